//! WebSocket transport for the broker channel.
//!
//! One text frame = one signaling message. Binary frames are accepted if
//! they are valid UTF-8; ping/pong is handled by tungstenite.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};
use tracing::debug;

use super::client::{BrokerDialer, BrokerError, BrokerSink, BrokerStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Dials `ws://` and `wss://` broker endpoints
#[derive(Debug, Clone, Copy, Default)]
pub struct WsDialer;

impl WsDialer {
    pub fn new() -> Self {
        Self
    }
}

struct WsSink {
    sink: SplitSink<WsStream, WsMessage>,
}

struct WsReader {
    stream: SplitStream<WsStream>,
}

#[async_trait]
impl BrokerDialer for WsDialer {
    async fn dial(
        &self,
        endpoint: &str,
    ) -> Result<(Box<dyn BrokerSink>, Box<dyn BrokerStream>), BrokerError> {
        let (ws, _response) = connect_async(endpoint)
            .await
            .map_err(|e| BrokerError::ConnectFailed(e.to_string()))?;
        let (sink, stream) = ws.split();
        Ok((Box::new(WsSink { sink }), Box::new(WsReader { stream })))
    }
}

#[async_trait]
impl BrokerSink for WsSink {
    async fn send_text(&mut self, text: String) -> Result<(), BrokerError> {
        self.sink
            .send(WsMessage::Text(text))
            .await
            .map_err(|e| BrokerError::Send(e.to_string()))
    }

    async fn close(&mut self) {
        // Best effort close frame
        let _ = self.sink.close().await;
    }
}

#[async_trait]
impl BrokerStream for WsReader {
    async fn next_text(&mut self) -> Option<Result<String, BrokerError>> {
        loop {
            match self.stream.next().await {
                Some(Ok(WsMessage::Text(text))) => return Some(Ok(text)),
                Some(Ok(WsMessage::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => return Some(Ok(text)),
                    Err(_) => {
                        debug!("Dropping non-UTF-8 binary frame from broker");
                        continue;
                    }
                },
                Some(Ok(WsMessage::Close(_))) => return None,
                Some(Ok(_)) => continue, // Ping, Pong, raw frames
                Some(Err(e)) => return Some(Err(BrokerError::Transport(e.to_string()))),
                None => return None,
            }
        }
    }
}
