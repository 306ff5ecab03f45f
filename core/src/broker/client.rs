//! Broker Client: owns the one signaling channel to the rendezvous broker

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::protocol::{BrokerMessage, ProtocolError};
use crate::config::ProxyConfig;
use crate::proxy::ProxyEvent;

/// Broker client configuration
#[derive(Debug, Clone)]
pub struct BrokerClientConfig {
    /// Broker endpoint URL
    pub endpoint: String,
    /// Fixed wait before each reconnection attempt
    pub retry_interval: Duration,
    /// Consecutive connect failures tolerated before giving up
    pub max_retries: u8,
    /// Upper bound on a single dial
    pub connect_timeout: Duration,
}

impl Default for BrokerClientConfig {
    fn default() -> Self {
        Self::from(&ProxyConfig::default())
    }
}

impl From<&ProxyConfig> for BrokerClientConfig {
    fn from(config: &ProxyConfig) -> Self {
        Self {
            endpoint: config.broker_url.clone(),
            retry_interval: config.retry_interval,
            max_retries: config.max_retries,
            connect_timeout: config.connect_timeout,
        }
    }
}

/// Connection state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// The broker connection record
#[derive(Debug)]
pub struct BrokerConnection {
    /// The broker's endpoint
    pub endpoint: String,
    /// Current connection state
    pub status: ConnectionStatus,
    /// Consecutive failed connects since the last success
    pub retry_count: u8,
}

impl BrokerConnection {
    pub fn new(endpoint: String) -> Self {
        Self {
            endpoint,
            status: ConnectionStatus::Disconnected,
            retry_count: 0,
        }
    }

    /// Update connection state. Connecting successfully clears the retry counter.
    pub fn set_status(&mut self, status: ConnectionStatus) {
        self.status = status;
        if status == ConnectionStatus::Connected {
            self.retry_count = 0;
        }
    }

    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }
}

/// Broker client error types
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("Connection failed: {0}")]
    ConnectFailed(String),
    #[error("Connection attempt timed out")]
    Timeout,
    #[error("Not connected to the broker")]
    NotConnected,
    #[error("Broker unavailable after {0} consecutive failures")]
    Unavailable(u8),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Send failed: {0}")]
    Send(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// What the broker connection reports to the event loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    /// One inbound text frame
    Message(String),
    /// The channel ended, cleanly or not
    Closed,
}

/// Outcome of recording a failed connect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryIn(Duration),
    GiveUp,
}

// ============================================================================
// TRANSPORT SEAM
// ============================================================================

/// Opens the duplex signaling channel
#[async_trait]
pub trait BrokerDialer: Send + Sync {
    async fn dial(
        &self,
        endpoint: &str,
    ) -> Result<(Box<dyn BrokerSink>, Box<dyn BrokerStream>), BrokerError>;
}

/// Write half of the signaling channel
#[async_trait]
pub trait BrokerSink: Send {
    async fn send_text(&mut self, text: String) -> Result<(), BrokerError>;
    async fn close(&mut self);
}

/// Read half of the signaling channel. `None` means the channel is closed.
#[async_trait]
pub trait BrokerStream: Send {
    async fn next_text(&mut self) -> Option<Result<String, BrokerError>>;
}

// ============================================================================
// CLIENT
// ============================================================================

/// Broker client: one logical connection, reconnect bookkeeping, I/O pumps
pub struct BrokerClient {
    config: BrokerClientConfig,
    dialer: Arc<dyn BrokerDialer>,
    events: mpsc::UnboundedSender<ProxyEvent>,
    connection: BrokerConnection,
    /// Bumped on every connect and close; broker events carry it
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<String>>,
    reader: Option<JoinHandle<()>>,
    gave_up: bool,
}

impl BrokerClient {
    pub fn new(
        config: BrokerClientConfig,
        dialer: Arc<dyn BrokerDialer>,
        events: mpsc::UnboundedSender<ProxyEvent>,
    ) -> Self {
        let connection = BrokerConnection::new(config.endpoint.clone());
        Self {
            config,
            dialer,
            events,
            connection,
            generation: 0,
            outbound: None,
            reader: None,
            gave_up: false,
        }
    }

    /// Dial the broker, replacing any existing connection.
    ///
    /// Does not touch the retry counter on failure; the caller decides via
    /// [`BrokerClient::record_failure`].
    pub async fn connect(&mut self) -> Result<(), BrokerError> {
        self.teardown();
        self.generation += 1;
        self.connection.set_status(ConnectionStatus::Connecting);
        info!("Connecting to broker at {}", self.config.endpoint);

        let dialed = tokio::time::timeout(
            self.config.connect_timeout,
            self.dialer.dial(&self.config.endpoint),
        )
        .await;

        let (mut sink, mut stream) = match dialed {
            Ok(Ok(halves)) => halves,
            Ok(Err(e)) => {
                self.connection.set_status(ConnectionStatus::Disconnected);
                warn!("Broker connection error: {}", e);
                return Err(e);
            }
            Err(_) => {
                self.connection.set_status(ConnectionStatus::Disconnected);
                warn!(
                    "Broker connection timed out after {:?}",
                    self.config.connect_timeout
                );
                return Err(BrokerError::Timeout);
            }
        };

        let generation = self.generation;
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = sink.send_text(text).await {
                    warn!("Broker send failed: {}", e);
                    break;
                }
            }
            sink.close().await;
        });

        let events = self.events.clone();
        let reader = tokio::spawn(async move {
            while let Some(item) = stream.next_text().await {
                match item {
                    Ok(text) => {
                        let event = ProxyEvent::Broker {
                            generation,
                            event: BrokerEvent::Message(text),
                        };
                        if events.send(event).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!("Broker transport error: {}", e);
                        break;
                    }
                }
            }
            let _ = events.send(ProxyEvent::Broker {
                generation,
                event: BrokerEvent::Closed,
            });
        });

        self.outbound = Some(out_tx);
        self.reader = Some(reader);
        self.gave_up = false;
        self.connection.set_status(ConnectionStatus::Connected);
        info!("Connected to broker");
        Ok(())
    }

    /// Queue a message on the live connection
    pub fn send(&self, message: &BrokerMessage) -> Result<(), BrokerError> {
        let outbound = match (&self.outbound, self.connection.is_connected()) {
            (Some(outbound), true) => outbound,
            _ => return Err(BrokerError::NotConnected),
        };
        let text = message.to_text()?;
        outbound
            .send(text)
            .map_err(|_| BrokerError::Send("writer task gone".to_string()))?;
        debug!("Sent {} to broker", message.message_type());
        Ok(())
    }

    /// Whether a broker event belongs to the live connection
    pub fn is_current(&self, generation: u64) -> bool {
        generation == self.generation && self.connection.is_connected()
    }

    /// Handle the live connection ending. Returns false for stale events.
    pub fn on_closed(&mut self, generation: u64) -> bool {
        if !self.is_current(generation) {
            return false;
        }
        info!("Broker connection closed");
        self.teardown();
        self.connection.set_status(ConnectionStatus::Disconnected);
        true
    }

    /// Count a failed connect and decide whether to try again
    pub fn record_failure(&mut self) -> RetryDecision {
        self.connection.retry_count = self.connection.retry_count.saturating_add(1);
        if self.connection.retry_count >= self.config.max_retries {
            self.gave_up = true;
            RetryDecision::GiveUp
        } else {
            RetryDecision::RetryIn(self.backoff_for(self.connection.retry_count))
        }
    }

    /// Wait before reconnection attempt `attempt`. The policy is a fixed interval.
    pub fn backoff_for(&self, _attempt: u8) -> Duration {
        self.config.retry_interval
    }

    /// Close the connection and forget retry history
    pub fn close(&mut self) {
        self.teardown();
        self.generation += 1;
        self.connection.set_status(ConnectionStatus::Disconnected);
        self.connection.retry_count = 0;
        self.gave_up = false;
    }

    fn teardown(&mut self) {
        // Dropping the sender lets the writer flush and send a close frame.
        self.outbound = None;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.connection.status
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn retry_count(&self) -> u8 {
        self.connection.retry_count
    }

    pub fn has_given_up(&self) -> bool {
        self.gave_up
    }

    pub fn connection(&self) -> &BrokerConnection {
        &self.connection
    }

    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }
}

// ============================================================================
// TESTS
// ============================================================================
