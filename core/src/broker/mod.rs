//! Broker signaling
//!
//! One duplex channel to one rendezvous broker. Offers go out, answers come
//! back, and the client keeps the channel up across transient failures.

pub mod client;
pub mod protocol;
pub mod ws;

pub use client::{
    BrokerClient, BrokerClientConfig, BrokerConnection, BrokerDialer, BrokerError, BrokerEvent,
    BrokerSink, BrokerStream, ConnectionStatus, RetryDecision,
};
pub use protocol::{BrokerMessage, ProtocolError};
pub use ws::WsDialer;
