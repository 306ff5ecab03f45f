// Flurry Core: Volunteer Relay Spine
//
// "Does this keep one more censored client connected without the
//  volunteer having to babysit it?"
//
// Broker signaling, session lifecycle, admission control and counters.
// The peer-connection primitive, the notification surface and the UI are
// injected from outside.

pub mod broker;
pub mod config;
pub mod manager;
pub mod nat;
pub mod negotiation;
pub mod notify;
pub mod proxy;
pub mod session;
pub mod store;

pub use broker::{BrokerClient, BrokerDialer, BrokerError, BrokerMessage, WsDialer};
pub use config::{ConfigError, ProxyConfig};
pub use manager::{AnswerRoute, SessionManager, SessionOutcome};
pub use nat::{NatClassifier, NatType};
pub use negotiation::{
    Candidate, CandidateKind, EventSink, NegotiationError, NegotiationHandle, Negotiator,
    PeerConnectionState, SessionDescription, SessionEvent,
};
pub use notify::{LogNotifier, Notifier};
pub use proxy::{Counters, ProxyController, ProxyError, ProxyEvent, ProxyHandle, ProxyStatus};
pub use session::{Session, SessionError, SessionId, SessionState};
pub use store::{
    MemoryStorage, PersistedState, SledStorage, StateStore, StorageBackend, StoreError,
};
