// Persisted proxy state
//
// Four JSON-encoded values under fixed keys. Missing keys load as defaults;
// values that fail to decode are treated as missing. Every write flushes.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

use super::backend::{StorageBackend, StoreError};
use crate::nat::NatType;

pub const KEY_ENABLED: &str = "proxy_enabled";
pub const KEY_TOTAL_HELPED: &str = "proxy_total_helped";
pub const KEY_ALLTIME_UPTIME: &str = "proxy_alltime_uptime";
pub const KEY_NAT_TYPE: &str = "proxy_nat_type";

/// Durable fields of the proxy state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    pub enabled: bool,
    pub total_helped: u64,
    pub alltime_uptime_secs: u64,
    pub nat_type: NatType,
}

#[derive(Clone)]
pub struct StateStore {
    backend: Arc<dyn StorageBackend>,
}

impl StateStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    /// Load every field, defaulting what is missing or unreadable
    pub fn load(&self) -> PersistedState {
        PersistedState {
            enabled: self.read(KEY_ENABLED).unwrap_or(false),
            total_helped: self.read(KEY_TOTAL_HELPED).unwrap_or(0),
            alltime_uptime_secs: self.read(KEY_ALLTIME_UPTIME).unwrap_or(0),
            nat_type: self.read(KEY_NAT_TYPE).unwrap_or_default(),
        }
    }

    /// Write every field
    pub fn save(&self, state: &PersistedState) -> Result<(), StoreError> {
        self.set_enabled(state.enabled)?;
        self.set_total_helped(state.total_helped)?;
        self.set_alltime_uptime(state.alltime_uptime_secs)?;
        self.set_nat_type(state.nat_type)
    }

    pub fn set_enabled(&self, enabled: bool) -> Result<(), StoreError> {
        self.write(KEY_ENABLED, &enabled)
    }

    pub fn set_total_helped(&self, total: u64) -> Result<(), StoreError> {
        self.write(KEY_TOTAL_HELPED, &total)
    }

    pub fn set_alltime_uptime(&self, secs: u64) -> Result<(), StoreError> {
        self.write(KEY_ALLTIME_UPTIME, &secs)
    }

    pub fn set_nat_type(&self, nat_type: NatType) -> Result<(), StoreError> {
        self.write(KEY_NAT_TYPE, &nat_type)
    }

    fn read<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let bytes = match self.backend.get(key.as_bytes()) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                warn!("Failed to read {}: {}", key, e);
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Ignoring corrupt value for {}: {}", key, e);
                None
            }
        }
    }

    fn write<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(value).map_err(|e| StoreError::Encode {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        self.backend.put(key.as_bytes(), &bytes)?;
        self.backend.flush()
    }
}
