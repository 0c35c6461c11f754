//! Freshness markers.
//!
//! A marker at a well-known key declares a view of cluster state complete
//! and authoritative as of its timestamp. The marker disappears when its TTL
//! runs out, so a producer that stops producing stops vouching for its data.

use crate::error::{StateError, StateResult};
use crate::store::StateStore;
use crate::types::FreshnessMarker;

/// Capability to declare a view fresh.
pub trait FreshnessSignal: Send + Sync {
    fn bump(&self, key: &str, timestamp: u64, ttl: u64) -> StateResult<()>;
}

impl FreshnessSignal for StateStore {
    fn bump(&self, key: &str, timestamp: u64, ttl: u64) -> StateResult<()> {
        let value = serde_json::to_vec(&FreshnessMarker { timestamp })
            .map_err(|e| StateError::Serialize(e.to_string()))?;
        self.put(key, &value, ttl)
    }
}

impl StateStore {
    /// The live marker at `key`, if any.
    pub fn freshness(&self, key: &str) -> StateResult<Option<FreshnessMarker>> {
        match self.get(key) {
            Ok(node) => node.decode().map(Some),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn is_fresh(&self, key: &str) -> StateResult<bool> {
        Ok(self.freshness(key)?.is_some())
    }
}
