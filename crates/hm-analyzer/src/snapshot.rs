//! Immutable per-tick view of desired and actual state.
//!
//! Built once at the start of a tick from the store and the heartbeat book.
//! Every decision of the tick reads this value and nothing else.

use std::collections::{BTreeMap, BTreeSet};

use hm_state::{AppKey, CrashCount, DesiredAppState, Heartbeat, InstanceState, StoreNode};
use tracing::warn;

/// What the heartbeats say about one instance index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexState {
    /// Running, starting or evacuating. The guid is the instance to stop if
    /// the index turns out to be unwanted.
    Alive { instance_guid: String },
    /// Reported crashed and not reported alive by any host.
    Crashed,
}

/// A crash count as read from the store. `raw` is the exact stored value,
/// used as the expected value for conditional writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCrashCount {
    /// `None` when the stored value does not decode.
    pub record: Option<CrashCount>,
    pub raw: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub now: u64,
    pub desired: BTreeMap<AppKey, DesiredAppState>,
    /// Desired-state store keys whose values could not be decoded.
    pub unreadable_desired: BTreeSet<String>,
    pub actual: BTreeMap<AppKey, BTreeMap<u32, IndexState>>,
    /// Keyed by crash-count store key.
    pub crash_counts: BTreeMap<String, StoredCrashCount>,
}

impl Snapshot {
    pub fn new(now: u64) -> Self {
        Self {
            now,
            ..Self::default()
        }
    }

    /// Add desired-state nodes. Undecodable values are remembered by key and
    /// returned as a count.
    pub fn with_desired_nodes(mut self, nodes: &[StoreNode], skipped: &mut usize) -> Self {
        for node in nodes {
            match node.decode::<DesiredAppState>() {
                Ok(desired) => {
                    self.desired.insert(desired.app_key(), desired);
                }
                Err(e) => {
                    warn!(key = %node.key, error = %e, "skipping malformed desired state");
                    self.unreadable_desired.insert(node.key.clone());
                    *skipped += 1;
                }
            }
        }
        self
    }

    pub fn with_desired(mut self, desired: impl IntoIterator<Item = DesiredAppState>) -> Self {
        for d in desired {
            self.desired.insert(d.app_key(), d);
        }
        self
    }

    /// Fold heartbeats into per-index state. An index reported alive by any
    /// instance is alive, even if another instance reports it crashed.
    pub fn with_heartbeats(mut self, heartbeats: &[Heartbeat]) -> Self {
        for heartbeat in heartbeats {
            for instance in &heartbeat.instance_heartbeats {
                let indices = self.actual.entry(instance.app_key()).or_default();
                if instance.is_alive() {
                    let replace = !matches!(
                        indices.get(&instance.instance_index),
                        Some(IndexState::Alive { .. })
                    );
                    if replace {
                        indices.insert(
                            instance.instance_index,
                            IndexState::Alive {
                                instance_guid: instance.instance_guid.clone(),
                            },
                        );
                    }
                } else if instance.state == InstanceState::Crashed {
                    indices
                        .entry(instance.instance_index)
                        .or_insert(IndexState::Crashed);
                }
            }
        }
        self
    }

    /// Add crash-count nodes. Undecodable values are kept raw so a new
    /// detection can overwrite them.
    pub fn with_crash_count_nodes(mut self, nodes: Vec<StoreNode>) -> Self {
        for node in nodes {
            let record = match node.decode::<CrashCount>() {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(key = %node.key, error = %e, "malformed crash count");
                    None
                }
            };
            self.crash_counts.insert(
                node.key,
                StoredCrashCount {
                    record,
                    raw: node.value,
                },
            );
        }
        self
    }

    pub fn index_state(&self, app: &AppKey, index: u32) -> Option<&IndexState> {
        self.actual.get(app).and_then(|indices| indices.get(&index))
    }

    /// Every app version mentioned by desired state or heartbeats, ordered.
    pub fn app_keys(&self) -> BTreeSet<AppKey> {
        self.desired
            .keys()
            .chain(self.actual.keys())
            .cloned()
            .collect()
    }
}
