//! StateStore — redb-backed TTL key-value store for HM.
//!
//! Entries are raw bytes at slash-separated paths, each with an optional
//! time-to-live. Paths form a hierarchy the way an etcd v2 keyspace does:
//! a path holding a value cannot also have children, and vice versa. The
//! store supports both on-disk and in-memory backends (the latter for
//! testing).
//!
//! Expiry is judged against the injected [`TimeProvider`] at read time, so
//! every reader agrees on what is live. [`StateStore::reap_expired`]
//! reclaims the space afterwards.

use std::path::Path;
use std::sync::Arc;

use hm_core::TimeProvider;
use redb::{Database, ReadableDatabase, ReadableTable};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// A live entry read from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreNode {
    pub key: String,
    pub value: Vec<u8>,
    /// Remaining seconds to live. Zero means the entry never expires.
    pub ttl: u64,
}

impl StoreNode {
    /// Decode the JSON value.
    pub fn decode<T: DeserializeOwned>(&self) -> StateResult<T> {
        serde_json::from_slice(&self.value)
            .map_err(|e| StateError::Deserialize(format!("{}: {e}", self.key)))
    }
}

/// Thread-safe TTL store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    clock: Arc<dyn TimeProvider>,
}

impl StateStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path, clock: Arc<dyn TimeProvider>) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self {
            db: Arc::new(db),
            clock,
        };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory(clock: Arc<dyn TimeProvider>) -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self {
            db: Arc::new(db),
            clock,
        };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(ENTRIES).map_err(map_err!(Table))?;
        txn.open_table(EXPIRIES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Current time according to the store's clock.
    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    // ── Raw entries ────────────────────────────────────────────────

    /// Write `value` at `key`. A `ttl` of zero never expires.
    pub fn put(&self, key: &str, value: &[u8], ttl: u64) -> StateResult<()> {
        validate_key(key)?;
        let now = self.clock.now();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut entries = txn.open_table(ENTRIES).map_err(map_err!(Table))?;
            let mut expiries = txn.open_table(EXPIRIES).map_err(map_err!(Table))?;
            make_room(&mut entries, &mut expiries, key, now)?;
            write_entry(&mut entries, &mut expiries, key, value, ttl, now)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, ttl, "entry stored");
        Ok(())
    }

    /// Read a live entry. Missing and expired keys are `NotFound`.
    pub fn get(&self, key: &str) -> StateResult<StoreNode> {
        let now = self.clock.now();
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let entries = txn.open_table(ENTRIES).map_err(map_err!(Table))?;
        let expiries = txn.open_table(EXPIRIES).map_err(map_err!(Table))?;
        live_node(&entries, &expiries, key, now)?
            .ok_or_else(|| StateError::NotFound(key.to_string()))
    }

    /// List every live entry below `dir`, ordered by key.
    pub fn list(&self, dir: &str) -> StateResult<Vec<StoreNode>> {
        let prefix = dir_prefix(dir);
        let now = self.clock.now();
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let entries = txn.open_table(ENTRIES).map_err(map_err!(Table))?;
        let expiries = txn.open_table(EXPIRIES).map_err(map_err!(Table))?;

        let mut results = Vec::new();
        for entry in entries.range(prefix.as_str()..).map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            let key = key.value();
            if !key.starts_with(&prefix) {
                break;
            }
            let expiry = expiry_of(&expiries, key)?;
            if is_live(expiry, now) {
                results.push(StoreNode {
                    key: key.to_string(),
                    value: value.value().to_vec(),
                    ttl: remaining(expiry, now),
                });
            }
        }
        Ok(results)
    }

    /// Delete a key. Returns true if a live entry existed.
    pub fn delete(&self, key: &str) -> StateResult<bool> {
        let now = self.clock.now();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut entries = txn.open_table(ENTRIES).map_err(map_err!(Table))?;
            let mut expiries = txn.open_table(EXPIRIES).map_err(map_err!(Table))?;
            existed = live_node(&entries, &expiries, key, now)?.is_some();
            entries.remove(key).map_err(map_err!(Write))?;
            expiries.remove(key).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, existed, "entry deleted");
        Ok(existed)
    }

    /// Write `value` only if the live value at `key` still equals `expected`
    /// (`None` = absent or expired). Returns whether the write happened.
    pub fn compare_and_put(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: &[u8],
        ttl: u64,
    ) -> StateResult<bool> {
        validate_key(key)?;
        let now = self.clock.now();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let swapped = {
            let mut entries = txn.open_table(ENTRIES).map_err(map_err!(Table))?;
            let mut expiries = txn.open_table(EXPIRIES).map_err(map_err!(Table))?;
            let current = live_node(&entries, &expiries, key, now)?.map(|node| node.value);
            if current.as_deref() == expected {
                make_room(&mut entries, &mut expiries, key, now)?;
                write_entry(&mut entries, &mut expiries, key, value, ttl, now)?;
                true
            } else {
                false
            }
        };
        if swapped {
            txn.commit().map_err(map_err!(Transaction))?;
        } else {
            txn.abort().map_err(map_err!(Transaction))?;
            debug!(%key, "compare-and-put lost to a concurrent writer");
        }
        Ok(swapped)
    }

    /// Delete `key` only if its live value equals `expected`.
    pub fn compare_and_delete(&self, key: &str, expected: &[u8]) -> StateResult<bool> {
        let now = self.clock.now();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let deleted = {
            let mut entries = txn.open_table(ENTRIES).map_err(map_err!(Table))?;
            let mut expiries = txn.open_table(EXPIRIES).map_err(map_err!(Table))?;
            let current = live_node(&entries, &expiries, key, now)?.map(|node| node.value);
            if current.as_deref() == Some(expected) {
                entries.remove(key).map_err(map_err!(Write))?;
                expiries.remove(key).map_err(map_err!(Write))?;
                true
            } else {
                false
            }
        };
        if deleted {
            txn.commit().map_err(map_err!(Transaction))?;
        } else {
            txn.abort().map_err(map_err!(Transaction))?;
        }
        Ok(deleted)
    }

    /// Physically remove expired entries. Returns the number removed.
    pub fn reap_expired(&self) -> StateResult<usize> {
        let now = self.clock.now();
        // Collect keys in a read transaction first.
        let expired: Vec<String> = {
            let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
            let expiries = txn.open_table(EXPIRIES).map_err(map_err!(Table))?;
            let mut keys = Vec::new();
            for entry in expiries.iter().map_err(map_err!(Read))? {
                let (key, at) = entry.map_err(map_err!(Read))?;
                if at.value() <= now {
                    keys.push(key.value().to_string());
                }
            }
            keys
        };
        if expired.is_empty() {
            return Ok(0);
        }

        // Delete in a write transaction, re-checking each expiry so a key
        // rewritten in between survives.
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut count = 0;
        {
            let mut entries = txn.open_table(ENTRIES).map_err(map_err!(Table))?;
            let mut expiries = txn.open_table(EXPIRIES).map_err(map_err!(Table))?;
            for key in &expired {
                if is_live(expiry_of(&expiries, key)?, now) {
                    continue;
                }
                entries.remove(key.as_str()).map_err(map_err!(Write))?;
                expiries.remove(key.as_str()).map_err(map_err!(Write))?;
                count += 1;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(count, "expired entries reaped");
        Ok(count)
    }

    // ── Desired state ──────────────────────────────────────────────

    /// Store a desired-state entry at `/desired/{guid}-{version}`.
    pub fn save_desired_state(&self, desired: &DesiredAppState, ttl: u64) -> StateResult<()> {
        self.put_json(&desired.store_key(), desired, ttl)
    }

    pub fn get_desired_state(&self, key: &AppKey) -> StateResult<DesiredAppState> {
        self.get(&desired_state_key(key))?.decode()
    }

    // ── Crash counts ───────────────────────────────────────────────

    pub fn save_crash_count(&self, crash_count: &CrashCount, ttl: u64) -> StateResult<()> {
        self.put_json(&crash_count.store_key(), crash_count, ttl)
    }

    pub fn get_crash_count(&self, key: &AppKey, index: u32) -> StateResult<Option<CrashCount>> {
        match self.get(&crash_count_key(key, index)) {
            Ok(node) => node.decode().map(Some),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Raw crash-count nodes, ordered by key.
    pub fn list_crash_counts(&self) -> StateResult<Vec<StoreNode>> {
        self.list(CRASH_COUNT_DIR)
    }

    // ── Helpers ────────────────────────────────────────────────────

    fn put_json<T: Serialize>(&self, key: &str, value: &T, ttl: u64) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        self.put(key, &bytes, ttl)
    }
}

fn validate_key(key: &str) -> StateResult<()> {
    if !key.starts_with('/') || key.len() < 2 || key.ends_with('/') || key.contains("//") {
        return Err(StateError::InvalidKey(key.to_string()));
    }
    Ok(())
}

fn dir_prefix(dir: &str) -> String {
    format!("{}/", dir.trim_end_matches('/'))
}

fn is_live(expiry: Option<u64>, now: u64) -> bool {
    expiry.is_none_or(|at| at > now)
}

fn remaining(expiry: Option<u64>, now: u64) -> u64 {
    expiry.map(|at| at.saturating_sub(now)).unwrap_or(0)
}

fn expiry_of(
    expiries: &impl ReadableTable<&'static str, u64>,
    key: &str,
) -> StateResult<Option<u64>> {
    Ok(expiries
        .get(key)
        .map_err(map_err!(Read))?
        .map(|guard| guard.value()))
}

fn live_node(
    entries: &impl ReadableTable<&'static str, &'static [u8]>,
    expiries: &impl ReadableTable<&'static str, u64>,
    key: &str,
    now: u64,
) -> StateResult<Option<StoreNode>> {
    let value = match entries.get(key).map_err(map_err!(Read))? {
        Some(guard) => guard.value().to_vec(),
        None => return Ok(None),
    };
    let expiry = expiry_of(expiries, key)?;
    if !is_live(expiry, now) {
        return Ok(None);
    }
    Ok(Some(StoreNode {
        key: key.to_string(),
        value,
        ttl: remaining(expiry, now),
    }))
}

/// Keep the keyspace a tree: refuse to write over a live directory or
/// beneath a live value, and clear out expired entries in the way.
fn make_room(
    entries: &mut redb::Table<&'static str, &'static [u8]>,
    expiries: &mut redb::Table<&'static str, u64>,
    key: &str,
    now: u64,
) -> StateResult<()> {
    let mut stale = Vec::new();

    let mut parent = key;
    while let Some(pos) = parent.rfind('/') {
        parent = &parent[..pos];
        if parent.is_empty() {
            break;
        }
        if entries.get(parent).map_err(map_err!(Read))?.is_some() {
            if is_live(expiry_of(&*expiries, parent)?, now) {
                return Err(StateError::NotADirectory(parent.to_string()));
            }
            stale.push(parent.to_string());
        }
    }

    let prefix = dir_prefix(key);
    let children: Vec<String> = {
        let mut keys = Vec::new();
        for entry in entries.range(prefix.as_str()..).map_err(map_err!(Read))? {
            let (child, _) = entry.map_err(map_err!(Read))?;
            let child = child.value();
            if !child.starts_with(&prefix) {
                break;
            }
            keys.push(child.to_string());
        }
        keys
    };
    for child in children {
        if is_live(expiry_of(&*expiries, &child)?, now) {
            return Err(StateError::NotAFile(key.to_string()));
        }
        stale.push(child);
    }

    for key in &stale {
        entries.remove(key.as_str()).map_err(map_err!(Write))?;
        expiries.remove(key.as_str()).map_err(map_err!(Write))?;
    }
    Ok(())
}

fn write_entry(
    entries: &mut redb::Table<&'static str, &'static [u8]>,
    expiries: &mut redb::Table<&'static str, u64>,
    key: &str,
    value: &[u8],
    ttl: u64,
    now: u64,
) -> StateResult<()> {
    entries.insert(key, value).map_err(map_err!(Write))?;
    if ttl > 0 {
        expiries.insert(key, now.saturating_add(ttl)).map_err(map_err!(Write))?;
    } else {
        expiries.remove(key).map_err(map_err!(Write))?;
    }
    Ok(())
}
