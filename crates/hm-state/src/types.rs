//! Domain types for the HM health manager.
//!
//! Desired state comes from the bulk API, heartbeats come from execution
//! hosts, and crash counts are derived by the analyzer. All types serialize
//! to/from JSON, which is also their stored form.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Directory holding desired-state entries.
pub const DESIRED_STATE_DIR: &str = "/desired";

/// Directory holding crash counts.
pub const CRASH_COUNT_DIR: &str = "/crashes";

/// Identity of one version of an application.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AppKey {
    pub app_guid: String,
    pub app_version: String,
}

impl AppKey {
    pub fn new(app_guid: impl Into<String>, app_version: impl Into<String>) -> Self {
        Self {
            app_guid: app_guid.into(),
            app_version: app_version.into(),
        }
    }
}

impl fmt::Display for AppKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.app_guid, self.app_version)
    }
}

// ── Desired state ─────────────────────────────────────────────────

/// Declared run state of an application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AppState {
    Started,
    Stopped,
}

/// Staging state of an application's package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PackageState {
    Pending,
    Staged,
    Failed,
}

/// Target configuration for one version of an application, as reported by
/// the system of record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredAppState {
    #[serde(rename = "id")]
    pub app_guid: String,
    #[serde(rename = "version")]
    pub app_version: String,
    #[serde(rename = "instances")]
    pub number_of_instances: u32,
    pub memory: u64,
    pub state: AppState,
    pub package_state: PackageState,
    /// Unix timestamp of the last change in the system of record.
    pub updated_at: u64,
}

impl DesiredAppState {
    pub fn app_key(&self) -> AppKey {
        AppKey::new(&self.app_guid, &self.app_version)
    }

    /// Store path: `/desired/{guid}-{version}`.
    pub fn store_key(&self) -> String {
        desired_state_key(&self.app_key())
    }

    /// Number of instances that should be running right now. A stopped app
    /// wants none.
    pub fn wanted_instances(&self) -> u32 {
        match self.state {
            AppState::Started => self.number_of_instances,
            AppState::Stopped => 0,
        }
    }
}

pub fn desired_state_key(key: &AppKey) -> String {
    format!("{DESIRED_STATE_DIR}/{key}")
}

// ── Heartbeats ────────────────────────────────────────────────────

/// Runtime state of an instance as reported by its host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceState {
    Starting,
    Running,
    Crashed,
    Evacuating,
}

/// One instance inside a host heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceHeartbeat {
    pub app_guid: String,
    pub app_version: String,
    pub instance_guid: String,
    pub instance_index: u32,
    pub state: InstanceState,
    /// Unix timestamp of the last state change.
    pub state_timestamp: u64,
}

impl InstanceHeartbeat {
    pub fn app_key(&self) -> AppKey {
        AppKey::new(&self.app_guid, &self.app_version)
    }

    /// Starting instances count as alive.
    pub fn is_alive(&self) -> bool {
        matches!(
            self.state,
            InstanceState::Running | InstanceState::Starting | InstanceState::Evacuating
        )
    }
}

/// Heartbeat from an execution host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub host_id: String,
    pub instance_heartbeats: Vec<InstanceHeartbeat>,
}

// ── Crash counts ──────────────────────────────────────────────────

/// Restart attempts for one crashing instance index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrashCount {
    pub app_guid: String,
    pub app_version: String,
    pub instance_index: u32,
    /// Restart attempts sent for the current run of crashes. Starts at 1.
    pub crash_count: u32,
    pub created_at: u64,
    pub last_attempt_at: u64,
}

impl CrashCount {
    /// First detection: one attempt, sent now.
    pub fn first(key: &AppKey, instance_index: u32, now: u64) -> Self {
        Self {
            app_guid: key.app_guid.clone(),
            app_version: key.app_version.clone(),
            instance_index,
            crash_count: 1,
            created_at: now,
            last_attempt_at: now,
        }
    }

    pub fn app_key(&self) -> AppKey {
        AppKey::new(&self.app_guid, &self.app_version)
    }

    /// Store path: `/crashes/{guid}-{version}-{index}`.
    pub fn store_key(&self) -> String {
        crash_count_key(&self.app_key(), self.instance_index)
    }

    /// Record another attempt sent at `now`.
    pub fn next_attempt(&self, now: u64) -> Self {
        Self {
            crash_count: self.crash_count.saturating_add(1),
            last_attempt_at: now,
            ..self.clone()
        }
    }

    /// Whether the record has outlived its TTL as of `now`.
    pub fn is_expired(&self, now: u64, ttl: u64) -> bool {
        now.saturating_sub(self.last_attempt_at) >= ttl
    }
}

pub fn crash_count_key(key: &AppKey, instance_index: u32) -> String {
    format!("{CRASH_COUNT_DIR}/{key}-{instance_index}")
}

// ── Freshness ─────────────────────────────────────────────────────

/// Stored at a freshness key while a view of cluster state is authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreshnessMarker {
    pub timestamp: u64,
}

// ── Actions ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartReason {
    /// No heartbeat reports the index.
    Missing,
    /// The index reported a crash.
    Crashed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Index at or beyond the desired instance count.
    Extra,
    /// The app version has no desired state.
    Undesired,
    /// The desired state is STOPPED.
    AppStopped,
}

/// Ask the dispatcher to start an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartMessage {
    pub app_guid: String,
    pub app_version: String,
    pub instance_index: u32,
    pub reason: StartReason,
}

/// Ask the dispatcher to stop an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopMessage {
    pub app_guid: String,
    pub app_version: String,
    pub instance_index: u32,
    pub instance_guid: String,
    pub reason: StopReason,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desired() -> DesiredAppState {
        DesiredAppState {
            app_guid: "app-1".to_string(),
            app_version: "v1".to_string(),
            number_of_instances: 3,
            memory: 256,
            state: AppState::Started,
            package_state: PackageState::Staged,
            updated_at: 1000,
        }
    }

    #[test]
    fn desired_state_keys() {
        let d = desired();
        assert_eq!(d.store_key(), "/desired/app-1-v1");
        assert_eq!(d.app_key().to_string(), "app-1-v1");
    }

    #[test]
    fn desired_state_wire_format() {
        let json = serde_json::to_value(desired()).unwrap();
        assert_eq!(json["id"], "app-1");
        assert_eq!(json["version"], "v1");
        assert_eq!(json["instances"], 3);
        assert_eq!(json["state"], "STARTED");
        assert_eq!(json["package_state"], "STAGED");
    }

    #[test]
    fn stopped_app_wants_no_instances() {
        let mut d = desired();
        d.state = AppState::Stopped;
        assert_eq!(d.wanted_instances(), 0);
    }

    #[test]
    fn crash_count_attempts_and_expiry() {
        let key = AppKey::new("app-1", "v1");
        let first = CrashCount::first(&key, 2, 100);
        assert_eq!(first.store_key(), "/crashes/app-1-v1-2");
        assert_eq!(first.crash_count, 1);

        let second = first.next_attempt(130);
        assert_eq!(second.crash_count, 2);
        assert_eq!(second.created_at, 100);
        assert_eq!(second.last_attempt_at, 130);

        assert!(!second.is_expired(141, 12));
        assert!(second.is_expired(142, 12));
    }

    #[test]
    fn instance_liveness() {
        let mut hb = InstanceHeartbeat {
            app_guid: "a".to_string(),
            app_version: "v".to_string(),
            instance_guid: "i".to_string(),
            instance_index: 0,
            state: InstanceState::Starting,
            state_timestamp: 0,
        };
        assert!(hb.is_alive());
        hb.state = InstanceState::Crashed;
        assert!(!hb.is_alive());
    }
}
