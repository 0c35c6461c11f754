//! Analyzer — one reconciliation tick against the store and the bus.
//!
//! A tick reads the freshness marker, desired state and crash counts once,
//! plans against that snapshot, then applies the plan. Crash-count writes
//! are conditional on the snapshot value; a start whose write loses a race
//! is dropped for this tick.

use std::sync::Arc;

use hm_core::{HmConfig, MessageBus};
use hm_state::{DESIRED_STATE_DIR, Heartbeat, StartMessage, StateStore, StopMessage};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::backoff::BackoffPolicy;
use crate::decision::{self, Plan};
use crate::error::{AnalyzerError, AnalyzerResult};
use crate::snapshot::Snapshot;

/// Subjects and keys the analyzer works with.
#[derive(Debug, Clone)]
pub struct AnalyzerSettings {
    pub freshness_key: String,
    pub start_subject: String,
    pub stop_subject: String,
}

impl AnalyzerSettings {
    pub fn from_config(config: &HmConfig) -> Self {
        Self {
            freshness_key: config.desired_freshness_key.clone(),
            start_subject: config.start_subject.clone(),
            stop_subject: config.stop_subject.clone(),
        }
    }
}

/// What a tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub starts: Vec<StartMessage>,
    pub stops: Vec<StopMessage>,
    /// Desired-state entries that could not be decoded.
    pub skipped_entries: usize,
    /// Starts dropped because the crash count changed under us or could not
    /// be written.
    pub dropped_starts: usize,
    /// Expired crash counts removed.
    pub cleared_crash_counts: usize,
    /// Starts and stops the bus refused. A refused start leaves its crash
    /// count as it was.
    pub failed_publishes: usize,
}

pub struct Analyzer {
    store: StateStore,
    bus: Arc<dyn MessageBus>,
    policy: BackoffPolicy,
    settings: AnalyzerSettings,
}

impl Analyzer {
    pub fn new(
        store: StateStore,
        bus: Arc<dyn MessageBus>,
        policy: BackoffPolicy,
        settings: AnalyzerSettings,
    ) -> Self {
        Self {
            store,
            bus,
            policy,
            settings,
        }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Run one tick against the given heartbeat snapshot.
    pub fn evaluate(&self, heartbeats: &[Heartbeat]) -> AnalyzerResult<TickReport> {
        let now = self.store.now();
        if !self.store.is_fresh(&self.settings.freshness_key)? {
            debug!(key = %self.settings.freshness_key, "desired state not fresh");
            return Err(AnalyzerError::DesiredStateNotFresh);
        }

        let mut report = TickReport::default();
        let desired_nodes = self.store.list(DESIRED_STATE_DIR)?;
        let crash_nodes = self.store.list_crash_counts()?;
        let snapshot = Snapshot::new(now)
            .with_desired_nodes(&desired_nodes, &mut report.skipped_entries)
            .with_heartbeats(heartbeats)
            .with_crash_count_nodes(crash_nodes);

        let plan = decision::plan(&snapshot, &self.policy);
        self.apply(plan, &mut report)?;

        info!(
            starts = report.starts.len(),
            stops = report.stops.len(),
            skipped = report.skipped_entries,
            dropped = report.dropped_starts,
            cleared = report.cleared_crash_counts,
            failed = report.failed_publishes,
            "analyzer tick complete"
        );
        Ok(report)
    }

    fn apply(&self, plan: Plan, report: &mut TickReport) -> AnalyzerResult<()> {
        let ttl = self.policy.crash_count_ttl();

        for expired in plan.expired {
            match self.store.compare_and_delete(&expired.key, &expired.expected) {
                Ok(true) => {
                    debug!(key = %expired.key, "crash count expired");
                    report.cleared_crash_counts += 1;
                }
                Ok(false) => debug!(key = %expired.key, "crash count changed, not clearing"),
                Err(e) => warn!(key = %expired.key, error = %e, "failed to clear crash count"),
            }
        }

        for start in plan.starts {
            let value = to_json(&start.record)?;
            match self
                .store
                .compare_and_put(&start.key, start.expected.as_deref(), &value, ttl)
            {
                Ok(true) => {}
                Ok(false) => {
                    debug!(key = %start.key, "crash count changed, skipping start this tick");
                    report.dropped_starts += 1;
                    continue;
                }
                Err(e) => {
                    warn!(key = %start.key, error = %e, "failed to record crash count, skipping start");
                    report.dropped_starts += 1;
                    continue;
                }
            }

            if let Err(e) = self
                .bus
                .publish(&self.settings.start_subject, to_json(&start.message)?)
            {
                warn!(key = %start.key, error = %e, "failed to publish start");
                self.revert_crash_count(&start.key, start.expected.as_deref(), &value, ttl);
                report.failed_publishes += 1;
                continue;
            }
            info!(
                app_guid = %start.message.app_guid,
                app_version = %start.message.app_version,
                index = start.message.instance_index,
                attempt = start.record.crash_count,
                reason = ?start.message.reason,
                "start sent"
            );
            report.starts.push(start.message);
        }

        for stop in plan.stops {
            if let Err(e) = self
                .bus
                .publish(&self.settings.stop_subject, to_json(&stop)?)
            {
                warn!(
                    app_guid = %stop.app_guid,
                    index = stop.instance_index,
                    error = %e,
                    "failed to publish stop"
                );
                report.failed_publishes += 1;
                continue;
            }
            info!(
                app_guid = %stop.app_guid,
                app_version = %stop.app_version,
                index = stop.instance_index,
                instance_guid = %stop.instance_guid,
                reason = ?stop.reason,
                "stop sent"
            );
            report.stops.push(stop);
        }

        Ok(())
    }

    /// Undo a crash-count write whose start never went out, unless someone
    /// else has written the key since.
    fn revert_crash_count(&self, key: &str, previous: Option<&[u8]>, written: &[u8], ttl: u64) {
        let reverted = match previous {
            Some(previous) => self.store.compare_and_put(key, Some(written), previous, ttl),
            None => self.store.compare_and_delete(key, written),
        };
        match reverted {
            Ok(true) => debug!(%key, "crash count reverted"),
            Ok(false) => debug!(%key, "crash count changed, not reverting"),
            Err(e) => warn!(%key, error = %e, "failed to revert crash count"),
        }
    }
}

fn to_json<T: Serialize>(value: &T) -> AnalyzerResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| AnalyzerError::Serialize(e.to_string()))
}
