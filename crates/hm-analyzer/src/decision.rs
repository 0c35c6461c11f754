//! Pure reconciliation: snapshot in, plan out.
//!
//! Nothing here touches the store or the bus. The plan lists start and stop
//! messages together with the crash-count writes that must succeed before a
//! start may be sent.

use std::collections::BTreeSet;

use hm_state::{
    AppKey, AppState, CrashCount, DesiredAppState, PackageState, StartMessage, StartReason,
    StopMessage, StopReason, crash_count_key, desired_state_key,
};
use tracing::debug;

use crate::backoff::BackoffPolicy;
use crate::snapshot::{IndexState, Snapshot};

/// A start gated on a conditional crash-count write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedStart {
    pub message: StartMessage,
    /// Crash-count store key.
    pub key: String,
    /// Value the key must still hold, `None` for absent.
    pub expected: Option<Vec<u8>>,
    pub record: CrashCount,
}

/// A crash count to forget, if it still holds `expected`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredCrashCount {
    pub key: String,
    pub expected: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    pub starts: Vec<PlannedStart>,
    pub stops: Vec<StopMessage>,
    pub expired: Vec<ExpiredCrashCount>,
}

/// Decide every action for one tick.
///
/// At most one action is planned per instance index.
pub fn plan(snapshot: &Snapshot, policy: &BackoffPolicy) -> Plan {
    let mut plan = Plan::default();
    // Crash-count keys of indices that want a start this tick.
    let mut crashing = BTreeSet::new();

    for app in snapshot.app_keys() {
        match snapshot.desired.get(&app) {
            None if snapshot
                .unreadable_desired
                .contains(&desired_state_key(&app)) =>
            {
                debug!(%app, "desired state unreadable, leaving app alone");
            }
            None => stop_alive(snapshot, &app, 0, StopReason::Undesired, &mut plan),
            Some(desired) => {
                let reason = match desired.state {
                    AppState::Started => StopReason::Extra,
                    AppState::Stopped => StopReason::AppStopped,
                };
                stop_alive(snapshot, &app, desired.wanted_instances(), reason, &mut plan);
                plan_starts(snapshot, policy, desired, &mut crashing, &mut plan);
            }
        }
    }

    for (key, stored) in &snapshot.crash_counts {
        let Some(record) = &stored.record else {
            continue;
        };
        if record.is_expired(snapshot.now, policy.crash_count_ttl()) && !crashing.contains(key) {
            plan.expired.push(ExpiredCrashCount {
                key: key.clone(),
                expected: stored.raw.clone(),
            });
        }
    }

    plan
}

/// Stop every alive instance of `app` at index `from` or above.
fn stop_alive(snapshot: &Snapshot, app: &AppKey, from: u32, reason: StopReason, plan: &mut Plan) {
    let Some(indices) = snapshot.actual.get(app) else {
        return;
    };
    for (&index, state) in indices.range(from..) {
        if let IndexState::Alive { instance_guid } = state {
            debug!(%app, index, %instance_guid, ?reason, "planning stop");
            plan.stops.push(StopMessage {
                app_guid: app.app_guid.clone(),
                app_version: app.app_version.clone(),
                instance_index: index,
                instance_guid: instance_guid.clone(),
                reason,
            });
        }
    }
}

fn plan_starts(
    snapshot: &Snapshot,
    policy: &BackoffPolicy,
    desired: &DesiredAppState,
    crashing: &mut BTreeSet<String>,
    plan: &mut Plan,
) {
    let app = desired.app_key();
    if desired.package_state != PackageState::Staged {
        debug!(%app, package_state = ?desired.package_state, "package not staged, no starts");
        return;
    }

    let wanted = desired.wanted_instances();
    let all_crashed = wanted > 0
        && (0..wanted).all(|i| snapshot.index_state(&app, i) == Some(&IndexState::Crashed));

    for index in 0..wanted {
        let reason = match snapshot.index_state(&app, index) {
            Some(IndexState::Alive { .. }) => continue,
            Some(IndexState::Crashed) => StartReason::Crashed,
            None => StartReason::Missing,
        };
        let key = crash_count_key(&app, index);
        crashing.insert(key.clone());

        // A fully crashed app restarts from its lowest index only.
        if all_crashed && index > 0 {
            debug!(%app, index, "whole app crashed, deferring");
            continue;
        }

        if let Some(start) = gate(snapshot, policy, &app, index, key, reason) {
            plan.starts.push(start);
        }
    }
}

/// The backoff gate. Returns the start to send now, if any.
fn gate(
    snapshot: &Snapshot,
    policy: &BackoffPolicy,
    app: &AppKey,
    index: u32,
    key: String,
    reason: StartReason,
) -> Option<PlannedStart> {
    let now = snapshot.now;
    let stored = snapshot.crash_counts.get(&key);
    let previous = stored
        .and_then(|s| s.record.as_ref())
        .filter(|record| !record.is_expired(now, policy.crash_count_ttl()));

    let record = match previous {
        None => CrashCount::first(app, index, now),
        Some(record) if policy.attempt_due(record, now) => record.next_attempt(now),
        Some(record) => {
            debug!(
                %app,
                index,
                attempts = record.crash_count,
                last_attempt_at = record.last_attempt_at,
                "backing off"
            );
            return None;
        }
    };

    debug!(%app, index, attempts = record.crash_count, ?reason, "planning start");
    Some(PlannedStart {
        message: StartMessage {
            app_guid: app.app_guid.clone(),
            app_version: app.app_version.clone(),
            instance_index: index,
            reason,
        },
        key,
        expected: stored.map(|s| s.raw.clone()),
        record,
    })
}
