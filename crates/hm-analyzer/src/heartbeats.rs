//! Latest heartbeat per execution host.

use std::collections::HashMap;

use hm_state::Heartbeat;
use tracing::debug;

/// Each host's most recent heartbeat replaces the previous one. A host that
/// stays silent for the heartbeat TTL drops out of the snapshot, so its
/// instances read as missing.
#[derive(Debug, Default)]
pub struct HeartbeatBook {
    hosts: HashMap<String, Received>,
}

#[derive(Debug)]
struct Received {
    at: u64,
    heartbeat: Heartbeat,
}

impl HeartbeatBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, heartbeat: Heartbeat, now: u64) {
        self.hosts.insert(
            heartbeat.host_id.clone(),
            Received { at: now, heartbeat },
        );
    }

    /// Forget hosts silent for `ttl` seconds, then return the rest ordered
    /// by host id.
    pub fn snapshot(&mut self, now: u64, ttl: u64) -> Vec<Heartbeat> {
        self.hosts.retain(|host_id, received| {
            let live = now.saturating_sub(received.at) < ttl;
            if !live {
                debug!(%host_id, last_seen = received.at, "host heartbeat expired");
            }
            live
        });

        let mut heartbeats: Vec<Heartbeat> = self
            .hosts
            .values()
            .map(|received| received.heartbeat.clone())
            .collect();
        heartbeats.sort_by(|a, b| a.host_id.cmp(&b.host_id));
        heartbeats
    }

    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }
}
