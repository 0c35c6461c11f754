//! hm-analyzer — crash detection and restart backoff.
//!
//! Each tick compares the heartbeat snapshot with the stored desired state
//! and decides which instances to start or stop.
//!
//! # Tick
//!
//! ```text
//! freshness marker live?  ── no ──▶ DesiredStateNotFresh, no action
//!        │ yes
//!        ▼
//! Snapshot { desired, heartbeats, crash counts }   (read once)
//!        │
//!        ▼
//! decision::plan()        pure, one action per instance index at most
//!        │
//!        ▼
//! compare-and-put crash counts ──▶ publish starts / stops
//! ```
//!
//! # Per index
//!
//! - alive: nothing; an existing crash count is kept
//! - crashed or missing: start, subject to the [`BackoffPolicy`]
//! - at or beyond the desired count and alive: stop
//!
//! When every desired index of an app reports crashed, only index 0 is
//! started until something comes back up.

pub mod analyzer;
pub mod backoff;
pub mod decision;
pub mod error;
pub mod heartbeats;
pub mod snapshot;

pub use analyzer::{Analyzer, AnalyzerSettings, TickReport};
pub use backoff::BackoffPolicy;
pub use decision::{ExpiredCrashCount, Plan, PlannedStart};
pub use error::{AnalyzerError, AnalyzerResult};
pub use heartbeats::HeartbeatBook;
pub use snapshot::{IndexState, Snapshot, StoredCrashCount};
