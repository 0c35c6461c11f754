//! hm-state — durable TTL store for the HM health manager.
//!
//! Backed by [redb](https://docs.rs/redb). Keys are slash-separated paths
//! (`/desired/{guid}-{version}`) and every entry may carry a time-to-live.
//! Reads of an expired key behave exactly like reads of a missing key.
//!
//! # Architecture
//!
//! ```text
//! StateStore
//!   ├── entries   path → raw value bytes
//!   ├── expiries  path → absolute expiry (unix seconds)
//!   └── TimeProvider (decides what "expired" means right now)
//! ```
//!
//! Values are opaque bytes to the store. Domain records (desired state,
//! crash counts, freshness markers) are JSON and have typed helpers.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod freshness;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use freshness::FreshnessSignal;
pub use store::{StateStore, StoreNode};
pub use types::*;
