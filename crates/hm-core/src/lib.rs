//! hm-core — shared plumbing for the HM health manager.
//!
//! Holds the pieces every other crate leans on:
//!
//! - [`HmConfig`]: TOML configuration with defaults and validation
//! - [`TimeProvider`]: wall clock and a manually driven virtual clock
//! - [`MessageBus`]: fire-and-forget publish plus single-shot request/reply,
//!   with [`LocalBus`] as the in-process implementation

pub mod bus;
pub mod clock;
pub mod config;

pub use bus::{BusError, BusMessage, LocalBus, MessageBus, ReplyFuture};
pub use clock::{ManualClock, SystemClock, TimeProvider};
pub use config::{Credentials, HmConfig};
