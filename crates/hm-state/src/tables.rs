//! redb table definitions for the HM state store.
//!
//! Both tables are keyed by the full entry path. An entry without a row in
//! `EXPIRIES` never expires.

use redb::TableDefinition;

/// Raw entry values keyed by path.
pub const ENTRIES: TableDefinition<&str, &[u8]> = TableDefinition::new("entries");

/// Absolute expiry time (unix seconds) keyed by path.
pub const EXPIRIES: TableDefinition<&str, u64> = TableDefinition::new("expiries");
