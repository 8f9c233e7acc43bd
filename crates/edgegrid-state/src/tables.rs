//! redb table definitions for the EdgeGrid sample store.
//!
//! Keys are `{timestamp_ms:020}:{seq:020}` so a lexicographic scan is also
//! a chronological one; values are JSON-serialized samples.

use redb::TableDefinition;

/// Raw response-time samples emitted by the dispatcher.
pub const RESPONSE_TIMES: TableDefinition<&str, &[u8]> = TableDefinition::new("response_times");

/// Raw per-function CPU usage samples.
pub const RESOURCE_DATA: TableDefinition<&str, &[u8]> = TableDefinition::new("resource_data");

/// Build a sample key. Zero padding keeps string order equal to time order.
pub fn sample_key(timestamp_ms: u64, seq: u64) -> String {
    format!("{timestamp_ms:020}:{seq:020}")
}
