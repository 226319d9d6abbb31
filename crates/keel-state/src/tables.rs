//! redb table definitions for the Keel state store.
//!
//! Tables use `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Job update configurations keyed by `{role}/{job}`.
pub const UPDATE_CONFIGS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("job_update_configs");
