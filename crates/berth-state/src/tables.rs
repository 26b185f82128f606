//! redb table definitions for the berth state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized types).

use redb::TableDefinition;

/// Certificate records keyed by domain.
pub const CERTIFICATES: TableDefinition<&str, &[u8]> = TableDefinition::new("certificates");

/// Spec history keyed by `{environment}/{service}`.
pub const SPEC_HISTORY: TableDefinition<&str, &[u8]> = TableDefinition::new("spec_history");

/// Latest rollout report keyed by environment name.
pub const ROLLOUTS: TableDefinition<&str, &[u8]> = TableDefinition::new("rollouts");
