//! Versioned SQLite schema helpers shared by the on-disk stores.

mod versioned_schema;

pub use versioned_schema::{open_versioned, Column, SqlType, Table, VersionedSchema};

/// Offset applied to `PRAGMA user_version` so that databases created by this service
/// can be told apart from unrelated SQLite files.
pub const BASE_DB_VERSION: usize = 7100;
