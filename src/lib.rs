//! Clinic Analysis Worker Library
//!
//! Background scheduler that runs medical report analyses through an external
//! provider. The modules are exposed for the binary and for integration tests.

pub mod analysis_queue;
pub mod cache;
pub mod config;
pub mod metrics;
pub mod server;
pub mod sqlite_persistence;

// Re-export commonly used types for convenience
pub use analysis_queue::{AnalysisProcessor, QueueWatchdog, SqliteAnalysisStore};
pub use cache::BoundedCache;
pub use server::run_server;
