//! Common test infrastructure
//!
//! Tests should only import from this module, not from internal submodules.
//!
//! # Example
//!
//! ```no_run
//! mod common;
//! use common::{FakeProvider, FakeResolver, TestQueue};
//!
//! #[tokio::test]
//! async fn test_cycle() {
//!     let queue = TestQueue::new();
//!     queue.enqueue("r1", 1);
//!     let processor = queue.processor(FakeResolver::new(), FakeProvider::new(), 4);
//!     processor.process_pending(10).await.unwrap();
//! }
//! ```

mod fakes;
mod fixtures;

pub use fakes::{FakeProvider, FakeResolver};
pub use fixtures::TestQueue;

// Not every test binary builds subjects by hand
#[allow(unused_imports)]
pub use fixtures::subject;
