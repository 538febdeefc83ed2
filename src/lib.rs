//! # parallel-tx
//!
//! Run one database transaction per work item, a bounded number at a time,
//! and decide consistently which of them commit.
//!
//! ## Overview
//!
//! [`BatchCoordinator`] takes a list of items and a unit of work. Items are
//! split into chunks no larger than `max_concurrency`; inside a chunk every
//! item gets its own freshly connected handle with an open transaction, and
//! all units of work run concurrently on the calling task. Once every item in
//! the chunk has settled, the [`FailurePolicy`] decides which transactions
//! commit and which roll back. Chunks run strictly one after another.
//!
//! ## Quick Start
//!
//! ```rust
//! use parallel_tx::{BatchCoordinator, RunOptions};
//! use parallel_tx::handle::MemoryHandleProvider;
//!
//! # async fn example() -> parallel_tx::Result<()> {
//! let coordinator = BatchCoordinator::new(MemoryHandleProvider::new());
//!
//! let doubled = coordinator
//!     .run(
//!         vec![1, 2, 3],
//!         |n: i32, _tx| Box::pin(async move { Ok(n * 2) }),
//!         RunOptions::new().with_max_concurrency(2),
//!     )
//!     .await?;
//!
//! assert_eq!(doubled, vec![2, 4, 6]);
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`batch`]: the coordinator, run options, failure policies and errors
//! - [`handle`]: the transactional handle interface, the tracking wrapper,
//!   and the Postgres and in-memory providers
//! - [`telemetry`]: tracing subscriber setup

#![warn(rustdoc::missing_crate_level_docs)]

/// Result type for coordinator runs
pub type Result<T> = std::result::Result<T, batch::RunError>;

/// Batch coordination over transactional handles
pub mod batch;

/// Transactional handle interface and providers
pub mod handle;

/// Tracing setup
pub mod telemetry;

pub use batch::{
    AggregateError, BatchCoordinator, ErrorCallback, FailurePolicy, ItemError, RunError,
    RunOptions, RunReport, RunStats, UnitOfWorkFuture,
};
pub use handle::{HandleError, HandleProvider, IsolationLevel, TransactionalHandle};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{HandleOperation, MemoryHandleProvider};

    #[tokio::test]
    async fn test_coordinator_smoke() {
        let provider = MemoryHandleProvider::new();
        let log = provider.call_log();
        let coordinator = BatchCoordinator::new(provider);

        let values = coordinator
            .run(
                vec!["a", "b"],
                |item, _tx| Box::pin(async move { Ok(item.len()) }),
                RunOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(values, vec![1, 1]);
        assert_eq!(log.count(HandleOperation::CommitTransaction), 2);
    }

    #[test]
    fn test_default_policy_is_fail_fast() {
        assert_eq!(FailurePolicy::default(), FailurePolicy::FailFast);
    }
}
