pub mod chunking;
pub mod coordinator;
pub mod error;
pub mod types;

pub use chunking::{partition_failed, plan_chunks};
pub use coordinator::{BatchCoordinator, UnitOfWorkFuture};
pub use error::{AggregateError, RunError};
pub use types::*;
