//! Transactional handles consumed by the batch coordinator
//!
//! A handle is one database connection carrying at most one open transaction.
//! The coordinator never talks to a database directly; it drives handles
//! produced by a [`HandleProvider`] through the lifecycle
//! connect → start transaction → unit of work → commit or rollback → release.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod tracked;

pub use memory::{CallLog, HandleEvent, MemoryHandle, MemoryHandleProvider};
#[cfg(feature = "postgres")]
pub use postgres::{PgHandleProvider, PgProviderConfig, PgTransactionHandle};
pub use tracked::TrackedHandle;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Boxed error type used by providers for backend failures
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors raised by a transactional handle operation
#[derive(Error, Debug)]
pub enum HandleError {
    #[error("handle is not connected")]
    NotConnected,

    #[error("handle is already connected")]
    AlreadyConnected,

    #[error("no transaction is open on this handle")]
    NoActiveTransaction,

    #[error("a transaction is already open on this handle")]
    TransactionAlreadyOpen,

    #[error("handle has already been released")]
    AlreadyReleased,

    #[error("unknown isolation level: {0}")]
    UnknownIsolationLevel(String),

    #[error("backend error: {0}")]
    Backend(#[source] BoxError),
}

impl HandleError {
    /// Wrap any backend error
    pub fn backend<E>(error: E) -> Self
    where
        E: Into<BoxError>,
    {
        HandleError::Backend(error.into())
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for HandleError {
    fn from(err: sqlx::Error) -> Self {
        HandleError::Backend(Box::new(err))
    }
}

/// Transaction isolation level forwarded to `start_transaction`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    /// SQL spelling used in `BEGIN ISOLATION LEVEL ...`
    pub fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

impl FromStr for IsolationLevel {
    type Err = HandleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace(['_', '-'], " ");
        match normalized.as_str() {
            "READ UNCOMMITTED" => Ok(IsolationLevel::ReadUncommitted),
            "READ COMMITTED" => Ok(IsolationLevel::ReadCommitted),
            "REPEATABLE READ" => Ok(IsolationLevel::RepeatableRead),
            "SERIALIZABLE" => Ok(IsolationLevel::Serializable),
            _ => Err(HandleError::UnknownIsolationLevel(s.to_string())),
        }
    }
}

/// Operations the coordinator issues against a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleOperation {
    Connect,
    StartTransaction,
    CommitTransaction,
    RollbackTransaction,
    Release,
}

impl HandleOperation {
    pub(crate) const ALL: [HandleOperation; 5] = [
        HandleOperation::Connect,
        HandleOperation::StartTransaction,
        HandleOperation::CommitTransaction,
        HandleOperation::RollbackTransaction,
        HandleOperation::Release,
    ];
}

impl fmt::Display for HandleOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandleOperation::Connect => "connect",
            HandleOperation::StartTransaction => "start_transaction",
            HandleOperation::CommitTransaction => "commit_transaction",
            HandleOperation::RollbackTransaction => "rollback_transaction",
            HandleOperation::Release => "release",
        };
        f.write_str(name)
    }
}

/// A live database connection that can carry one transaction at a time
///
/// Implementations must not retry internally; the coordinator treats any
/// error returned here as fatal to the run.
#[async_trait]
pub trait TransactionalHandle: Send {
    /// Acquire the underlying connection
    async fn connect(&mut self) -> Result<(), HandleError>;

    /// Begin a transaction, using the backend default when `isolation` is `None`
    async fn start_transaction(
        &mut self,
        isolation: Option<IsolationLevel>,
    ) -> Result<(), HandleError>;

    /// Commit the open transaction
    async fn commit_transaction(&mut self) -> Result<(), HandleError>;

    /// Roll back the open transaction
    async fn rollback_transaction(&mut self) -> Result<(), HandleError>;

    /// Give the connection back to wherever it came from
    async fn release(&mut self) -> Result<(), HandleError>;
}

/// Factory producing one fresh handle per work item
pub trait HandleProvider: Send + Sync {
    /// Handle type produced by this provider
    type Handle: TransactionalHandle;

    /// Create an unconnected handle
    fn create_handle(&self) -> Self::Handle;
}

impl<P> HandleProvider for std::sync::Arc<P>
where
    P: HandleProvider + ?Sized,
{
    type Handle = P::Handle;

    fn create_handle(&self) -> Self::Handle {
        (**self).create_handle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isolation_level_parsing() {
        assert_eq!(
            "read committed".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::ReadCommitted
        );
        assert_eq!(
            "REPEATABLE_READ".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::RepeatableRead
        );
        assert_eq!(
            "serializable".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::Serializable
        );
        assert!(matches!(
            "snapshot".parse::<IsolationLevel>(),
            Err(HandleError::UnknownIsolationLevel(_))
        ));
    }

    #[test]
    fn test_isolation_level_serde() {
        let level: IsolationLevel = serde_json::from_str("\"READ_UNCOMMITTED\"").unwrap();
        assert_eq!(level, IsolationLevel::ReadUncommitted);
        assert_eq!(level.as_sql(), "READ UNCOMMITTED");
        assert_eq!(
            serde_json::to_string(&IsolationLevel::Serializable).unwrap(),
            "\"SERIALIZABLE\""
        );
    }

    #[test]
    fn test_operation_display() {
        assert_eq!(HandleOperation::StartTransaction.to_string(), "start_transaction");
        assert_eq!(HandleOperation::Release.to_string(), "release");
    }
}
