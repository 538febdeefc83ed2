use thiserror::Error;

use crate::batch::ItemError;
use crate::handle::{HandleError, HandleOperation};

/// Every item failure from a chunk that was rolled back as a whole
#[derive(Debug, Error)]
#[error("{} item(s) failed; every transaction in the chunk was rolled back", .errors.len())]
pub struct AggregateError {
    errors: Vec<ItemError>,
}

impl AggregateError {
    /// Build from failures, ordered by item index
    pub fn new(mut errors: Vec<ItemError>) -> Self {
        errors.sort_by_key(|e| e.index);
        Self { errors }
    }

    pub fn errors(&self) -> &[ItemError] {
        &self.errors
    }

    pub fn into_errors(self) -> Vec<ItemError> {
        self.errors
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Input indexes of the failed items
    pub fn indexes(&self) -> Vec<usize> {
        self.errors.iter().map(|e| e.index).collect()
    }
}

/// Why a coordinator run failed
#[derive(Debug, Error)]
pub enum RunError {
    #[error("invalid run options: {0}")]
    InvalidOptions(String),

    /// Fail-fast policy: the failing chunk was fully rolled back
    #[error(transparent)]
    Aggregate(#[from] AggregateError),

    /// Error-callback policy: the first failure observed, after commits
    #[error("{failed} item(s) failed; first failure: {first}")]
    ItemFailed { first: ItemError, failed: usize },

    /// A handle operation failed; never retried
    ///
    /// `failures` holds the item errors of the same chunk, ordered by index.
    #[error("{operation} failed for item {index}: {source}")]
    Provider {
        index: usize,
        operation: HandleOperation,
        #[source]
        source: HandleError,
        failures: Vec<ItemError>,
    },
}

impl RunError {
    /// Item failures carried by this error, if any
    pub fn item_errors(&self) -> Vec<&ItemError> {
        match self {
            RunError::Aggregate(aggregate) => aggregate.errors().iter().collect(),
            RunError::ItemFailed { first, .. } => vec![first],
            RunError::Provider { failures, .. } => failures.iter().collect(),
            RunError::InvalidOptions(_) => Vec::new(),
        }
    }

    /// Attach item failures observed in the same chunk to a provider error
    pub(crate) fn with_item_failures(self, mut items: Vec<ItemError>) -> Self {
        match self {
            RunError::Provider {
                index,
                operation,
                source,
                mut failures,
            } => {
                failures.append(&mut items);
                failures.sort_by_key(|f| f.index);
                RunError::Provider {
                    index,
                    operation,
                    source,
                    failures,
                }
            }
            other => other,
        }
    }

    pub fn is_provider_error(&self) -> bool {
        matches!(self, RunError::Provider { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn test_aggregate_orders_by_index() {
        let aggregate = AggregateError::new(vec![
            ItemError::new(3, anyhow!("three")),
            ItemError::new(1, anyhow!("one")),
        ]);
        assert_eq!(aggregate.indexes(), vec![1, 3]);
        assert_eq!(
            aggregate.to_string(),
            "2 item(s) failed; every transaction in the chunk was rolled back"
        );

        let err = RunError::from(aggregate);
        assert_eq!(err.item_errors().len(), 2);
        assert!(!err.is_provider_error());
    }

    #[test]
    fn test_provider_error_display() {
        let err = RunError::Provider {
            index: 4,
            operation: HandleOperation::CommitTransaction,
            source: HandleError::NoActiveTransaction,
            failures: Vec::new(),
        };
        assert_eq!(
            err.to_string(),
            "commit_transaction failed for item 4: no transaction is open on this handle"
        );
        assert!(err.is_provider_error());
        assert!(err.item_errors().is_empty());
    }

    #[test]
    fn test_provider_error_keeps_item_failures() {
        let err = RunError::Provider {
            index: 0,
            operation: HandleOperation::RollbackTransaction,
            source: HandleError::NoActiveTransaction,
            failures: Vec::new(),
        }
        .with_item_failures(vec![
            ItemError::new(5, anyhow!("five")),
            ItemError::new(2, anyhow!("two")),
        ]);

        let indexes: Vec<usize> = err.item_errors().iter().map(|e| e.index).collect();
        assert_eq!(indexes, vec![2, 5]);

        let untouched = RunError::InvalidOptions("zero".to_string())
            .with_item_failures(vec![ItemError::new(1, anyhow!("one"))]);
        assert!(untouched.item_errors().is_empty());
    }
}
