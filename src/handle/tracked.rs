//! Handle wrapper carrying the per-item failure marker

use tracing::warn;

use super::{HandleError, IsolationLevel, TransactionalHandle};

/// Where a tracked handle is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    Created,
    Connected,
    InTransaction,
    /// Commit or rollback has been issued
    Finished,
    Released,
}

/// A transactional handle owned by exactly one work item
///
/// Every operation forwards to the wrapped handle and returns its result
/// unchanged. The wrapper only adds the failure marker and enough lifecycle
/// bookkeeping for the coordinator to know which calls are still owed.
pub struct TrackedHandle<H> {
    inner: H,
    index: usize,
    failed: bool,
    lifecycle: Lifecycle,
}

impl<H: TransactionalHandle> TrackedHandle<H> {
    /// Wrap a fresh handle for the item at `index`
    pub fn new(index: usize, inner: H) -> Self {
        Self {
            inner,
            index,
            failed: false,
            lifecycle: Lifecycle::Created,
        }
    }

    /// Index of the owning item in the run's input
    pub fn index(&self) -> usize {
        self.index
    }

    /// Whether the unit of work failed on this handle
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    pub(crate) fn mark_failed(&mut self) {
        debug_assert!(!self.failed, "failure marker set twice for item {}", self.index);
        self.failed = true;
    }

    #[cfg(test)]
    pub(crate) fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    /// True while a transaction is open and neither commit nor rollback was issued
    pub fn has_open_transaction(&self) -> bool {
        self.lifecycle == Lifecycle::InTransaction
    }

    /// True once `release` has been issued
    pub fn is_released(&self) -> bool {
        self.lifecycle == Lifecycle::Released
    }

    /// The wrapped handle, as handed to the unit of work
    pub fn inner_mut(&mut self) -> &mut H {
        &mut self.inner
    }

    /// Connect the wrapped handle
    pub async fn connect(&mut self) -> Result<(), HandleError> {
        self.inner.connect().await?;
        self.lifecycle = Lifecycle::Connected;
        Ok(())
    }

    /// Begin a transaction on the wrapped handle
    pub async fn start_transaction(
        &mut self,
        isolation: Option<IsolationLevel>,
    ) -> Result<(), HandleError> {
        self.inner.start_transaction(isolation).await?;
        self.lifecycle = Lifecycle::InTransaction;
        Ok(())
    }

    /// Commit; the transaction counts as finished even if the backend fails
    pub async fn commit_transaction(&mut self) -> Result<(), HandleError> {
        self.lifecycle = Lifecycle::Finished;
        self.inner.commit_transaction().await
    }

    /// Roll back; like commit, issued at most once
    pub async fn rollback_transaction(&mut self) -> Result<(), HandleError> {
        self.lifecycle = Lifecycle::Finished;
        self.inner.rollback_transaction().await
    }

    /// Release the wrapped handle
    pub async fn release(&mut self) -> Result<(), HandleError> {
        self.lifecycle = Lifecycle::Released;
        self.inner.release().await
    }
}

impl<H> Drop for TrackedHandle<H> {
    fn drop(&mut self) {
        if self.lifecycle != Lifecycle::Released {
            warn!(
                item_index = self.index,
                lifecycle = ?self.lifecycle,
                "Transactional handle dropped without being released"
            );
        }
    }
}
