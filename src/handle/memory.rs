//! In-memory transactional handles that record every call
//!
//! Nothing is persisted. The provider exists so coordinator behaviour can be
//! observed and scripted without a database: every handle operation is
//! appended to a shared [`CallLog`], and individual operations can be made to
//! fail for a chosen handle.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::trace;

use super::{HandleError, HandleOperation, HandleProvider, IsolationLevel, TransactionalHandle};

/// One recorded handle call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleEvent {
    /// Creation-order id of the handle
    pub handle: usize,
    pub operation: HandleOperation,
    /// Isolation requested, only set for `StartTransaction`
    pub isolation: Option<IsolationLevel>,
    pub succeeded: bool,
}

#[derive(Debug, Default)]
struct LogState {
    events: Vec<HandleEvent>,
    handles_created: usize,
    open_connections: usize,
    peak_open_connections: usize,
    open_transactions: usize,
    peak_open_transactions: usize,
}

/// Shared, cloneable record of every call made against memory handles
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    state: Arc<Mutex<LogState>>,
}

impl CallLog {
    /// All events in the order they happened
    pub fn events(&self) -> Vec<HandleEvent> {
        self.state.lock().events.clone()
    }

    /// Number of successful calls of `operation` across all handles
    pub fn count(&self, operation: HandleOperation) -> usize {
        self.state
            .lock()
            .events
            .iter()
            .filter(|e| e.operation == operation && e.succeeded)
            .count()
    }

    /// Number of calls (successful or not) of `operation` on one handle
    pub fn attempts_for(&self, handle: usize, operation: HandleOperation) -> usize {
        self.state
            .lock()
            .events
            .iter()
            .filter(|e| e.handle == handle && e.operation == operation)
            .count()
    }

    /// Ordered operations issued against one handle
    pub fn operations_for(&self, handle: usize) -> Vec<HandleOperation> {
        self.state
            .lock()
            .events
            .iter()
            .filter(|e| e.handle == handle)
            .map(|e| e.operation)
            .collect()
    }

    /// Ids of handles that successfully committed, in commit order
    pub fn committed_handles(&self) -> Vec<usize> {
        self.handles_with(HandleOperation::CommitTransaction)
    }

    /// Ids of handles that successfully rolled back, in rollback order
    pub fn rolled_back_handles(&self) -> Vec<usize> {
        self.handles_with(HandleOperation::RollbackTransaction)
    }

    fn handles_with(&self, operation: HandleOperation) -> Vec<usize> {
        self.state
            .lock()
            .events
            .iter()
            .filter(|e| e.operation == operation && e.succeeded)
            .map(|e| e.handle)
            .collect()
    }

    /// Isolation level passed to each `start_transaction` call
    pub fn isolation_levels(&self) -> Vec<Option<IsolationLevel>> {
        self.state
            .lock()
            .events
            .iter()
            .filter(|e| e.operation == HandleOperation::StartTransaction)
            .map(|e| e.isolation)
            .collect()
    }

    pub fn handles_created(&self) -> usize {
        self.state.lock().handles_created
    }

    pub fn open_connections(&self) -> usize {
        self.state.lock().open_connections
    }

    /// Highest number of simultaneously connected handles seen so far
    pub fn peak_open_connections(&self) -> usize {
        self.state.lock().peak_open_connections
    }

    pub fn open_transactions(&self) -> usize {
        self.state.lock().open_transactions
    }

    /// Highest number of simultaneously open transactions seen so far
    pub fn peak_open_transactions(&self) -> usize {
        self.state.lock().peak_open_transactions
    }

    fn record(&self, event: HandleEvent) {
        let mut state = self.state.lock();
        if event.succeeded {
            match event.operation {
                HandleOperation::Connect => {
                    state.open_connections += 1;
                    state.peak_open_connections =
                        state.peak_open_connections.max(state.open_connections);
                }
                HandleOperation::StartTransaction => {
                    state.open_transactions += 1;
                    state.peak_open_transactions =
                        state.peak_open_transactions.max(state.open_transactions);
                }
                HandleOperation::CommitTransaction | HandleOperation::RollbackTransaction => {
                    state.open_transactions = state.open_transactions.saturating_sub(1);
                }
                HandleOperation::Release => {}
            }
        }
        state.events.push(event);
    }

    fn close_connection(&self) {
        let mut state = self.state.lock();
        state.open_connections = state.open_connections.saturating_sub(1);
    }

    fn abort_transaction(&self) {
        let mut state = self.state.lock();
        state.open_transactions = state.open_transactions.saturating_sub(1);
    }
}

/// Provider of [`MemoryHandle`]s sharing one [`CallLog`]
#[derive(Debug, Default)]
pub struct MemoryHandleProvider {
    log: CallLog,
    next_id: AtomicUsize,
    failures: HashSet<(usize, HandleOperation)>,
    latency: Option<Duration>,
}

impl MemoryHandleProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `operation` fail on the handle created `handle`-th (zero based)
    pub fn fail_on(mut self, handle: usize, operation: HandleOperation) -> Self {
        self.failures.insert((handle, operation));
        self
    }

    /// Sleep for `latency` inside every handle operation
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Shared log of every call made by handles from this provider
    pub fn call_log(&self) -> CallLog {
        self.log.clone()
    }
}

impl HandleProvider for MemoryHandleProvider {
    type Handle = MemoryHandle;

    fn create_handle(&self) -> MemoryHandle {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.log.state.lock().handles_created += 1;
        trace!(handle = id, "Created memory handle");

        let failures = HandleOperation::ALL
            .iter()
            .copied()
            .filter(|op| self.failures.contains(&(id, *op)))
            .collect();

        MemoryHandle {
            id,
            log: self.log.clone(),
            failures,
            latency: self.latency,
            state: MemoryState::Idle,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MemoryState {
    Idle,
    Connected,
    InTransaction,
    Released,
}

/// Handle that enforces lifecycle ordering and records each call
#[derive(Debug)]
pub struct MemoryHandle {
    id: usize,
    log: CallLog,
    failures: Vec<HandleOperation>,
    latency: Option<Duration>,
    state: MemoryState,
}

impl MemoryHandle {
    /// Creation-order id of this handle
    pub fn id(&self) -> usize {
        self.id
    }

    /// Whether a transaction is currently open
    pub fn in_transaction(&self) -> bool {
        self.state == MemoryState::InTransaction
    }

    async fn pause(&self) {
        match self.latency {
            Some(latency) => tokio::time::sleep(latency).await,
            None => tokio::task::yield_now().await,
        }
    }

    fn scripted_failure(&self, operation: HandleOperation) -> Option<HandleError> {
        self.failures.contains(&operation).then(|| {
            HandleError::backend(format!(
                "scripted {} failure on memory handle {}",
                operation, self.id
            ))
        })
    }

    fn finish(
        &self,
        operation: HandleOperation,
        isolation: Option<IsolationLevel>,
        result: Result<(), HandleError>,
    ) -> Result<(), HandleError> {
        self.log.record(HandleEvent {
            handle: self.id,
            operation,
            isolation,
            succeeded: result.is_ok(),
        });
        result
    }

    fn end_transaction(&mut self, operation: HandleOperation) -> Result<(), HandleError> {
        let result = match self.state {
            MemoryState::InTransaction => match self.scripted_failure(operation) {
                Some(err) => {
                    // A failed commit or rollback still ends the transaction
                    self.log.abort_transaction();
                    self.state = MemoryState::Connected;
                    Err(err)
                }
                None => {
                    self.state = MemoryState::Connected;
                    Ok(())
                }
            },
            MemoryState::Released => Err(HandleError::AlreadyReleased),
            _ => Err(HandleError::NoActiveTransaction),
        };
        self.finish(operation, None, result)
    }
}

#[async_trait]
impl TransactionalHandle for MemoryHandle {
    async fn connect(&mut self) -> Result<(), HandleError> {
        self.pause().await;
        let result = match self.state {
            MemoryState::Idle => match self.scripted_failure(HandleOperation::Connect) {
                Some(err) => Err(err),
                None => {
                    self.state = MemoryState::Connected;
                    Ok(())
                }
            },
            MemoryState::Released => Err(HandleError::AlreadyReleased),
            _ => Err(HandleError::AlreadyConnected),
        };
        self.finish(HandleOperation::Connect, None, result)
    }

    async fn start_transaction(
        &mut self,
        isolation: Option<IsolationLevel>,
    ) -> Result<(), HandleError> {
        self.pause().await;
        let result = match self.state {
            MemoryState::Connected => match self.scripted_failure(HandleOperation::StartTransaction) {
                Some(err) => Err(err),
                None => {
                    self.state = MemoryState::InTransaction;
                    Ok(())
                }
            },
            MemoryState::InTransaction => Err(HandleError::TransactionAlreadyOpen),
            MemoryState::Released => Err(HandleError::AlreadyReleased),
            MemoryState::Idle => Err(HandleError::NotConnected),
        };
        self.finish(HandleOperation::StartTransaction, isolation, result)
    }

    async fn commit_transaction(&mut self) -> Result<(), HandleError> {
        self.pause().await;
        self.end_transaction(HandleOperation::CommitTransaction)
    }

    async fn rollback_transaction(&mut self) -> Result<(), HandleError> {
        self.pause().await;
        self.end_transaction(HandleOperation::RollbackTransaction)
    }

    async fn release(&mut self) -> Result<(), HandleError> {
        self.pause().await;
        let previous = self.state;
        let result = match previous {
            MemoryState::Released => Err(HandleError::AlreadyReleased),
            _ => match self.scripted_failure(HandleOperation::Release) {
                Some(err) => Err(err),
                None => Ok(()),
            },
        };
        if previous != MemoryState::Released {
            // The connection is gone whether or not the release call succeeded
            if previous == MemoryState::InTransaction {
                self.log.abort_transaction();
            }
            if previous != MemoryState::Idle {
                self.log.close_connection();
            }
            self.state = MemoryState::Released;
        }
        self.finish(HandleOperation::Release, None, result)
    }
}
