//! Batch Coordinator
//!
//! Runs one transaction per work item with:
//! - Bounded concurrency through sequential chunks
//! - Concurrent units of work polled on the calling task
//! - A commit/rollback decision per chunk driven by [`FailurePolicy`]
//! - Guaranteed release of every handle, including on provider failures

use std::any::Any;
use std::panic::AssertUnwindSafe;

use anyhow::anyhow;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::batch::chunking::{partition_failed, plan_chunks};
use crate::batch::{
    AggregateError, FailurePolicy, ItemError, RunError, RunOptions, RunReport, RunStats,
};
use crate::handle::{
    HandleError, HandleOperation, HandleProvider, IsolationLevel, TrackedHandle,
    TransactionalHandle,
};
use crate::Result;

/// Future returned by a unit of work borrowing its handle for `'h`
pub type UnitOfWorkFuture<'h, R> = BoxFuture<'h, anyhow::Result<R>>;

/// How one item's execution ended
enum Outcome<R> {
    Completed(R),
    Failed(anyhow::Error),
    /// `connect` or `start_transaction` failed; the unit of work never ran
    SetupFailed {
        operation: HandleOperation,
        error: HandleError,
    },
}

struct Settled<H, R> {
    handle: TrackedHandle<H>,
    outcome: Outcome<R>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Commit,
    Rollback,
}

/// What a failed commit or rollback means for the handles still waiting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommitFailure {
    /// Roll back every remaining handle
    RollBackRest,
    /// Keep the original decision for the remaining handles
    KeepCommitting,
}

/// Everything observed once all items of a chunk have settled
struct ChunkOutcome<H, R> {
    /// Creation order
    handles: Vec<TrackedHandle<H>>,
    /// Item order
    values: Vec<(usize, R)>,
    /// Settlement order
    failures: Vec<ItemError>,
    setup_error: Option<RunError>,
}

/// Coordinates one transaction per work item over handles from a provider
pub struct BatchCoordinator<P> {
    provider: P,
}

impl<P: HandleProvider> BatchCoordinator<P> {
    /// Create a coordinator drawing one fresh handle per item from `provider`
    pub fn new(provider: P) -> Self {
        Self { provider }
    }

    /// The provider handles are created from
    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Run `unit_of_work` once per item and return the values of the items
    /// whose transactions were committed, in input order
    ///
    /// Under [`FailurePolicy::RetainSuccessful`] failed items are left out of
    /// the returned values; use [`run_report`](Self::run_report) to inspect them.
    pub async fn run<T, R, F>(
        &self,
        items: Vec<T>,
        unit_of_work: F,
        options: RunOptions,
    ) -> Result<Vec<R>>
    where
        F: for<'h> Fn(T, &'h mut P::Handle) -> UnitOfWorkFuture<'h, R>,
    {
        let report = self.run_report(items, unit_of_work, options).await?;
        Ok(report.values)
    }

    /// Run a unit of work that produces no value
    pub async fn execute<T, F>(
        &self,
        items: Vec<T>,
        unit_of_work: F,
        options: RunOptions,
    ) -> Result<()>
    where
        F: for<'h> Fn(T, &'h mut P::Handle) -> UnitOfWorkFuture<'h, ()>,
    {
        self.run_report(items, unit_of_work, options).await?;
        Ok(())
    }

    /// Run and return values, retained failures and counters
    #[instrument(
        skip_all,
        fields(
            run_id = tracing::field::Empty,
            item_count = items.len(),
            max_concurrency = ?options.max_concurrency,
            policy = %options.failure_policy,
        )
    )]
    pub async fn run_report<T, R, F>(
        &self,
        items: Vec<T>,
        unit_of_work: F,
        options: RunOptions,
    ) -> Result<RunReport<R>>
    where
        F: for<'h> Fn(T, &'h mut P::Handle) -> UnitOfWorkFuture<'h, R>,
    {
        options.validate()?;

        let run_id = Uuid::new_v4();
        tracing::Span::current().record("run_id", tracing::field::display(run_id));
        let mut report = RunReport::new(run_id, items.len());

        if items.is_empty() {
            debug!("No items to run");
            return Ok(report);
        }

        let chunks = plan_chunks(items.len(), options.max_concurrency);
        info!(
            total_items = items.len(),
            chunk_count = chunks.len(),
            isolation = ?options.isolation_level,
            "Starting parallel transaction run"
        );

        let mut remaining = items.into_iter();
        for (chunk_index, range) in chunks.into_iter().enumerate() {
            debug!(chunk = chunk_index, start = range.start, end = range.end, "Opening chunk");

            let chunk: Vec<(usize, T)> = range.zip(remaining.by_ref()).collect();
            let settled = self
                .settle_chunk(chunk, &unit_of_work, options.isolation_level)
                .await;
            report.stats.chunks += 1;

            if let Err(err) = self.resolve_chunk(settled, &options, &mut report).await {
                error!(
                    chunk = chunk_index,
                    error = %err,
                    committed = report.stats.committed,
                    rolled_back = report.stats.rolled_back,
                    "Parallel transaction run failed"
                );
                return Err(err);
            }
        }

        info!(
            committed = report.stats.committed,
            rolled_back = report.stats.rolled_back,
            failed = report.failures.len(),
            chunks = report.stats.chunks,
            "Parallel transaction run completed"
        );

        Ok(report)
    }

    /// Open a handle per item and drive every unit of work until all settle
    async fn settle_chunk<T, R, F>(
        &self,
        chunk: Vec<(usize, T)>,
        unit_of_work: &F,
        isolation: Option<IsolationLevel>,
    ) -> ChunkOutcome<P::Handle, R>
    where
        F: for<'h> Fn(T, &'h mut P::Handle) -> UnitOfWorkFuture<'h, R>,
    {
        let size = chunk.len();
        let mut in_flight = FuturesUnordered::new();
        for (index, item) in chunk {
            let handle = TrackedHandle::new(index, self.provider.create_handle());
            in_flight.push(run_item(handle, item, unit_of_work, isolation));
        }

        let mut outcome = ChunkOutcome {
            handles: Vec::with_capacity(size),
            values: Vec::with_capacity(size),
            failures: Vec::new(),
            setup_error: None,
        };

        while let Some(Settled { mut handle, outcome: item_outcome }) = in_flight.next().await {
            let index = handle.index();
            match item_outcome {
                Outcome::Completed(value) => outcome.values.push((index, value)),
                Outcome::Failed(error) => {
                    handle.mark_failed();
                    warn!(item_index = index, error = %error, "Unit of work failed");
                    outcome.failures.push(ItemError::new(index, error));
                }
                Outcome::SetupFailed { operation, error } => {
                    error!(item_index = index, %operation, error = %error, "Could not open transaction");
                    if outcome.setup_error.is_none() {
                        outcome.setup_error = Some(RunError::Provider {
                            index,
                            operation,
                            source: error,
                            failures: Vec::new(),
                        });
                    }
                }
            }
            outcome.handles.push(handle);
        }

        outcome.handles.sort_by_key(|h| h.index());
        outcome.values.sort_by_key(|(index, _)| *index);
        outcome
    }

    /// Apply the failure policy to a settled chunk, then commit what remains
    async fn resolve_chunk<R>(
        &self,
        chunk: ChunkOutcome<P::Handle, R>,
        options: &RunOptions,
        report: &mut RunReport<R>,
    ) -> Result<()> {
        let ChunkOutcome {
            handles,
            values,
            mut failures,
            setup_error,
        } = chunk;
        report.stats.handles_opened += handles.len();

        if options.failure_policy == FailurePolicy::ErrorCallback {
            if let Some(callback) = &options.on_error {
                for failure in &failures {
                    callback(failure);
                }
            }
        }

        if let Some(err) = setup_error {
            // Nothing from a chunk that could not fully open may persist
            let cleanup = finish_handles(
                handles,
                Decision::Rollback,
                CommitFailure::RollBackRest,
                &mut report.stats,
            )
            .await;
            if let Err(cleanup) = cleanup {
                warn!(error = %cleanup, "Cleanup after failed setup also failed");
            }
            return Err(err.with_item_failures(failures));
        }

        if failures.is_empty() {
            finish_handles(
                handles,
                Decision::Commit,
                CommitFailure::RollBackRest,
                &mut report.stats,
            )
            .await?;
            report.values.extend(values.into_iter().map(|(_, value)| value));
            return Ok(());
        }

        match options.failure_policy {
            FailurePolicy::FailFast => {
                let rolled_back = finish_handles(
                    handles,
                    Decision::Rollback,
                    CommitFailure::RollBackRest,
                    &mut report.stats,
                )
                .await;
                if let Err(err) = rolled_back {
                    return Err(err.with_item_failures(failures));
                }
                Err(AggregateError::new(failures).into())
            }
            FailurePolicy::RetainSuccessful => {
                if let Err(err) =
                    finish_partitioned(handles, CommitFailure::RollBackRest, &mut report.stats).await
                {
                    return Err(err.with_item_failures(failures));
                }

                failures.sort_by_key(|f| f.index);
                report.failures.extend(failures);
                report.values.extend(values.into_iter().map(|(_, value)| value));
                Ok(())
            }
            FailurePolicy::ErrorCallback => {
                // The run fails either way, so every surviving commit is still attempted
                if let Err(err) =
                    finish_partitioned(handles, CommitFailure::KeepCommitting, &mut report.stats).await
                {
                    return Err(err.with_item_failures(failures));
                }

                let failed = failures.len();
                let first = failures.remove(0);
                Err(RunError::ItemFailed { first, failed })
            }
        }
    }
}

/// Connect, begin, and run one item's unit of work on its own handle
async fn run_item<H, T, R, F>(
    mut handle: TrackedHandle<H>,
    item: T,
    unit_of_work: &F,
    isolation: Option<IsolationLevel>,
) -> Settled<H, R>
where
    H: TransactionalHandle,
    F: for<'h> Fn(T, &'h mut H) -> UnitOfWorkFuture<'h, R>,
{
    if let Err(error) = handle.connect().await {
        return Settled {
            handle,
            outcome: Outcome::SetupFailed {
                operation: HandleOperation::Connect,
                error,
            },
        };
    }
    if let Err(error) = handle.start_transaction(isolation).await {
        return Settled {
            handle,
            outcome: Outcome::SetupFailed {
                operation: HandleOperation::StartTransaction,
                error,
            },
        };
    }

    // Building the future happens inside the catch so a closure that panics
    // before returning still leaves the handle for rollback and release
    let result = AssertUnwindSafe(async { unit_of_work(item, handle.inner_mut()).await })
        .catch_unwind()
        .await;

    let outcome = match result {
        Ok(Ok(value)) => Outcome::Completed(value),
        Ok(Err(error)) => Outcome::Failed(error),
        Err(panic) => Outcome::Failed(anyhow!(
            "unit of work panicked: {}",
            panic_message(panic.as_ref())
        )),
    };

    Settled { handle, outcome }
}

/// Roll back failed handles, then commit the others in creation order
///
/// With [`CommitFailure::RollBackRest`] a failed rollback rolls back the
/// others too; with [`CommitFailure::KeepCommitting`] every commit is attempted.
async fn finish_partitioned<H>(
    handles: Vec<TrackedHandle<H>>,
    on_failure: CommitFailure,
    stats: &mut RunStats,
) -> Result<()>
where
    H: TransactionalHandle,
{
    let (failed, succeeded) = partition_failed(handles);
    let rolled_back = finish_handles(failed, Decision::Rollback, on_failure, stats).await;
    let decision = if rolled_back.is_ok() || on_failure == CommitFailure::KeepCommitting {
        Decision::Commit
    } else {
        Decision::Rollback
    };
    let committed = finish_handles(succeeded, decision, on_failure, stats).await;
    rolled_back.and(committed)
}

/// Commit or roll back each handle in order, then release it
///
/// Unless `on_failure` says otherwise, once a commit fails the remaining
/// handles are rolled back instead. Every handle is released regardless; the
/// first provider error is returned.
async fn finish_handles<H>(
    handles: Vec<TrackedHandle<H>>,
    decision: Decision,
    on_failure: CommitFailure,
    stats: &mut RunStats,
) -> Result<()>
where
    H: TransactionalHandle,
{
    let mut decision = decision;
    let mut first_error: Option<RunError> = None;

    for mut handle in handles {
        let index = handle.index();

        if handle.has_open_transaction() {
            let (operation, result) = match decision {
                Decision::Commit => (
                    HandleOperation::CommitTransaction,
                    handle.commit_transaction().await,
                ),
                Decision::Rollback => (
                    HandleOperation::RollbackTransaction,
                    handle.rollback_transaction().await,
                ),
            };

            match result {
                Ok(()) if decision == Decision::Commit => stats.committed += 1,
                Ok(()) => stats.rolled_back += 1,
                Err(source) => {
                    error!(item_index = index, %operation, error = %source, "Transaction did not finish");
                    if on_failure == CommitFailure::RollBackRest {
                        decision = Decision::Rollback;
                    }
                    record_first(&mut first_error, index, operation, source);
                }
            }
        }

        if !handle.is_released() {
            if let Err(source) = handle.release().await {
                error!(item_index = index, error = %source, "Handle release failed");
                record_first(&mut first_error, index, HandleOperation::Release, source);
            }
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn record_first(
    slot: &mut Option<RunError>,
    index: usize,
    operation: HandleOperation,
    source: HandleError,
) {
    if slot.is_none() {
        *slot = Some(RunError::Provider {
            index,
            operation,
            source,
            failures: Vec::new(),
        });
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{MemoryHandle, MemoryHandleProvider};

    #[tokio::test]
    async fn test_finish_handles_switches_to_rollback_after_commit_failure() {
        let provider = MemoryHandleProvider::new().fail_on(1, HandleOperation::CommitTransaction);
        let log = provider.call_log();

        let mut handles = Vec::new();
        for i in 0..3 {
            let mut handle = TrackedHandle::new(i, provider.create_handle());
            handle.connect().await.unwrap();
            handle.start_transaction(None).await.unwrap();
            handles.push(handle);
        }

        let mut stats = RunStats::default();
        let err = finish_handles(
            handles,
            Decision::Commit,
            CommitFailure::RollBackRest,
            &mut stats,
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            RunError::Provider {
                index: 1,
                operation: HandleOperation::CommitTransaction,
                ..
            }
        ));
        assert_eq!(log.committed_handles(), vec![0]);
        assert_eq!(log.rolled_back_handles(), vec![2]);
        assert_eq!(log.count(HandleOperation::Release), 3);
        assert_eq!(stats.committed, 1);
        assert_eq!(stats.rolled_back, 1);
    }

    #[tokio::test]
    async fn test_finish_handles_keeps_committing_when_asked() {
        let provider = MemoryHandleProvider::new().fail_on(0, HandleOperation::CommitTransaction);
        let log = provider.call_log();

        let mut handles = Vec::new();
        for i in 0..3 {
            let mut handle = TrackedHandle::new(i, provider.create_handle());
            handle.connect().await.unwrap();
            handle.start_transaction(None).await.unwrap();
            handles.push(handle);
        }

        let mut stats = RunStats::default();
        let err = finish_handles(
            handles,
            Decision::Commit,
            CommitFailure::KeepCommitting,
            &mut stats,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, RunError::Provider { index: 0, .. }));
        assert_eq!(log.committed_handles(), vec![1, 2]);
        assert!(log.rolled_back_handles().is_empty());
        assert_eq!(log.count(HandleOperation::Release), 3);
        assert_eq!(stats.committed, 2);
    }

    #[tokio::test]
    async fn test_run_item_catches_panics() {
        fn explode(item: u32, _: &mut MemoryHandle) -> UnitOfWorkFuture<'_, u32> {
            Box::pin(async move {
                if item == 0 {
                    panic!("boom");
                }
                Ok(item)
            })
        }

        let provider = MemoryHandleProvider::new();
        let handle = TrackedHandle::new(0, provider.create_handle());
        let settled = run_item(handle, 0, &explode, None).await;

        match settled.outcome {
            Outcome::Failed(error) => assert!(error.to_string().contains("boom")),
            _ => panic!("expected a failed outcome"),
        }
        assert!(settled.handle.has_open_transaction());

        let mut stats = RunStats::default();
        finish_handles(
            vec![settled.handle],
            Decision::Rollback,
            CommitFailure::RollBackRest,
            &mut stats,
        )
            .await
            .unwrap();
        assert_eq!(stats.rolled_back, 1);
    }

    #[tokio::test]
    async fn test_run_item_catches_panics_before_the_future_exists() {
        fn explode_early(item: u32, _: &mut MemoryHandle) -> UnitOfWorkFuture<'_, u32> {
            if item == 0 {
                panic!("no future for you");
            }
            Box::pin(async move { Ok(item) })
        }

        let provider = MemoryHandleProvider::new();
        let handle = TrackedHandle::new(0, provider.create_handle());
        let settled = run_item(handle, 0, &explode_early, None).await;

        match settled.outcome {
            Outcome::Failed(error) => assert!(error.to_string().contains("no future for you")),
            _ => panic!("expected a failed outcome"),
        }
        assert!(settled.handle.has_open_transaction());

        let mut stats = RunStats::default();
        finish_handles(
            vec![settled.handle],
            Decision::Rollback,
            CommitFailure::RollBackRest,
            &mut stats,
        )
        .await
        .unwrap();
        assert_eq!(stats.rolled_back, 1);
    }

    #[test]
    fn test_panic_message_extraction() {
        let payload: Box<dyn Any + Send> = Box::new("static message");
        assert_eq!(panic_message(payload.as_ref()), "static message");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned message"));
        assert_eq!(panic_message(payload.as_ref()), "owned message");
        let payload: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
    }
}
