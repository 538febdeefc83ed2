//! Parallel insert example: one transaction per order, three at a time
//!
//! Runs against the in-memory provider so it needs no database. Set
//! `RUST_LOG=parallel_tx=debug` to watch chunks open and settle.

use std::error::Error;
use std::time::Duration;

use anyhow::bail;
use parallel_tx::handle::{HandleOperation, MemoryHandle, MemoryHandleProvider};
use parallel_tx::telemetry::init_tracing;
use parallel_tx::{BatchCoordinator, FailurePolicy, IsolationLevel, RunError, RunOptions, UnitOfWorkFuture};

#[derive(Debug, Clone)]
struct Order {
    id: u32,
    quantity: i32,
}

fn insert_order(order: Order, tx: &mut MemoryHandle) -> UnitOfWorkFuture<'_, u32> {
    Box::pin(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if order.quantity <= 0 {
            bail!("order {} has non-positive quantity {}", order.id, order.quantity);
        }
        tracing::debug!(order = order.id, handle = tx.id(), "Inserted order");
        Ok(order.id)
    })
}

fn orders() -> Vec<Order> {
    [5, 2, -1, 8, 3, 0, 4]
        .into_iter()
        .enumerate()
        .map(|(i, quantity)| Order {
            id: 100 + i as u32,
            quantity,
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    init_tracing("parallel_tx=info");

    println!("🚀 parallel-tx - Parallel Insert Example\n");

    // Step 1: Fail fast, the default
    let provider = MemoryHandleProvider::new().with_latency(Duration::from_millis(2));
    let log = provider.call_log();
    let coordinator = BatchCoordinator::new(provider);

    let options = RunOptions::new()
        .with_max_concurrency(3)
        .with_isolation_level(IsolationLevel::ReadCommitted);

    match coordinator.run(orders(), insert_order, options).await {
        Ok(ids) => println!("✅ Inserted {:?}", ids),
        Err(RunError::Aggregate(aggregate)) => {
            println!("❌ Chunk rolled back, failed items: {:?}", aggregate.indexes());
        }
        Err(other) => return Err(other.into()),
    }
    println!(
        "   commits: {}, rollbacks: {}, handles: {}\n",
        log.count(HandleOperation::CommitTransaction),
        log.count(HandleOperation::RollbackTransaction),
        log.handles_created()
    );

    // Step 2: Keep whatever succeeded
    let coordinator = BatchCoordinator::new(MemoryHandleProvider::new());
    let report = coordinator
        .run_report(
            orders(),
            insert_order,
            RunOptions::new()
                .with_max_concurrency(3)
                .with_failure_policy(FailurePolicy::RetainSuccessful),
        )
        .await?;

    println!("✅ Retained {:?}", report.values);
    for failure in &report.failures {
        println!("   skipped: {}", failure);
    }
    println!("   stats: {:?}\n", report.stats);

    // Step 3: Report failures through a callback
    let coordinator = BatchCoordinator::new(MemoryHandleProvider::new());
    let options = RunOptions::new().with_error_callback(|failure| {
        println!("   callback: {}", failure);
    });

    if let Err(err) = coordinator.run(orders(), insert_order, options).await {
        println!("❌ Run stopped: {}", err);
    }

    Ok(())
}
