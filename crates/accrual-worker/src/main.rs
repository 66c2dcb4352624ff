mod config;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use loyalty_infra::{
    HttpAccrualClient, LedgerStorage, OrderPipeline, PostgresLedgerStorage, RetryingStorage,
    StorageError,
};

use crate::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    loyalty_observability::init(&config.log_level);

    let policy = config.backoff_policy();
    info!(
        max_attempts = policy.max_attempts,
        retry_budget_ms = policy.worst_case_total().as_millis() as u64,
        "storage retry policy"
    );

    let dsn = config.database_uri.as_str();
    let storage = RetryingStorage::connect(
        policy,
        Arc::new(StorageError::is_transient),
        move || PostgresLedgerStorage::connect(dsn),
    )
    .await
    .context("failed to connect to the database")?;
    let storage = Arc::new(storage);

    let client = HttpAccrualClient::new(&config.accrual_system_address, config.accrual_timeout)
        .context("failed to build accrual client")?;
    info!(accrual = %client.base_url(), workers = config.workers, "accrual worker starting");

    let (pipeline, queue) =
        OrderPipeline::new(Arc::clone(&storage), client, config.pipeline_config());

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for ctrl-c");
            }
            info!("shutdown signal received");
            shutdown.cancel();
        }
    });

    let run = tokio::spawn({
        let pipeline = pipeline.clone();
        let shutdown = shutdown.clone();
        let workers = config.workers;
        async move { pipeline.start(workers, shutdown).await }
    });

    let unfinished = storage
        .list_unfinished_orders()
        .await
        .context("failed to load unfinished orders")?;
    info!(count = unfinished.len(), "re-admitting unfinished orders");
    for order in unfinished {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            admitted = queue.enqueue(order) => admitted.context("failed to re-admit order")?,
        }
    }

    shutdown.cancelled().await;
    drop(queue);

    let stats = run.await.context("pipeline task failed")?;
    info!(
        processed = stats.processed,
        invalid = stats.invalid,
        requeued = stats.requeued,
        dead_lettered = stats.dead_lettered,
        "accrual worker stopped"
    );

    storage.close().await.context("failed to close storage")?;
    Ok(())
}
