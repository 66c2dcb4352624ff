use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use loyalty_core::{Order, OrderNumber, OrderStatus, Points};

use super::gate::AuthorityGate;
use super::queue::{Flight, OrderQueue};
use super::types::{
    DeadLetterEntry, PipelineConfig, PipelineError, PipelineStats, QueuedOrder, StatsCounters,
};
use crate::accrual::{AccrualClient, AccrualError, AccrualStatus};
use crate::storage::{LedgerStorage, StorageError};

/// Worker pool that reconciles submitted orders with the accrual authority.
///
/// Cloning yields another handle to the same pipeline.
pub struct OrderPipeline<S, C> {
    inner: Arc<Inner<S, C>>,
}

impl<S, C> Clone for OrderPipeline<S, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<S, C> {
    storage: S,
    client: C,
    config: PipelineConfig,
    intake: AsyncMutex<mpsc::Receiver<QueuedOrder>>,
    retry_rx: AsyncMutex<mpsc::UnboundedReceiver<QueuedOrder>>,
    retry_tx: mpsc::UnboundedSender<QueuedOrder>,
    flight: Arc<Flight>,
    gate: AuthorityGate,
    stats: StatsCounters,
    dead_letters: Mutex<Vec<DeadLetterEntry>>,
}

/// What one pass over an order ended with.
enum Pass {
    /// Finalized, or found already final.
    Done,
    /// Try again later without spending the failure budget.
    Again,
    /// Try again later, spending one unit of the failure budget.
    Failed(String),
    /// Shutdown interrupted the pass.
    Abandoned,
}

impl<S, C> OrderPipeline<S, C>
where
    S: LedgerStorage + 'static,
    C: AccrualClient + 'static,
{
    /// Build a pipeline and the producer handle of its intake.
    pub fn new(storage: S, client: C, config: PipelineConfig) -> (Self, OrderQueue) {
        let (intake_tx, intake_rx) = mpsc::channel(config.queue_capacity.max(1));
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();
        let flight = Arc::new(Flight::default());

        let pipeline = Self {
            inner: Arc::new(Inner {
                storage,
                client,
                config,
                intake: AsyncMutex::new(intake_rx),
                retry_rx: AsyncMutex::new(retry_rx),
                retry_tx,
                flight: Arc::clone(&flight),
                gate: AuthorityGate::default(),
                stats: StatsCounters::default(),
                dead_letters: Mutex::new(Vec::new()),
            }),
        };

        (pipeline, OrderQueue::new(intake_tx, flight))
    }

    /// Run `workers` concurrent workers until `shutdown` is cancelled or the
    /// pipeline is drained (intake closed, nothing in flight).
    pub async fn start(&self, workers: usize, shutdown: CancellationToken) -> PipelineStats {
        let workers = workers.max(1);
        info!(workers, "order pipeline started");

        let handles: Vec<_> = (0..workers)
            .map(|worker| {
                let inner = Arc::clone(&self.inner);
                let shutdown = shutdown.clone();
                tokio::spawn(async move { inner.run_worker(worker, shutdown).await })
            })
            .collect();

        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "order worker panicked");
            }
        }

        let stats = self.stats();
        info!(
            processed = stats.processed,
            invalid = stats.invalid,
            dead_lettered = stats.dead_lettered,
            in_flight = self.inner.flight.in_flight(),
            "order pipeline stopped"
        );
        stats
    }

    pub fn stats(&self) -> PipelineStats {
        self.inner.stats.snapshot()
    }

    /// Orders currently admitted and not yet finalized or dead-lettered.
    pub fn in_flight(&self) -> usize {
        self.inner.flight.in_flight()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetterEntry> {
        self.inner.lock_dead_letters().clone()
    }

    /// Put a dead-lettered order back on the retry lane with a fresh budget.
    pub fn retry_dead_letter(&self, number: &OrderNumber) -> Result<(), PipelineError> {
        let entry = {
            let mut dead = self.inner.lock_dead_letters();
            let idx = dead
                .iter()
                .position(|e| &e.order.number == number)
                .ok_or_else(|| PipelineError::NotDeadLettered(number.clone()))?;
            dead.remove(idx)
        };

        let flight = &self.inner.flight;
        if !flight.try_admit() {
            self.inner.lock_dead_letters().push(entry);
            return Err(PipelineError::Closed);
        }
        if let Err(e) = self.inner.retry_tx.send(QueuedOrder::new(entry.order.clone())) {
            flight.complete();
            debug!(order = %e.0.order.number, "retry lane closed");
            self.inner.lock_dead_letters().push(entry);
            return Err(PipelineError::Closed);
        }

        info!(order = %number, "dead-lettered order re-admitted");
        Ok(())
    }
}

impl<S, C> Inner<S, C>
where
    S: LedgerStorage + 'static,
    C: AccrualClient + 'static,
{
    async fn run_worker(self: Arc<Self>, worker: usize, shutdown: CancellationToken) {
        debug!(worker, "order worker started");
        let drained = self.flight.drained().clone();
        let mut intake_open = true;

        loop {
            let mut item = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = drained.cancelled() => break,
                Some(item) = recv_unbounded(&self.retry_rx) => item,
                received = recv_bounded(&self.intake), if intake_open => match received {
                    Some(item) => item,
                    None => {
                        intake_open = false;
                        self.flight.close_intake();
                        continue;
                    }
                },
            };

            match self.pass(&mut item.order, &shutdown).await {
                Pass::Done => self.flight.complete(),
                Pass::Again => self.requeue(item, &shutdown),
                Pass::Failed(reason) => self.fail(item, reason, &shutdown),
                Pass::Abandoned => break,
            }
        }

        debug!(worker, "order worker stopped");
    }

    /// Query the authority once and act on the verdict.
    async fn pass(&self, order: &mut Order, shutdown: &CancellationToken) -> Pass {
        if !self.gate.wait(shutdown).await {
            return Pass::Abandoned;
        }

        StatsCounters::bump(&self.stats.polled);
        match self.client.fetch(&order.number).await {
            Ok(verdict) if verdict.status.is_terminal() => {
                self.finalize(order, verdict.status.order_status(), verdict.accrual)
                    .await
            }
            Ok(verdict) => {
                debug!(order = %order.number, status = ?verdict.status, "accrual not final yet");
                if verdict.status == AccrualStatus::Processing
                    && order.status == OrderStatus::New
                    && self.mark_processing(order).await
                {
                    order.status = OrderStatus::Processing;
                }
                Pass::Again
            }
            Err(AccrualError::NotFound) => {
                info!(order = %order.number, "order unknown to accrual authority, marking invalid");
                self.finalize(order, OrderStatus::Invalid, None).await
            }
            Err(AccrualError::RateLimited { retry_after }) => {
                StatsCounters::bump(&self.stats.rate_limited);
                warn!(
                    order = %order.number,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "accrual authority rate limit, pausing all workers"
                );
                self.gate.close_for(retry_after);
                Pass::Again
            }
            Err(e) => Pass::Failed(e.to_string()),
        }
    }

    async fn finalize(&self, order: &Order, status: OrderStatus, accrual: Option<Points>) -> Pass {
        let mut finished = order.clone();
        if let Err(e) = finished.finalize(status, accrual) {
            return Pass::Failed(e.to_string());
        }

        match self.storage.process_order(&finished).await {
            Ok(()) => {
                match finished.status {
                    OrderStatus::Processed => StatsCounters::bump(&self.stats.processed),
                    _ => StatsCounters::bump(&self.stats.invalid),
                }
                info!(
                    order = %finished.number,
                    user_id = %finished.user_id,
                    status = %finished.status,
                    accrual = %finished.credit(),
                    "order finalized"
                );
                Pass::Done
            }
            Err(e) if matches!(e.root(), StorageError::AlreadyFinalized(_)) => {
                debug!(order = %finished.number, "order already finalized");
                Pass::Done
            }
            Err(e) => {
                StatsCounters::bump(&self.stats.finalize_failures);
                Pass::Failed(e.to_string())
            }
        }
    }

    /// Record `PROCESSING` in storage; best effort.
    async fn mark_processing(&self, order: &Order) -> bool {
        match self
            .storage
            .update_order_status(&order.number, OrderStatus::Processing)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                debug!(order = %order.number, error = %e, "failed to record processing status");
                false
            }
        }
    }

    fn fail(&self, mut item: QueuedOrder, reason: String, shutdown: &CancellationToken) {
        item.attempts += 1;
        let attempts = item.attempts;

        if let Some(max) = self.config.max_poll_attempts {
            if attempts >= max {
                warn!(
                    order = %item.order.number,
                    attempts,
                    reason = %reason,
                    "order dead-lettered"
                );
                StatsCounters::bump(&self.stats.dead_lettered);
                self.lock_dead_letters()
                    .push(DeadLetterEntry::new(item.order, attempts, reason));
                self.flight.complete();
                return;
            }
        }

        if self.config.warn_every > 0 && attempts % self.config.warn_every == 0 {
            warn!(order = %item.order.number, attempts, reason = %reason, "order keeps failing");
        } else {
            debug!(order = %item.order.number, attempts, reason = %reason, "order pass failed");
        }
        self.requeue(item, shutdown);
    }

    /// Put the order back on the retry lane after `repoll_delay`.
    fn requeue(&self, item: QueuedOrder, shutdown: &CancellationToken) {
        StatsCounters::bump(&self.stats.requeued);
        let retry_tx = self.retry_tx.clone();
        let delay = self.config.repoll_delay;
        let shutdown = shutdown.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if let Err(e) = retry_tx.send(item) {
                        debug!(order = %e.0.order.number, "retry lane closed, dropping order");
                    }
                }
            }
        });
    }

    fn lock_dead_letters(&self) -> std::sync::MutexGuard<'_, Vec<DeadLetterEntry>> {
        match self.dead_letters.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

async fn recv_bounded(rx: &AsyncMutex<mpsc::Receiver<QueuedOrder>>) -> Option<QueuedOrder> {
    rx.lock().await.recv().await
}

async fn recv_unbounded(
    rx: &AsyncMutex<mpsc::UnboundedReceiver<QueuedOrder>>,
) -> Option<QueuedOrder> {
    rx.lock().await.recv().await
}
