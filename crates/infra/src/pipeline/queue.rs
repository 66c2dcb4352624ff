use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use loyalty_core::Order;

use super::types::{PipelineError, QueuedOrder};

/// Bookkeeping of admitted orders, used to detect a drained pipeline.
///
/// An order is in flight from admission until it is finalized or
/// dead-lettered; requeues keep it in flight. The pipeline is drained once the
/// intake is closed and nothing is in flight.
#[derive(Debug, Default)]
pub(crate) struct Flight {
    in_flight: AtomicUsize,
    intake_closed: AtomicBool,
    drained: CancellationToken,
}

impl Flight {
    pub fn admit(&self) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
    }

    /// Admit unless the pipeline has already drained (or is about to).
    pub fn try_admit(&self) -> bool {
        let mut current = self.in_flight.load(Ordering::SeqCst);
        loop {
            if current == 0 && self.intake_closed.load(Ordering::SeqCst) {
                return false;
            }
            match self.in_flight.compare_exchange(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn complete(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1
            && self.intake_closed.load(Ordering::SeqCst)
        {
            self.drained.cancel();
        }
    }

    pub fn close_intake(&self) {
        self.intake_closed.store(true, Ordering::SeqCst);
        if self.in_flight.load(Ordering::SeqCst) == 0 {
            self.drained.cancel();
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn drained(&self) -> &CancellationToken {
        &self.drained
    }
}

/// Producer handle of the pipeline's bounded intake.
///
/// Cloneable; the intake closes once every clone is dropped.
#[derive(Debug, Clone)]
pub struct OrderQueue {
    tx: mpsc::Sender<QueuedOrder>,
    flight: Arc<Flight>,
}

impl OrderQueue {
    pub(crate) fn new(tx: mpsc::Sender<QueuedOrder>, flight: Arc<Flight>) -> Self {
        Self { tx, flight }
    }

    /// Submit an order, waiting while the intake is full.
    pub async fn enqueue(&self, order: Order) -> Result<(), PipelineError> {
        if order.is_terminal() {
            return Err(PipelineError::AlreadyFinal(order.number));
        }
        let number = order.number.clone();

        let permit = self.tx.reserve().await.map_err(|_| PipelineError::Closed)?;
        self.flight.admit();
        permit.send(QueuedOrder::new(order));
        debug!(order = %number, "order enqueued");
        Ok(())
    }

    /// Submit an order without waiting; fails with [`PipelineError::Full`]
    /// when the intake has no free slot.
    pub fn try_enqueue(&self, order: Order) -> Result<(), PipelineError> {
        if order.is_terminal() {
            return Err(PipelineError::AlreadyFinal(order.number));
        }

        self.flight.admit();
        match self.tx.try_send(QueuedOrder::new(order)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.flight.complete();
                Err(PipelineError::Full)
            }
            Err(TrySendError::Closed(_)) => {
                self.flight.complete();
                Err(PipelineError::Closed)
            }
        }
    }

    /// Free slots left in the intake.
    pub fn available(&self) -> usize {
        self.tx.capacity()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use loyalty_core::{OrderNumber, OrderStatus, UserId};

    fn order(raw: &str) -> Order {
        Order::new(OrderNumber::parse(raw).unwrap(), UserId::new())
    }

    fn queue(capacity: usize) -> (OrderQueue, mpsc::Receiver<QueuedOrder>, Arc<Flight>) {
        let (tx, rx) = mpsc::channel(capacity);
        let flight = Arc::new(Flight::default());
        (OrderQueue::new(tx, Arc::clone(&flight)), rx, flight)
    }

    #[tokio::test]
    async fn try_enqueue_reports_full() {
        let (queue, _rx, flight) = queue(1);

        queue.try_enqueue(order("18")).unwrap();
        assert_eq!(queue.try_enqueue(order("26")), Err(PipelineError::Full));
        assert_eq!(flight.in_flight(), 1);
        assert_eq!(queue.available(), 0);
    }

    #[tokio::test]
    async fn terminal_orders_are_rejected() {
        let (queue, _rx, flight) = queue(4);
        let mut done = order("18");
        done.finalize(OrderStatus::Invalid, None).unwrap();

        assert!(matches!(
            queue.enqueue(done).await,
            Err(PipelineError::AlreadyFinal(_))
        ));
        assert_eq!(flight.in_flight(), 0);
    }

    #[tokio::test]
    async fn closed_intake_is_reported() {
        let (queue, rx, flight) = queue(4);
        drop(rx);

        assert_eq!(queue.enqueue(order("18")).await, Err(PipelineError::Closed));
        assert_eq!(flight.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_enqueue_does_not_stay_in_flight() {
        let (queue, _rx, flight) = queue(1);
        queue.try_enqueue(order("18")).unwrap();

        let blocked =
            tokio::time::timeout(Duration::from_millis(10), queue.enqueue(order("26"))).await;

        assert!(blocked.is_err());
        assert_eq!(flight.in_flight(), 1);
    }

    #[test]
    fn no_admission_after_drain() {
        let flight = Flight::default();
        assert!(flight.try_admit());
        flight.close_intake();
        assert!(flight.try_admit());

        flight.complete();
        flight.complete();
        assert!(flight.drained().is_cancelled());
        assert!(!flight.try_admit());
        assert_eq!(flight.in_flight(), 0);
    }

    #[test]
    fn drained_once_closed_and_empty() {
        let flight = Flight::default();
        flight.admit();
        flight.close_intake();
        assert!(!flight.drained().is_cancelled());

        flight.complete();
        assert!(flight.drained().is_cancelled());
    }
}
