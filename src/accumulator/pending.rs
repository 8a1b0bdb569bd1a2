use ndarray::ArrayD;
use tokio::sync::oneshot::{self, error::RecvError};

use crate::{
    element::Element,
    error::{AccumulatorErr, Result},
};

/// What a queued take eventually receives.
pub(crate) type Delivery<T> = Result<ArrayD<T>>;

/// A queued take request, waiting at some position of the FIFO.
#[derive(Debug)]
pub(super) struct PendingTake<T: Element> {
    pub id: u64,
    pub required: usize,
    tx: oneshot::Sender<Delivery<T>>,
}

impl<T: Element> PendingTake<T> {
    /// Creates a new `PendingTake` and the ticket its caller waits on.
    ///
    /// # Arguments
    /// * `id` - A per accumulator unique request id.
    /// * `required` - The amount of contributions this request waits for.
    ///
    /// # Returns
    /// The queue record and its matching `TakeTicket`.
    pub fn new(id: u64, required: usize) -> (Self, TakeTicket<T>) {
        let (tx, rx) = oneshot::channel();
        (Self { id, required, tx }, TakeTicket { id, rx })
    }

    /// Whether the caller stopped waiting for this request.
    pub fn is_abandoned(&self) -> bool {
        self.tx.is_closed()
    }

    /// Hands the reduced result over to the waiting caller.
    ///
    /// # Returns
    /// `false` if the caller stopped waiting, in which case the result is dropped.
    pub fn deliver(self, result: ArrayD<T>) -> bool {
        self.tx.send(Ok(result)).is_ok()
    }

    pub fn cancel(self) {
        let _ = self.tx.send(Err(AccumulatorErr::Cancelled));
    }
}

/// The caller's side of a queued take.
#[derive(Debug)]
pub(crate) struct TakeTicket<T: Element> {
    pub id: u64,
    pub rx: oneshot::Receiver<Delivery<T>>,
}

/// Collapses a received delivery into the take's result.
///
/// A request dropped from the queue without being resolved only happens when the
/// accumulator itself went away, which is reported as a cancellation.
pub(crate) fn resolve<T: Element>(
    delivery: std::result::Result<Delivery<T>, RecvError>,
) -> Result<ArrayD<T>> {
    delivery.unwrap_or(Err(AccumulatorErr::Cancelled))
}
