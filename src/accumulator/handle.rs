use std::{ops::Deref, sync::Arc};

use log::warn;
use ndarray::{ArrayBase, ArrayD, Data, Dimension};
use tokio::{sync::oneshot, task};

use super::{
    Accumulator,
    pending::{self, Delivery},
};
use crate::{element::Element, error::Result};

/// The async interface to a shared `Accumulator`.
///
/// It bridges the async runtime with the blocking implementation of the
/// `Accumulator`, so it must be used from a multi-threaded tokio runtime.
pub struct AccumulatorHandle<T: Element>(Arc<Accumulator<T>>);

impl<T: Element> Clone for AccumulatorHandle<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T: Element> Deref for AccumulatorHandle<T> {
    type Target = Accumulator<T>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T: Element> From<Arc<Accumulator<T>>> for AccumulatorHandle<T> {
    fn from(accumulator: Arc<Accumulator<T>>) -> Self {
        Self(accumulator)
    }
}

impl<T: Element> AccumulatorHandle<T> {
    /// Creates a new `AccumulatorHandle`.
    ///
    /// # Arguments
    /// * `accumulator` - The underlying accumulator.
    ///
    /// # Returns
    /// A new `AccumulatorHandle` instance.
    pub fn new(accumulator: Accumulator<T>) -> Self {
        Self(Arc::new(accumulator))
    }

    /// Async call to the synchronous implementation of `Accumulator::apply`.
    ///
    /// # Arguments
    /// * `value` - The contribution.
    /// * `local_step` - The step the contribution was computed at.
    ///
    /// # Returns
    /// `ShapeMismatch` if the shape doesn't fit, `Cancelled` if the accumulator was closed.
    pub async fn apply<S, D>(&self, value: &ArrayBase<S, D>, local_step: i64) -> Result<()>
    where
        S: Data<Elem = T>,
        D: Dimension,
    {
        task::block_in_place(|| self.0.apply(value, local_step))
    }

    /// Waits for the reduction of at least `n` contributions, see `Accumulator::take`.
    ///
    /// Dropping the returned future before it completes withdraws the request, the
    /// next request in line is then served in its place.
    ///
    /// # Arguments
    /// * `n` - The minimum amount of contributions to wait for.
    ///
    /// # Returns
    /// The reduced contributions, `InvalidTakeCount` if `n` isn't positive, or
    /// `Cancelled` if the accumulator is or gets closed.
    pub async fn take(&self, n: i64) -> Result<ArrayD<T>> {
        let ticket = self.0.enqueue_take(n)?;

        let mut waiting = Waiting {
            accumulator: &self.0,
            id: ticket.id,
            rx: ticket.rx,
            done: false,
        };

        let delivery = (&mut waiting.rx).await;
        waiting.done = true;
        pending::resolve(delivery)
    }
}

/// A take in flight, withdrawn from the queue if dropped before completion.
struct Waiting<'a, T: Element> {
    accumulator: &'a Accumulator<T>,
    id: u64,
    rx: oneshot::Receiver<Delivery<T>>,
    done: bool,
}

impl<T: Element> Drop for Waiting<'_, T> {
    fn drop(&mut self) {
        if self.done || self.accumulator.withdraw(self.id) {
            return;
        }

        // Served between the caller giving up and the withdrawal.
        if let Ok(Ok(_)) = self.rx.try_recv() {
            warn!(
                accumulator = self.accumulator.name(),
                id = self.id;
                "dropped a delivered result of an abandoned take"
            );
        }
    }
}
