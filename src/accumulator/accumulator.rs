use log::{debug, info, trace, warn};
use ndarray::{ArrayBase, ArrayD, Data, Dimension};
use parking_lot::Mutex;

use super::{
    pending::{self, TakeTicket},
    state::{AccumState, Applied},
};
use crate::{
    config::AccumulatorConfig,
    element::{DType, Element},
    error::{AccumulatorErr, Result},
    shape::ShapeSpec,
};

/// A staleness aware buffer averaging the contributions of many producers.
///
/// Producers `apply` contributions tagged with the step they were computed at,
/// consumers `take` the average of at least `n` accepted contributions, served in
/// the order they asked. Contributions tagged below the global step are discarded.
///
/// Every operation goes through a single lock; a blocked `take` waits on its own
/// result slot and never holds it.
#[derive(Debug)]
pub struct Accumulator<T: Element> {
    config: AccumulatorConfig,
    state: Mutex<AccumState<T>>,
}

impl<T: Element> Accumulator<T> {
    /// Creates a new averaging `Accumulator` with default options.
    ///
    /// # Arguments
    /// * `shape` - The declared shape of the contributions, possibly unknown.
    ///
    /// # Returns
    /// A new `Accumulator` instance.
    pub fn new(shape: ShapeSpec) -> Self {
        let config = AccumulatorConfig {
            dtype: T::DTYPE,
            shape,
            ..AccumulatorConfig::default()
        };

        Self::build(&config)
    }

    /// Creates a new `Accumulator` following a configuration.
    ///
    /// # Arguments
    /// * `config` - The accumulator's configuration.
    ///
    /// # Returns
    /// A new `Accumulator` or a `DTypeMismatch` if `config.dtype` isn't `T`'s.
    pub fn from_config(config: &AccumulatorConfig) -> Result<Self> {
        if config.dtype != T::DTYPE {
            return Err(AccumulatorErr::DTypeMismatch {
                name: config.name.clone(),
                expected: config.dtype,
                got: T::DTYPE,
            });
        }

        Ok(Self::build(config))
    }

    fn build(config: &AccumulatorConfig) -> Self {
        let state = AccumState::new(
            config.shape.clone(),
            config.reduction,
            config.advance_step_on_take,
        );

        Self {
            config: config.clone(),
            state: Mutex::new(state),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// The configuration this accumulator was built with.
    pub fn config(&self) -> &AccumulatorConfig {
        &self.config
    }

    pub fn dtype(&self) -> DType {
        T::DTYPE
    }

    /// The shape this accumulator was declared with.
    pub fn declared_shape(&self) -> &ShapeSpec {
        &self.config.shape
    }

    /// Returns the shape contributions must have, once it's known.
    ///
    /// # Returns
    /// The declared shape if it was fully known, otherwise the shape of the first
    /// contribution, or `None` if nothing was applied yet.
    pub fn shape(&self) -> Option<Vec<usize>> {
        self.state.lock().resolved().map(<[usize]>::to_vec)
    }

    /// Accumulates a contribution computed at `local_step`.
    ///
    /// A contribution tagged below the current global step is silently discarded,
    /// the call still succeeds. Otherwise it's added to the running sum and the
    /// oldest waiting `take` is served if it can be.
    ///
    /// # Arguments
    /// * `value` - The contribution, its shape must match the accumulator's.
    /// * `local_step` - The step the contribution was computed at.
    ///
    /// # Returns
    /// `ShapeMismatch` if the shape doesn't fit, `Cancelled` if the accumulator was closed.
    pub fn apply<S, D>(&self, value: &ArrayBase<S, D>, local_step: i64) -> Result<()>
    where
        S: Data<Elem = T>,
        D: Dimension,
    {
        let value = value.view().into_dyn();
        let mut state = self.state.lock();

        match state.apply(value, local_step)? {
            Applied::Accepted => {
                trace!(
                    accumulator = self.name(),
                    local_step = local_step,
                    count = state.count();
                    "accepted contribution"
                );
                state.serve(self.name());
            }
            Applied::Stale => {
                debug!(
                    accumulator = self.name(),
                    local_step = local_step,
                    global_step = state.global_step();
                    "discarded stale contribution"
                );
            }
        }

        Ok(())
    }

    /// Blocks until at least `n` contributions were accepted and this request is the
    /// oldest one waiting, then returns their reduction and empties the accumulator.
    ///
    /// The mean divides by the amount of contributions actually accumulated, which
    /// can exceed `n`.
    ///
    /// # Arguments
    /// * `n` - The minimum amount of contributions to wait for.
    ///
    /// # Returns
    /// The reduced contributions, `InvalidTakeCount` if `n` isn't positive, or
    /// `Cancelled` if the accumulator is or gets closed.
    ///
    /// # Panics
    /// If called from within an async execution context, use an `AccumulatorHandle` there.
    pub fn take(&self, n: i64) -> Result<ArrayD<T>> {
        let ticket = self.enqueue_take(n)?;
        pending::resolve(ticket.rx.blocking_recv())
    }

    /// Queues a take request and serves it right away if possible.
    pub(crate) fn enqueue_take(&self, n: i64) -> Result<TakeTicket<T>> {
        let required = match usize::try_from(n) {
            Ok(required) if required > 0 => required,
            _ => return Err(AccumulatorErr::InvalidTakeCount(n)),
        };

        let mut state = self.state.lock();
        let ticket = state.enqueue(required)?;
        trace!(
            accumulator = self.name(),
            id = ticket.id,
            required = required,
            queued = state.num_pending();
            "queued take"
        );

        state.serve(self.name());
        Ok(ticket)
    }

    /// Removes a take request its caller gave up on and lets the next one in line
    /// be served.
    ///
    /// # Returns
    /// `false` if the request wasn't queued anymore.
    pub(crate) fn withdraw(&self, id: u64) -> bool {
        let mut state = self.state.lock();
        if !state.withdraw(id) {
            return false;
        }

        debug!(accumulator = self.name(), id = id; "withdrew take");
        state.serve(self.name());
        true
    }

    /// Replaces the global step contributions are checked against.
    ///
    /// Contributions already accumulated are kept. Moving the step backwards is
    /// allowed, it re-admits previously stale steps.
    ///
    /// # Arguments
    /// * `step` - The new global step.
    pub fn set_global_step(&self, step: i64) {
        let previous = self.state.lock().set_global_step(step);

        if step < previous {
            warn!(
                accumulator = self.name(),
                previous = previous,
                step = step;
                "global step moved backwards"
            );
        }
    }

    pub fn global_step(&self) -> i64 {
        self.state.lock().global_step()
    }

    /// Returns how many contributions were accepted since the last take.
    pub fn num_accumulated(&self) -> usize {
        self.state.lock().count()
    }

    /// Returns how many takes are waiting to be served.
    pub fn num_pending_takes(&self) -> usize {
        self.state.lock().num_pending()
    }

    /// Closes the accumulator, every waiting and future `take` and `apply` fails
    /// with `Cancelled`. Calling it more than once has no further effect.
    pub fn close(&self) {
        if let Some(cancelled) = self.state.lock().close() {
            info!(
                accumulator = self.name(),
                cancelled = cancelled;
                "closed accumulator"
            );
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().is_closed()
    }
}

impl<T: Element> Default for Accumulator<T> {
    fn default() -> Self {
        Self::new(ShapeSpec::Unknown)
    }
}
