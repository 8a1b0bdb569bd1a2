use std::{collections::VecDeque, mem};

use log::{debug, trace};
use ndarray::{ArrayD, ArrayViewD, Zip};

use super::pending::{PendingTake, TakeTicket};
use crate::{
    config::Reduction,
    element::Element,
    error::{AccumulatorErr, Result},
    shape::ShapeSpec,
};

/// Contributions with at least this many elements are summed in parallel.
const PARALLEL_ADD_THRESHOLD: usize = 1 << 15;

/// What happened to a contribution that passed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Applied {
    Accepted,
    Stale,
}

/// Everything an accumulator guards behind its single lock.
///
/// `count > 0` if and only if `sum` holds a value.
#[derive(Debug)]
pub(super) struct AccumState<T: Element> {
    declared: ShapeSpec,
    resolved: Option<Vec<usize>>,
    sum: Option<ArrayD<T>>,
    count: usize,
    global_step: i64,
    pending: VecDeque<PendingTake<T>>,
    next_id: u64,
    closed: bool,
    reduction: Reduction,
    advance_step_on_take: bool,
}

impl<T: Element> AccumState<T> {
    pub fn new(declared: ShapeSpec, reduction: Reduction, advance_step_on_take: bool) -> Self {
        Self {
            resolved: declared.to_concrete(),
            declared,
            sum: None,
            count: 0,
            global_step: 0,
            pending: VecDeque::new(),
            next_id: 0,
            closed: false,
            reduction,
            advance_step_on_take,
        }
    }

    pub fn resolved(&self) -> Option<&[usize]> {
        self.resolved.as_deref()
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn global_step(&self) -> i64 {
        self.global_step
    }

    pub fn num_pending(&self) -> usize {
        self.pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Replaces the global step.
    ///
    /// # Returns
    /// The previous global step.
    pub fn set_global_step(&mut self, step: i64) -> i64 {
        mem::replace(&mut self.global_step, step)
    }

    /// Checks a contribution's shape against the resolved or declared shape.
    fn validate_shape(&self, shape: &[usize]) -> Result<()> {
        match &self.resolved {
            Some(resolved) if resolved != shape => Err(AccumulatorErr::ShapeMismatch {
                expected: ShapeSpec::known(resolved),
                got: shape.to_vec(),
            }),
            Some(_) => Ok(()),
            None if self.declared.is_compatible(shape) => Ok(()),
            None => Err(AccumulatorErr::ShapeMismatch {
                expected: self.declared.clone(),
                got: shape.to_vec(),
            }),
        }
    }

    /// Folds a contribution into the running sum unless it's stale.
    ///
    /// Validation happens before any mutation, a rejected contribution leaves the
    /// state untouched. A stale contribution still fixes an unresolved shape.
    ///
    /// # Arguments
    /// * `value` - The contribution.
    /// * `local_step` - The step the contribution was computed at.
    ///
    /// # Returns
    /// Whether the contribution was accepted or discarded as stale, `Cancelled` if
    /// the accumulator is closed or `ShapeMismatch` if the shape doesn't fit.
    pub fn apply(&mut self, value: ArrayViewD<'_, T>, local_step: i64) -> Result<Applied> {
        if self.closed {
            return Err(AccumulatorErr::Cancelled);
        }

        self.validate_shape(value.shape())?;

        if self.resolved.is_none() {
            self.resolved = Some(value.shape().to_vec());
        }

        if local_step < self.global_step {
            return Ok(Applied::Stale);
        }

        match &mut self.sum {
            Some(sum) => add_into(sum, value),
            None => self.sum = Some(value.to_owned()),
        }

        self.count += 1;
        Ok(Applied::Accepted)
    }

    /// Queues a new take request at the back of the FIFO.
    ///
    /// # Arguments
    /// * `required` - The amount of contributions the request waits for, at least one.
    ///
    /// # Returns
    /// The ticket to wait on or `Cancelled` if the accumulator is closed.
    pub fn enqueue(&mut self, required: usize) -> Result<TakeTicket<T>> {
        if self.closed {
            return Err(AccumulatorErr::Cancelled);
        }

        let id = self.next_id;
        self.next_id += 1;

        let (pending, ticket) = PendingTake::new(id, required);
        self.pending.push_back(pending);
        Ok(ticket)
    }

    /// Removes a request from the queue, wherever it is.
    ///
    /// # Returns
    /// `false` if the request was no longer queued.
    pub fn withdraw(&mut self, id: u64) -> bool {
        let Some(pos) = self.pending.iter().position(|pending| pending.id == id) else {
            return false;
        };

        self.pending.remove(pos);
        true
    }

    /// Serves the head of the queue for as long as it can be satisfied.
    ///
    /// Requests whose callers stopped waiting are dropped on the way. A result is
    /// only committed, resetting the sum and count, once it reached its caller.
    ///
    /// # Arguments
    /// * `name` - The accumulator's name, for logging.
    ///
    /// # Returns
    /// The amount of requests served.
    pub fn serve(&mut self, name: &str) -> usize {
        let mut served = 0;

        while let Some(head) = self.pending.front() {
            if head.is_abandoned() {
                debug!(accumulator = name, id = head.id; "dropping abandoned take");
                self.pending.pop_front();
                continue;
            }

            if self.count < head.required {
                break;
            }

            let Some(sum) = &self.sum else {
                break;
            };

            let result = match self.reduction {
                Reduction::Mean => {
                    let count = T::from_count(self.count);
                    sum.mapv(|x| x / count)
                }
                Reduction::Sum => sum.clone(),
            };

            let Some(head) = self.pending.pop_front() else {
                break;
            };

            let (id, required) = (head.id, head.required);
            if !head.deliver(result) {
                debug!(accumulator = name, id = id; "take abandoned at delivery");
                continue;
            }

            let count = mem::take(&mut self.count);
            self.sum = None;
            if self.advance_step_on_take {
                self.global_step += 1;
            }

            served += 1;
            debug!(
                accumulator = name,
                id = id,
                required = required,
                count = count,
                global_step = self.global_step;
                "drained accumulator"
            );
        }

        served
    }

    /// Closes the state and cancels every queued request.
    ///
    /// # Returns
    /// The amount of cancelled requests, or `None` if it was already closed.
    pub fn close(&mut self) -> Option<usize> {
        if mem::replace(&mut self.closed, true) {
            return None;
        }

        let cancelled = self.pending.len();
        for pending in self.pending.drain(..) {
            trace!(id = pending.id; "cancelling take");
            pending.cancel();
        }

        Some(cancelled)
    }
}

/// Adds `value` into `sum` element-wise, both must have the same shape.
fn add_into<T: Element>(sum: &mut ArrayD<T>, value: ArrayViewD<'_, T>) {
    let zip = Zip::from(sum).and(&value);

    if value.len() >= PARALLEL_ADD_THRESHOLD {
        zip.par_for_each(|acc, &v| *acc += v);
    } else {
        zip.for_each(|acc, &v| *acc += v);
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{Array, arr1, arr2};

    use super::*;

    fn mean_state(declared: ShapeSpec) -> AccumState<f32> {
        AccumState::new(declared, Reduction::Mean, false)
    }

    #[test]
    fn test_apply_accumulates_and_counts() {
        let mut state = mean_state(ShapeSpec::known(&[2]));

        let applied = state.apply(arr1(&[1.0, 2.0]).into_dyn().view(), 0).unwrap();
        assert_eq!(applied, Applied::Accepted);
        state.apply(arr1(&[3.0, 4.0]).into_dyn().view(), 0).unwrap();

        assert_eq!(state.count(), 2);
        assert_eq!(state.sum, Some(arr1(&[4.0, 6.0]).into_dyn()));
    }

    #[test]
    fn test_stale_contribution_is_discarded() {
        let mut state = mean_state(ShapeSpec::known(&[1]));
        state.set_global_step(5);

        let applied = state.apply(arr1(&[1.0]).into_dyn().view(), 4).unwrap();
        assert_eq!(applied, Applied::Stale);
        assert_eq!(state.count(), 0);
        assert!(state.sum.is_none());

        let applied = state.apply(arr1(&[1.0]).into_dyn().view(), 5).unwrap();
        assert_eq!(applied, Applied::Accepted);
        assert_eq!(state.count(), 1);
    }

    #[test]
    fn test_stale_contribution_still_resolves_shape() {
        let mut state = mean_state(ShapeSpec::unknown());
        state.set_global_step(1);

        state.apply(arr1(&[1.0, 2.0]).into_dyn().view(), 0).unwrap();
        assert_eq!(state.resolved(), Some(&[2][..]));
        assert_eq!(state.count(), 0);
    }

    #[test]
    fn test_shape_mismatch_leaves_state_untouched() {
        let mut state = mean_state(ShapeSpec::known(&[3, 2]));
        state.apply(Array::from_elem((3, 2), 1.0).into_dyn().view(), 0).unwrap();

        let err = state
            .apply(arr2(&[[1.0, 2.0], [3.0, 4.0]]).into_dyn().view(), 0)
            .unwrap_err();

        assert_eq!(
            err,
            AccumulatorErr::ShapeMismatch {
                expected: ShapeSpec::known(&[3, 2]),
                got: vec![2, 2],
            }
        );
        assert_eq!(state.count(), 1);
        assert_eq!(state.sum, Some(Array::from_elem((3, 2), 1.0).into_dyn()));
    }

    #[test]
    fn test_partial_shape_resolves_on_first_contribution() {
        let mut state = mean_state(ShapeSpec::partial(vec![None, Some(2)]));
        assert_eq!(state.resolved(), None);

        let err = state.apply(arr2(&[[1.0, 2.0, 3.0]]).into_dyn().view(), 0);
        assert!(err.is_err());
        assert_eq!(state.resolved(), None);

        state.apply(arr2(&[[1.0, 2.0]]).into_dyn().view(), 0).unwrap();
        assert_eq!(state.resolved(), Some(&[1, 2][..]));

        let err = state.apply(arr2(&[[1.0, 2.0], [3.0, 4.0]]).into_dyn().view(), 0);
        assert!(err.is_err());
    }

    #[test]
    fn test_parallel_add_matches_sequential() {
        let len = PARALLEL_ADD_THRESHOLD + 3;
        let mut state = mean_state(ShapeSpec::unknown());

        let ones = Array::from_elem(len, 1.0f32).into_dyn();
        state.apply(ones.view(), 0).unwrap();
        state.apply(ones.view(), 0).unwrap();

        let sum = state.sum.as_ref().unwrap();
        assert!(sum.iter().all(|&x| x == 2.0));
    }

    #[test]
    fn test_serve_respects_fifo_head() {
        let mut state = mean_state(ShapeSpec::known(&[1]));
        let mut first = state.enqueue(3).unwrap();
        let mut second = state.enqueue(1).unwrap();

        state.apply(arr1(&[3.0]).into_dyn().view(), 0).unwrap();
        assert_eq!(state.serve("test"), 0);
        assert!(second.rx.try_recv().is_err());

        state.apply(arr1(&[6.0]).into_dyn().view(), 0).unwrap();
        state.apply(arr1(&[9.0]).into_dyn().view(), 0).unwrap();
        assert_eq!(state.serve("test"), 1);
        assert_eq!(state.count(), 0);
        assert_eq!(first.rx.try_recv().unwrap(), Ok(arr1(&[6.0]).into_dyn()));

        state.apply(arr1(&[1.0]).into_dyn().view(), 0).unwrap();
        assert_eq!(state.serve("test"), 1);
        assert_eq!(second.rx.try_recv().unwrap(), Ok(arr1(&[1.0]).into_dyn()));
        assert_eq!(state.num_pending(), 0);
    }

    #[test]
    fn test_serve_divides_by_actual_count() {
        let mut state = mean_state(ShapeSpec::known(&[1]));
        for x in [10.0, 20.0, 30.0, 40.0] {
            state.apply(arr1(&[x]).into_dyn().view(), 0).unwrap();
        }

        let mut ticket = state.enqueue(2).unwrap();
        assert_eq!(state.serve("test"), 1);
        assert_eq!(ticket.rx.try_recv().unwrap(), Ok(arr1(&[25.0]).into_dyn()));
    }

    #[test]
    fn test_serve_sum_reduction_and_step_advance() {
        let mut state = AccumState::<f64>::new(ShapeSpec::known(&[1]), Reduction::Sum, true);
        state.apply(arr1(&[1.5]).into_dyn().view(), 0).unwrap();
        state.apply(arr1(&[2.5]).into_dyn().view(), 0).unwrap();

        let mut ticket = state.enqueue(2).unwrap();
        state.serve("test");

        assert_eq!(ticket.rx.try_recv().unwrap(), Ok(arr1(&[4.0]).into_dyn()));
        assert_eq!(state.global_step(), 1);
    }

    #[test]
    fn test_abandoned_requests_are_skipped() {
        let mut state = mean_state(ShapeSpec::known(&[1]));
        let abandoned = state.enqueue(5).unwrap();
        let mut waiting = state.enqueue(1).unwrap();
        drop(abandoned);

        state.apply(arr1(&[2.0]).into_dyn().view(), 0).unwrap();
        assert_eq!(state.serve("test"), 1);
        assert_eq!(waiting.rx.try_recv().unwrap(), Ok(arr1(&[2.0]).into_dyn()));
    }

    #[test]
    fn test_undelivered_result_keeps_sum() {
        let mut state = mean_state(ShapeSpec::known(&[1]));
        state.apply(arr1(&[2.0]).into_dyn().view(), 0).unwrap();

        let ticket = state.enqueue(1).unwrap();
        drop(ticket);
        assert_eq!(state.serve("test"), 0);
        assert_eq!(state.count(), 1);
    }

    #[test]
    fn test_withdraw() {
        let mut state = mean_state(ShapeSpec::known(&[1]));
        let first = state.enqueue(1).unwrap();
        let _second = state.enqueue(1).unwrap();

        assert!(state.withdraw(first.id));
        assert!(!state.withdraw(first.id));
        assert_eq!(state.num_pending(), 1);
    }

    #[test]
    fn test_close_cancels_pending() {
        let mut state = mean_state(ShapeSpec::known(&[1]));
        let mut first = state.enqueue(1).unwrap();
        let mut second = state.enqueue(2).unwrap();

        assert_eq!(state.close(), Some(2));
        assert_eq!(state.close(), None);
        assert_eq!(first.rx.try_recv().unwrap(), Err(AccumulatorErr::Cancelled));
        assert_eq!(second.rx.try_recv().unwrap(), Err(AccumulatorErr::Cancelled));

        let err = state.apply(arr1(&[1.0]).into_dyn().view(), 0).unwrap_err();
        assert_eq!(err, AccumulatorErr::Cancelled);
        assert_eq!(state.enqueue(1).unwrap_err(), AccumulatorErr::Cancelled);
    }
}
