mod accumulator;
mod handle;
mod pending;
mod state;

pub use accumulator::Accumulator;
pub use handle::AccumulatorHandle;
