pub mod accumulator;
pub mod config;
pub mod element;
pub mod error;
pub mod registry;
pub mod shape;

pub use accumulator::{Accumulator, AccumulatorHandle};
pub use config::{AccumulatorConfig, Reduction};
pub use element::{DType, Element};
pub use error::{AccumulatorErr, ErrorKind, Result};
pub use registry::Registry;
pub use shape::ShapeSpec;
