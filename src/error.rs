use std::{error::Error, fmt};

use crate::{config::AccumulatorConfig, element::DType, shape::ShapeSpec};

/// The accumulator crate's result type.
pub type Result<T> = std::result::Result<T, AccumulatorErr>;

/// Coarse classification of an `AccumulatorErr`, for callers that only need to
/// decide between fixing their input and giving up on the instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    Cancelled,
    NotFound,
}

/// Failures reported by accumulators and the registry holding them.
#[derive(Debug, Clone, PartialEq)]
pub enum AccumulatorErr {
    InvalidTakeCount(i64),
    ShapeMismatch {
        expected: ShapeSpec,
        got: Vec<usize>,
    },
    DTypeMismatch {
        name: String,
        expected: DType,
        got: DType,
    },
    ConfigConflict {
        name: String,
        registered: Box<AccumulatorConfig>,
        requested: Box<AccumulatorConfig>,
    },
    NotFound(String),
    Cancelled,
}

impl AccumulatorErr {
    /// Returns the coarse kind of this error.
    ///
    /// # Returns
    /// `Cancelled` for closed instances, `NotFound` for unknown registry names and
    /// `InvalidArgument` for everything the caller could fix by changing its input.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AccumulatorErr::Cancelled => ErrorKind::Cancelled,
            AccumulatorErr::NotFound(_) => ErrorKind::NotFound,
            _ => ErrorKind::InvalidArgument,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind() == ErrorKind::Cancelled
    }
}

impl fmt::Display for AccumulatorErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccumulatorErr::InvalidTakeCount(n) => {
                write!(f, "invalid argument: take count must be positive, got {n}")
            }
            AccumulatorErr::ShapeMismatch { expected, got } => write!(
                f,
                "invalid argument: shape mismatch, expected {expected}, got {got:?}"
            ),
            AccumulatorErr::DTypeMismatch {
                name,
                expected,
                got,
            } => write!(
                f,
                "invalid argument: accumulator {name:?} holds {expected} elements, got {got}"
            ),
            AccumulatorErr::ConfigConflict {
                name,
                registered,
                requested,
            } => write!(
                f,
                "invalid argument: accumulator {name:?} was registered as {}, requested {}",
                Declaration(registered),
                Declaration(requested),
            ),
            AccumulatorErr::NotFound(name) => write!(f, "accumulator {name:?} not found"),
            AccumulatorErr::Cancelled => f.write_str("cancelled: the accumulator was closed"),
        }
    }
}

impl Error for AccumulatorErr {}

/// Displays everything but the name of a configuration.
struct Declaration<'a>(&'a AccumulatorConfig);

impl fmt::Display for Declaration<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let config = self.0;
        write!(
            f,
            "{} {} ({:?}, advance step on take: {})",
            config.dtype, config.shape, config.reduction, config.advance_step_on_take
        )
    }
}
