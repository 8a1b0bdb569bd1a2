use std::{
    fmt::{self, Debug, Display},
    ops::{AddAssign, Div},
};

use half::f16;
use serde::{Deserialize, Serialize};

/// Runtime tag for the element type an accumulator was built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    F16,
    #[default]
    F32,
    F64,
}

impl Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::F16 => "f16",
            DType::F32 => "f32",
            DType::F64 => "f64",
        };

        f.write_str(name)
    }
}

/// A floating point type contributions can be made of.
///
/// Summation uses the type's own `+=` and averaging divides by the
/// contribution count converted into the same type.
pub trait Element:
    Copy + AddAssign + Div<Output = Self> + PartialEq + Debug + Send + Sync + 'static
{
    const DTYPE: DType;

    /// Converts a contribution count into this element type.
    ///
    /// # Arguments
    /// * `count` - The amount of contributions folded into a sum.
    ///
    /// # Returns
    /// The count as an element, rounded to the nearest representable value.
    fn from_count(count: usize) -> Self;
}

impl Element for f16 {
    const DTYPE: DType = DType::F16;

    fn from_count(count: usize) -> Self {
        f16::from_f64(count as f64)
    }
}

impl Element for f32 {
    const DTYPE: DType = DType::F32;

    fn from_count(count: usize) -> Self {
        count as f32
    }
}

impl Element for f64 {
    const DTYPE: DType = DType::F64;

    fn from_count(count: usize) -> Self {
        count as f64
    }
}
