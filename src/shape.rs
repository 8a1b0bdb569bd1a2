use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

/// A shape as it is declared on an accumulator, possibly only partially known.
///
/// In configuration files it is written as `null` for an unknown rank, or as a
/// list whose entries are either a size or `null` for an unknown dimension.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "Option<Vec<Option<usize>>>", into = "Option<Vec<Option<usize>>>")]
pub enum ShapeSpec {
    #[default]
    Unknown,
    Dims(Vec<Option<usize>>),
}

impl ShapeSpec {
    /// Creates a shape with unknown rank, accepting whatever comes first.
    pub fn unknown() -> Self {
        Self::Unknown
    }

    /// Creates a fully known shape.
    ///
    /// # Arguments
    /// * `dims` - The size of every dimension.
    ///
    /// # Returns
    /// A new `ShapeSpec` instance.
    pub fn known(dims: &[usize]) -> Self {
        Self::Dims(dims.iter().copied().map(Some).collect())
    }

    /// Creates a shape with known rank where `None` entries are left unknown.
    ///
    /// # Arguments
    /// * `dims` - The optional size of every dimension.
    ///
    /// # Returns
    /// A new `ShapeSpec` instance.
    pub fn partial(dims: Vec<Option<usize>>) -> Self {
        Self::Dims(dims)
    }

    /// Returns the rank if it's known.
    pub fn rank(&self) -> Option<usize> {
        match self {
            ShapeSpec::Unknown => None,
            ShapeSpec::Dims(dims) => Some(dims.len()),
        }
    }

    /// Returns the concrete dimensions when every one of them is known.
    ///
    /// # Returns
    /// `None` if the rank or any dimension is unknown.
    pub fn to_concrete(&self) -> Option<Vec<usize>> {
        match self {
            ShapeSpec::Unknown => None,
            ShapeSpec::Dims(dims) => dims.iter().copied().collect(),
        }
    }

    /// Checks whether a concrete shape fits this declaration.
    ///
    /// # Arguments
    /// * `shape` - The concrete shape of a contribution.
    ///
    /// # Returns
    /// `true` if the ranks match and every known dimension is equal.
    pub fn is_compatible(&self, shape: &[usize]) -> bool {
        match self {
            ShapeSpec::Unknown => true,
            ShapeSpec::Dims(dims) => {
                dims.len() == shape.len()
                    && dims
                        .iter()
                        .zip(shape)
                        .all(|(dim, size)| dim.is_none_or(|dim| dim == *size))
            }
        }
    }
}

impl From<Option<Vec<Option<usize>>>> for ShapeSpec {
    fn from(value: Option<Vec<Option<usize>>>) -> Self {
        match value {
            Some(dims) => Self::Dims(dims),
            None => Self::Unknown,
        }
    }
}

impl From<ShapeSpec> for Option<Vec<Option<usize>>> {
    fn from(value: ShapeSpec) -> Self {
        match value {
            ShapeSpec::Unknown => None,
            ShapeSpec::Dims(dims) => Some(dims),
        }
    }
}

impl Display for ShapeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ShapeSpec::Dims(dims) = self else {
            return f.write_str("<unknown>");
        };

        f.write_str("[")?;
        for (i, dim) in dims.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }

            match dim {
                Some(size) => write!(f, "{size}")?,
                None => f.write_str("?")?,
            }
        }
        f.write_str("]")
    }
}
