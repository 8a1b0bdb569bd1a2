use std::{fs, io, path::Path};

use serde::{Deserialize, Serialize};

use crate::{element::DType, shape::ShapeSpec};

const DEFAULT_NAME: &str = "accumulator";

/// How a drained sum is turned into the delivered result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reduction {
    /// Divide the sum by the amount of contributions folded into it.
    #[default]
    Mean,
    /// Deliver the sum as is.
    Sum,
}

/// Immutable construction parameters of an accumulator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AccumulatorConfig {
    pub name: String,
    pub dtype: DType,
    pub shape: ShapeSpec,
    pub reduction: Reduction,
    pub advance_step_on_take: bool,
}

impl Default for AccumulatorConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_NAME.to_string(),
            dtype: DType::default(),
            shape: ShapeSpec::Unknown,
            reduction: Reduction::default(),
            advance_step_on_take: false,
        }
    }
}

impl AccumulatorConfig {
    /// Creates a new configuration with default options.
    ///
    /// # Arguments
    /// * `name` - The name the accumulator is logged and registered under.
    /// * `dtype` - The element type of the accumulator.
    ///
    /// # Returns
    /// A new `AccumulatorConfig` instance.
    pub fn new(name: impl Into<String>, dtype: DType) -> Self {
        Self {
            name: name.into(),
            dtype,
            ..Self::default()
        }
    }

    pub fn with_shape(mut self, shape: ShapeSpec) -> Self {
        self.shape = shape;
        self
    }

    pub fn with_reduction(mut self, reduction: Reduction) -> Self {
        self.reduction = reduction;
        self
    }

    /// Makes every successful take bump the global step by one.
    pub fn with_advance_step_on_take(mut self, advance: bool) -> Self {
        self.advance_step_on_take = advance;
        self
    }

    /// Parses a configuration from a JSON document.
    ///
    /// # Arguments
    /// * `json` - The JSON text.
    ///
    /// # Returns
    /// The parsed configuration or an `InvalidData` io error.
    pub fn from_json(json: &str) -> io::Result<Self> {
        serde_json::from_str(json).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Reads a JSON configuration file.
    ///
    /// # Arguments
    /// * `path` - Where the file is located.
    ///
    /// # Returns
    /// The parsed configuration or an io error.
    pub fn from_path(path: impl AsRef<Path>) -> io::Result<Self> {
        let json = fs::read_to_string(path)?;
        Self::from_json(&json)
    }
}
