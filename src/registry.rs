use std::{any::Any, collections::HashMap, sync::Arc};

use log::info;
use parking_lot::Mutex;

use crate::{
    accumulator::Accumulator,
    config::AccumulatorConfig,
    element::{DType, Element},
    error::{AccumulatorErr, Result},
};

/// An accumulator with its element type erased.
trait Registered: Send + Sync {
    fn dtype(&self) -> DType;
    fn config(&self) -> &AccumulatorConfig;
    fn close(&self);
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Element> Registered for Accumulator<T> {
    fn dtype(&self) -> DType {
        Accumulator::dtype(self)
    }

    fn config(&self) -> &AccumulatorConfig {
        Accumulator::config(self)
    }

    fn close(&self) {
        Accumulator::close(self);
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Named accumulators shared between every caller of a session.
///
/// Looking up the same name twice yields the same instance, closing the registry
/// cancels every take blocked on any of them.
#[derive(Default)]
pub struct Registry {
    accumulators: Mutex<HashMap<String, Arc<dyn Registered>>>,
}

impl Registry {
    /// Creates a new, empty `Registry`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the accumulator registered under `config.name`, creating it first
    /// if it doesn't exist yet.
    ///
    /// # Arguments
    /// * `config` - The configuration of the accumulator.
    ///
    /// # Returns
    /// The shared accumulator, a `DTypeMismatch` if `T` doesn't match the configured
    /// element type, or a `ConfigConflict` if it was registered with any other
    /// element type, shape, reduction or step policy.
    pub fn get_or_create<T: Element>(
        &self,
        config: &AccumulatorConfig,
    ) -> Result<Arc<Accumulator<T>>> {
        if config.dtype != T::DTYPE {
            return Err(AccumulatorErr::DTypeMismatch {
                name: config.name.clone(),
                expected: config.dtype,
                got: T::DTYPE,
            });
        }

        let mut accumulators = self.accumulators.lock();

        if let Some(registered) = accumulators.get(&config.name) {
            if registered.config() != config {
                return Err(AccumulatorErr::ConfigConflict {
                    name: config.name.clone(),
                    registered: Box::new(registered.config().clone()),
                    requested: Box::new(config.clone()),
                });
            }

            return downcast(&config.name, registered);
        }

        let accumulator = Arc::new(Accumulator::<T>::from_config(config)?);
        accumulators.insert(config.name.clone(), accumulator.clone());
        info!(
            accumulator = config.name.as_str(),
            dtype = config.dtype.to_string().as_str(),
            shape = config.shape.to_string().as_str();
            "registered accumulator"
        );

        Ok(accumulator)
    }

    /// Looks up an already registered accumulator.
    ///
    /// # Arguments
    /// * `name` - The accumulator's name.
    ///
    /// # Returns
    /// The shared accumulator, `NotFound` if there's none by that name, or a
    /// `DTypeMismatch` if it holds another element type.
    pub fn get<T: Element>(&self, name: &str) -> Result<Arc<Accumulator<T>>> {
        let accumulators = self.accumulators.lock();
        let registered = accumulators
            .get(name)
            .ok_or_else(|| AccumulatorErr::NotFound(name.to_string()))?;

        downcast(name, registered)
    }

    /// Unregisters and closes an accumulator.
    ///
    /// # Returns
    /// `false` if there was none by that name.
    pub fn remove(&self, name: &str) -> bool {
        let Some(registered) = self.accumulators.lock().remove(name) else {
            return false;
        };

        registered.close();
        true
    }

    /// Closes and unregisters every accumulator.
    ///
    /// # Returns
    /// The amount of accumulators that were closed.
    pub fn close_all(&self) -> usize {
        let drained: Vec<_> = self.accumulators.lock().drain().collect();
        let closed = drained.len();

        for (_, registered) in drained {
            registered.close();
        }

        info!(closed = closed; "closed registry");
        closed
    }

    pub fn len(&self) -> usize {
        self.accumulators.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Recovers the concrete accumulator type of a registered entry.
fn downcast<T: Element>(
    name: &str,
    registered: &Arc<dyn Registered>,
) -> Result<Arc<Accumulator<T>>> {
    let dtype = registered.dtype();

    Arc::clone(registered)
        .into_any()
        .downcast::<Accumulator<T>>()
        .map_err(|_| AccumulatorErr::DTypeMismatch {
            name: name.to_string(),
            expected: dtype,
            got: T::DTYPE,
        })
}

#[cfg(test)]
mod tests {
    use ndarray::arr1;

    use super::*;
    use crate::{config::Reduction, error::ErrorKind, shape::ShapeSpec};

    #[test]
    fn test_same_name_shares_instance() {
        let registry = Registry::new();
        let config =
            AccumulatorConfig::new("grads", DType::F32).with_shape(ShapeSpec::known(&[1]));

        let first = registry.get_or_create::<f32>(&config).unwrap();
        let second = registry.get_or_create::<f32>(&config).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        first.apply(&arr1(&[1.0]), 0).unwrap();
        assert_eq!(second.num_accumulated(), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_dtype_mismatch() {
        let registry = Registry::new();
        let config = AccumulatorConfig::new("grads", DType::F64);

        let err = registry.get_or_create::<f32>(&config).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(registry.is_empty());

        registry.get_or_create::<f64>(&config).unwrap();
        let err = registry.get::<f32>("grads").unwrap_err();
        assert_eq!(
            err,
            AccumulatorErr::DTypeMismatch {
                name: "grads".into(),
                expected: DType::F64,
                got: DType::F32,
            }
        );
    }

    #[test]
    fn test_shape_conflict() {
        let registry = Registry::new();
        let config =
            AccumulatorConfig::new("grads", DType::F32).with_shape(ShapeSpec::known(&[3, 2]));
        registry.get_or_create::<f32>(&config).unwrap();

        let other = config.clone().with_shape(ShapeSpec::known(&[2, 2]));
        let err = registry.get_or_create::<f32>(&other).unwrap_err();
        assert!(matches!(err, AccumulatorErr::ConfigConflict { .. }));
    }

    #[test]
    fn test_configured_dtype_checked_against_registered() {
        let registry = Registry::new();
        let config = AccumulatorConfig::new("g", DType::F32).with_shape(ShapeSpec::known(&[1]));
        registry.get_or_create::<f32>(&config).unwrap();

        let wrong = AccumulatorConfig {
            dtype: DType::F64,
            ..config.clone()
        };
        let err = registry.get_or_create::<f32>(&wrong).unwrap_err();
        assert_eq!(
            err,
            AccumulatorErr::DTypeMismatch {
                name: "g".into(),
                expected: DType::F64,
                got: DType::F32,
            }
        );

        let err = registry.get_or_create::<f64>(&wrong).unwrap_err();
        assert!(matches!(err, AccumulatorErr::ConfigConflict { .. }));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_reduction_conflict() {
        let registry = Registry::new();
        let config = AccumulatorConfig::new("g", DType::F32).with_shape(ShapeSpec::known(&[1]));
        let mean = registry.get_or_create::<f32>(&config).unwrap();

        let sum = config.clone().with_reduction(Reduction::Sum);
        let err = registry.get_or_create::<f32>(&sum).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(
            err,
            AccumulatorErr::ConfigConflict {
                name: "g".into(),
                registered: Box::new(config),
                requested: Box::new(sum),
            }
        );

        mean.apply(&arr1(&[2.0]), 0).unwrap();
        mean.apply(&arr1(&[4.0]), 0).unwrap();
        assert_eq!(mean.take(2).unwrap(), arr1(&[3.0]).into_dyn());
    }

    #[test]
    fn test_step_policy_conflict() {
        let registry = Registry::new();
        let config = AccumulatorConfig::new("g", DType::F32);
        registry.get_or_create::<f32>(&config).unwrap();

        let advancing = config.clone().with_advance_step_on_take(true);
        let err = registry.get_or_create::<f32>(&advancing).unwrap_err();
        assert!(matches!(err, AccumulatorErr::ConfigConflict { .. }));

        assert!(registry.get_or_create::<f32>(&config).is_ok());
    }

    #[test]
    fn test_get_unknown_name() {
        let registry = Registry::new();
        let err = registry.get::<f32>("missing").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_remove_closes() {
        let registry = Registry::new();
        let config = AccumulatorConfig::new("grads", DType::F32);
        let accumulator = registry.get_or_create::<f32>(&config).unwrap();

        assert!(registry.remove("grads"));
        assert!(!registry.remove("grads"));
        assert!(accumulator.is_closed());
    }
}
