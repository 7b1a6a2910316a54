//! Scalar and aggregate function registry.
//!
//! Nodes never hard-code kernels: filter and project expressions call
//! scalar functions by name, and the aggregate node resolves its
//! accumulators here. The registry is an explicit object carried by the
//! execution context, so independent plans can use different function sets.

pub mod aggregate;
pub mod quantile;
mod scalar;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use arrow::array::ArrayRef;
use arrow::datatypes::DataType;
use parking_lot::RwLock;

use common_error::{RivuletError, RivuletResult};

pub use aggregate::{AggregateFunction, AggregateOptions, CountMode, GroupsAccumulator};
pub use quantile::Interpolation;
pub use scalar::ScalarUdf;

/// A function applied row-wise to argument arrays.
pub trait ScalarFunction: Send + Sync + fmt::Debug {
    /// Registry name.
    fn name(&self) -> &str;

    /// Result type for the given argument types.
    fn return_type(&self, arg_types: &[DataType]) -> RivuletResult<DataType>;

    /// Evaluate over arrays of `num_rows` rows.
    fn invoke(&self, args: &[ArrayRef], num_rows: usize) -> RivuletResult<ArrayRef>;
}

/// Name-keyed registry of scalar and aggregate functions.
#[derive(Default)]
pub struct FunctionRegistry {
    scalar: RwLock<HashMap<String, Arc<dyn ScalarFunction>>>,
    aggregate: RwLock<HashMap<String, Arc<dyn AggregateFunction>>>,
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("scalar", &self.scalar_names())
            .field("aggregate", &self.aggregate_names())
            .finish()
    }
}

impl FunctionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with the builtin functions.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        for function in scalar::builtin_scalar_functions() {
            registry.scalar.write().insert(function.name().to_string(), function);
        }
        for function in aggregate::builtin_aggregate_functions() {
            registry
                .aggregate
                .write()
                .insert(function.name().to_string(), function);
        }
        registry
    }

    /// Register a scalar function; fails if the name is taken.
    pub fn register_scalar(&self, function: Arc<dyn ScalarFunction>) -> RivuletResult<()> {
        let mut scalar = self.scalar.write();
        let name = function.name().to_string();
        if scalar.contains_key(&name) {
            return Err(RivuletError::already_exists(format!(
                "scalar function '{name}'"
            )));
        }
        log::debug!("registered scalar function {name}");
        scalar.insert(name, function);
        Ok(())
    }

    /// Register a closure-backed scalar UDF with a fixed return type.
    pub fn register_udf<F>(
        &self,
        name: impl Into<String>,
        return_type: DataType,
        func: F,
    ) -> RivuletResult<()>
    where
        F: Fn(&[ArrayRef]) -> RivuletResult<ArrayRef> + Send + Sync + 'static,
    {
        self.register_scalar(Arc::new(ScalarUdf::new(name, return_type, func)))
    }

    /// Register an aggregate function; fails if the name is taken.
    pub fn register_aggregate(&self, function: Arc<dyn AggregateFunction>) -> RivuletResult<()> {
        let mut aggregate = self.aggregate.write();
        let name = function.name().to_string();
        if aggregate.contains_key(&name) {
            return Err(RivuletError::already_exists(format!(
                "aggregate function '{name}'"
            )));
        }
        aggregate.insert(name, function);
        Ok(())
    }

    /// Look up a scalar function.
    pub fn scalar(&self, name: &str) -> RivuletResult<Arc<dyn ScalarFunction>> {
        self.scalar
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| RivuletError::not_found(format!("scalar function '{name}'")))
    }

    /// Look up an aggregate function.
    pub fn aggregate(&self, name: &str) -> RivuletResult<Arc<dyn AggregateFunction>> {
        self.aggregate
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| RivuletError::not_found(format!("aggregate function '{name}'")))
    }

    pub fn scalar_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.scalar.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn aggregate_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.aggregate.read().keys().cloned().collect();
        names.sort();
        names
    }
}
