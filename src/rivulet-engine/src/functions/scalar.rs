//! Builtin scalar functions and closure-backed UDFs.

use std::fmt;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, AsArray, Float64Array, Int64Array, StringArray};
use arrow::compute::cast;
use arrow::compute::kernels::length::length;
use arrow::datatypes::{DataType, Float64Type, Int64Type};

use common_error::{RivuletError, RivuletResult};

use super::ScalarFunction;

type UdfImpl = dyn Fn(&[ArrayRef]) -> RivuletResult<ArrayRef> + Send + Sync;

/// Scalar function backed by a closure with a fixed return type.
pub struct ScalarUdf {
    name: String,
    return_type: DataType,
    func: Arc<UdfImpl>,
}

impl ScalarUdf {
    pub fn new<F>(name: impl Into<String>, return_type: DataType, func: F) -> Self
    where
        F: Fn(&[ArrayRef]) -> RivuletResult<ArrayRef> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            return_type,
            func: Arc::new(func),
        }
    }
}

impl fmt::Debug for ScalarUdf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScalarUdf")
            .field("name", &self.name)
            .field("return_type", &self.return_type)
            .finish_non_exhaustive()
    }
}

impl ScalarFunction for ScalarUdf {
    fn name(&self) -> &str {
        &self.name
    }

    fn return_type(&self, _arg_types: &[DataType]) -> RivuletResult<DataType> {
        Ok(self.return_type.clone())
    }

    fn invoke(&self, args: &[ArrayRef], _num_rows: usize) -> RivuletResult<ArrayRef> {
        (self.func)(args)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Builtin {
    Abs,
    Upper,
    Lower,
    Length,
}

#[derive(Debug)]
struct BuiltinScalar(Builtin);

pub(super) fn builtin_scalar_functions() -> Vec<Arc<dyn ScalarFunction>> {
    [Builtin::Abs, Builtin::Upper, Builtin::Lower, Builtin::Length]
        .into_iter()
        .map(|b| Arc::new(BuiltinScalar(b)) as Arc<dyn ScalarFunction>)
        .collect()
}

fn single_arg<'a, T>(name: &str, args: &'a [T]) -> RivuletResult<&'a T> {
    match args {
        [arg] => Ok(arg),
        _ => Err(RivuletError::invalid_options(format!(
            "{name} takes exactly one argument, got {}",
            args.len()
        ))),
    }
}

impl ScalarFunction for BuiltinScalar {
    fn name(&self) -> &str {
        match self.0 {
            Builtin::Abs => "abs",
            Builtin::Upper => "upper",
            Builtin::Lower => "lower",
            Builtin::Length => "length",
        }
    }

    fn return_type(&self, arg_types: &[DataType]) -> RivuletResult<DataType> {
        let arg = single_arg(self.name(), arg_types)?;
        match (self.0, arg) {
            (Builtin::Abs, t) if t.is_floating() => Ok(DataType::Float64),
            (Builtin::Abs, t) if t.is_integer() || t == &DataType::Null => Ok(DataType::Int64),
            (Builtin::Upper | Builtin::Lower, DataType::Utf8 | DataType::Null) => {
                Ok(DataType::Utf8)
            }
            (Builtin::Length, DataType::Utf8 | DataType::Null) => Ok(DataType::Int32),
            (_, other) => Err(RivuletError::type_error(format!(
                "{} does not accept {other}",
                self.name()
            ))),
        }
    }

    fn invoke(&self, args: &[ArrayRef], _num_rows: usize) -> RivuletResult<ArrayRef> {
        let arg = single_arg(self.name(), args)?;
        let return_type = self.return_type(&[arg.data_type().clone()])?;
        let input = if arg.data_type() == &DataType::Null {
            cast(arg, if return_type == DataType::Int32 { &DataType::Utf8 } else { &return_type })?
        } else {
            arg.clone()
        };

        let result: ArrayRef = match self.0 {
            Builtin::Abs if return_type == DataType::Float64 => {
                let values = cast(&input, &DataType::Float64)?;
                let out: Float64Array = values.as_primitive::<Float64Type>().unary(f64::abs);
                Arc::new(out)
            }
            Builtin::Abs => {
                let values = cast(&input, &DataType::Int64)?;
                let out: Int64Array = values
                    .as_primitive::<Int64Type>()
                    .unary(i64::wrapping_abs);
                Arc::new(out)
            }
            Builtin::Upper => {
                let out: StringArray = input
                    .as_string::<i32>()
                    .iter()
                    .map(|v| v.map(str::to_uppercase))
                    .collect();
                Arc::new(out)
            }
            Builtin::Lower => {
                let out: StringArray = input
                    .as_string::<i32>()
                    .iter()
                    .map(|v| v.map(str::to_lowercase))
                    .collect();
                Arc::new(out)
            }
            Builtin::Length => length(&input)?,
        };
        Ok(result)
    }
}
