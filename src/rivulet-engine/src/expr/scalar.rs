//! Scalar literal values.

use std::fmt;
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, AsArray, BooleanArray, Float64Array, Int64Array, StringArray,
    new_null_array,
};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Float64Type, Int64Type};

use common_error::{RivuletError, RivuletResult};

/// A single typed value, used for literals and broadcast batch columns.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarValue {
    /// Untyped null.
    Null,
    Boolean(Option<bool>),
    Int64(Option<i64>),
    Float64(Option<f64>),
    Utf8(Option<String>),
}

impl ScalarValue {
    /// Arrow data type of this value.
    pub fn data_type(&self) -> DataType {
        match self {
            Self::Null => DataType::Null,
            Self::Boolean(_) => DataType::Boolean,
            Self::Int64(_) => DataType::Int64,
            Self::Float64(_) => DataType::Float64,
            Self::Utf8(_) => DataType::Utf8,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(
            self,
            Self::Null
                | Self::Boolean(None)
                | Self::Int64(None)
                | Self::Float64(None)
                | Self::Utf8(None)
        )
    }

    /// Broadcast the value into an array of `len` rows.
    pub fn to_array(&self, len: usize) -> ArrayRef {
        match self {
            Self::Null => new_null_array(&DataType::Null, len),
            Self::Boolean(Some(v)) => Arc::new(BooleanArray::from(vec![*v; len])),
            Self::Int64(Some(v)) => Arc::new(Int64Array::from_value(*v, len)),
            Self::Float64(Some(v)) => Arc::new(Float64Array::from_value(*v, len)),
            Self::Utf8(Some(v)) => Arc::new(StringArray::from_iter_values(
                std::iter::repeat(v.as_str()).take(len),
            )),
            other => new_null_array(&other.data_type(), len),
        }
    }

    /// Broadcast the value into an array of the requested type.
    pub fn to_array_of_type(&self, len: usize, data_type: &DataType) -> RivuletResult<ArrayRef> {
        let array = self.to_array(len);
        if array.data_type() == data_type {
            return Ok(array);
        }
        Ok(cast(&array, data_type)?)
    }

    /// Read the value at `index` of an array.
    pub fn try_from_array(array: &dyn Array, index: usize) -> RivuletResult<Self> {
        if index >= array.len() {
            return Err(RivuletError::value_error(format!(
                "index {index} out of bounds for array of length {}",
                array.len()
            )));
        }
        let valid = array.is_valid(index);
        let value = match array.data_type() {
            DataType::Null => Self::Null,
            DataType::Boolean => {
                Self::Boolean(valid.then(|| array.as_boolean().value(index)))
            }
            DataType::Int64 => {
                Self::Int64(valid.then(|| array.as_primitive::<Int64Type>().value(index)))
            }
            DataType::Float64 => {
                Self::Float64(valid.then(|| array.as_primitive::<Float64Type>().value(index)))
            }
            DataType::Utf8 => {
                Self::Utf8(valid.then(|| array.as_string::<i32>().value(index).to_string()))
            }
            other => {
                return Err(RivuletError::not_implemented(format!(
                    "scalar value of type {other}"
                )));
            }
        };
        Ok(value)
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            return write!(f, "null");
        }
        match self {
            Self::Boolean(Some(v)) => write!(f, "{v}"),
            Self::Int64(Some(v)) => write!(f, "{v}"),
            Self::Float64(Some(v)) => write!(f, "{v}"),
            Self::Utf8(Some(v)) => write!(f, "'{v}'"),
            _ => write!(f, "null"),
        }
    }
}

impl From<bool> for ScalarValue {
    fn from(v: bool) -> Self {
        Self::Boolean(Some(v))
    }
}

impl From<i64> for ScalarValue {
    fn from(v: i64) -> Self {
        Self::Int64(Some(v))
    }
}

impl From<i32> for ScalarValue {
    fn from(v: i32) -> Self {
        Self::Int64(Some(i64::from(v)))
    }
}

impl From<f64> for ScalarValue {
    fn from(v: f64) -> Self {
        Self::Float64(Some(v))
    }
}

impl From<&str> for ScalarValue {
    fn from(v: &str) -> Self {
        Self::Utf8(Some(v.to_string()))
    }
}

impl From<String> for ScalarValue {
    fn from(v: String) -> Self {
        Self::Utf8(Some(v))
    }
}
