//! The unit of data exchanged between nodes.

use std::fmt;

use arrow::array::{Array, ArrayRef};
use arrow::datatypes::{DataType, SchemaRef};
use arrow::record_batch::{RecordBatch, RecordBatchOptions};

use common_error::{RivuletError, RivuletResult};

use crate::expr::{Expr, ScalarValue};

/// One column of an [`ExecBatch`]: a full array or a value repeated for
/// every row.
#[derive(Debug, Clone)]
pub enum Datum {
    Array(ArrayRef),
    Scalar(ScalarValue),
}

impl Datum {
    pub fn data_type(&self) -> DataType {
        match self {
            Datum::Array(array) => array.data_type().clone(),
            Datum::Scalar(value) => value.data_type(),
        }
    }

    /// Materialize as an array of `len` rows.
    pub fn to_array(&self, len: usize) -> ArrayRef {
        match self {
            Datum::Array(array) => array.clone(),
            Datum::Scalar(value) => value.to_array(len),
        }
    }

    fn memory_size(&self) -> usize {
        match self {
            Datum::Array(array) => array.get_array_memory_size(),
            Datum::Scalar(_) => std::mem::size_of::<ScalarValue>(),
        }
    }
}

impl From<ArrayRef> for Datum {
    fn from(array: ArrayRef) -> Self {
        Datum::Array(array)
    }
}

impl From<ScalarValue> for Datum {
    fn from(value: ScalarValue) -> Self {
        Datum::Scalar(value)
    }
}

/// Columns of equal length plus the metadata nodes need to route them.
///
/// `length` is carried explicitly so a batch of only scalars still has a
/// row count. `index` is the batch's position in the stream it came from;
/// map nodes keep it so sinks can restore source order.
#[derive(Debug, Clone)]
pub struct ExecBatch {
    pub values: Vec<Datum>,
    pub length: usize,
    /// Rows are known to satisfy this predicate.
    pub guarantee: Option<Expr>,
    pub index: Option<u64>,
}

impl ExecBatch {
    pub fn try_new(values: Vec<Datum>, length: usize) -> RivuletResult<Self> {
        for (i, value) in values.iter().enumerate() {
            if let Datum::Array(array) = value {
                if array.len() != length {
                    return Err(RivuletError::value_error(format!(
                        "column {i} has {} rows, batch has {length}",
                        array.len()
                    )));
                }
            }
        }
        Ok(Self {
            values,
            length,
            guarantee: None,
            index: None,
        })
    }

    pub fn from_record_batch(batch: &RecordBatch) -> Self {
        Self {
            values: batch.columns().iter().cloned().map(Datum::Array).collect(),
            length: batch.num_rows(),
            guarantee: None,
            index: None,
        }
    }

    /// Materialize against `schema`, broadcasting scalars.
    pub fn to_record_batch(&self, schema: SchemaRef) -> RivuletResult<RecordBatch> {
        if self.values.len() != schema.fields().len() {
            return Err(RivuletError::schema_error(format!(
                "batch has {} columns, schema has {}",
                self.values.len(),
                schema.fields().len()
            )));
        }
        let columns = self
            .values
            .iter()
            .zip(schema.fields())
            .map(|(value, field)| match value {
                Datum::Array(array) => Ok(array.clone()),
                Datum::Scalar(v) => v.to_array_of_type(self.length, field.data_type()),
            })
            .collect::<RivuletResult<Vec<_>>>()?;
        let options = RecordBatchOptions::new().with_row_count(Some(self.length));
        Ok(RecordBatch::try_new_with_options(schema, columns, &options)?)
    }

    pub fn with_index(mut self, index: u64) -> Self {
        self.index = Some(index);
        self
    }

    pub fn with_guarantee(mut self, guarantee: Expr) -> Self {
        self.guarantee = Some(guarantee);
        self
    }

    pub fn num_rows(&self) -> usize {
        self.length
    }

    pub fn num_values(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn data_types(&self) -> Vec<DataType> {
        self.values.iter().map(Datum::data_type).collect()
    }

    /// Approximate bytes held by the batch's buffers.
    pub fn memory_size(&self) -> usize {
        self.values.iter().map(Datum::memory_size).sum()
    }

    /// Check column count and types against `schema`.
    pub fn validate_schema(&self, schema: &SchemaRef) -> RivuletResult<()> {
        if self.values.len() != schema.fields().len() {
            return Err(RivuletError::schema_error(format!(
                "batch has {} columns, output schema has {}",
                self.values.len(),
                schema.fields().len()
            )));
        }
        for (value, field) in self.values.iter().zip(schema.fields()) {
            let data_type = value.data_type();
            // null scalars fit any column
            if data_type != *field.data_type() && data_type != DataType::Null {
                return Err(RivuletError::schema_error(format!(
                    "column '{}' expects {}, batch carries {data_type}",
                    field.name(),
                    field.data_type()
                )));
            }
        }
        Ok(())
    }
}

impl From<RecordBatch> for ExecBatch {
    fn from(batch: RecordBatch) -> Self {
        Self::from_record_batch(&batch)
    }
}

impl fmt::Display for ExecBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExecBatch[{} rows, {} columns", self.length, self.values.len())?;
        if let Some(index) = self.index {
            write!(f, ", index={index}")?;
        }
        if let Some(guarantee) = &self.guarantee {
            write!(f, ", guarantee={guarantee}")?;
        }
        write!(f, "]")
    }
}
