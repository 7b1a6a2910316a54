//! Grouped aggregate functions.
//!
//! An [`AggregateFunction`] is a factory: the aggregate node asks it for one
//! [`GroupsAccumulator`] per aggregate, then feeds every input batch through
//! `update` together with the group index of each row. Group indices are
//! dense (`0..total_groups`), so accumulators keep plain vectors indexed by
//! group.

use std::fmt;
use std::mem::size_of;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, AsArray, Float64Array, Int64Array, PrimitiveArray};
use arrow::buffer::{NullBuffer, ScalarBuffer};
use arrow::compute::cast;
use arrow::datatypes::{
    ArrowNativeTypeOp, ArrowPrimitiveType, DataType, Float64Type, Int64Type,
};
use serde::{Deserialize, Serialize};

use common_error::{RivuletError, RivuletResult};

use super::quantile::{Interpolation, quantile};

/// Which rows `count` counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CountMode {
    /// Non-null values.
    #[default]
    OnlyValid,
    /// Null values.
    OnlyNull,
    /// Every row.
    All,
}

/// Per-aggregate options.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum AggregateOptions {
    #[default]
    None,
    Count(CountMode),
    Quantile {
        q: f64,
        interpolation: Interpolation,
    },
}

/// Per-group state for one aggregate.
pub trait GroupsAccumulator: Send + fmt::Debug {
    /// Fold `values` into the groups given row by row in `group_indices`.
    ///
    /// `values` is `None` for aggregates without a target column.
    fn update(
        &mut self,
        values: Option<&ArrayRef>,
        group_indices: &[usize],
        total_groups: usize,
    ) -> RivuletResult<()>;

    /// Produce one value per group and reset.
    fn evaluate(&mut self, total_groups: usize) -> RivuletResult<ArrayRef>;

    /// Approximate heap footprint in bytes.
    fn size(&self) -> usize;
}

/// Named aggregate resolved through the function registry.
pub trait AggregateFunction: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn return_type(
        &self,
        input: Option<&DataType>,
        options: &AggregateOptions,
    ) -> RivuletResult<DataType>;

    fn accumulator(
        &self,
        input: Option<&DataType>,
        options: &AggregateOptions,
    ) -> RivuletResult<Box<dyn GroupsAccumulator>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Builtin {
    Count,
    Sum,
    Min,
    Max,
    Mean,
    Quantile,
}

#[derive(Debug)]
struct BuiltinAggregate(Builtin);

pub(super) fn builtin_aggregate_functions() -> Vec<Arc<dyn AggregateFunction>> {
    [
        Builtin::Count,
        Builtin::Sum,
        Builtin::Min,
        Builtin::Max,
        Builtin::Mean,
        Builtin::Quantile,
    ]
    .into_iter()
    .map(|b| Arc::new(BuiltinAggregate(b)) as Arc<dyn AggregateFunction>)
    .collect()
}

impl BuiltinAggregate {
    fn numeric_input<'a>(&self, input: Option<&'a DataType>) -> RivuletResult<&'a DataType> {
        match input {
            Some(t) if t.is_numeric() || t == &DataType::Null => Ok(t),
            Some(t) => Err(RivuletError::type_error(format!(
                "{} requires a numeric argument, got {t}",
                self.name()
            ))),
            None => Err(RivuletError::invalid_options(format!(
                "{} requires a target column",
                self.name()
            ))),
        }
    }
}

impl AggregateFunction for BuiltinAggregate {
    fn name(&self) -> &str {
        match self.0 {
            Builtin::Count => "count",
            Builtin::Sum => "sum",
            Builtin::Min => "min",
            Builtin::Max => "max",
            Builtin::Mean => "mean",
            Builtin::Quantile => "quantile",
        }
    }

    fn return_type(
        &self,
        input: Option<&DataType>,
        options: &AggregateOptions,
    ) -> RivuletResult<DataType> {
        match self.0 {
            Builtin::Count => {
                count_mode(options)?;
                Ok(DataType::Int64)
            }
            Builtin::Sum | Builtin::Min | Builtin::Max => {
                if self.numeric_input(input)?.is_floating() {
                    Ok(DataType::Float64)
                } else {
                    Ok(DataType::Int64)
                }
            }
            Builtin::Mean => {
                self.numeric_input(input)?;
                Ok(DataType::Float64)
            }
            Builtin::Quantile => {
                self.numeric_input(input)?;
                quantile_options(options)?;
                Ok(DataType::Float64)
            }
        }
    }

    fn accumulator(
        &self,
        input: Option<&DataType>,
        options: &AggregateOptions,
    ) -> RivuletResult<Box<dyn GroupsAccumulator>> {
        let return_type = self.return_type(input, options)?;
        let kind = match self.0 {
            Builtin::Count => {
                return Ok(Box::new(CountAccumulator::new(count_mode(options)?)));
            }
            Builtin::Mean => return Ok(Box::new(MeanAccumulator::default())),
            Builtin::Quantile => {
                let (q, interpolation) = quantile_options(options)?;
                return Ok(Box::new(QuantileAccumulator::new(q, interpolation)));
            }
            Builtin::Sum => NumericKind::Sum,
            Builtin::Min => NumericKind::Min,
            Builtin::Max => NumericKind::Max,
        };
        if return_type == DataType::Float64 {
            Ok(Box::new(NumericAccumulator::<Float64Type>::new(kind)))
        } else {
            Ok(Box::new(NumericAccumulator::<Int64Type>::new(kind)))
        }
    }
}

fn count_mode(options: &AggregateOptions) -> RivuletResult<CountMode> {
    match options {
        AggregateOptions::None => Ok(CountMode::default()),
        AggregateOptions::Count(mode) => Ok(*mode),
        other => Err(RivuletError::invalid_options(format!(
            "count does not accept {other:?}"
        ))),
    }
}

fn quantile_options(options: &AggregateOptions) -> RivuletResult<(f64, Interpolation)> {
    match options {
        AggregateOptions::Quantile { q, interpolation } => {
            if !(0.0..=1.0).contains(q) {
                return Err(RivuletError::invalid_options(format!(
                    "quantile q must be within [0, 1], got {q}"
                )));
            }
            Ok((*q, *interpolation))
        }
        AggregateOptions::None => Ok((0.5, Interpolation::default())),
        other => Err(RivuletError::invalid_options(format!(
            "quantile does not accept {other:?}"
        ))),
    }
}

fn required<'a>(values: Option<&'a ArrayRef>, name: &str) -> RivuletResult<&'a ArrayRef> {
    values.ok_or_else(|| RivuletError::invalid_state(format!("{name} received no values")))
}

fn check_lengths(values: Option<&ArrayRef>, group_indices: &[usize]) -> RivuletResult<()> {
    match values {
        Some(v) if v.len() != group_indices.len() => Err(RivuletError::internal(format!(
            "{} values for {} group indices",
            v.len(),
            group_indices.len()
        ))),
        _ => Ok(()),
    }
}

#[derive(Debug)]
struct CountAccumulator {
    mode: CountMode,
    counts: Vec<i64>,
}

impl CountAccumulator {
    fn new(mode: CountMode) -> Self {
        Self {
            mode,
            counts: Vec::new(),
        }
    }
}

impl GroupsAccumulator for CountAccumulator {
    fn update(
        &mut self,
        values: Option<&ArrayRef>,
        group_indices: &[usize],
        total_groups: usize,
    ) -> RivuletResult<()> {
        check_lengths(values, group_indices)?;
        self.counts.resize(total_groups, 0);
        for (row, &group) in group_indices.iter().enumerate() {
            let counted = match (self.mode, values) {
                (CountMode::All, _) | (_, None) => true,
                (CountMode::OnlyValid, Some(v)) => v.is_valid(row),
                (CountMode::OnlyNull, Some(v)) => v.is_null(row),
            };
            if counted {
                self.counts[group] += 1;
            }
        }
        Ok(())
    }

    fn evaluate(&mut self, total_groups: usize) -> RivuletResult<ArrayRef> {
        self.counts.resize(total_groups, 0);
        Ok(Arc::new(Int64Array::from(std::mem::take(&mut self.counts))))
    }

    fn size(&self) -> usize {
        self.counts.capacity() * size_of::<i64>()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NumericKind {
    Sum,
    Min,
    Max,
}

/// Sum, min or max over a primitive type; groups with no valid input are null.
struct NumericAccumulator<T: ArrowPrimitiveType> {
    kind: NumericKind,
    values: Vec<T::Native>,
    seen: Vec<bool>,
}

impl<T: ArrowPrimitiveType> NumericAccumulator<T> {
    fn new(kind: NumericKind) -> Self {
        Self {
            kind,
            values: Vec::new(),
            seen: Vec::new(),
        }
    }

    fn resize(&mut self, total_groups: usize) {
        self.values.resize(total_groups, T::Native::default());
        self.seen.resize(total_groups, false);
    }
}

impl<T: ArrowPrimitiveType> fmt::Debug for NumericAccumulator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NumericAccumulator")
            .field("kind", &self.kind)
            .field("data_type", &T::DATA_TYPE)
            .field("groups", &self.values.len())
            .finish()
    }
}

impl<T: ArrowPrimitiveType> GroupsAccumulator for NumericAccumulator<T> {
    fn update(
        &mut self,
        values: Option<&ArrayRef>,
        group_indices: &[usize],
        total_groups: usize,
    ) -> RivuletResult<()> {
        check_lengths(values, group_indices)?;
        let values = cast(required(values, "numeric aggregate")?, &T::DATA_TYPE)?;
        let values = values.as_primitive::<T>();
        self.resize(total_groups);

        for (row, &group) in group_indices.iter().enumerate() {
            if values.is_null(row) {
                continue;
            }
            let v = values.value(row);
            if !self.seen[group] {
                self.seen[group] = true;
                self.values[group] = v;
                continue;
            }
            let slot = &mut self.values[group];
            match self.kind {
                NumericKind::Sum => *slot = slot.add_wrapping(v),
                NumericKind::Min => {
                    if v.is_lt(*slot) {
                        *slot = v;
                    }
                }
                NumericKind::Max => {
                    if v.is_gt(*slot) {
                        *slot = v;
                    }
                }
            }
        }
        Ok(())
    }

    fn evaluate(&mut self, total_groups: usize) -> RivuletResult<ArrayRef> {
        self.resize(total_groups);
        let values = ScalarBuffer::from(std::mem::take(&mut self.values));
        let nulls = NullBuffer::from(std::mem::take(&mut self.seen));
        Ok(Arc::new(PrimitiveArray::<T>::new(values, Some(nulls))))
    }

    fn size(&self) -> usize {
        self.values.capacity() * size_of::<T::Native>() + self.seen.capacity()
    }
}

#[derive(Debug, Default)]
struct MeanAccumulator {
    sums: Vec<f64>,
    counts: Vec<u64>,
}

impl GroupsAccumulator for MeanAccumulator {
    fn update(
        &mut self,
        values: Option<&ArrayRef>,
        group_indices: &[usize],
        total_groups: usize,
    ) -> RivuletResult<()> {
        check_lengths(values, group_indices)?;
        let values = cast(required(values, "mean")?, &DataType::Float64)?;
        let values = values.as_primitive::<Float64Type>();
        self.sums.resize(total_groups, 0.0);
        self.counts.resize(total_groups, 0);

        for (row, &group) in group_indices.iter().enumerate() {
            if values.is_valid(row) {
                self.sums[group] += values.value(row);
                self.counts[group] += 1;
            }
        }
        Ok(())
    }

    fn evaluate(&mut self, total_groups: usize) -> RivuletResult<ArrayRef> {
        self.sums.resize(total_groups, 0.0);
        self.counts.resize(total_groups, 0);
        let out: Float64Array = self
            .sums
            .iter()
            .zip(&self.counts)
            .map(|(sum, &count)| (count > 0).then(|| sum / count as f64))
            .collect();
        self.sums.clear();
        self.counts.clear();
        Ok(Arc::new(out))
    }

    fn size(&self) -> usize {
        self.sums.capacity() * size_of::<f64>() + self.counts.capacity() * size_of::<u64>()
    }
}

/// Holds every valid sample per group until evaluation.
#[derive(Debug)]
struct QuantileAccumulator {
    q: f64,
    interpolation: Interpolation,
    samples: Vec<Vec<f64>>,
    total_samples: usize,
}

impl QuantileAccumulator {
    fn new(q: f64, interpolation: Interpolation) -> Self {
        Self {
            q,
            interpolation,
            samples: Vec::new(),
            total_samples: 0,
        }
    }
}

impl GroupsAccumulator for QuantileAccumulator {
    fn update(
        &mut self,
        values: Option<&ArrayRef>,
        group_indices: &[usize],
        total_groups: usize,
    ) -> RivuletResult<()> {
        check_lengths(values, group_indices)?;
        let values = cast(required(values, "quantile")?, &DataType::Float64)?;
        let values = values.as_primitive::<Float64Type>();
        self.samples.resize_with(total_groups, Vec::new);

        for (row, &group) in group_indices.iter().enumerate() {
            if values.is_valid(row) {
                self.samples[group].push(values.value(row));
                self.total_samples += 1;
            }
        }
        Ok(())
    }

    fn evaluate(&mut self, total_groups: usize) -> RivuletResult<ArrayRef> {
        self.samples.resize_with(total_groups, Vec::new);
        let out: Float64Array = std::mem::take(&mut self.samples)
            .into_iter()
            .map(|samples| quantile(samples, self.q, self.interpolation))
            .collect();
        self.total_samples = 0;
        Ok(Arc::new(out))
    }

    fn size(&self) -> usize {
        self.samples.capacity() * size_of::<Vec<f64>>() + self.total_samples * size_of::<f64>()
    }
}
