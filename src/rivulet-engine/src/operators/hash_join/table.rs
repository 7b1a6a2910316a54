//! Build-side hash table and output assembly.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use ahash::AHashMap;
use arrow::array::{Array, ArrayRef, UInt32Array, new_null_array};
use arrow::compute::{cast, filter, take};
use arrow::datatypes::{DataType, SchemaRef};
use arrow::record_batch::{RecordBatch, RecordBatchOptions};
use arrow::row::{RowConverter, Rows, SortField};

use common_error::{RivuletError, RivuletResult};

use super::JoinType;
use crate::expr::{Expr, ExprEvaluator};
use crate::functions::FunctionRegistry;

/// Everything about a join that is fixed once both input schemas are known.
#[derive(Debug)]
pub(super) struct JoinLayout {
    pub join_type: JoinType,
    pub left_keys: Vec<usize>,
    pub right_keys: Vec<usize>,
    /// Type both sides of each key are cast to before encoding.
    pub key_types: Vec<DataType>,
    /// Per key: whether null matches null.
    pub null_equal: Vec<bool>,
    pub left_schema: SchemaRef,
    pub left_output: Vec<usize>,
    pub right_output: Vec<usize>,
    pub output_schema: SchemaRef,
    pub filter: Option<Expr>,
    /// All left then all right columns, nullable, collisions suffixed.
    pub filter_schema: SchemaRef,
}

impl JoinLayout {
    fn converter(&self) -> RivuletResult<RowConverter> {
        let fields = self
            .key_types
            .iter()
            .map(|t| SortField::new(t.clone()))
            .collect();
        Ok(RowConverter::new(fields)?)
    }

    /// Encode the key columns of `batch`, flagging rows that can match.
    fn encode(
        &self,
        converter: &RowConverter,
        batch: &RecordBatch,
        key_columns: &[usize],
    ) -> RivuletResult<(Rows, Vec<bool>)> {
        let mut valid = vec![true; batch.num_rows()];
        let mut keys = Vec::with_capacity(key_columns.len());
        for ((&column, key_type), &null_equal) in
            key_columns.iter().zip(&self.key_types).zip(&self.null_equal)
        {
            let array = cast(batch.column(column), key_type)?;
            if !null_equal {
                if let Some(nulls) = array.logical_nulls() {
                    for (row, ok) in valid.iter_mut().enumerate() {
                        *ok &= nulls.is_valid(row);
                    }
                }
            }
            keys.push(array);
        }
        Ok((converter.convert_columns(&keys)?, valid))
    }
}

/// Gather `indices` from `values`; null indices yield nulls.
fn take_or_null(values: &ArrayRef, indices: &UInt32Array) -> RivuletResult<ArrayRef> {
    if indices.null_count() == indices.len() {
        return Ok(new_null_array(values.data_type(), indices.len()));
    }
    Ok(take(values.as_ref(), indices, None)?)
}

/// Hash table over the whole build side.
#[derive(Debug)]
pub(super) struct JoinTable {
    layout: Arc<JoinLayout>,
    converter: RowConverter,
    build: RecordBatch,
    map: AHashMap<Box<[u8]>, Vec<u32>>,
    matched: Vec<AtomicBool>,
}

impl JoinTable {
    pub(super) fn build(layout: Arc<JoinLayout>, build: RecordBatch) -> RivuletResult<Self> {
        if u32::try_from(build.num_rows()).is_err() {
            return Err(RivuletError::resource_exhausted(format!(
                "hash join build side has {} rows",
                build.num_rows()
            )));
        }
        let converter = layout.converter()?;
        let (rows, valid) = layout.encode(&converter, &build, &layout.left_keys)?;
        let mut map: AHashMap<Box<[u8]>, Vec<u32>> = AHashMap::new();
        for (row, key) in rows.iter().enumerate() {
            if valid[row] {
                map.entry(key.as_ref().into()).or_default().push(row as u32);
            }
        }
        let matched = (0..build.num_rows()).map(|_| AtomicBool::new(false)).collect();
        Ok(Self {
            layout,
            converter,
            build,
            map,
            matched,
        })
    }

    pub(super) fn num_rows(&self) -> usize {
        self.build.num_rows()
    }

    /// Approximate bytes held.
    pub(super) fn size(&self) -> usize {
        self.build.get_array_memory_size()
            + self.converter.size()
            + self
                .map
                .iter()
                .map(|(k, v)| k.len() + v.capacity() * 4)
                .sum::<usize>()
            + self.matched.len()
    }

    /// Join one probe batch. `None` when this join type only emits at the end.
    pub(super) fn probe(
        &self,
        probe: &RecordBatch,
        functions: &FunctionRegistry,
    ) -> RivuletResult<Option<RecordBatch>> {
        let layout = &self.layout;
        let (rows, valid) = layout.encode(&self.converter, probe, &layout.right_keys)?;

        let mut build_indices = Vec::new();
        let mut probe_indices = Vec::new();
        for (row, key) in rows.iter().enumerate() {
            if !valid[row] {
                continue;
            }
            if let Some(candidates) = self.map.get(key.as_ref()) {
                for &candidate in candidates {
                    build_indices.push(candidate);
                    probe_indices.push(row as u32);
                }
            }
        }
        let mut build_indices = UInt32Array::from(build_indices);
        let mut probe_indices = UInt32Array::from(probe_indices);

        if let Some(predicate) = &layout.filter {
            let candidates = self.candidate_batch(&build_indices, &probe_indices, probe)?;
            let mask = ExprEvaluator::new(functions).evaluate_predicate(predicate, &candidates)?;
            build_indices = downcast_u32(filter(&build_indices, &mask)?)?;
            probe_indices = downcast_u32(filter(&probe_indices, &mask)?)?;
        }

        if layout.join_type.tracks_build_matches() {
            for &index in build_indices.values() {
                self.matched[index as usize].store(true, Ordering::Relaxed);
            }
        }

        let mut probe_matched = vec![false; probe.num_rows()];
        for &index in probe_indices.values() {
            probe_matched[index as usize] = true;
        }

        match layout.join_type {
            JoinType::Inner | JoinType::LeftOuter => {
                self.assemble(&build_indices, Some((probe, &probe_indices))).map(Some)
            }
            JoinType::RightOuter | JoinType::FullOuter => {
                let unmatched = probe_matched.iter().enumerate().filter(|(_, m)| !**m);
                let mut left: Vec<Option<u32>> = build_indices.iter().collect();
                let mut right: Vec<Option<u32>> = probe_indices.iter().collect();
                for (row, _) in unmatched {
                    left.push(None);
                    right.push(Some(row as u32));
                }
                let left = UInt32Array::from(left);
                let right = UInt32Array::from(right);
                self.assemble(&left, Some((probe, &right))).map(Some)
            }
            JoinType::RightSemi | JoinType::RightAnti => {
                let keep = layout.join_type == JoinType::RightSemi;
                let rows: Vec<u32> = probe_matched
                    .iter()
                    .enumerate()
                    .filter(|(_, m)| **m == keep)
                    .map(|(row, _)| row as u32)
                    .collect();
                let rows = UInt32Array::from(rows);
                self.assemble(&UInt32Array::from(Vec::<u32>::new()), Some((probe, &rows)))
                    .map(Some)
            }
            JoinType::LeftSemi | JoinType::LeftAnti => Ok(None),
        }
    }

    /// Build rows owed once the probe side is exhausted, in chunks.
    pub(super) fn drain(&self, batch_size: usize) -> RivuletResult<Vec<RecordBatch>> {
        let wanted = match self.layout.join_type {
            JoinType::LeftSemi => true,
            JoinType::LeftOuter | JoinType::FullOuter | JoinType::LeftAnti => false,
            _ => return Ok(Vec::new()),
        };
        let rows: Vec<u32> = self
            .matched
            .iter()
            .enumerate()
            .filter(|(_, m)| m.load(Ordering::Relaxed) == wanted)
            .map(|(row, _)| row as u32)
            .collect();
        rows.chunks(batch_size.max(1))
            .map(|chunk| self.assemble(&UInt32Array::from(chunk.to_vec()), None))
            .collect()
    }

    /// Left then right pairs for the residual filter.
    fn candidate_batch(
        &self,
        build_indices: &UInt32Array,
        probe_indices: &UInt32Array,
        probe: &RecordBatch,
    ) -> RivuletResult<RecordBatch> {
        let columns = self
            .build
            .columns()
            .iter()
            .map(|c| take_or_null(c, build_indices))
            .chain(probe.columns().iter().map(|c| take_or_null(c, probe_indices)))
            .collect::<RivuletResult<Vec<_>>>()?;
        let options = RecordBatchOptions::new().with_row_count(Some(build_indices.len()));
        Ok(RecordBatch::try_new_with_options(
            self.layout.filter_schema.clone(),
            columns,
            &options,
        )?)
    }

    /// Output rows from build rows and probe rows; `right` is `None` when
    /// no probe row takes part, and then right columns are all null.
    fn assemble(
        &self,
        left: &UInt32Array,
        right: Option<(&RecordBatch, &UInt32Array)>,
    ) -> RivuletResult<RecordBatch> {
        let layout = &self.layout;
        let num_rows = match (layout.left_output.is_empty(), right) {
            (true, Some((_, indices))) => indices.len(),
            _ => left.len(),
        };
        let mut columns = Vec::with_capacity(layout.output_schema.fields().len());
        for &column in &layout.left_output {
            columns.push(take_or_null(self.build.column(column), left)?);
        }
        for &column in &layout.right_output {
            let array = match right {
                Some((probe, indices)) => take_or_null(probe.column(column), indices)?,
                None => {
                    let field = layout.output_schema.field(columns.len());
                    new_null_array(field.data_type(), num_rows)
                }
            };
            columns.push(array);
        }
        let options = RecordBatchOptions::new().with_row_count(Some(num_rows));
        Ok(RecordBatch::try_new_with_options(
            layout.output_schema.clone(),
            columns,
            &options,
        )?)
    }
}

fn downcast_u32(array: ArrayRef) -> RivuletResult<UInt32Array> {
    array
        .as_any()
        .downcast_ref::<UInt32Array>()
        .cloned()
        .ok_or_else(|| RivuletError::internal("filtered join indices are not UInt32"))
}
