//! Expression evaluator implementation.

use std::sync::Arc;

use arrow::array::{Array, ArrayRef, BooleanArray, new_null_array};
use arrow::compute::kernels::{boolean, cmp, numeric};
use arrow::compute::{can_cast_types, cast};
use arrow::datatypes::{DataType, Schema};
use arrow::record_batch::RecordBatch;

use common_error::{RivuletError, RivuletResult};

use super::{BinaryOp, Expr};
use crate::functions::FunctionRegistry;

/// Expression evaluator for physical execution.
///
/// Evaluates an [`Expr`] against a `RecordBatch`, producing an Arrow array
/// with one value per row. Scalar function calls are resolved in the
/// registry the evaluator was created with.
#[derive(Debug, Clone, Copy)]
pub struct ExprEvaluator<'a> {
    functions: &'a FunctionRegistry,
}

impl<'a> ExprEvaluator<'a> {
    /// Create a new expression evaluator.
    pub fn new(functions: &'a FunctionRegistry) -> Self {
        Self { functions }
    }

    /// Evaluate an expression against a record batch.
    pub fn evaluate(&self, expr: &Expr, batch: &RecordBatch) -> RivuletResult<ArrayRef> {
        match expr {
            Expr::Column(name) => batch.column_by_name(name).cloned().ok_or_else(|| {
                RivuletError::column_not_found(format!(
                    "'{}' not in batch with columns {:?}",
                    name,
                    batch
                        .schema()
                        .fields()
                        .iter()
                        .map(|f| f.name().clone())
                        .collect::<Vec<_>>()
                ))
            }),

            Expr::Literal(value) => Ok(value.to_array(batch.num_rows())),

            Expr::Binary { left, op, right } => self.eval_binary(left, *op, right, batch),

            Expr::Not(inner) => {
                let arr = self.evaluate(inner, batch)?;
                Ok(Arc::new(boolean::not(&as_boolean(&arr, "NOT")?)?))
            }

            Expr::IsNull(inner) => {
                let arr = self.evaluate(inner, batch)?;
                Ok(Arc::new(boolean::is_null(&arr)?))
            }

            Expr::IsNotNull(inner) => {
                let arr = self.evaluate(inner, batch)?;
                Ok(Arc::new(boolean::is_not_null(&arr)?))
            }

            Expr::Cast { expr, data_type } => {
                let arr = self.evaluate(expr, batch)?;
                Ok(cast(&arr, data_type)?)
            }

            Expr::Call { name, args } => {
                let function = self.functions.scalar(name)?;
                let args = args
                    .iter()
                    .map(|a| self.evaluate(a, batch))
                    .collect::<RivuletResult<Vec<_>>>()?;
                let result = function.invoke(&args, batch.num_rows())?;
                if result.len() != batch.num_rows() {
                    return Err(RivuletError::execution(format!(
                        "function '{name}' returned {} rows for a batch of {}",
                        result.len(),
                        batch.num_rows()
                    )));
                }
                Ok(result)
            }
        }
    }

    /// Evaluate a predicate expression, returning a `BooleanArray`.
    pub fn evaluate_predicate(&self, expr: &Expr, batch: &RecordBatch) -> RivuletResult<BooleanArray> {
        let result = self.evaluate(expr, batch)?;
        as_boolean(&result, "predicate")
    }

    /// Result type of an expression over a schema.
    pub fn data_type(&self, expr: &Expr, schema: &Schema) -> RivuletResult<DataType> {
        match expr {
            Expr::Column(name) => schema
                .field_with_name(name)
                .map(|f| f.data_type().clone())
                .map_err(|_| RivuletError::column_not_found(name.clone())),

            Expr::Literal(value) => Ok(value.data_type()),

            Expr::Binary { left, op, right } => {
                let lt = self.data_type(left, schema)?;
                let rt = self.data_type(right, schema)?;
                match op {
                    BinaryOp::And | BinaryOp::Or => {
                        for t in [&lt, &rt] {
                            if !matches!(t, DataType::Boolean | DataType::Null) {
                                return Err(RivuletError::type_error(format!(
                                    "{expr} requires boolean operands, got {t}"
                                )));
                            }
                        }
                        Ok(DataType::Boolean)
                    }
                    op => {
                        let common = common_type(&lt, &rt).ok_or_else(|| {
                            RivuletError::type_error(format!(
                                "cannot apply {op:?} to {lt} and {rt}"
                            ))
                        })?;
                        if op.is_predicate() {
                            Ok(DataType::Boolean)
                        } else if common.is_numeric() || common == DataType::Null {
                            Ok(common)
                        } else {
                            Err(RivuletError::type_error(format!(
                                "arithmetic {op:?} requires numeric operands, got {common}"
                            )))
                        }
                    }
                }
            }

            Expr::Not(inner) => match self.data_type(inner, schema)? {
                DataType::Boolean | DataType::Null => Ok(DataType::Boolean),
                other => Err(RivuletError::type_error(format!(
                    "NOT requires a boolean operand, got {other}"
                ))),
            },

            Expr::IsNull(inner) | Expr::IsNotNull(inner) => {
                self.data_type(inner, schema)?;
                Ok(DataType::Boolean)
            }

            Expr::Cast { expr, data_type } => {
                let from = self.data_type(expr, schema)?;
                if !can_cast_types(&from, data_type) {
                    return Err(RivuletError::type_error(format!(
                        "cannot cast {from} to {data_type}"
                    )));
                }
                Ok(data_type.clone())
            }

            Expr::Call { name, args } => {
                let arg_types = args
                    .iter()
                    .map(|a| self.data_type(a, schema))
                    .collect::<RivuletResult<Vec<_>>>()?;
                self.functions.scalar(name)?.return_type(&arg_types)
            }
        }
    }

    /// Whether the expression can produce nulls over a schema.
    pub fn nullable(&self, expr: &Expr, schema: &Schema) -> RivuletResult<bool> {
        match expr {
            Expr::Column(name) => schema
                .field_with_name(name)
                .map(|f| f.is_nullable())
                .map_err(|_| RivuletError::column_not_found(name.clone())),
            Expr::Literal(value) => Ok(value.is_null()),
            Expr::IsNull(_) | Expr::IsNotNull(_) => Ok(false),
            _ => Ok(true),
        }
    }

    fn eval_binary(
        &self,
        left: &Expr,
        op: BinaryOp,
        right: &Expr,
        batch: &RecordBatch,
    ) -> RivuletResult<ArrayRef> {
        let left_arr = self.evaluate(left, batch)?;
        let right_arr = self.evaluate(right, batch)?;

        match op {
            BinaryOp::And => {
                let l = as_boolean(&left_arr, "AND")?;
                let r = as_boolean(&right_arr, "AND")?;
                Ok(Arc::new(boolean::and_kleene(&l, &r)?))
            }
            BinaryOp::Or => {
                let l = as_boolean(&left_arr, "OR")?;
                let r = as_boolean(&right_arr, "OR")?;
                Ok(Arc::new(boolean::or_kleene(&l, &r)?))
            }
            op => {
                let (l, r) = coerce_pair(left_arr, right_arr)?;
                if l.data_type() == &DataType::Null {
                    // null op null is null
                    let result_type = if op.is_predicate() {
                        DataType::Boolean
                    } else {
                        DataType::Null
                    };
                    return Ok(new_null_array(&result_type, l.len()));
                }
                let result: ArrayRef = match op {
                    BinaryOp::Add => numeric::add(&l, &r)?,
                    BinaryOp::Subtract => numeric::sub(&l, &r)?,
                    BinaryOp::Multiply => numeric::mul(&l, &r)?,
                    BinaryOp::Divide => numeric::div(&l, &r)?,
                    BinaryOp::Modulo => numeric::rem(&l, &r)?,
                    BinaryOp::Eq => Arc::new(cmp::eq(&l, &r)?),
                    BinaryOp::NotEq => Arc::new(cmp::neq(&l, &r)?),
                    BinaryOp::Lt => Arc::new(cmp::lt(&l, &r)?),
                    BinaryOp::LtEq => Arc::new(cmp::lt_eq(&l, &r)?),
                    BinaryOp::Gt => Arc::new(cmp::gt(&l, &r)?),
                    BinaryOp::GtEq => Arc::new(cmp::gt_eq(&l, &r)?),
                    BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
                };
                Ok(result)
            }
        }
    }
}

/// Common type two operands are coerced to before a kernel runs.
pub fn common_type(left: &DataType, right: &DataType) -> Option<DataType> {
    if left == right {
        return Some(left.clone());
    }
    match (left, right) {
        (DataType::Null, other) | (other, DataType::Null) => Some(other.clone()),
        (l, r) if l.is_numeric() && r.is_numeric() => {
            if l.is_floating() || r.is_floating() {
                Some(DataType::Float64)
            } else {
                Some(DataType::Int64)
            }
        }
        (DataType::Utf8 | DataType::LargeUtf8, DataType::Utf8 | DataType::LargeUtf8) => {
            Some(DataType::LargeUtf8)
        }
        _ => None,
    }
}

fn coerce_pair(left: ArrayRef, right: ArrayRef) -> RivuletResult<(ArrayRef, ArrayRef)> {
    if left.data_type() == right.data_type() {
        return Ok((left, right));
    }
    let target = common_type(left.data_type(), right.data_type()).ok_or_else(|| {
        RivuletError::type_error(format!(
            "incompatible operand types {} and {}",
            left.data_type(),
            right.data_type()
        ))
    })?;
    let cast_to = |arr: ArrayRef| -> RivuletResult<ArrayRef> {
        if arr.data_type() == &target {
            Ok(arr)
        } else {
            Ok(cast(&arr, &target)?)
        }
    };
    Ok((cast_to(left)?, cast_to(right)?))
}

fn as_boolean(arr: &ArrayRef, context: &str) -> RivuletResult<BooleanArray> {
    match arr.data_type() {
        DataType::Boolean => Ok(arr
            .as_any()
            .downcast_ref::<BooleanArray>()
            .cloned()
            .ok_or_else(|| RivuletError::internal("boolean array downcast failed"))?),
        DataType::Null => Ok(BooleanArray::new_null(arr.len())),
        other => Err(RivuletError::type_error(format!(
            "{context} must evaluate to boolean, got {other}"
        ))),
    }
}
