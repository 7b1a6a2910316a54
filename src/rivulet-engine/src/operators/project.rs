//! Projection node.

use std::sync::Arc;

use arrow::datatypes::{Field, Schema, SchemaRef};

use common_error::{RivuletError, RivuletResult};

use super::map::{MapFunction, MapNode};
use crate::batch::{Datum, ExecBatch};
use crate::expr::{Expr, ExprEvaluator};
use crate::node::{NodeCore, NodeId, NodeSpec, validate_input_count};
use crate::plan::{ExecNodeOptions, ExecPlan, downcast_options};

/// Options for the `project` factory.
///
/// Output columns are named by `names` when given, otherwise by each
/// expression's display form.
#[derive(Debug, Clone)]
pub struct ProjectNodeOptions {
    pub expressions: Vec<Expr>,
    pub names: Option<Vec<String>>,
}

impl ProjectNodeOptions {
    pub fn new(expressions: Vec<Expr>) -> Self {
        Self {
            expressions,
            names: None,
        }
    }

    pub fn with_names(mut self, names: Vec<String>) -> Self {
        self.names = Some(names);
        self
    }

    fn output_names(&self) -> RivuletResult<Vec<String>> {
        match &self.names {
            Some(names) if names.len() != self.expressions.len() => {
                Err(RivuletError::invalid_options(format!(
                    "project has {} expressions but {} names",
                    self.expressions.len(),
                    names.len()
                )))
            }
            Some(names) => Ok(names.clone()),
            None => Ok(self.expressions.iter().map(ToString::to_string).collect()),
        }
    }
}

#[derive(Debug)]
struct Project {
    expressions: Vec<Expr>,
    input_schema: SchemaRef,
}

impl MapFunction for Project {
    fn map(&self, core: &NodeCore, batch: ExecBatch) -> RivuletResult<ExecBatch> {
        let length = batch.num_rows();
        let record_batch = batch.to_record_batch(self.input_schema.clone())?;
        let evaluator = ExprEvaluator::new(core.ctx().functions());
        let values = self
            .expressions
            .iter()
            .map(|expr| match expr {
                Expr::Literal(value) => Ok(Datum::Scalar(value.clone())),
                expr => evaluator.evaluate(expr, &record_batch).map(Datum::Array),
            })
            .collect::<RivuletResult<Vec<_>>>()?;
        ExecBatch::try_new(values, length)
    }

    fn describe(&self) -> String {
        let exprs: Vec<String> = self.expressions.iter().map(ToString::to_string).collect();
        exprs.join(", ")
    }
}

/// Factory for `project`.
pub fn make(
    plan: &ExecPlan,
    inputs: Vec<NodeId>,
    options: Box<dyn ExecNodeOptions>,
) -> RivuletResult<NodeId> {
    validate_input_count("project", &inputs, 1)?;
    let options = downcast_options::<ProjectNodeOptions>(options, "project")?;
    let input_schema = plan.output_schema(inputs[0])?;
    let names = options.output_names()?;

    let evaluator = ExprEvaluator::new(plan.context().functions());
    let fields = options
        .expressions
        .iter()
        .zip(names)
        .map(|(expr, name)| {
            let data_type = evaluator.data_type(expr, &input_schema)?;
            let nullable = evaluator.nullable(expr, &input_schema)?;
            Ok(Field::new(name, data_type, nullable))
        })
        .collect::<RivuletResult<Vec<_>>>()?;
    let schema = Arc::new(Schema::new(fields));

    let spec = NodeSpec::new("project", inputs, schema);
    plan.add_node(spec, |core| {
        Ok(MapNode::new(
            core,
            Project {
                expressions: options.expressions,
                input_schema,
            },
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{col, lit};

    #[test]
    fn test_output_names() {
        let options = ProjectNodeOptions::new(vec![col("a"), col("a").add(lit(1i64))]);
        assert_eq!(options.output_names().unwrap(), vec!["a", "(a + 1)"]);

        let options = options.with_names(vec!["only_one".into()]);
        assert!(options.output_names().is_err());
    }
}
