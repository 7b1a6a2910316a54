//! Filter node.

use arrow::compute::filter_record_batch;
use arrow::datatypes::{DataType, SchemaRef};

use common_error::{RivuletError, RivuletResult};

use super::map::{MapFunction, MapNode};
use crate::batch::ExecBatch;
use crate::expr::{Expr, ExprEvaluator};
use crate::node::{NodeCore, NodeId, NodeSpec, validate_input_count};
use crate::plan::{ExecNodeOptions, ExecPlan, downcast_options};

/// Options for the `filter` factory.
#[derive(Debug, Clone)]
pub struct FilterNodeOptions {
    pub predicate: Expr,
}

impl FilterNodeOptions {
    pub fn new(predicate: Expr) -> Self {
        Self { predicate }
    }
}

#[derive(Debug)]
struct Filter {
    predicate: Expr,
    schema: SchemaRef,
}

impl MapFunction for Filter {
    fn map(&self, core: &NodeCore, batch: ExecBatch) -> RivuletResult<ExecBatch> {
        // already known to hold for every row
        if batch
            .guarantee
            .as_ref()
            .is_some_and(|g| g.implies(&self.predicate))
        {
            return Ok(batch);
        }
        let record_batch = batch.to_record_batch(self.schema.clone())?;
        let mask = ExprEvaluator::new(core.ctx().functions())
            .evaluate_predicate(&self.predicate, &record_batch)?;
        let filtered = filter_record_batch(&record_batch, &mask)?;
        let guarantee = match batch.guarantee {
            Some(existing) => existing.and(self.predicate.clone()),
            None => self.predicate.clone(),
        };
        Ok(ExecBatch::from_record_batch(&filtered).with_guarantee(guarantee))
    }

    fn describe(&self) -> String {
        self.predicate.to_string()
    }
}

/// Factory for `filter`.
pub fn make(
    plan: &ExecPlan,
    inputs: Vec<NodeId>,
    options: Box<dyn ExecNodeOptions>,
) -> RivuletResult<NodeId> {
    validate_input_count("filter", &inputs, 1)?;
    let options = downcast_options::<FilterNodeOptions>(options, "filter")?;
    let schema = plan.output_schema(inputs[0])?;

    let evaluator = ExprEvaluator::new(plan.context().functions());
    let predicate_type = evaluator.data_type(&options.predicate, &schema)?;
    if predicate_type != DataType::Boolean {
        return Err(RivuletError::type_error(format!(
            "filter predicate {} has type {predicate_type}, expected Boolean",
            options.predicate
        )));
    }

    let spec = NodeSpec::new("filter", inputs, schema.clone());
    plan.add_node(spec, |core| {
        Ok(MapNode::new(
            core,
            Filter {
                predicate: options.predicate,
                schema,
            },
        ))
    })
}
