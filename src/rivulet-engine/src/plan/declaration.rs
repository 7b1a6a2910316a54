//! Declarative plan descriptions.

use common_error::{RivuletError, RivuletResult};

use super::{ExecNodeOptions, ExecPlan};
use crate::node::NodeId;

/// A node to build, or one already living in a plan.
///
/// Descriptions form a tree whose leaves are sources or live nodes;
/// [`Declaration::add_to_plan`] builds it bottom-up through the plan's
/// factory registry.
#[derive(Debug)]
pub enum Declaration {
    Description {
        factory: String,
        options: Box<dyn ExecNodeOptions>,
        inputs: Vec<Declaration>,
        label: Option<String>,
    },
    LiveNode(NodeId),
}

impl Declaration {
    pub fn new(factory: impl Into<String>, options: impl ExecNodeOptions) -> Self {
        Self::from_boxed(factory, Box::new(options))
    }

    /// Like [`Declaration::new`] for options that are already boxed.
    pub fn from_boxed(factory: impl Into<String>, options: Box<dyn ExecNodeOptions>) -> Self {
        Self::Description {
            factory: factory.into(),
            options,
            inputs: Vec::new(),
            label: None,
        }
    }

    pub fn live(id: NodeId) -> Self {
        Self::LiveNode(id)
    }

    /// Replace the inputs of a description. No effect on a live node.
    pub fn with_inputs(mut self, new_inputs: Vec<Declaration>) -> Self {
        if let Self::Description { inputs, .. } = &mut self {
            *inputs = new_inputs;
        }
        self
    }

    /// Label the node once built. No effect on a live node.
    pub fn with_label(mut self, new_label: impl Into<String>) -> Self {
        if let Self::Description { label, .. } = &mut self {
            *label = Some(new_label.into());
        }
        self
    }

    /// Chain declarations so each consumes the one before it.
    ///
    /// Every element after the first gains its predecessor as an extra
    /// last input.
    pub fn sequence(declarations: Vec<Declaration>) -> RivuletResult<Declaration> {
        let mut iter = declarations.into_iter();
        let Some(mut current) = iter.next() else {
            return Err(RivuletError::invalid_options(
                "cannot sequence an empty list of declarations",
            ));
        };
        for next in iter {
            match next {
                Self::Description {
                    factory,
                    options,
                    mut inputs,
                    label,
                } => {
                    inputs.push(current);
                    current = Self::Description {
                        factory,
                        options,
                        inputs,
                        label,
                    };
                }
                Self::LiveNode(id) => {
                    return Err(RivuletError::invalid_options(format!(
                        "live node {id} cannot take a sequenced input"
                    )));
                }
            }
        }
        Ok(current)
    }

    /// Build this declaration and its inputs into `plan`.
    pub fn add_to_plan(self, plan: &ExecPlan) -> RivuletResult<NodeId> {
        match self {
            Self::LiveNode(id) => {
                if plan.node(id).is_none() {
                    return Err(RivuletError::not_found(format!("node {id}")));
                }
                Ok(id)
            }
            Self::Description {
                factory,
                options,
                inputs,
                label,
            } => {
                let inputs = inputs
                    .into_iter()
                    .map(|input| input.add_to_plan(plan))
                    .collect::<RivuletResult<Vec<_>>>()?;
                let id = plan.make_node(&factory, inputs, options)?;
                if let Some(label) = label {
                    plan.set_label(id, label)?;
                }
                Ok(id)
            }
        }
    }
}
