//! Name-keyed registry of node factories.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use common_error::{RivuletError, RivuletResult};

use super::ExecPlan;
use crate::node::NodeId;
use crate::operators;

/// Options consumed by a node factory.
///
/// Any `Send + Debug + 'static` type qualifies; factories recover their
/// concrete type with [`downcast_options`].
pub trait ExecNodeOptions: Any + Send + fmt::Debug {
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

impl<T: Any + Send + fmt::Debug> ExecNodeOptions for T {
    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

/// Recover the concrete options a factory expects.
pub fn downcast_options<T: ExecNodeOptions>(
    options: Box<dyn ExecNodeOptions>,
    factory: &str,
) -> RivuletResult<T> {
    let received = format!("{options:?}");
    options.into_any().downcast::<T>().map(|o| *o).map_err(|_| {
        RivuletError::invalid_options(format!(
            "factory '{factory}' expects {}, got {}",
            std::any::type_name::<T>(),
            common_display::truncate_string(&received, 80)
        ))
    })
}

/// Builds a node in `plan` from its inputs and options.
pub type ExecFactory = Arc<
    dyn Fn(&ExecPlan, Vec<NodeId>, Box<dyn ExecNodeOptions>) -> RivuletResult<NodeId> + Send + Sync,
>;

/// Factories by name.
#[derive(Default)]
pub struct ExecFactoryRegistry {
    factories: RwLock<HashMap<String, ExecFactory>>,
}

impl fmt::Debug for ExecFactoryRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecFactoryRegistry")
            .field("factories", &self.names())
            .finish()
    }
}

impl ExecFactoryRegistry {
    /// Registry with no factories.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every builtin node registered.
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register_defaults();
        registry
    }

    /// Register a factory. Names are unique.
    pub fn register<F>(&self, name: impl Into<String>, factory: F) -> RivuletResult<()>
    where
        F: Fn(&ExecPlan, Vec<NodeId>, Box<dyn ExecNodeOptions>) -> RivuletResult<NodeId>
            + Send
            + Sync
            + 'static,
    {
        let name = name.into();
        let mut factories = self.factories.write();
        if factories.contains_key(&name) {
            return Err(RivuletError::already_exists(format!("factory '{name}'")));
        }
        factories.insert(name, Arc::new(factory));
        Ok(())
    }

    /// Register the builtin nodes under their default names.
    ///
    /// Names already taken are left alone, so calling this twice is harmless.
    pub fn register_defaults(&self) {
        let defaults: [(&str, ExecFactory); 10] = [
            ("source", Arc::new(operators::source::make)),
            ("table_source", Arc::new(operators::source::make_table)),
            ("filter", Arc::new(operators::filter::make)),
            ("project", Arc::new(operators::project::make)),
            ("aggregate", Arc::new(operators::aggregate::make)),
            ("hashjoin", Arc::new(operators::hash_join::make)),
            ("sink", Arc::new(operators::sink::make)),
            ("consuming_sink", Arc::new(operators::consuming_sink::make)),
            ("order_by_sink", Arc::new(operators::order_by::make)),
            ("select_k_sink", Arc::new(operators::select_k::make)),
        ];
        let mut factories = self.factories.write();
        for (name, factory) in defaults {
            factories.entry(name.to_string()).or_insert(factory);
        }
    }

    pub fn get(&self, name: &str) -> RivuletResult<ExecFactory> {
        self.factories
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| RivuletError::not_found(format!("factory '{name}'")))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.read().contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.read().keys().cloned().collect();
        names.sort();
        names
    }
}
