//! Push-based streaming execution engine for Rivulet.
//!
//! This crate runs DAGs of relational operators over Arrow record batches.
//! Producers push batches into their consumer; consumers push pause, resume
//! and stop signals back to their producers. Work is scheduled as small
//! tasks on a shared Tokio runtime.

#![allow(clippy::missing_const_for_fn)] // Builder patterns often can't be const
#![allow(clippy::return_self_not_must_use)] // Builder patterns don't always need must_use
#![allow(clippy::doc_markdown)] // Documentation backticks are sometimes unnecessary
#![allow(clippy::redundant_closure_for_method_calls)] // Closures are sometimes clearer
#![allow(
    clippy::cast_possible_wrap,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss,
    clippy::cast_possible_truncation
)] // Some casts are intentional
#![allow(clippy::significant_drop_in_scrutinee)] // Some temporaries are needed
#![allow(clippy::significant_drop_tightening)] // Some temporaries with Drop must stay alive
#![allow(clippy::needless_pass_by_value)] // Node callbacks take owned batches
#![allow(clippy::option_if_let_else)] // if let/else is sometimes clearer than map_or
#![allow(clippy::format_push_string)] // Some format! + push_str patterns are clearer
#![allow(clippy::match_same_arms)] // Some match arms intentionally have same body
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐     ┌──────────────┐     ┌────────────────┐
//! │ Declaration │ ──▶ │   ExecPlan   │ ──▶ │ LocalExecutor  │
//! │ (tree)      │     │ (node arena) │     │ (sink reader)  │
//! └─────────────┘     └──────────────┘     └────────────────┘
//!                            │                      │
//!                            ▼                      ▼
//!                      ExecNode tasks        Arrow RecordBatch
//! ```
//!
//! # Key Components
//!
//! ## Node protocol ([`node`])
//!
//! - [`ExecNode`]: callbacks for data (`input_received`, `input_finished`)
//!   and control (`pause_producing`, `resume_producing`, `stop_producing`)
//! - [`NodeCore`]: identity, wiring, task tracking and completion
//!
//! ## Plans ([`plan`])
//!
//! - [`ExecPlan`]: owns the nodes, starts and stops them, exposes `finished`
//! - [`ExecFactoryRegistry`]: named node factories
//! - [`Declaration`]: a deferred tree of factory calls
//!
//! ## Flow control ([`backpressure`])
//!
//! - [`BackpressureController`]: watermark hysteresis over buffered data
//! - [`PauseSet`]: per-requester pause tracking that rejects stale signals
//!
//! ## Operators ([`operators`])
//!
//! | Factory | Blocking | Description |
//! |---------|----------|-------------|
//! | `source` | No | Pull batches from an async stream |
//! | `table_source` | No | Slice an in-memory table |
//! | `filter` | No | Keep rows matching a predicate |
//! | `project` | No | Compute expressions per batch |
//! | `aggregate` | **Yes** | Grouped and scalar aggregation |
//! | `hashjoin` | **Yes** (build side) | Hash join of two inputs |
//! | `sink` | No | Hand batches to a [`SinkReader`] |
//! | `consuming_sink` | No | Push batches into a [`SinkConsumer`] |
//! | `order_by_sink` | **Yes** | Full sort |
//! | `select_k_sink` | **Yes** | Top k rows |
//!
//! # Example
//!
//! ```rust,ignore
//! use rivulet_engine::expr::{col, lit};
//! use rivulet_engine::operators::{FilterNodeOptions, TableSourceNodeOptions};
//! use rivulet_engine::{Declaration, LocalExecutor};
//!
//! let plan = Declaration::sequence(vec![
//!     Declaration::new("table_source", TableSourceNodeOptions::new(schema, batches)),
//!     Declaration::new("filter", FilterNodeOptions::new(col("age").gt(lit(18i64)))),
//! ])?;
//! let result = LocalExecutor::new().execute(plan).await?;
//! println!("{} rows", result.total_rows());
//! ```
//!
//! [`ExecNode`]: node::ExecNode
//! [`NodeCore`]: node::NodeCore
//! [`ExecPlan`]: plan::ExecPlan
//! [`ExecFactoryRegistry`]: plan::ExecFactoryRegistry
//! [`Declaration`]: plan::Declaration
//! [`BackpressureController`]: backpressure::BackpressureController
//! [`PauseSet`]: backpressure::PauseSet
//! [`SinkReader`]: operators::SinkReader
//! [`SinkConsumer`]: operators::SinkConsumer

pub mod backpressure;
pub mod batch;
pub mod executor;
pub mod expr;
pub mod functions;
pub mod memory;
pub mod metrics;
pub mod node;
pub mod operators;
pub mod plan;

// Re-export commonly used types
pub use backpressure::{
    BackpressureControl, BackpressureController, BackpressureOptions, BackpressureTarget,
    PauseSet,
};
pub use batch::{Datum, ExecBatch};
pub use executor::{
    CancellationHandle, Completion, ExecContext, ExecutionResult, LocalExecutor, TaskScheduler,
    TokioScheduler,
};
pub use functions::FunctionRegistry;
pub use memory::{MemoryManager, MemoryReservation, NoopMemoryManager, TrackingMemoryManager};
pub use metrics::{ExecutionTimer, MetricsSink, NodeMetrics};
pub use node::{ExecNode, NodeCaps, NodeCore, NodeId, NodeSpec, NodeState};
pub use plan::{Declaration, ExecFactoryRegistry, ExecNodeOptions, ExecPlan};
