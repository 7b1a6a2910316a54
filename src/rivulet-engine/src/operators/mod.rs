//! Builtin nodes.
//!
//! Each module exposes an options struct and a `make` factory with the
//! [`ExecFactory`](crate::plan::ExecFactory) signature, registered under
//! the names listed in [`ExecFactoryRegistry::register_defaults`].
//!
//! | Factory          | Inputs | Kind                    |
//! |------------------|--------|-------------------------|
//! | `source`         | 0      | async stream of batches |
//! | `table_source`   | 0      | in-memory batches       |
//! | `filter`         | 1      | map                     |
//! | `project`        | 1      | map                     |
//! | `aggregate`      | 1      | pipeline breaker        |
//! | `hashjoin`       | 2      | pipeline breaker        |
//! | `sink`           | 1      | pull sink               |
//! | `consuming_sink` | 1      | push sink               |
//! | `order_by_sink`  | 1      | sorting sink            |
//! | `select_k_sink`  | 1      | top-k sink              |
//!
//! [`ExecFactoryRegistry::register_defaults`]: crate::plan::ExecFactoryRegistry::register_defaults

pub mod aggregate;
mod chunked;
pub mod consuming_sink;
pub mod filter;
pub mod hash_join;
mod map;
pub mod order_by;
pub mod project;
pub mod select_k;
pub mod sink;
mod sort;
pub mod source;

pub use aggregate::{Aggregate, AggregateNodeOptions};
pub use consuming_sink::{ConsumingSinkNodeOptions, SinkConsumer};
pub use filter::FilterNodeOptions;
pub use hash_join::{HashJoinNodeOptions, JoinKeyCmp, JoinType};
pub use order_by::OrderByNodeOptions;
pub use project::ProjectNodeOptions;
pub use select_k::SelectKNodeOptions;
pub use sink::{SinkNodeOptions, SinkReader};
pub use sort::{NullPlacement, SortKey, SortOrder};
pub use source::{SourceNodeOptions, TableSourceNodeOptions};
