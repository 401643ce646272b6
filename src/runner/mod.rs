//! Task runners - interchangeable execution strategies
//!
//! All four runners implement one contract: recursively compute every child
//! dependency's value, build a name→value mapping, then invoke the parent
//! task's `transform` with it. A parent never runs before all of its
//! children's values are available; sibling ordering is otherwise
//! unconstrained.
//!
//! - [`SequentialRunner`]: depth-first, single thread.
//! - [`ThreadedRunner`]: siblings on a bounded thread pool, per level.
//! - [`CooperativeRunner`]: single-threaded event loop, fail-fast joins.
//! - [`ProcessRunner`]: sibling subtrees in worker processes.

mod cooperative;
mod process;
mod sequential;
mod threaded;

pub use cooperative::CooperativeRunner;
pub use process::ProcessRunner;
pub use sequential::SequentialRunner;
pub use threaded::ThreadedRunner;

use serde_json::Value;

use crate::error::TaskmeshError;
use crate::meta::Meta;
use crate::task_graph::TaskNode;
use std::sync::Arc;

/// Execution strategy over a resolved task graph.
pub trait TaskRunner: Send + Sync {
    /// Compute the node's value, evaluating its dependency subtree first.
    /// Any dependency failure propagates synchronously to the caller.
    fn run(&self, meta: &Meta, node: &Arc<TaskNode>) -> Result<Value, TaskmeshError>;
}

/// The metadata slice a dependency is invoked with: the field of the
/// parent's meta named after the dependency, or an empty meta.
pub(crate) fn dependency_meta(meta: &Meta, name: &str) -> Meta {
    meta.get(name)
        .cloned()
        .and_then(Meta::from_value)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dependency_meta_slices_by_name() {
        let meta = Meta::from_value(json!({"a": {"x": 1}, "b": 2})).unwrap();
        assert_eq!(dependency_meta(&meta, "a").get("x"), Some(&json!(1)));
        // Non-object and missing slices default to empty.
        assert!(dependency_meta(&meta, "b").is_empty());
        assert!(dependency_meta(&meta, "c").is_empty());
    }
}
