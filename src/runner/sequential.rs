//! Depth-first single-threaded runner

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use super::{dependency_meta, TaskRunner};
use crate::error::TaskmeshError;
use crate::meta::Meta;
use crate::task::DepValues;
use crate::task_graph::TaskNode;

/// The reference strategy: siblings never overlap, evaluation order is
/// declaration order.
#[derive(Debug, Default, Clone, Copy)]
pub struct SequentialRunner;

impl TaskRunner for SequentialRunner {
    fn run(&self, meta: &Meta, node: &Arc<TaskNode>) -> Result<Value, TaskmeshError> {
        let mut deps = DepValues::new();
        for child in node.dependencies() {
            let child_meta = dependency_meta(meta, child.task().name());
            let value = self.run(&child_meta, child)?;
            deps.insert(child.task().name().to_string(), value);
        }
        debug!(task = node.task().name(), deps = deps.len(), "invoking transform");
        let invocation_meta = node.task().invocation_meta(meta);
        node.task().transform(&invocation_meta, &deps)
    }
}
