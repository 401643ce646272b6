//! Bounded thread-pool runner

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use super::{dependency_meta, TaskRunner};
use crate::error::TaskmeshError;
use crate::meta::Meta;
use crate::task::DepValues;
use crate::task_graph::TaskNode;

/// Default worker count per level.
const MAX_WORKERS: usize = 5;

/// Evaluates sibling dependencies on scoped worker threads, at most
/// `max_workers` at a time, joining each batch before the next. The bound
/// re-applies at every level of the graph; parallelism is per level, not
/// global.
#[derive(Debug, Clone, Copy)]
pub struct ThreadedRunner {
    max_workers: usize,
}

impl Default for ThreadedRunner {
    fn default() -> Self {
        Self {
            max_workers: MAX_WORKERS,
        }
    }
}

impl ThreadedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }
}

impl TaskRunner for ThreadedRunner {
    fn run(&self, meta: &Meta, node: &Arc<TaskNode>) -> Result<Value, TaskmeshError> {
        let mut deps = DepValues::new();
        for batch in node.dependencies().chunks(self.max_workers) {
            debug!(task = node.task().name(), batch = batch.len(), "dispatching sibling batch");
            let results = std::thread::scope(|scope| {
                let handles: Vec<_> = batch
                    .iter()
                    .map(|child| {
                        let child_meta = dependency_meta(meta, child.task().name());
                        scope.spawn(move || {
                            (
                                child.task().name().to_string(),
                                self.run(&child_meta, child),
                            )
                        })
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|handle| {
                        handle.join().map_err(|_| TaskmeshError::Invocation {
                            task: node.task().name().to_string(),
                            details: "dependency evaluation panicked".into(),
                        })
                    })
                    .collect::<Vec<_>>()
            });
            for joined in results {
                let (name, value) = joined?;
                deps.insert(name, value?);
            }
        }
        let invocation_meta = node.task().invocation_meta(meta);
        node.task().transform(&invocation_meta, &deps)
    }
}
