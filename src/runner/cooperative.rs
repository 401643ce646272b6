//! Single-threaded cooperative runner

use std::sync::Arc;

use futures::future::{self, BoxFuture, FutureExt};
use serde_json::Value;
use tracing::debug;

use super::{dependency_meta, TaskRunner};
use crate::error::TaskmeshError;
use crate::meta::Meta;
use crate::task::DepValues;
use crate::task_graph::TaskNode;

/// Runs sibling dependencies as concurrent tasks on a current-thread event
/// loop. The sibling group joins all-or-nothing: the first failure aborts
/// the remaining joins and surfaces to the caller. Suspension happens only
/// at the group join, never inside a transform, so a running transform is
/// never preempted.
#[derive(Debug, Default, Clone, Copy)]
pub struct CooperativeRunner;

impl CooperativeRunner {
    pub fn new() -> Self {
        Self
    }

    fn run_node<'a>(
        &'a self,
        meta: &'a Meta,
        node: &'a Arc<TaskNode>,
    ) -> BoxFuture<'a, Result<Value, TaskmeshError>> {
        async move {
            let group = node.dependencies().iter().map(|child| async move {
                let child_meta = dependency_meta(meta, child.task().name());
                let value = self.run_node(&child_meta, child).await?;
                Ok::<(String, Value), TaskmeshError>((child.task().name().to_string(), value))
            });

            let joined = future::try_join_all(group).await?;

            let deps: DepValues = joined.into_iter().collect();
            debug!(task = node.task().name(), deps = deps.len(), "group joined");
            let invocation_meta = node.task().invocation_meta(meta);
            node.task().transform(&invocation_meta, &deps)
        }
        .boxed()
    }
}

impl TaskRunner for CooperativeRunner {
    fn run(&self, meta: &Meta, node: &Arc<TaskNode>) -> Result<Value, TaskmeshError> {
        let runtime = tokio::runtime::Builder::new_current_thread().build()?;
        runtime.block_on(self.run_node(meta, node))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;
    use crate::task_graph::TaskNode;
    use crate::workspace::{demo_workspace, WorkspaceBuilder};
    use serde_json::json;

    #[test]
    fn matches_sequential_result() {
        let ws = demo_workspace();
        let total = ws.find_task("reduce_map_numbers").unwrap().unwrap();
        let node = TaskNode::resolve(total, ws);
        let value = CooperativeRunner::new().run(&Meta::new(), &node).unwrap();
        assert_eq!(value, json!(55));
    }

    #[test]
    fn group_fails_as_a_whole() {
        let ws = WorkspaceBuilder::new("w")
            .task(Task::data("ok", |_| Ok(json!(1))))
            .task(Task::data("bad", |_| {
                Err(TaskmeshError::Invocation {
                    task: "bad".into(),
                    details: "boom".into(),
                })
            }))
            .task(Task::function(
                "join",
                vec!["ok".to_string(), "bad".to_string()],
                |_m, _d| Ok(json!(0)),
            ))
            .build();
        let join = ws.find_task("join").unwrap().unwrap();
        let node = TaskNode::resolve(join, ws);
        let err = CooperativeRunner::new()
            .run(&Meta::new(), &node)
            .unwrap_err();
        assert!(matches!(err, TaskmeshError::Invocation { .. }));
    }
}
