//! Task graph resolution (Arc-shared nodes)
//!
//! A [`TaskNode`] binds one task to one workspace and resolves the task's
//! dependency closure eagerly: found dependencies become child nodes,
//! missing ones are recorded as unresolved markers. A [`TaskTree`] is an
//! optional cache over resolved nodes keyed by (task identity, workspace
//! identity) so shared subgraphs resolve once.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::{json, Value};
use tracing::debug;

use crate::task::Task;
use crate::workspace::{TaskPath, Workspace};

/// One dependency that failed to resolve, reported from an explicit
/// depth-first walk: the path that did not resolve, the task that declared
/// it, and the depth below the walk's root at which it was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnresolvedDependency {
    pub path: String,
    pub required_by: String,
    pub depth: usize,
}

impl UnresolvedDependency {
    pub fn to_value(&self) -> Value {
        json!({
            "path": self.path,
            "required_by": self.required_by,
            "depth": self.depth,
        })
    }
}

/// A task bound to a workspace with its dependency closure resolved.
#[derive(Debug)]
pub struct TaskNode {
    task: Arc<Task>,
    workspace: Arc<Workspace>,
    /// Identifier this node was resolved under, relative to the workspace.
    /// The root node uses the task's own name (leaf names cascade).
    path: String,
    dependencies: Vec<Arc<TaskNode>>,
    /// Direct unresolved markers of this node only; subtree queries walk.
    direct_unresolved: Vec<(String, String)>,
}

impl TaskNode {
    /// Resolve `task` and its whole dependency closure against `workspace`.
    ///
    /// Resolution never fails: syntactically invalid paths, missing tasks
    /// and dependency cycles all end up as unresolved markers instead.
    pub fn resolve(task: Arc<Task>, workspace: Arc<Workspace>) -> Arc<TaskNode> {
        let path = task.name().to_string();
        let mut stack = Vec::new();
        Self::resolve_inner(path, task, workspace, &mut stack)
    }

    fn resolve_inner(
        path: String,
        task: Arc<Task>,
        workspace: Arc<Workspace>,
        stack: &mut Vec<*const Task>,
    ) -> Arc<TaskNode> {
        stack.push(Arc::as_ptr(&task));

        let mut dependencies = Vec::new();
        let mut direct_unresolved = Vec::new();
        for dep_path in task.dependencies() {
            let found = match TaskPath::parse(dep_path) {
                Ok(parsed) => workspace.resolve(&parsed),
                Err(_) => None,
            };
            match found {
                Some(dep_task) if stack.contains(&Arc::as_ptr(&dep_task)) => {
                    debug!(task = task.name(), dependency = %dep_path, "dependency cycle");
                    direct_unresolved.push((dep_path.clone(), task.name().to_string()));
                }
                Some(dep_task) => {
                    dependencies.push(Self::resolve_inner(
                        dep_path.clone(),
                        dep_task,
                        Arc::clone(&workspace),
                        stack,
                    ));
                }
                None => {
                    direct_unresolved.push((dep_path.clone(), task.name().to_string()));
                }
            }
        }

        stack.pop();
        Arc::new(TaskNode {
            task,
            workspace,
            path,
            dependencies,
            direct_unresolved,
        })
    }

    pub fn task(&self) -> &Arc<Task> {
        &self.task
    }

    pub fn workspace(&self) -> &Arc<Workspace> {
        &self.workspace
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn dependencies(&self) -> &[Arc<TaskNode>] {
        &self.dependencies
    }

    pub fn is_leaf(&self) -> bool {
        self.dependencies.is_empty()
    }

    /// True iff any unresolved marker exists anywhere in the subtree.
    pub fn has_dependency_errors(&self) -> bool {
        !self.direct_unresolved.is_empty()
            || self.dependencies.iter().any(|d| d.has_dependency_errors())
    }

    /// Depth-first walk collecting every unresolved dependency in the
    /// subtree with the depth it was found at.
    pub fn unresolved_dependencies(&self) -> Vec<UnresolvedDependency> {
        let mut out = Vec::new();
        self.collect_unresolved(0, &mut out);
        out
    }

    fn collect_unresolved(&self, depth: usize, out: &mut Vec<UnresolvedDependency>) {
        for (path, required_by) in &self.direct_unresolved {
            out.push(UnresolvedDependency {
                path: path.clone(),
                required_by: required_by.clone(),
                depth,
            });
        }
        for dep in &self.dependencies {
            dep.collect_unresolved(depth + 1, out);
        }
    }
}

/// Cache key: raw pointer identities of the task and workspace Arcs.
type NodeKey = (usize, usize);

fn node_key(task: &Arc<Task>, workspace: &Arc<Workspace>) -> NodeKey {
    (
        Arc::as_ptr(task) as usize,
        Arc::as_ptr(workspace) as usize,
    )
}

/// Cache of resolved nodes. Resolving the same (task, workspace) pair twice
/// returns the same `Arc<TaskNode>`.
#[derive(Default)]
pub struct TaskTree {
    nodes: DashMap<NodeKey, Arc<TaskNode>>,
}

impl TaskTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve a cached node or build (and cache) a fresh one. Children of a
    /// freshly built node are cached too, so shared subgraphs are not
    /// re-resolved.
    pub fn resolve_node(&self, task: &Arc<Task>, workspace: &Arc<Workspace>) -> Arc<TaskNode> {
        if let Some(node) = self.nodes.get(&node_key(task, workspace)) {
            return Arc::clone(&node);
        }
        let node = TaskNode::resolve(Arc::clone(task), Arc::clone(workspace));
        self.cache_subtree(&node);
        node
    }

    fn cache_subtree(&self, node: &Arc<TaskNode>) {
        self.nodes
            .entry(node_key(node.task(), node.workspace()))
            .or_insert_with(|| Arc::clone(node));
        for dep in node.dependencies() {
            self.cache_subtree(dep);
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
