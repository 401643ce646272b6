//! Taskmesh - metadata-driven task execution engine

pub mod envelope;
pub mod error;
pub mod meta;
pub mod remote;
pub mod runner;
pub mod task;
pub mod task_graph;
pub mod task_master;
pub mod workspace;

pub use envelope::{Envelope, SpillPolicy};
pub use error::TaskmeshError;
pub use meta::{Meta, Specification, ValueType, Verification};
pub use remote::{Distributor, UnitClient, UnitServer};
pub use runner::{
    CooperativeRunner, ProcessRunner, SequentialRunner, TaskRunner, ThreadedRunner,
};
pub use task::Task;
pub use task_graph::{TaskNode, TaskTree};
pub use task_master::{TaskMaster, TaskResult, TaskStatus};
pub use workspace::{TaskPath, Workspace, WorkspaceBuilder};
