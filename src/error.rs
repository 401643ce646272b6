//! Error types for the task engine (v0.1)

use thiserror::Error;

/// All error variants are part of the public API.
///
/// Graph and validation failures are normally *recovered* into a
/// [`TaskResult`](crate::task_master::TaskResult) status and never thrown from
/// `TaskMaster::execute`; the variants here surface when a lazy result is
/// forced or when callers use the lower layers directly.
#[derive(Error, Debug)]
pub enum TaskmeshError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // ─────────────────────────────────────────────────────────────
    // Graph errors
    // ─────────────────────────────────────────────────────────────
    #[error("Dependency '{path}' required by task '{required_by}' does not resolve")]
    UnresolvedDependency { path: String, required_by: String },

    #[error("Invalid task path syntax: '{path}'")]
    InvalidPath { path: String },

    #[error("Task '{path}' not found in workspace '{workspace}'")]
    TaskNotFound { path: String, workspace: String },

    #[error("Unknown workspace locator '{0}'")]
    UnknownWorkspace(String),

    // ─────────────────────────────────────────────────────────────
    // Validation errors
    // ─────────────────────────────────────────────────────────────
    #[error("Metadata rejected for task '{task}': {details}")]
    MetaRejected { task: String, details: String },

    // ─────────────────────────────────────────────────────────────
    // Invocation errors
    // ─────────────────────────────────────────────────────────────
    #[error("Task '{task}' failed: {details}")]
    Invocation { task: String, details: String },

    #[error("Reduce over empty sequence in task '{task}'")]
    EmptySequence { task: String },

    #[error("Task '{task}' expected a sequence from dependency '{dependency}'")]
    NotASequence { task: String, dependency: String },

    #[error("Dependency '{task}' timed out after {millis}ms")]
    Timeout { task: String, millis: u64 },

    // ─────────────────────────────────────────────────────────────
    // Protocol errors
    // ─────────────────────────────────────────────────────────────
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Remote call failed: {0}")]
    Remote(String),
}
