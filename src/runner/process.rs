//! Worker-process runner
//!
//! Sibling subtrees are handed to worker processes: each worker is this
//! same binary in its hidden `eval` mode, rebuilding the workspace from a
//! registered locator and executing one task path. Inputs and outputs
//! cross the process boundary as JSON; workers share no mutable state.

use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::debug;

use super::{dependency_meta, TaskRunner};
use crate::error::TaskmeshError;
use crate::meta::Meta;
use crate::task::DepValues;
use crate::task_graph::TaskNode;

/// Poll interval while waiting on a worker with a deadline.
const WAIT_POLL: Duration = Duration::from_millis(10);

/// Evaluates sibling dependency subtrees in a pool of worker processes
/// bounded by the machine's available parallelism. Tasks must be
/// addressable by path inside the workspace the locator rebuilds; the
/// worker executes its subtree sequentially and reports one JSON result.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    locator: String,
    program: PathBuf,
    max_workers: usize,
    timeout: Option<Duration>,
}

impl ProcessRunner {
    /// `locator` must name a registered workspace reachable from the
    /// worker process (see `workspace::register`).
    pub fn new(locator: impl Into<String>) -> Self {
        Self {
            locator: locator.into(),
            program: std::env::current_exe().unwrap_or_else(|_| PathBuf::from("taskmesh")),
            max_workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            timeout: None,
        }
    }

    /// Override the worker executable. Integration tests point this at the
    /// built binary; library consumers embedding the engine point it at
    /// their own binary exposing the `eval` mode.
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }

    /// Kill a worker that exceeds the deadline; surfaces as a timeout
    /// failure on the parent.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn spawn_worker(&self, task_path: &str, meta: &Meta) -> Result<std::process::Child, TaskmeshError> {
        let meta_json = serde_json::to_string(meta)?;
        debug!(task = task_path, locator = %self.locator, "spawning worker");
        let child = Command::new(&self.program)
            .arg("--workspace")
            .arg(&self.locator)
            .arg("eval")
            .arg("--task")
            .arg(task_path)
            .arg("--meta")
            .arg(meta_json)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        Ok(child)
    }

    fn collect_worker(
        &self,
        task_name: &str,
        mut child: std::process::Child,
    ) -> Result<Value, TaskmeshError> {
        if let Some(timeout) = self.timeout {
            let deadline = Instant::now() + timeout;
            while child.try_wait()?.is_none() {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(TaskmeshError::Timeout {
                        task: task_name.to_string(),
                        millis: timeout.as_millis() as u64,
                    });
                }
                std::thread::sleep(WAIT_POLL);
            }
        }
        let output = child.wait_with_output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TaskmeshError::Invocation {
                task: task_name.to_string(),
                details: format!("worker exited with {}: {}", output.status, stderr.trim()),
            });
        }

        let report: Value = serde_json::from_slice(&output.stdout).map_err(|e| {
            TaskmeshError::Invocation {
                task: task_name.to_string(),
                details: format!("unreadable worker report: {e}"),
            }
        })?;
        match report.get("status").and_then(Value::as_str) {
            Some("contains_data") => Ok(report.get("data").cloned().unwrap_or(Value::Null)),
            _ => Err(TaskmeshError::Invocation {
                task: task_name.to_string(),
                details: report
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("worker reported failure")
                    .to_string(),
            }),
        }
    }
}

impl TaskRunner for ProcessRunner {
    fn run(&self, meta: &Meta, node: &Arc<TaskNode>) -> Result<Value, TaskmeshError> {
        let mut deps = DepValues::new();
        for batch in node.dependencies().chunks(self.max_workers) {
            // Spawn the whole batch, then reap in order.
            let mut running = Vec::with_capacity(batch.len());
            for child in batch {
                let child_meta = dependency_meta(meta, child.task().name());
                let worker = self.spawn_worker(child.path(), &child_meta)?;
                running.push((child.task().name().to_string(), worker));
            }
            for (name, worker) in running {
                let value = self.collect_worker(&name, worker)?;
                deps.insert(name, value);
            }
        }
        let invocation_meta = node.task().invocation_meta(meta);
        node.task().transform(&invocation_meta, &deps)
    }
}
