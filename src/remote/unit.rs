//! Unit server - one workspace on one TCP endpoint
//!
//! Connections are served strictly one at a time; each request envelope is
//! answered by one response envelope on the same connection. A `stop`
//! command ends the accept loop without a response.

use std::net::{TcpListener, TcpStream};
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::{failure, reply};
use crate::envelope::Envelope;
use crate::error::TaskmeshError;
use crate::meta::Meta;
use crate::runner::{SequentialRunner, TaskRunner};
use crate::task_master::{TaskMaster, TaskStatus};
use crate::workspace::Workspace;

enum Handled {
    Reply(Meta),
    Shutdown,
}

/// Blocking TCP server answering the remote command protocol for a single
/// workspace.
pub struct UnitServer {
    workspace: Arc<Workspace>,
    listener: TcpListener,
    runner: Arc<dyn TaskRunner>,
    powerfullity: i64,
}

impl UnitServer {
    /// Bind to `addr` (use port 0 for an ephemeral port). `powerfullity` is
    /// the capability score this unit reports to distributors.
    pub fn bind(
        workspace: Arc<Workspace>,
        addr: &str,
        powerfullity: i64,
    ) -> Result<Self, TaskmeshError> {
        let listener = TcpListener::bind(addr)?;
        Ok(Self {
            workspace,
            listener,
            runner: Arc::new(SequentialRunner),
            powerfullity,
        })
    }

    /// Evaluate `run` commands with a different strategy.
    pub fn with_runner(mut self, runner: Arc<dyn TaskRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr, TaskmeshError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept and serve connections until a `stop` command arrives.
    pub fn serve(&self) -> Result<(), TaskmeshError> {
        info!(workspace = self.workspace.name(), addr = %self.listener.local_addr()?, "unit serving");
        for stream in self.listener.incoming() {
            let mut stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };
            match self.serve_connection(&mut stream) {
                Ok(true) => {
                    info!("stop received, shutting down");
                    return Ok(());
                }
                Ok(false) => {}
                // A vanished client must not bring the accept loop down.
                Err(e) => warn!(error = %e, "connection failed"),
            }
        }
        Ok(())
    }

    /// Returns true when the connection asked for shutdown.
    fn serve_connection(&self, stream: &mut TcpStream) -> Result<bool, TaskmeshError> {
        let request = match Envelope::read_from(stream) {
            Ok(envelope) => envelope.meta().clone(),
            Err(e) => {
                warn!(error = %e, "unreadable request");
                let _ = Envelope::from_meta(failure(&e.to_string())).write_to(stream);
                return Ok(false);
            }
        };
        debug!(?request, "request received");
        match dispatch(&self.workspace, &self.runner, self.powerfullity, &request) {
            Handled::Shutdown => Ok(true),
            Handled::Reply(response) => {
                Envelope::from_meta(response).write_to(stream)?;
                Ok(false)
            }
        }
    }
}

fn dispatch(
    workspace: &Arc<Workspace>,
    runner: &Arc<dyn TaskRunner>,
    powerfullity: i64,
    request: &Meta,
) -> Handled {
    match request.get("command").and_then(Value::as_str) {
        None => Handled::Reply(failure("Command is required")),
        Some("stop") => Handled::Shutdown,
        Some("powerfullity") => Handled::Reply(reply(json!({
            "status": "success",
            "powerfullity": powerfullity,
        }))),
        Some("structure") => Handled::Reply(reply(json!({
            "status": "success",
            "structure": workspace.structure(),
        }))),
        Some("run") => Handled::Reply(run_command(workspace, runner, request)),
        Some(_) => Handled::Reply(failure("Unknown command")),
    }
}

/// The whole request meta doubles as the execution meta; `command` and
/// `task_path` ride along and are ignored by validation unless a task
/// explicitly requires them.
fn run_command(
    workspace: &Arc<Workspace>,
    runner: &Arc<dyn TaskRunner>,
    request: &Meta,
) -> Meta {
    let Some(path) = request.get("task_path").and_then(Value::as_str) else {
        return failure("Task path is required");
    };
    let task = match workspace.find_task(path) {
        Ok(Some(task)) => task,
        Ok(None) => return failure("Task not found"),
        Err(e) => return failure(&e.to_string()),
    };

    let master = TaskMaster::new(Arc::clone(runner));
    let mut result = master.execute(request.clone(), &task, Some(workspace));
    let forced = result.force().map(Value::clone).map_err(|e| e.to_string());
    match result.status() {
        TaskStatus::ContainsData => reply(json!({
            "status": "contains_data",
            "data": forced.expect("contains_data has a value"),
        })),
        TaskStatus::InvocationError => reply(json!({
            "status": "invocation_error",
            "error": forced.expect_err("invocation_error has an error"),
        })),
        TaskStatus::DependenciesError => {
            let unresolved: Vec<Value> = result
                .node()
                .unresolved_dependencies()
                .iter()
                .map(|u| u.to_value())
                .collect();
            reply(json!({
                "status": "dependencies_error",
                "error": unresolved,
            }))
        }
        TaskStatus::MetaError => {
            let detail = result
                .meta_error()
                .map(|e| e.to_value())
                .unwrap_or(Value::Null);
            reply(json!({
                "status": "meta_error",
                "error": detail,
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::demo_workspace;

    fn dispatch_demo(request: Value) -> Meta {
        let workspace = demo_workspace();
        let runner: Arc<dyn TaskRunner> = Arc::new(SequentialRunner);
        let request = Meta::from_value(request).unwrap();
        match dispatch(&workspace, &runner, 7, &request) {
            Handled::Reply(meta) => meta,
            Handled::Shutdown => panic!("unexpected shutdown"),
        }
    }

    #[test]
    fn missing_command_is_required() {
        let response = dispatch_demo(json!({}));
        assert_eq!(response.get("status"), Some(&json!("failed")));
        assert_eq!(response.get("error"), Some(&json!("Command is required")));
    }

    #[test]
    fn unknown_command_is_reported() {
        let response = dispatch_demo(json!({"command": "dance"}));
        assert_eq!(response.get("error"), Some(&json!("Unknown command")));
    }

    #[test]
    fn powerfullity_reports_capability() {
        let response = dispatch_demo(json!({"command": "powerfullity"}));
        assert_eq!(response.get("status"), Some(&json!("success")));
        assert_eq!(response.get("powerfullity"), Some(&json!(7)));
    }

    #[test]
    fn structure_describes_workspace() {
        let response = dispatch_demo(json!({"command": "structure"}));
        let structure = response.get("structure").unwrap();
        assert_eq!(structure["name"], "demo");
    }

    #[test]
    fn run_returns_task_data() {
        let response = dispatch_demo(json!({"command": "run", "task_path": "b"}));
        assert_eq!(response.get("status"), Some(&json!("contains_data")));
        assert_eq!(response.get("data"), Some(&json!(2)));
    }

    #[test]
    fn run_unknown_task_fails() {
        let response = dispatch_demo(json!({"command": "run", "task_path": "ghost"}));
        assert_eq!(response.get("status"), Some(&json!("failed")));
        assert_eq!(response.get("error"), Some(&json!("Task not found")));
    }

    #[test]
    fn run_mistyped_meta_is_meta_error() {
        let response = dispatch_demo(json!({
            "command": "run",
            "task_path": "counted",
            "count": "many",
        }));
        assert_eq!(response.get("status"), Some(&json!("meta_error")));
        assert!(response.get("error").unwrap().get("issues").is_some());
    }

    #[test]
    fn stop_requests_shutdown() {
        let workspace = demo_workspace();
        let runner: Arc<dyn TaskRunner> = Arc::new(SequentialRunner);
        let request = Meta::from_value(json!({"command": "stop"})).unwrap();
        assert!(matches!(
            dispatch(&workspace, &runner, 1, &request),
            Handled::Shutdown
        ));
    }
}
