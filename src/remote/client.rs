//! Blocking client for unit servers and distributors

use std::net::TcpStream;

use serde_json::{json, Value};
use tracing::debug;

use crate::envelope::Envelope;
use crate::error::TaskmeshError;
use crate::meta::Meta;

/// One connection per call; both unit servers and distributors speak the
/// same protocol, so the client addresses either.
#[derive(Debug, Clone)]
pub struct UnitClient {
    addr: String,
}

impl UnitClient {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Send one request meta and wait for the response meta.
    pub fn call(&self, request: Meta) -> Result<Meta, TaskmeshError> {
        debug!(addr = %self.addr, ?request, "calling remote");
        let mut stream = TcpStream::connect(&self.addr)?;
        Envelope::from_meta(request).write_to(&mut stream)?;
        let response = Envelope::read_from(&mut stream)?;
        Ok(response.meta().clone())
    }

    /// Execute a task remotely. `meta` becomes the execution meta; the
    /// command fields are added on top of it.
    pub fn run(&self, task_path: &str, meta: Meta) -> Result<Value, TaskmeshError> {
        let mut request = meta;
        request.insert("command", json!("run"));
        request.insert("task_path", json!(task_path));
        let response = self.call(request)?;
        match response.get("status").and_then(Value::as_str) {
            Some("contains_data") => Ok(response.get("data").cloned().unwrap_or(Value::Null)),
            _ => Err(remote_failure(&response)),
        }
    }

    pub fn structure(&self) -> Result<Value, TaskmeshError> {
        let response = self.call(command("structure"))?;
        match response.get("structure") {
            Some(structure) => Ok(structure.clone()),
            None => Err(remote_failure(&response)),
        }
    }

    pub fn powerfullity(&self) -> Result<i64, TaskmeshError> {
        let response = self.call(command("powerfullity"))?;
        response
            .get("powerfullity")
            .and_then(Value::as_i64)
            .ok_or_else(|| remote_failure(&response))
    }

    /// Ask the remote to shut down. No response is read; the remote closes
    /// its accept loop without replying.
    pub fn stop(&self) -> Result<(), TaskmeshError> {
        let mut stream = TcpStream::connect(&self.addr)?;
        Envelope::from_meta(command("stop")).write_to(&mut stream)?;
        Ok(())
    }
}

fn command(name: &str) -> Meta {
    let mut meta = Meta::new();
    meta.insert("command", json!(name));
    meta
}

fn remote_failure(response: &Meta) -> TaskmeshError {
    let status = response
        .get("status")
        .and_then(Value::as_str)
        .unwrap_or("failed");
    let detail = match response.get("error") {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => "no error detail".to_string(),
    };
    TaskmeshError::Remote(format!("{status}: {detail}"))
}
