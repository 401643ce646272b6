//! Distributor - capability-aware front for a pool of unit servers
//!
//! Speaks the same protocol as a unit server, so clients need not know
//! whether they talk to a unit or a distributor. `run` and `structure`
//! requests are forwarded to the most capable reachable unit; the
//! distributor's own `powerfullity` is the sum over the reachable pool.

use std::collections::HashMap;

use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use super::{failure, reply};
use crate::envelope::Envelope;
use crate::error::TaskmeshError;
use crate::meta::Meta;

/// Async single-loop server forwarding envelopes to a unit pool.
/// Connections are handled one at a time.
pub struct Distributor {
    listener: TcpListener,
    units: Vec<String>,
    /// Capability per unit, probed lazily and cached for the lifetime of
    /// the distributor.
    capabilities: HashMap<String, i64>,
}

impl Distributor {
    pub async fn bind(addr: &str, units: Vec<String>) -> Result<Self, TaskmeshError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            units,
            capabilities: HashMap::new(),
        })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr, TaskmeshError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept and serve until a `stop` command arrives. Stopping the
    /// distributor leaves the pool running.
    pub async fn serve(mut self) -> Result<(), TaskmeshError> {
        info!(addr = %self.listener.local_addr()?, units = self.units.len(), "distributor serving");
        loop {
            let (mut stream, peer) = self.listener.accept().await?;
            debug!(%peer, "connection accepted");
            match self.serve_connection(&mut stream).await {
                Ok(true) => {
                    info!("stop received, shutting down");
                    return Ok(());
                }
                Ok(false) => {}
                Err(e) => warn!(error = %e, "connection failed"),
            }
        }
    }

    async fn serve_connection(&mut self, stream: &mut TcpStream) -> Result<bool, TaskmeshError> {
        let request = match Envelope::async_read_from(stream).await {
            Ok(envelope) => envelope.meta().clone(),
            Err(e) => {
                let _ = Envelope::from_meta(failure(&e.to_string()))
                    .async_write_to(stream)
                    .await;
                return Ok(false);
            }
        };

        let response = match request.get("command").and_then(Value::as_str) {
            None => failure("Command is required"),
            Some("stop") => return Ok(true),
            Some("powerfullity") => self.pool_powerfullity().await,
            Some("run") | Some("structure") => self.forward(request.clone()).await,
            Some(_) => failure("Unknown command"),
        };
        Envelope::from_meta(response).async_write_to(stream).await?;
        Ok(false)
    }

    async fn pool_powerfullity(&mut self) -> Meta {
        let mut total = 0i64;
        for unit in self.units.clone() {
            if let Some(capability) = self.probe(&unit).await {
                total += capability;
            }
        }
        reply(json!({"status": "success", "powerfullity": total}))
    }

    /// Forward to units in descending capability order until one answers.
    async fn forward(&mut self, request: Meta) -> Meta {
        let mut ranked = Vec::new();
        for unit in self.units.clone() {
            if let Some(capability) = self.probe(&unit).await {
                ranked.push((capability, unit));
            }
        }
        ranked.sort_by(|a, b| b.0.cmp(&a.0));

        for (capability, unit) in ranked {
            debug!(%unit, capability, "forwarding");
            match call_unit(&unit, request.clone()).await {
                Ok(response) => return response,
                Err(e) => {
                    warn!(%unit, error = %e, "unit unreachable, trying next");
                    self.capabilities.remove(&unit);
                }
            }
        }
        failure("No unit available")
    }

    async fn probe(&mut self, unit: &str) -> Option<i64> {
        if let Some(&capability) = self.capabilities.get(unit) {
            return Some(capability);
        }
        let mut request = Meta::new();
        request.insert("command", json!("powerfullity"));
        match call_unit(unit, request).await {
            Ok(response) => {
                let capability = response.get("powerfullity").and_then(Value::as_i64)?;
                self.capabilities.insert(unit.to_string(), capability);
                Some(capability)
            }
            Err(e) => {
                debug!(%unit, error = %e, "probe failed");
                None
            }
        }
    }
}

async fn call_unit(addr: &str, request: Meta) -> Result<Meta, TaskmeshError> {
    let mut stream = TcpStream::connect(addr).await?;
    Envelope::from_meta(request).async_write_to(&mut stream).await?;
    let response = Envelope::async_read_from(&mut stream).await?;
    Ok(response.meta().clone())
}
