//! Host-wide table of ports published by user containers.

use std::sync::Arc;

use tracing::debug;

use crate::errors::RunnerError;
use crate::gateway::{Operation, PrivilegedGateway};
use crate::lock::ResourceLocks;

pub const STATUS_ADDED: &str = "Ports allocation added";
pub const STATUS_UNCHANGED: &str = "Ports allocation unchanged";

/// `uid:port` lines read and written through `PORTS_GET` / `PORTS_SET`
#[derive(Clone)]
pub struct PortTable {
    gateway: Arc<dyn PrivilegedGateway>,
    locks: ResourceLocks,
}

impl PortTable {
    pub fn new(gateway: Arc<dyn PrivilegedGateway>, locks: ResourceLocks) -> Self {
        Self { gateway, locks }
    }

    /// Record `ports` as owned by `uid`, keeping existing entries
    pub async fn allocate(&self, uid: &str, ports: &[String]) -> Result<String, RunnerError> {
        let gateway = self.gateway.clone();
        let wanted: Vec<String> = ports.iter().map(|p| format!("{}:{}", uid, p)).collect();
        self.locks
            .with_lock("ports", || async move {
                let out = gateway
                    .invoke(Operation::PortsGet, &[], None)
                    .await?
                    .check(Operation::PortsGet)?;
                let mut lines: Vec<String> = out
                    .stdout
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(str::to_string)
                    .collect();

                let mut changed = false;
                for line in wanted {
                    if !lines.contains(&line) {
                        debug!("Allocating port {}", line);
                        lines.push(line);
                        changed = true;
                    }
                }
                if !changed {
                    return Ok(STATUS_UNCHANGED.to_string());
                }

                let table = format!("{}\n", lines.join("\n"));
                gateway
                    .invoke(Operation::PortsSet, &[], Some(&table))
                    .await?
                    .check(Operation::PortsSet)?;
                Ok(STATUS_ADDED.to_string())
            })
            .await
    }
}
