//! DNS zone record changes.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::RunnerError;
use crate::gateway::{Operation, PrivilegedGateway};
use crate::lock::ResourceLocks;
use crate::utils::split_limit;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DnsAction {
    Add,
    Del,
}

/// One record mutation within a zone
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsChange {
    pub action: DnsAction,
    #[serde(rename = "type")]
    pub kind: String,
    pub domain: String,
    pub value: String,
}

impl DnsChange {
    /// Parse `[add|del] TYPE NAME VALUE...`; the action defaults to add
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        let line = if line.starts_with("add ") || line.starts_with("del ") {
            line.to_string()
        } else {
            format!("add {}", line)
        };
        let parts = split_limit(&line, ' ', 4);
        if parts.len() != 4 {
            return None;
        }
        Some(Self {
            action: if parts[0].eq_ignore_ascii_case("del") {
                DnsAction::Del
            } else {
                DnsAction::Add
            },
            kind: parts[1].to_lowercase(),
            domain: parts[2].to_lowercase(),
            value: parts[3].clone(),
        })
    }

    /// Accept either the string shorthand or the object form
    pub fn from_value(value: &Value) -> Result<Self, RunnerError> {
        match value {
            Value::String(s) => Self::parse(s)
                .ok_or_else(|| RunnerError::InvalidInput(format!("Invalid DNS record: {}", s))),
            other => serde_json::from_value(other.clone())
                .map_err(|e| RunnerError::InvalidInput(format!("Invalid DNS record: {}", e))),
        }
    }
}

/// DNS collaborator
#[async_trait]
pub trait DnsZones: Send + Sync {
    /// Apply `changes` to `zone`, returning the helper's status text
    async fn set(&self, zone: &str, changes: &[DnsChange]) -> Result<String, RunnerError>;
}

/// Zones edited through `NAMED_APPLY`
pub struct NamedZones {
    gateway: Arc<dyn PrivilegedGateway>,
    locks: ResourceLocks,
}

impl NamedZones {
    pub fn new(gateway: Arc<dyn PrivilegedGateway>, locks: ResourceLocks) -> Self {
        Self { gateway, locks }
    }
}

#[async_trait]
impl DnsZones for NamedZones {
    async fn set(&self, zone: &str, changes: &[DnsChange]) -> Result<String, RunnerError> {
        let body = serde_json::to_string(changes)?;
        let gateway = self.gateway.clone();
        let zone = zone.to_string();
        self.locks
            .with_lock("named", || async move {
                let out = gateway
                    .invoke(Operation::NamedApply, &[zone], Some(&body))
                    .await?
                    .check(Operation::NamedApply)?;
                Ok(out.stdout.trim_end().to_string())
            })
            .await
    }
}
