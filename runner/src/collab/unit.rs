//! Application server definitions for long-running user processes.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::collab::registry::DomainRecord;
use crate::errors::RunnerError;
use crate::gateway::{Operation, PrivilegedGateway};
use crate::lock::ResourceLocks;

/// The `unit` subtree of a deployment
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_start_command: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_root: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env_var_list: Vec<String>,
}

/// Collapse repeated slashes and drop a trailing one
fn normalize_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for c in path.chars() {
        if c == '/' && out.ends_with('/') {
            continue;
        }
        out.push(c);
    }
    if out.len() > 1 && out.ends_with('/') {
        out.pop();
    }
    out
}

/// Build the application definition for `domain`
pub fn sandbox(config: &AppConfig, domain: &str, record: &DomainRecord) -> Value {
    let user = record.username();
    let child = record.parent_domain().is_some();
    let root = match &config.app_root {
        Some(root) => root.clone(),
        None if child => format!("domains/{}/public_html", domain),
        None => "public_html".to_string(),
    };
    let working_directory = normalize_path(&format!("/home/{}/{}", user, root));
    let log_base = if child {
        format!("/home/{}/domains/{}/logs", user, domain)
    } else {
        format!("/home/{}/logs", user)
    };

    let mut app = json!({
        "type": "external",
        "working_directory": working_directory,
        "executable": "/usr/local/bin/port",
        "stdout": format!("{}/unit_stdout_log", log_base),
        "stderr": format!("{}/unit_stderr_log", log_base),
        "user": user,
        "group": user,
        "arguments": ["bash", "-c", config.app_start_command.clone().unwrap_or_default()],
        "processes": { "max": 1, "spare": 0, "idle_timeout": 900 },
    });

    let env: Map<String, Value> = config
        .env_var_list
        .iter()
        .filter_map(|entry| {
            let at = entry.find(['=', ' '])?;
            Some((entry[..at].to_string(), Value::from(&entry[at + 1..])))
        })
        .collect();
    if !env.is_empty() {
        app["environment"] = Value::Object(env);
    }
    app
}

/// Application server reached through `UNIT_SET` / `UNIT_DEL`
pub struct AppServer {
    gateway: Arc<dyn PrivilegedGateway>,
    locks: ResourceLocks,
}

impl AppServer {
    pub fn new(gateway: Arc<dyn PrivilegedGateway>, locks: ResourceLocks) -> Self {
        Self { gateway, locks }
    }

    /// Install or remove the application of `domain`
    pub async fn set_domain(
        &self,
        domain: &str,
        config: &AppConfig,
        record: &DomainRecord,
    ) -> Result<String, RunnerError> {
        let path = format!("/config/applications/{}", domain);
        if config.app_start_command.as_deref().unwrap_or_default().is_empty() {
            let out = self
                .gateway
                .invoke(Operation::UnitDel, &[path], None)
                .await?
                .check(Operation::UnitDel)?;
            return Ok(out.stdout.trim().to_string());
        }

        let body = serde_json::to_string(&sandbox(config, domain, record))?;
        let gateway = self.gateway.clone();
        self.locks
            .with_lock("unit", || async move {
                let out = gateway
                    .invoke(Operation::UnitSet, &[path], Some(&body))
                    .await?
                    .check(Operation::UnitSet)?;
                Ok(out.stdout.trim().to_string())
            })
            .await
    }
}
