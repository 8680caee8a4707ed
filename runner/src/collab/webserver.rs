//! Web-server virtual host configuration.
//!
//! The helper owns the config text; it hands out and accepts a JSON view of
//! the server blocks defined for a domain.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::RunnerError;
use crate::gateway::{Operation, PrivilegedGateway};
use crate::lock::ResourceLocks;

/// SSL listener modes indexed by [`SiteInfo::ssl`]
pub const SSL_MODES: [&str; 4] = ["", "off", "always", "on"];

/// Raw server blocks of a domain's config file keyed by server name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SiteNode(pub Map<String, Value>);

/// Location block
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Location {
    #[serde(rename = "match")]
    pub path: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_pass: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Settings the generator renders into the server block
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SiteConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<u8>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub www: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fastcgi: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub locations: Vec<Location>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Extracted view of one server block
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SiteInfo {
    /// Index into [`SSL_MODES`]
    #[serde(default)]
    pub ssl: usize,

    #[serde(default)]
    pub http: u8,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub www: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl_certificate: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl_certificate_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fcgi: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_ip: Option<String>,

    #[serde(default)]
    pub config: SiteConfig,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SiteInfo {
    pub fn ssl_mode(&self) -> &'static str {
        SSL_MODES.get(self.ssl).copied().unwrap_or_default()
    }

    /// Switch the listener mode, keeping the index and the rendered config in step
    pub fn set_ssl_mode(&mut self, mode: &str) {
        self.ssl = SSL_MODES.iter().position(|m| *m == mode).unwrap_or_default();
        self.config.ssl = Some(mode.to_string());
    }
}

/// Web-server config collaborator
#[async_trait]
pub trait WebServerConfig: Send + Sync {
    async fn get(&self, domain: &str) -> Result<SiteNode, RunnerError>;

    /// Write an edited [`SiteInfo`] back, returning a status line
    async fn set(&self, domain: &str, info: &SiteInfo) -> Result<String, RunnerError>;

    /// Apply the user supplied `nginx` subtree of a deployment
    async fn apply(&self, domain: &str, config: &Value) -> Result<String, RunnerError>;

    fn extract_info(&self, node: &SiteNode, domain: &str) -> Result<SiteInfo, RunnerError> {
        extract_info(node, domain)
    }

    /// `get` followed by `extract_info`
    async fn info(&self, domain: &str) -> Result<SiteInfo, RunnerError> {
        let node = self.get(domain).await?;
        self.extract_info(&node, domain)
    }
}

/// Pick the server block answering for `domain`
pub fn extract_info(node: &SiteNode, domain: &str) -> Result<SiteInfo, RunnerError> {
    let block = node
        .0
        .get(domain)
        .or_else(|| {
            node.0
                .iter()
                .find(|(names, _)| names.split_whitespace().any(|n| n == domain))
                .map(|(_, v)| v)
        })
        .ok_or_else(|| RunnerError::NotFound(format!("server block for {}", domain)))?;
    Ok(serde_json::from_value(block.clone())?)
}

/// Web-server config reached through the `NGINX_*` privileged operations
pub struct NginxConfig {
    gateway: Arc<dyn PrivilegedGateway>,
    locks: ResourceLocks,
}

impl NginxConfig {
    pub fn new(gateway: Arc<dyn PrivilegedGateway>, locks: ResourceLocks) -> Self {
        Self { gateway, locks }
    }

    async fn write(&self, op: Operation, domain: &str, body: String) -> Result<String, RunnerError> {
        let gateway = self.gateway.clone();
        let domain = domain.to_string();
        self.locks
            .with_lock("nginx", || async move {
                let out = gateway
                    .invoke(op, &[domain.clone()], Some(&body))
                    .await?
                    .check(op)?;
                let status = out.stdout.trim();
                Ok(if status.is_empty() {
                    format!("Done updating nginx config for {}", domain)
                } else {
                    status.to_string()
                })
            })
            .await
    }
}

#[async_trait]
impl WebServerConfig for NginxConfig {
    async fn get(&self, domain: &str) -> Result<SiteNode, RunnerError> {
        let out = self
            .gateway
            .invoke(Operation::NginxInfoGet, &[domain.to_string()], None)
            .await?
            .check(Operation::NginxInfoGet)?;
        Ok(serde_json::from_str(&out.stdout)?)
    }

    async fn set(&self, domain: &str, info: &SiteInfo) -> Result<String, RunnerError> {
        let body = serde_json::to_string(info)?;
        self.write(Operation::NginxInfoSet, domain, body).await
    }

    async fn apply(&self, domain: &str, config: &Value) -> Result<String, RunnerError> {
        let body = serde_json::to_string(config)?;
        self.write(Operation::NginxConfigSet, domain, body).await
    }
}
