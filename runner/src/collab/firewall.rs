//! Per-user egress restriction kept in the host's nftables rule set.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::errors::RunnerError;
use crate::gateway::{Operation, PrivilegedGateway};
use crate::lock::ResourceLocks;

const LOCK_NAME: &str = "iptables";
const DOC_HEADER: &str = "#!/usr/sbin/nft -f\n\n";

pub const STATUS_UPDATED: &str = "Updated for nftables";
pub const STATUS_UNCHANGED: &str = "Done unchanged for nftables";

/// Rule that rejects outbound traffic of `user`
pub fn user_rule(user: &str, uid: &str) -> String {
    format!(
        "add rule inet filter WHITELIST-SET skuid {} counter reject comment \"{}\"",
        uid, user
    )
}

/// Keep only the rule lines of a rule set document
pub fn parse_rules(doc: &str) -> Vec<String> {
    doc.lines()
        .filter(|l| l.starts_with("add rule"))
        .map(str::to_string)
        .collect()
}

pub fn encode_rules(rules: &[String]) -> String {
    format!("{}{}\n", DOC_HEADER, rules.join("\n"))
}

/// Firewall collaborator
#[async_trait]
pub trait Firewall: Send + Sync {
    async fn get_parsed(&self) -> Result<Vec<String>, RunnerError>;

    /// Restrict egress for the user
    async fn set_add_user(&self, user: &str, uid: &str) -> Result<String, RunnerError>;

    /// Lift the restriction for the user
    async fn set_del_user(&self, user: &str, uid: &str) -> Result<String, RunnerError>;

    async fn is_restricted(&self, user: &str, uid: &str) -> Result<bool, RunnerError> {
        let rule = user_rule(user, uid);
        Ok(self.get_parsed().await?.iter().any(|r| *r == rule))
    }
}

/// Firewall reached through `FIREWALL_GET` / `FIREWALL_SET`
pub struct NftFirewall {
    gateway: Arc<dyn PrivilegedGateway>,
    locks: ResourceLocks,
}

impl NftFirewall {
    pub fn new(gateway: Arc<dyn PrivilegedGateway>, locks: ResourceLocks) -> Self {
        Self { gateway, locks }
    }

    async fn read(gateway: &dyn PrivilegedGateway) -> Result<Vec<String>, RunnerError> {
        let out = gateway
            .invoke(Operation::FirewallGet, &[], None)
            .await?
            .check(Operation::FirewallGet)?;
        Ok(parse_rules(&out.stdout))
    }

    /// One read-modify-write cycle; `edit` reports whether it changed anything
    async fn update<F>(&self, edit: F) -> Result<String, RunnerError>
    where
        F: FnOnce(&mut Vec<String>) -> bool + Send,
    {
        let gateway = self.gateway.clone();
        self.locks
            .with_lock(LOCK_NAME, || async move {
                let mut rules = Self::read(gateway.as_ref()).await?;
                if !edit(&mut rules) {
                    return Ok(STATUS_UNCHANGED.to_string());
                }
                let doc = encode_rules(&rules);
                gateway
                    .invoke(Operation::FirewallSet, &[], Some(&doc))
                    .await?
                    .check(Operation::FirewallSet)?;
                Ok(STATUS_UPDATED.to_string())
            })
            .await
    }
}

#[async_trait]
impl Firewall for NftFirewall {
    async fn get_parsed(&self) -> Result<Vec<String>, RunnerError> {
        let gateway = self.gateway.clone();
        self.locks
            .with_lock(LOCK_NAME, || async move { Self::read(gateway.as_ref()).await })
            .await
    }

    async fn set_add_user(&self, user: &str, uid: &str) -> Result<String, RunnerError> {
        let rule = user_rule(user, uid);
        debug!("Restricting egress for {}", user);
        self.update(move |rules| {
            if rules.contains(&rule) {
                return false;
            }
            rules.push(rule);
            true
        })
        .await
    }

    async fn set_del_user(&self, user: &str, uid: &str) -> Result<String, RunnerError> {
        let rule = user_rule(user, uid);
        debug!("Lifting egress restriction for {}", user);
        self.update(move |rules| match rules.iter().position(|r| *r == rule) {
            Some(i) => {
                rules.remove(i);
                true
            }
            None => false,
        })
        .await
    }
}
