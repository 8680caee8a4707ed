//! Host collaborators the deployment pipeline drives.
//!
//! Each seam is a trait so the pipeline can run against in-memory fakes; the
//! production implementations reach the host through the privileged gateway
//! and guard shared files with [`ResourceLocks`].

pub mod compose;
pub mod dns;
pub mod firewall;
pub mod ports;
pub mod registry;
pub mod unit;
pub mod webserver;

use std::sync::Arc;

use crate::gateway::PrivilegedGateway;
use crate::lock::ResourceLocks;

use compose::ContainerServices;
use dns::{DnsZones, NamedZones};
use firewall::{Firewall, NftFirewall};
use registry::{DomainRegistry, PanelRegistry};
use unit::AppServer;
use webserver::{NginxConfig, WebServerConfig};

/// Every collaborator one deployment needs
#[derive(Clone)]
pub struct Collaborators {
    pub gateway: Arc<dyn PrivilegedGateway>,
    pub registry: Arc<dyn DomainRegistry>,
    pub webserver: Arc<dyn WebServerConfig>,
    pub firewall: Arc<dyn Firewall>,
    pub dns: Arc<dyn DnsZones>,
    pub containers: Arc<ContainerServices>,
    pub apps: Arc<AppServer>,
}

impl Collaborators {
    /// Gateway-backed implementations sharing one lock directory
    pub fn from_gateway(gateway: Arc<dyn PrivilegedGateway>, locks: ResourceLocks) -> Self {
        let webserver: Arc<dyn WebServerConfig> =
            Arc::new(NginxConfig::new(gateway.clone(), locks.clone()));
        Self {
            registry: Arc::new(PanelRegistry::new(gateway.clone())),
            firewall: Arc::new(NftFirewall::new(gateway.clone(), locks.clone())),
            dns: Arc::new(NamedZones::new(gateway.clone(), locks.clone())),
            containers: Arc::new(ContainerServices::new(
                gateway.clone(),
                locks.clone(),
                webserver.clone(),
            )),
            apps: Arc::new(AppServer::new(gateway.clone(), locks)),
            webserver,
            gateway,
        }
    }
}
