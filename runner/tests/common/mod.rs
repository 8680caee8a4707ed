//! In-memory collaborators shared by the integration tests

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use hostrunner::collab::compose::ContainerServices;
use hostrunner::collab::dns::{DnsChange, DnsZones};
use hostrunner::collab::firewall::Firewall;
use hostrunner::collab::registry::{panel_args, DomainRecord, DomainRegistry};
use hostrunner::collab::unit::AppServer;
use hostrunner::collab::webserver::{SiteInfo, SiteNode, WebServerConfig};
use hostrunner::collab::Collaborators;
use hostrunner::deploy::{Deployer, PipelineTiming, VersionCatalog};
use hostrunner::errors::RunnerError;
use hostrunner::filesys::dir::Dir;
use hostrunner::gateway::{OpOutput, Operation, PrivilegedGateway};
use hostrunner::lock::{LockOptions, ResourceLocks};
use hostrunner::output::LogWriter;
use hostrunner::shell::{Shell, ShellLauncher};

/// A panel record for `domain` owned by `user`
pub fn record(domain: &str, user: &str, uid: &str) -> DomainRecord {
    let home = format!("/home/{}", user);
    let fields: BTreeMap<String, String> = [
        ("Username", user.to_string()),
        ("User ID", uid.to_string()),
        ("ID", format!("1{}", uid)),
        ("Home directory", home.clone()),
        ("HTML directory", format!("{}/public_html", home)),
        ("Features", "unix dir web".to_string()),
        ("PHP execution mode", "fpm".to_string()),
        ("SSL cert file", format!("{}/ssl.cert", home)),
        ("SSL key file", format!("{}/ssl.key", home)),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect();
    DomainRecord::new(domain, fields)
}

/// Registry keeping records in memory and recording panel calls
#[derive(Default)]
pub struct FakeRegistry {
    pub records: Mutex<HashMap<String, DomainRecord>>,
    pub executed: Mutex<Vec<(String, Vec<String>)>>,
    pub pushed: Mutex<Vec<(String, BTreeMap<String, String>)>>,
}

impl FakeRegistry {
    pub fn with(records: Vec<DomainRecord>) -> Self {
        let registry = Self::default();
        {
            let mut map = registry.records.lock().unwrap();
            for record in records {
                map.insert(record.name.clone(), record);
            }
        }
        registry
    }

    pub fn programs(&self) -> Vec<String> {
        self.executed
            .lock()
            .unwrap()
            .iter()
            .map(|(p, _)| p.clone())
            .collect()
    }
}

#[async_trait]
impl DomainRegistry for FakeRegistry {
    async fn domain_info(&self, domain: &str) -> Result<Option<DomainRecord>, RunnerError> {
        Ok(self.records.lock().unwrap().get(domain).cloned())
    }

    async fn execute(
        &self,
        program: &str,
        options: &[&Value],
        log: &LogWriter,
    ) -> Result<(), RunnerError> {
        self.executed
            .lock()
            .unwrap()
            .push((program.to_string(), panel_args(options)));
        log.line("Exit status: 0\n");
        Ok(())
    }

    async fn push_server_config(
        &self,
        id: &str,
        config: &BTreeMap<String, String>,
    ) -> Result<String, RunnerError> {
        self.pushed
            .lock()
            .unwrap()
            .push((id.to_string(), config.clone()));
        Ok(format!("Server {} config updated", id))
    }
}

/// Web server keeping one [`SiteInfo`] per domain
#[derive(Default)]
pub struct FakeWebServer {
    pub sites: Mutex<HashMap<String, SiteInfo>>,
    pub writes: Mutex<Vec<(String, SiteInfo)>>,
    pub applied: Mutex<Vec<(String, Value)>>,
}

#[async_trait]
impl WebServerConfig for FakeWebServer {
    async fn get(&self, _domain: &str) -> Result<SiteNode, RunnerError> {
        Ok(SiteNode::default())
    }

    async fn set(&self, domain: &str, info: &SiteInfo) -> Result<String, RunnerError> {
        self.sites
            .lock()
            .unwrap()
            .insert(domain.to_string(), info.clone());
        self.writes
            .lock()
            .unwrap()
            .push((domain.to_string(), info.clone()));
        Ok(format!("Updated nginx config of {}", domain))
    }

    async fn apply(&self, domain: &str, config: &Value) -> Result<String, RunnerError> {
        self.applied
            .lock()
            .unwrap()
            .push((domain.to_string(), config.clone()));
        Ok(format!("Applied nginx config of {}", domain))
    }

    async fn info(&self, domain: &str) -> Result<SiteInfo, RunnerError> {
        Ok(self
            .sites
            .lock()
            .unwrap()
            .get(domain)
            .cloned()
            .unwrap_or_default())
    }
}

/// Firewall tracking restricted users
#[derive(Default)]
pub struct FakeFirewall {
    pub restricted: Mutex<HashSet<String>>,
}

#[async_trait]
impl Firewall for FakeFirewall {
    async fn get_parsed(&self) -> Result<Vec<String>, RunnerError> {
        Ok(Vec::new())
    }

    async fn set_add_user(&self, user: &str, _uid: &str) -> Result<String, RunnerError> {
        self.restricted.lock().unwrap().insert(user.to_string());
        Ok(format!("Firewall enabled for {}", user))
    }

    async fn set_del_user(&self, user: &str, _uid: &str) -> Result<String, RunnerError> {
        self.restricted.lock().unwrap().remove(user);
        Ok(format!("Firewall disabled for {}", user))
    }

    async fn is_restricted(&self, user: &str, _uid: &str) -> Result<bool, RunnerError> {
        Ok(self.restricted.lock().unwrap().contains(user))
    }
}

#[derive(Default)]
pub struct FakeDns {
    pub applied: Mutex<Vec<(String, Vec<DnsChange>)>>,
}

#[async_trait]
impl DnsZones for FakeDns {
    async fn set(&self, zone: &str, changes: &[DnsChange]) -> Result<String, RunnerError> {
        self.applied
            .lock()
            .unwrap()
            .push((zone.to_string(), changes.to_vec()));
        Ok(format!("Zone {} updated", zone))
    }
}

/// Gateway answering every operation with success
#[derive(Default)]
pub struct FakeGateway {
    pub calls: Mutex<Vec<(Operation, Vec<String>)>>,
}

impl FakeGateway {
    pub fn ops(&self) -> Vec<Operation> {
        self.calls.lock().unwrap().iter().map(|(op, _)| *op).collect()
    }
}

#[async_trait]
impl PrivilegedGateway for FakeGateway {
    async fn invoke(
        &self,
        op: Operation,
        args: &[String],
        _input: Option<&str>,
    ) -> Result<OpOutput, RunnerError> {
        self.calls.lock().unwrap().push((op, args.to_vec()));
        Ok(OpOutput::ok(""))
    }
}

/// Shell recording commands; echoed `echo X` commands print `X`
#[derive(Clone, Default)]
pub struct ScriptedShell {
    pub commands: Arc<Mutex<Vec<(String, bool)>>>,
    /// Commands failing with exit code 1
    pub failing: Arc<Mutex<HashSet<String>>>,
}

impl ScriptedShell {
    pub fn echoed(&self) -> Vec<String> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, echo)| *echo)
            .map(|(c, _)| c.clone())
            .collect()
    }
}

struct ScriptedSession {
    script: ScriptedShell,
    log: LogWriter,
}

#[async_trait]
impl Shell for ScriptedSession {
    async fn exec(&mut self, command: &str, echo: bool) -> Result<(), RunnerError> {
        self.script
            .commands
            .lock()
            .unwrap()
            .push((command.to_string(), echo));
        if echo {
            self.log.line(format!("$> {}", command));
            if let Some(text) = command.strip_prefix("echo ") {
                self.log.line(text);
            }
        }
        if self.script.failing.lock().unwrap().contains(command) {
            return Err(RunnerError::CommandFailed {
                operation: command.to_string(),
                code: 1,
                stdout: String::new(),
                stderr: format!("{}: failed", command),
            });
        }
        Ok(())
    }

    async fn close(&mut self) {}
}

#[async_trait]
impl ShellLauncher for ScriptedShell {
    async fn launch(&self, _user: &str, log: LogWriter) -> Result<Box<dyn Shell>, RunnerError> {
        Ok(Box::new(ScriptedSession {
            script: self.clone(),
            log,
        }))
    }
}

/// Everything a pipeline test inspects afterwards
pub struct Host {
    pub registry: Arc<FakeRegistry>,
    pub webserver: Arc<FakeWebServer>,
    pub firewall: Arc<FakeFirewall>,
    pub dns: Arc<FakeDns>,
    pub gateway: Arc<FakeGateway>,
    pub shell: ScriptedShell,
}

impl Host {
    pub fn new(records: Vec<DomainRecord>) -> Self {
        Self {
            registry: Arc::new(FakeRegistry::with(records)),
            webserver: Arc::new(FakeWebServer::default()),
            firewall: Arc::new(FakeFirewall::default()),
            dns: Arc::new(FakeDns::default()),
            gateway: Arc::new(FakeGateway::default()),
            shell: ScriptedShell::default(),
        }
    }

    /// Deployer over the fakes; `locks` holds the lock files of the
    /// gateway-backed container and app collaborators
    pub fn deployer(&self, locks: &Path) -> Deployer {
        let gateway: Arc<dyn PrivilegedGateway> = self.gateway.clone();
        let webserver: Arc<dyn WebServerConfig> = self.webserver.clone();
        let locks = ResourceLocks::new(Dir::new(locks), LockOptions::default());
        let collab = Collaborators {
            gateway: gateway.clone(),
            registry: self.registry.clone(),
            webserver: webserver.clone(),
            firewall: self.firewall.clone(),
            dns: self.dns.clone(),
            containers: Arc::new(ContainerServices::new(
                gateway.clone(),
                locks.clone(),
                webserver,
            )),
            apps: Arc::new(AppServer::new(gateway, locks)),
        };
        Deployer::new(
            collab,
            Arc::new(VersionCatalog::default()),
            Arc::new(self.shell.clone()),
        )
        .with_timing(PipelineTiming {
            create_attempts: 3,
            poll_interval: Duration::from_millis(1),
            settle: Duration::from_millis(1),
        })
    }
}
