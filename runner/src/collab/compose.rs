//! Container services of a domain.
//!
//! Published ports are pinned to the domain's private address, registered in
//! the shared port table and wired into the reverse proxy before the compose
//! file is written.

use std::sync::Arc;

use rand::Rng;
use serde_yaml::{Mapping, Value};
use tracing::info;

use crate::collab::ports::PortTable;
use crate::collab::webserver::{Location, WebServerConfig};
use crate::errors::RunnerError;
use crate::gateway::{Operation, PrivilegedGateway};
use crate::lock::ResourceLocks;

const LOCK_NAME: &str = "compose";
const DEFAULT_COMPOSE_FILE: &str = "docker-compose.yml";
const PROXY_PREFIX: &str = "docker:";

/// Where the services come from
#[derive(Debug, Clone, PartialEq)]
pub enum ServicesSpec {
    /// Inline `services` mapping from the deployment
    Inline(serde_json::Value),
    /// Compose file relative to the web root, `#` suffix ignored
    File(String),
}

impl ServicesSpec {
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::String(path) => {
                let path = path.split('#').next().unwrap_or_default();
                ServicesSpec::File(path.to_string())
            }
            other => ServicesSpec::Inline(other.clone()),
        }
    }

    /// `-f` flag for `docker compose` when a custom file is used
    pub fn compose_flags(&self) -> String {
        match self {
            ServicesSpec::File(path) => format!("-f {}", path),
            ServicesSpec::Inline(_) => String::new(),
        }
    }

    /// Directory holding the compose file, relative to the web root
    pub fn sub_dir(&self) -> Option<&str> {
        match self {
            ServicesSpec::File(path) => path.rfind('/').map(|i| &path[..i]),
            ServicesSpec::Inline(_) => None,
        }
    }
}

/// Random address in 10.0.0.0/8
pub fn random_private_ip() -> String {
    let mut rng = rand::thread_rng();
    format!(
        "10.{}.{}.{}",
        rng.gen_range(0..=255u8),
        rng.gen_range(0..=255u8),
        rng.gen_range(0..=255u8)
    )
}

fn random_published_port() -> String {
    rand::thread_rng().gen_range(1025..31025u32).to_string()
}

/// Target port and optional published port of one `ports` entry
fn parse_port(entry: &Value) -> Option<(u64, Option<String>)> {
    let digits = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit());
    match entry {
        Value::Number(n) => n.as_u64().map(|t| (t, None)),
        Value::String(s) => {
            let parts: Vec<&str> = s.split(':').collect();
            match parts.as_slice() {
                [target] if digits(target) => Some((target.parse().ok()?, None)),
                [published, target] if digits(published) && digits(target) => {
                    Some((target.parse().ok()?, Some(published.to_string())))
                }
                ["127.0.0.1", published, target] if digits(published) && digits(target) => {
                    Some((target.parse().ok()?, Some(published.to_string())))
                }
                _ => None,
            }
        }
        Value::Mapping(map) => {
            let target = map.get("target")?.as_u64()?;
            let published = map.get("published").and_then(|p| match p {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            });
            Some((target, published))
        }
        _ => None,
    }
}

/// Rewrite every service's ports onto `host_ip`, returning the published
/// ports in declaration order
pub fn rewrite_ports(services: &mut Mapping, host_ip: &str) -> Result<Vec<String>, RunnerError> {
    let mut exposed = Vec::new();
    for (name, service) in services.iter_mut() {
        let name = name.as_str().unwrap_or_default().to_string();
        let Some(service) = service.as_mapping_mut() else {
            continue;
        };
        let Some(ports) = service.get_mut("ports") else {
            continue;
        };
        let ports = match ports.as_sequence_mut() {
            Some(seq) if !seq.is_empty() => seq,
            _ => {
                return Err(RunnerError::InvalidInput(format!(
                    "Invalid ports format in service: {}",
                    name
                )))
            }
        };
        for port in ports.iter_mut() {
            let (target, published) = parse_port(port).ok_or_else(|| {
                RunnerError::InvalidInput(format!("Unknown ports format: {}", name))
            })?;
            let published = published.unwrap_or_else(random_published_port);

            let mut conf = Mapping::new();
            conf.insert("target".into(), Value::from(target));
            conf.insert("host_ip".into(), host_ip.into());
            conf.insert("protocol".into(), "tcp".into());
            conf.insert("published".into(), published.clone().into());
            *port = Value::Mapping(conf);
            exposed.push(published);
        }
    }
    Ok(exposed)
}

/// Point the `/` location at one of the exposed ports; returns whether the
/// location changed
pub fn reconcile_proxy(locations: &mut Vec<Location>, exposed: &[String]) -> Result<bool, RunnerError> {
    let mut changed = false;
    let index = match locations.iter().position(|l| l.path == "/") {
        Some(i) => i,
        None => {
            locations.push(Location {
                path: "/".to_string(),
                ..Default::default()
            });
            changed = true;
            locations.len() - 1
        }
    };
    let location = &mut locations[index];

    let current = location
        .proxy_pass
        .as_deref()
        .and_then(|p| p.strip_prefix(PROXY_PREFIX));
    let valid = current.is_some_and(|port| exposed.iter().any(|e| e == port));
    if !valid {
        let last = exposed.last().ok_or_else(|| {
            RunnerError::InvalidInput(
                "There are no exposed ports! Need atleast one to forward it into NGINX".into(),
            )
        })?;
        location.proxy_pass = Some(format!("{}{}", PROXY_PREFIX, last));
        changed = true;
    }
    Ok(changed)
}

/// Compose files and their reverse-proxy wiring
pub struct ContainerServices {
    gateway: Arc<dyn PrivilegedGateway>,
    locks: ResourceLocks,
    webserver: Arc<dyn WebServerConfig>,
    ports: PortTable,
}

impl ContainerServices {
    pub fn new(
        gateway: Arc<dyn PrivilegedGateway>,
        locks: ResourceLocks,
        webserver: Arc<dyn WebServerConfig>,
    ) -> Self {
        let ports = PortTable::new(gateway.clone(), locks.clone());
        Self {
            gateway,
            locks,
            webserver,
            ports,
        }
    }

    async fn read_compose(&self, path: &str) -> Result<Mapping, RunnerError> {
        let gateway = self.gateway.clone();
        let path = path.to_string();
        let text = self
            .locks
            .with_lock(LOCK_NAME, || async move {
                let out = gateway
                    .invoke(Operation::ComposeGet, &[path], None)
                    .await?
                    .check(Operation::ComposeGet)?;
                Ok(out.stdout)
            })
            .await?;
        match serde_yaml::from_str::<Value>(&text)? {
            Value::Mapping(map) => Ok(map),
            Value::Null => Ok(Mapping::new()),
            _ => Err(RunnerError::InvalidInput(
                "compose file is not a mapping".into(),
            )),
        }
    }

    /// Rewrite and write the compose file for `domain`, returning its text
    pub async fn execute(
        &self,
        spec: &ServicesSpec,
        html_dir: &str,
        domain: &str,
        uid: &str,
    ) -> Result<String, RunnerError> {
        let (path, mut compose) = match spec {
            ServicesSpec::File(file) => {
                let path = format!("{}/{}", html_dir, file);
                let compose = self.read_compose(&path).await?;
                (path, compose)
            }
            ServicesSpec::Inline(services) => {
                let mut compose = Mapping::new();
                compose.insert("services".into(), serde_yaml::to_value(services)?);
                (format!("{}/{}", html_dir, DEFAULT_COMPOSE_FILE), compose)
            }
        };

        let mut site = self.webserver.info(domain).await?;
        let mut site_changed = false;
        let host_ip = match &site.docker_ip {
            Some(ip) => ip.clone(),
            None => {
                let ip = random_private_ip();
                site.docker_ip = Some(ip.clone());
                site_changed = true;
                ip
            }
        };

        let mut services = match compose.remove("services") {
            Some(Value::Mapping(map)) => map,
            _ => Mapping::new(),
        };
        let exposed = rewrite_ports(&mut services, &host_ip)?;
        compose.insert("services".into(), Value::Mapping(services));

        site_changed |= reconcile_proxy(&mut site.config.locations, &exposed)?;
        if site_changed {
            self.webserver.set(domain, &site).await?;
        }
        let status = self.ports.allocate(uid, &exposed).await?;
        info!("{} for {}", status, domain);

        let text = serde_yaml::to_string(&Value::Mapping(compose))?;
        let gateway = self.gateway.clone();
        let body = text.clone();
        self.locks
            .with_lock(LOCK_NAME, || async move {
                gateway
                    .invoke(Operation::ComposeSet, &[path], Some(&body))
                    .await?
                    .check(Operation::ComposeSet)?;
                Ok(())
            })
            .await?;
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn services(yaml: &str) -> Mapping {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_rewrite_port_forms() {
        let mut map = services(
            "web:\n  image: nginx\n  ports:\n    - \"8080\"\n    - \"3000:80\"\n    - \"127.0.0.1:4000:81\"\ndb:\n  image: postgres\n",
        );
        let exposed = rewrite_ports(&mut map, "10.1.2.3").unwrap();
        assert_eq!(exposed.len(), 3);
        assert_eq!(&exposed[1..], &["3000".to_string(), "4000".to_string()]);

        let first: u32 = exposed[0].parse().unwrap();
        assert!((1025..31025).contains(&first));

        let port = &map["web"]["ports"][1];
        assert_eq!(port["target"], Value::from(80u64));
        assert_eq!(port["host_ip"], Value::from("10.1.2.3"));
        assert_eq!(port["protocol"], Value::from("tcp"));
    }

    #[test]
    fn test_rewrite_rejects_unknown_forms() {
        let mut map = services("web:\n  ports:\n    - \"0.0.0.0:80:80\"\n");
        let err = rewrite_ports(&mut map, "10.0.0.1").unwrap_err();
        assert_eq!(err.to_string(), "Invalid input: Unknown ports format: web");

        let mut map = services("web:\n  ports: []\n");
        assert!(rewrite_ports(&mut map, "10.0.0.1").is_err());
    }

    #[test]
    fn test_reconcile_proxy() {
        let mut locations = Vec::new();
        assert!(reconcile_proxy(&mut locations, &["3000".into(), "4000".into()]).unwrap());
        assert_eq!(locations[0].proxy_pass.as_deref(), Some("docker:4000"));

        // already pointing at an exposed port
        assert!(!reconcile_proxy(&mut locations, &["4000".into()]).unwrap());

        let err = reconcile_proxy(&mut locations, &[]).unwrap_err();
        assert!(err.to_string().contains("There are no exposed ports!"));
    }

    #[test]
    fn test_services_spec() {
        let spec = ServicesSpec::from_json(&serde_json::json!("app/compose.yml#main"));
        assert_eq!(spec, ServicesSpec::File("app/compose.yml".into()));
        assert_eq!(spec.compose_flags(), "-f app/compose.yml");
        assert_eq!(spec.sub_dir(), Some("app"));
    }
}
