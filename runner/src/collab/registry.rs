//! Domain registry backed by the hosting panel's command line.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::errors::RunnerError;
use crate::gateway::{OpOutput, Operation, PrivilegedGateway};
use crate::output::LogWriter;

/// Named string fields of one virtual server
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainRecord {
    pub name: String,
    fields: BTreeMap<String, String>,
}

impl DomainRecord {
    pub fn new(name: impl Into<String>, fields: BTreeMap<String, String>) -> Self {
        Self {
            name: name.into(),
            fields,
        }
    }

    /// Field value, `None` when absent or empty
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.fields.insert(key.to_string(), value.into());
    }

    pub fn remove(&mut self, key: &str) {
        self.fields.remove(key);
    }

    pub fn username(&self) -> &str {
        self.get("Username").unwrap_or_default()
    }

    pub fn uid(&self) -> &str {
        self.get("User ID").unwrap_or_default()
    }

    pub fn id(&self) -> &str {
        self.get("ID").unwrap_or_default()
    }

    pub fn home_dir(&self) -> &str {
        self.get("Home directory").unwrap_or_default()
    }

    pub fn html_dir(&self) -> &str {
        self.get("HTML directory").unwrap_or_default()
    }

    pub fn parent_domain(&self) -> Option<&str> {
        self.get("Parent domain")
    }

    pub fn features(&self) -> impl Iterator<Item = &str> {
        self.get("Features").unwrap_or_default().split_whitespace()
    }

    pub fn has_feature(&self, feature: &str) -> bool {
        self.features().any(|f| f == feature)
    }

    pub fn add_feature(&mut self, feature: &str) {
        if self.has_feature(feature) {
            return;
        }
        let mut list: Vec<&str> = self.features().collect();
        list.push(feature);
        let joined = list.join(" ");
        self.set("Features", joined);
    }

    pub fn remove_feature(&mut self, feature: &str) {
        let joined = self
            .features()
            .filter(|f| *f != feature)
            .collect::<Vec<_>>()
            .join(" ");
        self.set("Features", joined);
    }

    pub fn php_mode(&self) -> &str {
        self.get("PHP execution mode").unwrap_or("none")
    }

    /// Certificate file, preferring the bundle that includes the CA chain
    pub fn ssl_cert_file(&self) -> Option<&str> {
        self.get("SSL cert and CA file")
            .or_else(|| self.get("SSL cert file"))
    }

    pub fn ssl_key_file(&self) -> Option<&str> {
        self.get("SSL key file")
    }

    pub fn ssl_shared_with(&self) -> Option<&str> {
        self.get("SSL shared with")
    }

    pub fn ssl_candidate_hostnames(&self) -> Option<&str> {
        self.get("SSL candidate hostnames")
    }

    pub fn letsencrypt_renewal(&self) -> bool {
        self.get("Lets Encrypt renewal") == Some("Enabled")
    }

    /// Certificate expiry; the panel prints either RFC 3339 or
    /// `Mon Jan  2 15:04:05 2006`
    pub fn ssl_expiry(&self) -> Option<DateTime<Utc>> {
        let raw = self.get("SSL cert expiry")?;
        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return Some(dt.with_timezone(&Utc));
        }
        for format in ["%a %b %e %H:%M:%S %Y", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"] {
            if let Ok(dt) = NaiveDateTime::parse_from_str(raw, format) {
                return Some(dt.and_utc());
            }
        }
        warn!("Unparseable SSL expiry {:?} for {}", raw, self.name);
        None
    }

    pub fn password(&self, service: &str) -> Option<&str> {
        self.get(&format!("Password for {}", service))
    }
}

/// Parse `list-domains --simple-multiline` output.
///
/// Unindented lines name a domain, indented `Key: value` lines belong to the
/// last named domain.
pub fn parse_domain_list(stdout: &str) -> BTreeMap<String, DomainRecord> {
    let mut records = BTreeMap::new();
    let mut current: Option<DomainRecord> = None;

    for line in stdout.lines().map(str::trim_end) {
        if line.trim().is_empty() {
            continue;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            if let (Some(record), Some((key, value))) = (current.as_mut(), line.split_once(':')) {
                record.set(key.trim(), value.trim_start());
            }
        } else {
            if let Some(record) = current.take() {
                records.insert(record.name.clone(), record);
            }
            current = Some(DomainRecord::new(line, BTreeMap::new()));
        }
    }
    if let Some(record) = current {
        records.insert(record.name.clone(), record);
    }
    records
}

/// Flatten JSON option objects into panel flags.
///
/// Later objects override earlier ones. `true` becomes `--key`, strings and
/// numbers become `--key value`; false, null, empty and zero are skipped.
pub fn panel_args(options: &[&Value]) -> Vec<String> {
    let mut merged = Map::new();
    for option in options {
        if let Value::Object(map) = option {
            for (k, v) in map {
                merged.insert(k.clone(), v.clone());
            }
        }
    }

    let mut args = Vec::new();
    for (key, value) in merged {
        let flag = format!("--{}", key);
        match value {
            Value::Bool(true) => args.push(flag),
            Value::String(s) if !s.is_empty() => {
                args.push(flag);
                args.push(s);
            }
            Value::Number(n) if n.as_f64() != Some(0.0) => {
                args.push(flag);
                args.push(n.to_string());
            }
            Value::Array(_) | Value::Object(_) => {
                args.push(flag);
                args.push(value.to_string());
            }
            _ => {}
        }
    }
    args
}

/// Domain-management interface
#[async_trait]
pub trait DomainRegistry: Send + Sync {
    /// Record for `domain`, `None` when it does not exist
    async fn domain_info(&self, domain: &str) -> Result<Option<DomainRecord>, RunnerError>;

    /// Run a panel program with flags built by [`panel_args`], streaming its
    /// output into the deployment log. Non-zero exit is an error.
    async fn execute(
        &self,
        program: &str,
        options: &[&Value],
        log: &LogWriter,
    ) -> Result<(), RunnerError>;

    /// Rewrite raw server settings (certificate sharing links)
    async fn push_server_config(
        &self,
        id: &str,
        config: &BTreeMap<String, String>,
    ) -> Result<String, RunnerError>;
}

/// Registry reached through the `VIRTUALMIN` privileged operation
pub struct PanelRegistry {
    gateway: Arc<dyn PrivilegedGateway>,
}

impl PanelRegistry {
    pub fn new(gateway: Arc<dyn PrivilegedGateway>) -> Self {
        Self { gateway }
    }

    async fn run(&self, program: &str, args: Vec<String>) -> Result<OpOutput, RunnerError> {
        let mut argv = vec![program.to_string()];
        argv.extend(args);
        let mut out = self
            .gateway
            .invoke(Operation::Virtualmin, &argv, None)
            .await?;
        // the panel pads its output with blank lines
        out.stdout = strip_blank_lines(&out.stdout);
        out.stderr = strip_blank_lines(&out.stderr);
        Ok(out)
    }
}

fn strip_blank_lines(text: &str) -> String {
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| format!("{}\n", l))
        .collect()
}

#[async_trait]
impl DomainRegistry for PanelRegistry {
    async fn domain_info(&self, domain: &str) -> Result<Option<DomainRecord>, RunnerError> {
        let out = self
            .run(
                "list-domains",
                vec![
                    "--domain".to_string(),
                    domain.to_string(),
                    "--simple-multiline".to_string(),
                ],
            )
            .await?;
        if !out.success() {
            debug!("list-domains {} exited with {}", domain, out.code);
            return Ok(None);
        }
        Ok(parse_domain_list(&out.stdout).remove(domain))
    }

    async fn execute(
        &self,
        program: &str,
        options: &[&Value],
        log: &LogWriter,
    ) -> Result<(), RunnerError> {
        let out = self.run(program, panel_args(options)).await?;
        if !out.stdout.is_empty() {
            log.write(out.stdout.clone());
        }
        if !out.stderr.is_empty() {
            log.write(
                out.stderr
                    .lines()
                    .map(|l| format!("! {}\n", l))
                    .collect::<String>(),
            );
        }
        log.line(format!("Exit status: {}\n", out.code));
        out.check(format!("virtualmin {}", program)).map(|_| ())
    }

    async fn push_server_config(
        &self,
        id: &str,
        config: &BTreeMap<String, String>,
    ) -> Result<String, RunnerError> {
        let body = serde_json::to_string(config)?;
        let out = self
            .gateway
            .invoke(Operation::PushServerConfig, &[id.to_string()], Some(&body))
            .await?
            .check(Operation::PushServerConfig)?;
        let status = out.stdout.trim();
        Ok(if status.is_empty() {
            format!("Server {} config updated", id)
        } else {
            status.to_string()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::testing::FakeGateway;
    use crate::output;
    use serde_json::json;

    const LISTING: &str = "example.com\n    ID: 1690000000\n    Username: alice\n    User ID: 1001\n    Home directory: /home/alice\n    HTML directory: /home/alice/public_html\n    Features: unix dir mysql web ssl\n    SSL cert expiry: 2030-01-01T00:00:00Z\n\nsub.example.com\n    Parent domain: example.com\n    Features: web\n";

    #[test]
    fn test_parse_domain_list() {
        let records = parse_domain_list(LISTING);
        assert_eq!(records.len(), 2);

        let root = &records["example.com"];
        assert_eq!(root.username(), "alice");
        assert_eq!(root.uid(), "1001");
        assert_eq!(root.html_dir(), "/home/alice/public_html");
        assert!(root.has_feature("mysql"));
        assert!(!root.has_feature("postgres"));
        assert!(root.ssl_expiry().is_some());

        let sub = &records["sub.example.com"];
        assert_eq!(sub.parent_domain(), Some("example.com"));
        assert_eq!(sub.php_mode(), "none");
    }

    #[test]
    fn test_feature_edits() {
        let mut record = parse_domain_list(LISTING).remove("example.com").unwrap();
        record.remove_feature("mysql");
        record.add_feature("dns");
        record.add_feature("dns");
        assert_eq!(record.get("Features"), Some("unix dir web ssl dns"));
    }

    #[test]
    fn test_panel_args() {
        let user = json!({"pass": "secret", "webmin": false, "limits": 0});
        let fixed = json!({"domain": "example.com", "dir": true});
        let args = panel_args(&[&user, &fixed]);
        assert_eq!(args.len(), 5);
        assert!(args.contains(&"--dir".to_string()));
        assert!(args.windows(2).any(|w| w == ["--domain", "example.com"]));
        assert!(args.windows(2).any(|w| w == ["--pass", "secret"]));

        // fixed flags win over user supplied ones
        let user = json!({"domain": "evil.com"});
        let args = panel_args(&[&user, &fixed]);
        assert!(args.contains(&"example.com".to_string()));
        assert!(!args.contains(&"evil.com".to_string()));
    }

    #[tokio::test]
    async fn test_execute_logs_streams() {
        let gateway = Arc::new(FakeGateway::default());
        gateway.reply(
            Operation::Virtualmin,
            OpOutput {
                code: 1,
                stdout: "Creating database..\n\n".into(),
                stderr: "already exists\n".into(),
            },
        );
        let registry = PanelRegistry::new(gateway.clone());
        let (log, mut rx) = output::channel();

        let err = registry
            .execute("create-database", &[&json!({"name": "alice_db"})], &log)
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::CommandFailed { code: 1, .. }));

        drop(log);
        let mut logged = String::new();
        while let Some(chunk) = rx.recv().await {
            logged.push_str(&chunk);
        }
        assert_eq!(
            logged,
            "Creating database..\n! already exists\nExit status: 1\n\n"
        );
        let calls = gateway.calls_of(Operation::Virtualmin);
        assert_eq!(calls[0].args, vec!["create-database", "--name", "alice_db"]);
    }

    #[tokio::test]
    async fn test_domain_info_missing() {
        let gateway = Arc::new(FakeGateway::default());
        gateway.reply(
            Operation::Virtualmin,
            OpOutput {
                code: 255,
                ..Default::default()
            },
        );
        let registry = PanelRegistry::new(gateway);
        assert!(registry.domain_info("nope.com").await.unwrap().is_none());
    }
}
