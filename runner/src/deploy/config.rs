//! Deployment configuration model.
//!
//! The body of a job is a loosely typed JSON tree; it is turned into these
//! types once, up front, so unknown directive keys are rejected before any
//! host state is touched.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};

use crate::collab::unit::AppConfig;
use crate::errors::RunnerError;
use crate::utils::split_limit;

/// Language runtimes with install/uninstall recipes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Runtime {
    Python,
    Node,
    Deno,
    Go,
    Rust,
    Ruby,
    Bun,
    Zig,
    Dotnet,
    Java,
}

impl Runtime {
    /// Name used in log lines
    pub fn display_name(&self) -> &'static str {
        match self {
            Runtime::Python => "Python",
            Runtime::Node => "Node",
            Runtime::Deno => "Deno",
            Runtime::Go => "Golang",
            Runtime::Rust => "Rust",
            Runtime::Ruby => "Ruby",
            Runtime::Bun => "Bun",
            Runtime::Zig => "Zig",
            Runtime::Dotnet => "Dotnet",
            Runtime::Java => "Java",
        }
    }
}

/// Database engines managed through the panel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DbEngine {
    Mysql,
    Postgres,
}

impl DbEngine {
    /// Panel feature and database type name
    pub fn feature(&self) -> &'static str {
        match self {
            DbEngine::Mysql => "mysql",
            DbEngine::Postgres => "postgres",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            DbEngine::Mysql => "MySQL",
            DbEngine::Postgres => "PostgreSQL",
        }
    }

    /// Shell variable receiving the database password
    pub fn password_var(&self) -> &'static str {
        match self {
            DbEngine::Mysql => "MYPASSWD",
            DbEngine::Postgres => "PGPASSWD",
        }
    }
}

/// Every directive key the pipeline understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DirectiveKind {
    Create,
    Modify,
    Rename,
    Enable,
    Disable,
    Backup,
    Restore,
    Delete,
    Database(DbEngine),
    Dns,
    Firewall,
    Php,
    Http,
    Www,
    Ssl,
    Root,
    Docker,
    Runtime(Runtime),
}

impl DirectiveKind {
    /// Domain lifecycle verbs
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            DirectiveKind::Create
                | DirectiveKind::Modify
                | DirectiveKind::Rename
                | DirectiveKind::Enable
                | DirectiveKind::Disable
                | DirectiveKind::Backup
                | DirectiveKind::Restore
                | DirectiveKind::Delete
        )
    }

    /// Directives that act on the hosting account as a whole rather than on
    /// one web scope
    pub fn is_account_level(&self) -> bool {
        self.is_lifecycle()
            || matches!(
                self,
                DirectiveKind::Firewall | DirectiveKind::Docker | DirectiveKind::Runtime(_)
            )
    }
}

impl FromStr for DirectiveKind {
    type Err = RunnerError;

    fn from_str(key: &str) -> Result<Self, Self::Err> {
        Ok(match key {
            "create" => DirectiveKind::Create,
            "modify" => DirectiveKind::Modify,
            "rename" => DirectiveKind::Rename,
            "enable" => DirectiveKind::Enable,
            "disable" => DirectiveKind::Disable,
            "backup" => DirectiveKind::Backup,
            "restore" => DirectiveKind::Restore,
            "delete" => DirectiveKind::Delete,
            "mysql" | "mariadb" => DirectiveKind::Database(DbEngine::Mysql),
            "postgres" | "postgresql" => DirectiveKind::Database(DbEngine::Postgres),
            "dns" => DirectiveKind::Dns,
            "firewall" => DirectiveKind::Firewall,
            "php" => DirectiveKind::Php,
            "http" => DirectiveKind::Http,
            "www" => DirectiveKind::Www,
            "ssl" => DirectiveKind::Ssl,
            "root" => DirectiveKind::Root,
            "docker" | "podman" => DirectiveKind::Docker,
            "python" => DirectiveKind::Runtime(Runtime::Python),
            "node" => DirectiveKind::Runtime(Runtime::Node),
            "deno" => DirectiveKind::Runtime(Runtime::Deno),
            "go" | "golang" => DirectiveKind::Runtime(Runtime::Go),
            "rust" | "rustlang" => DirectiveKind::Runtime(Runtime::Rust),
            "ruby" => DirectiveKind::Runtime(Runtime::Ruby),
            "bun" => DirectiveKind::Runtime(Runtime::Bun),
            "zig" => DirectiveKind::Runtime(Runtime::Zig),
            "dotnet" => DirectiveKind::Runtime(Runtime::Dotnet),
            "java" | "jdk" => DirectiveKind::Runtime(Runtime::Java),
            other => {
                return Err(RunnerError::InvalidInput(format!(
                    "Unknown feature '{}'",
                    other
                )))
            }
        })
    }
}

/// One feature directive with its value.
///
/// Written either as `"key value"` or as a single-key object `{key: value}`.
#[derive(Debug, Clone, PartialEq)]
pub struct Directive {
    pub kind: DirectiveKind,
    pub key: String,
    pub value: Value,
}

impl Directive {
    pub fn parse(raw: &Value) -> Result<Self, RunnerError> {
        match raw {
            Value::String(s) => {
                let mut parts = split_limit(s.trim(), ' ', 2).into_iter();
                let key = parts.next().unwrap_or_default();
                let value = parts.next().unwrap_or_default();
                Ok(Self {
                    kind: key.parse()?,
                    key,
                    value: Value::String(value),
                })
            }
            Value::Object(map) if map.len() == 1 => {
                let (key, value) = map.iter().next().ok_or_else(|| {
                    RunnerError::InvalidInput("Empty feature object".to_string())
                })?;
                Ok(Self {
                    kind: key.parse()?,
                    key: key.clone(),
                    value: value.clone(),
                })
            }
            other => Err(RunnerError::InvalidInput(format!(
                "Feature must be a string or a single-key object, got {}",
                other
            ))),
        }
    }

    /// String value, empty for structured values
    pub fn text(&self) -> &str {
        self.value.as_str().unwrap_or_default().trim()
    }

    pub fn is_ssl(&self) -> bool {
        self.kind == DirectiveKind::Ssl
    }
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Value::String(s) if s.is_empty() => write!(f, "{}", self.key),
            Value::String(s) => write!(f, "{} {}", self.key, s),
            other => write!(f, "{} {}", self.key, other),
        }
    }
}

impl<'de> Deserialize<'de> for Directive {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Value::deserialize(deserializer)?;
        Directive::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// GitHub deploy key pair
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct GithubCredentials {
    #[serde(default)]
    pub ssh: Option<String>,

    #[serde(default, rename = "sshPub")]
    pub ssh_pub: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SourceCredentials {
    #[serde(default)]
    pub github: Option<GithubCredentials>,
}

/// Where the site's files come from
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SourceSpec {
    /// Repository or archive URL, or `clear`
    pub url: String,

    /// `clone` or `extract`; anything else is inferred from the URL
    #[serde(default, rename = "type")]
    pub kind: Option<String>,

    #[serde(default)]
    pub branch: Option<String>,

    #[serde(default)]
    pub directory: Option<String>,

    /// `blobless` (default), `treeless` or `shallow`
    #[serde(default)]
    pub depth: Option<String>,

    #[serde(default)]
    pub shallow: bool,

    #[serde(default)]
    pub submodules: bool,

    #[serde(default)]
    pub credentials: Option<SourceCredentials>,

    #[serde(default)]
    pub rootlesskit: bool,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SourceField {
    Url(String),
    Spec(SourceSpec),
}

fn deserialize_source<'de, D>(deserializer: D) -> Result<Option<SourceSpec>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(
        Option::<SourceField>::deserialize(deserializer)?.map(|field| match field {
            SourceField::Url(url) => SourceSpec {
                url,
                ..Default::default()
            },
            SourceField::Spec(spec) => spec,
        }),
    )
}

fn default_true() -> bool {
    true
}

/// One entry of `commands`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Command {
    Shell(String),
    Exec {
        command: String,
        #[serde(default = "default_true")]
        write: bool,
    },
    Feature {
        feature: Directive,
    },
    WriteFile {
        filename: String,
        content: String,
    },
    Services {
        services: Value,
    },
}

/// Declarative deployment for one domain and optionally its subdomains
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DeploymentConfig {
    #[serde(default)]
    pub features: Vec<Directive>,

    #[serde(default)]
    pub commands: Option<Vec<Command>>,

    #[serde(default, deserialize_with = "deserialize_source")]
    pub source: Option<SourceSpec>,

    #[serde(default)]
    pub envs: Map<String, Value>,

    /// Run this configuration against `<subdomain>.<domain>` instead
    #[serde(default)]
    pub subdomain: Option<String>,

    #[serde(default)]
    pub subdomains: Vec<DeploymentConfig>,

    #[serde(default)]
    pub nginx: Option<Value>,

    #[serde(default)]
    pub unit: Option<AppConfig>,

    #[serde(default)]
    pub services: Option<Value>,

    #[serde(default)]
    pub directory: Option<String>,

    #[serde(default)]
    pub root: Option<String>,
}

impl DeploymentConfig {
    pub fn from_value(value: Value) -> Result<Self, RunnerError> {
        let value = match value {
            Value::Null => Value::Object(Default::default()),
            other => other,
        };
        let mut config: DeploymentConfig = serde_json::from_value(value)
            .map_err(|e| RunnerError::InvalidInput(e.to_string()))?;
        config.normalize();
        Ok(config)
    }

    /// Fold shorthands into their canonical places
    pub fn normalize(&mut self) {
        if let (Some(dir), Some(source)) = (self.directory.take(), self.source.as_mut()) {
            if source.directory.is_none() {
                source.directory = Some(dir);
            }
        }

        let nginx_root = self
            .nginx
            .as_mut()
            .and_then(Value::as_object_mut)
            .and_then(|nginx| nginx.remove("root"));
        let root = match nginx_root {
            Some(Value::String(root)) => Some(root),
            _ => self.root.take(),
        };
        if let Some(root) = root {
            self.features.push(Directive {
                kind: DirectiveKind::Root,
                key: "root".to_string(),
                value: Value::String(root),
            });
        }

        for sub in &mut self.subdomains {
            sub.normalize();
        }
    }

    /// Features that run in order, SSL excluded
    pub fn ordered_features(&self) -> impl Iterator<Item = &Directive> {
        self.features.iter().filter(|d| !d.is_ssl())
    }

    /// SSL features, which always run last
    pub fn deferred_features(&self) -> impl Iterator<Item = &Directive> {
        self.features.iter().filter(|d| d.is_ssl())
    }

    /// `create` as first feature starts a new domain
    pub fn create_request(&self) -> Option<&Directive> {
        self.features
            .first()
            .filter(|d| d.kind == DirectiveKind::Create)
    }

    /// Whether this scope touches the web root from the shell
    pub fn uses_web_root(&self) -> bool {
        self.source.is_some() || self.commands.is_some() || self.services.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_directive_forms() {
        let d = Directive::parse(&json!("php 8.3")).unwrap();
        assert_eq!(d.kind, DirectiveKind::Php);
        assert_eq!(d.text(), "8.3");

        let d = Directive::parse(&json!("mariadb")).unwrap();
        assert_eq!(d.kind, DirectiveKind::Database(DbEngine::Mysql));
        assert_eq!(d.text(), "");

        let d = Directive::parse(&json!({"create": {"user": "alice"}})).unwrap();
        assert_eq!(d.kind, DirectiveKind::Create);
        assert_eq!(d.value["user"], json!("alice"));

        let d = Directive::parse(&json!("jdk 21")).unwrap();
        assert_eq!(d.kind, DirectiveKind::Runtime(Runtime::Java));
    }

    #[test]
    fn test_unknown_directive_rejected() {
        let err = Directive::parse(&json!("teleport on")).unwrap_err();
        assert_eq!(err.to_string(), "Invalid input: Unknown feature 'teleport'");
        assert!(Directive::parse(&json!({"php": "8.3", "ssl": "on"})).is_err());

        let err = DeploymentConfig::from_value(json!({"features": ["php 8.3", "bogus"]}));
        assert!(err.unwrap_err().to_string().contains("Unknown feature 'bogus'"));
    }

    #[test]
    fn test_config_shorthands() {
        let config = DeploymentConfig::from_value(json!({
            "source": "https://github.com/org/repo",
            "directory": "main",
            "nginx": {"root": "public_html/public", "locations": []},
            "features": ["ssl", "php 8.3"],
        }))
        .unwrap();

        let source = config.source.as_ref().unwrap();
        assert_eq!(source.url, "https://github.com/org/repo");
        assert_eq!(source.directory.as_deref(), Some("main"));
        assert!(config.directory.is_none());
        assert!(config.nginx.as_ref().unwrap().get("root").is_none());

        let last = config.features.last().unwrap();
        assert_eq!(last.kind, DirectiveKind::Root);
        assert_eq!(last.text(), "public_html/public");

        let ordered: Vec<_> = config.ordered_features().map(|d| d.kind).collect();
        assert_eq!(ordered, vec![DirectiveKind::Php, DirectiveKind::Root]);
        assert_eq!(config.deferred_features().count(), 1);
    }

    #[test]
    fn test_commands() {
        let config = DeploymentConfig::from_value(json!({
            "commands": [
                "npm ci",
                {"command": "cat .env", "write": false},
                {"feature": "node 20"},
                {"filename": ".env", "content": "A=1"},
                {"services": "compose.yml"},
            ]
        }))
        .unwrap();
        let commands = config.commands.unwrap();
        assert_eq!(commands[0], Command::Shell("npm ci".into()));
        assert_eq!(
            commands[1],
            Command::Exec {
                command: "cat .env".into(),
                write: false
            }
        );
        assert!(matches!(&commands[2], Command::Feature { feature } if feature.kind == DirectiveKind::Runtime(Runtime::Node)));
        assert!(matches!(&commands[3], Command::WriteFile { filename, .. } if filename == ".env"));
        assert!(matches!(&commands[4], Command::Services { .. }));
    }
}
