//! Settings file management

use secrecy::SecretString;
use serde::{Deserialize, Deserializer, Serialize};

use crate::errors::RunnerError;
use crate::filesys::file::File;
use crate::logs::LogLevel;

/// Environment variable overriding the API secret
pub const SECRET_ENV: &str = "SECRET";

/// Runner settings
#[derive(Debug, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit operator logs as JSON
    #[serde(default)]
    pub json_logs: bool,

    /// HTTP listener configuration
    #[serde(default)]
    pub server: ServerSettings,

    /// Bearer token expected on the submission API
    #[serde(default, deserialize_with = "deserialize_secret")]
    pub secret: Option<SecretString>,

    /// Peer addresses allowed to submit jobs, any when empty
    #[serde(default)]
    pub allow_ips: Vec<String>,

    /// Whether the server runs persistently
    #[serde(default = "default_true")]
    pub is_persistent: bool,

    /// Idle timeout in seconds for non-persistent servers
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Argv prefix used to reach the privileged helper
    #[serde(default = "default_helper_command")]
    pub helper_command: Vec<String>,

    /// Prompt flavour printed by the hosting shell
    #[serde(default)]
    pub prompt_style: PromptStyle,

    /// Ceiling for a whole deployment run in seconds
    #[serde(default = "default_max_execution")]
    pub max_execution_secs: u64,

    /// Callback delivery configuration
    #[serde(default)]
    pub callback: CallbackSettings,

    /// Resource lock retry configuration
    #[serde(default)]
    pub lock: LockSettings,

    /// Version catalog file, defaults to `<base>/catalog.json`
    #[serde(default)]
    pub catalog_file: Option<String>,

    /// Wildcard certificates subdomains may share
    #[serde(default)]
    pub shared_certificates: Vec<SharedCertificate>,

    /// Log shell commands instead of running them
    #[serde(default)]
    pub dry_shell: bool,
}

fn default_true() -> bool {
    true
}

fn default_idle_timeout() -> u64 {
    3600
}

fn default_helper_command() -> Vec<String> {
    vec![
        "sudo".to_string(),
        "/usr/local/lib/hostrunner/helper".to_string(),
    ]
}

fn default_max_execution() -> u64 {
    900
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.is_empty()).map(SecretString::from))
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            json_logs: false,
            server: ServerSettings::default(),
            secret: None,
            allow_ips: Vec::new(),
            is_persistent: true,
            idle_timeout_secs: default_idle_timeout(),
            helper_command: default_helper_command(),
            prompt_style: PromptStyle::default(),
            max_execution_secs: default_max_execution(),
            callback: CallbackSettings::default(),
            lock: LockSettings::default(),
            catalog_file: None,
            shared_certificates: Vec::new(),
            dry_shell: false,
        }
    }
}

impl Settings {
    /// Load settings from `file`, falling back to defaults when it is missing,
    /// then apply environment overrides
    pub async fn load(file: &File) -> Result<Self, RunnerError> {
        let mut settings = if file.exists().await {
            file.read_json::<Settings>().await?
        } else {
            tracing::warn!(
                "Settings file {} not found, using defaults",
                file.path().display()
            );
            Settings::default()
        };
        settings.apply_env(|key| std::env::var(key).ok());
        Ok(settings)
    }

    /// Apply overrides looked up through `lookup`
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(secret) = lookup(SECRET_ENV).filter(|s| !s.is_empty()) {
            self.secret = Some(SecretString::from(secret));
        }
    }
}

/// HTTP listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    2223
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Shell prompt flavour
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptStyle {
    /// `[user@host dir]$`
    #[default]
    #[serde(alias = "rhel")]
    Redhat,
    /// `user@host:dir$`
    Debian,
}

/// Callback delivery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackSettings {
    /// Seconds between partial pushes
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// Largest final payload in bytes before the head is cut
    #[serde(default = "default_max_payload")]
    pub max_payload_bytes: usize,

    /// Request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub timeout_secs: u64,
}

fn default_interval() -> u64 {
    5
}

fn default_max_payload() -> usize {
    65535
}

fn default_request_timeout() -> u64 {
    30
}

impl Default for CallbackSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
            max_payload_bytes: default_max_payload(),
            timeout_secs: default_request_timeout(),
        }
    }
}

/// Resource lock settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockSettings {
    #[serde(default = "default_lock_retries")]
    pub retries: u32,

    #[serde(default = "default_lock_base_delay")]
    pub base_delay_ms: u64,

    #[serde(default = "default_lock_max_delay")]
    pub max_delay_ms: u64,

    /// Age after which a lock whose owner is gone may be broken
    #[serde(default = "default_lock_stale")]
    pub stale_secs: u64,
}

fn default_lock_retries() -> u32 {
    40
}

fn default_lock_base_delay() -> u64 {
    50
}

fn default_lock_max_delay() -> u64 {
    1000
}

fn default_lock_stale() -> u64 {
    600
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            retries: default_lock_retries(),
            base_delay_ms: default_lock_base_delay(),
            max_delay_ms: default_lock_max_delay(),
            stale_secs: default_lock_stale(),
        }
    }
}

/// A wildcard certificate shared by every direct subdomain of `domain`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedCertificate {
    pub domain: String,
    pub id: String,
    pub path: String,
}
