//! Error types for the deployment runner

use thiserror::Error;

/// Exit code reported when the global execution ceiling is reached
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Main error type for the deployment runner
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Lock timeout: resource '{resource}' still busy after {attempts} attempts")]
    LockTimeout { resource: String, attempts: u32 },

    #[error("Shell has terminated{}", exit_suffix(.code))]
    SessionTerminated { code: Option<i32> },

    #[error("Execution took more than {secs}s (exit code {code})")]
    Timeout { secs: u64, code: i32 },

    #[error("No {runtime} with version {requested} is available to install")]
    UnknownVersion { runtime: String, requested: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("{operation} failed with exit code {code}")]
    CommandFailed {
        operation: String,
        code: i32,
        stdout: String,
        stderr: String,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

fn exit_suffix(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!(" (exit code {})", code),
        None => String::new(),
    }
}

impl RunnerError {
    /// The process exit code carried by this error, if any
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            RunnerError::Timeout { code, .. } => Some(*code),
            RunnerError::CommandFailed { code, .. } => Some(*code),
            RunnerError::SessionTerminated { code } => *code,
            _ => None,
        }
    }

    /// Shorthand for a timeout carrying the standard sentinel code
    pub fn timeout(secs: u64) -> Self {
        RunnerError::Timeout {
            secs,
            code: TIMEOUT_EXIT_CODE,
        }
    }
}

impl From<anyhow::Error> for RunnerError {
    fn from(err: anyhow::Error) -> Self {
        RunnerError::Internal(format!("{err:#}"))
    }
}
