//! Deployment jobs: submission payload, detached launch and log delivery.

pub mod callback;
pub mod controller;
pub mod launcher;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::deploy::Deployer;
use crate::errors::RunnerError;
use crate::storage::settings::CallbackSettings;

pub use callback::CallbackClient;
pub use controller::{run_job, JobOptions, JobOutcome};
pub use launcher::{JobLauncher, ProcessLauncher};

/// Environment variable carrying the job payload into the child process
pub const JOB_ENV: &str = "HOSTRUNNER_JOB";

/// One submitted deployment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    #[serde(default)]
    pub body: Value,
    pub domain: String,
    #[serde(default)]
    pub sandbox: bool,
    #[serde(default)]
    pub callback: Option<String>,
}

impl JobRequest {
    /// Parse a payload as found in [`JOB_ENV`]
    pub fn from_payload(raw: &str) -> Result<Self, RunnerError> {
        let job: JobRequest = serde_json::from_str(raw)?;
        if job.domain.trim().is_empty() {
            return Err(RunnerError::InvalidInput("domain is required".to_string()));
        }
        Ok(job)
    }

    /// Read and clear the payload handed over by the launcher
    pub fn take_from_env() -> Result<Self, RunnerError> {
        let raw = std::env::var(JOB_ENV)
            .map_err(|_| RunnerError::ConfigError(format!("{} is not set", JOB_ENV)))?;
        std::env::remove_var(JOB_ENV);
        Self::from_payload(&raw)
    }
}

/// Run `job` to completion in this process
pub async fn execute(
    job: JobRequest,
    deployer: &Deployer,
    settings: &CallbackSettings,
) -> JobOutcome {
    let callback = job
        .callback
        .as_deref()
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .and_then(
            |url| match CallbackClient::new(url, Duration::from_secs(settings.timeout_secs)) {
                Ok(client) => Some(client),
                Err(e) => {
                    warn!("Ignoring callback: {}", e);
                    None
                }
            },
        );

    let JobRequest {
        body,
        domain,
        sandbox,
        ..
    } = job;
    run_job(&JobOptions::from(settings), callback, |log| async move {
        deployer.run(body, &domain, sandbox, &log).await
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_payload_roundtrip_defaults() {
        let job = JobRequest::from_payload(r#"{"domain": "example.com"}"#).unwrap();
        assert_eq!(job.body, Value::Null);
        assert!(!job.sandbox);
        assert!(job.callback.is_none());

        let job = JobRequest::from_payload(
            &json!({"body": {"features": ["php 8.3"]}, "domain": "a.example.com", "sandbox": true, "callback": "https://cb.example.com/x"})
                .to_string(),
        )
        .unwrap();
        assert_eq!(job.body["features"][0], "php 8.3");
        assert_eq!(job.callback.as_deref(), Some("https://cb.example.com/x"));
    }

    #[test]
    fn test_payload_rejects_garbage() {
        assert!(JobRequest::from_payload("not json").is_err());
        assert!(JobRequest::from_payload(r#"{"domain": " "}"#).is_err());
        assert!(JobRequest::from_payload(r#"{"body": {}}"#).is_err());
    }
}
