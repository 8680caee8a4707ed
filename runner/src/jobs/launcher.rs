//! Detached job processes.
//!
//! The API process hands a job to a fresh `hostrunner --job` process through
//! the `HOSTRUNNER_JOB` environment variable, so deployments outlive the
//! request that started them.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use crate::errors::RunnerError;
use crate::jobs::{JobRequest, JOB_ENV};
use crate::storage::layout::StorageLayout;

/// Starts jobs somewhere other than the calling task
#[async_trait]
pub trait JobLauncher: Send + Sync {
    async fn launch(&self, job: &JobRequest) -> Result<(), RunnerError>;
}

/// Launches each job as a detached child process of the current executable
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<String>,
    layout: StorageLayout,
}

impl ProcessLauncher {
    /// Re-run the current executable, forwarding `args` after `--job`
    pub fn current(layout: StorageLayout, args: Vec<String>) -> Result<Self, RunnerError> {
        let program = std::env::current_exe()?;
        Ok(Self::new(program, args, layout))
    }

    pub fn new(program: impl Into<PathBuf>, args: Vec<String>, layout: StorageLayout) -> Self {
        Self {
            program: program.into(),
            args,
            layout,
        }
    }
}

#[async_trait]
impl JobLauncher for ProcessLauncher {
    async fn launch(&self, job: &JobRequest) -> Result<(), RunnerError> {
        let payload = serde_json::to_string(job)?;

        self.layout.logs_dir().create().await?;
        let log_file = self.layout.job_log_file(Utc::now().date_naive());
        let stdout = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file.path())?;
        let stderr = stdout.try_clone()?;

        let mut command = tokio::process::Command::new(&self.program);
        command
            .arg("--job")
            .args(&self.args)
            .env(JOB_ENV, payload)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn()?;
        let pid = child.id();
        info!("Launched job for {} as pid {:?}", job.domain, pid);

        // reap the child so it never lingers as a zombie
        let domain = job.domain.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => info!("Job for {} (pid {:?}) exited with {}", domain, pid, status),
                Err(e) => warn!("Failed to wait for job of {}: {}", domain, e),
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::os::unix::fs::PermissionsExt;

    #[tokio::test]
    async fn test_launch_passes_payload_and_appends_output() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(dir.path().join("base"));
        let script = dir.path().join("fake-runner.sh");
        std::fs::write(&script, "#!/bin/sh\necho \"$1 $2 $HOSTRUNNER_JOB\"\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let launcher = ProcessLauncher::new(&script, vec!["--base-dir=/srv".into()], layout.clone());
        let job = JobRequest {
            body: json!({"features": []}),
            domain: "example.com".into(),
            sandbox: true,
            callback: None,
        };
        launcher.launch(&job).await.unwrap();

        let log_file = layout.job_log_file(Utc::now().date_naive());
        let mut contents = String::new();
        for _ in 0..100 {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            contents = tokio::fs::read_to_string(log_file.path())
                .await
                .unwrap_or_default();
            if contents.ends_with('\n') {
                break;
            }
        }
        assert!(contents.starts_with("--job --base-dir=/srv {"));
        assert!(contents.contains("\"domain\":\"example.com\""));
        assert!(contents.contains("\"sandbox\":true"));
    }
}
