//! Interactive shell used to run deployment commands as the domain user.

pub mod lexer;
pub mod pty;
pub mod session;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::errors::RunnerError;
use crate::gateway::{Operation, PrivilegedGateway};
use crate::output::LogWriter;

pub use session::{SessionOptions, ShellSession};

/// Command sink the pipeline drives; one command in flight at a time
#[async_trait]
pub trait Shell: Send {
    /// Run `command` and wait for the prompt that follows it. When `echo` is
    /// false neither the command nor its output reaches the deployment log.
    async fn exec(&mut self, command: &str, echo: bool) -> Result<(), RunnerError>;

    /// Ask the shell to exit. Errors are not reported.
    async fn close(&mut self);
}

/// Opens the shell a deployment runs in, once the domain user is known
#[async_trait]
pub trait ShellLauncher: Send + Sync {
    async fn launch(&self, user: &str, log: LogWriter) -> Result<Box<dyn Shell>, RunnerError>;
}

/// Launches the user's login shell in a PTY through the privileged helper
pub struct PtyShellLauncher {
    helper: Vec<String>,
    gateway: Arc<dyn PrivilegedGateway>,
    options: SessionOptions,
}

impl PtyShellLauncher {
    pub fn new(
        helper: Vec<String>,
        gateway: Arc<dyn PrivilegedGateway>,
        options: SessionOptions,
    ) -> Self {
        Self {
            helper,
            gateway,
            options,
        }
    }
}

#[async_trait]
impl ShellLauncher for PtyShellLauncher {
    async fn launch(&self, user: &str, log: LogWriter) -> Result<Box<dyn Shell>, RunnerError> {
        let mut argv = self.helper.clone();
        argv.push(Operation::ShellInteractive.to_string());
        argv.push(user.to_string());
        let channels = pty::spawn_user_shell(argv, self.gateway.clone())?;
        let session = ShellSession::start(channels, self.options.clone(), log).await?;
        Ok(Box::new(session))
    }
}

/// Launches [`DryShell`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct DryShellLauncher;

#[async_trait]
impl ShellLauncher for DryShellLauncher {
    async fn launch(&self, user: &str, log: LogWriter) -> Result<Box<dyn Shell>, RunnerError> {
        debug!("dry shell for {}", user);
        Ok(Box::new(DryShell::new(log)))
    }
}

/// Shell stand-in for development hosts: commands are logged, never run
#[derive(Debug, Clone)]
pub struct DryShell {
    log: LogWriter,
}

impl DryShell {
    pub fn new(log: LogWriter) -> Self {
        Self { log }
    }
}

#[async_trait]
impl Shell for DryShell {
    async fn exec(&mut self, command: &str, echo: bool) -> Result<(), RunnerError> {
        debug!("dry shell: {}", command);
        if echo {
            self.log.line(format!("$> {}", command));
        }
        Ok(())
    }

    async fn close(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output;

    #[tokio::test]
    async fn test_dry_shell_logs_echoed_commands_only() {
        let (log, mut rx) = output::channel();
        let mut shell = DryShell::new(log);

        shell.exec("echo hi", true).await.unwrap();
        shell.exec("export SECRET=1", false).await.unwrap();
        shell.close().await;
        drop(shell);

        let mut lines = Vec::new();
        while let Some(chunk) = rx.recv().await {
            lines.push(chunk);
        }
        assert_eq!(lines, vec!["$> echo hi\n".to_string()]);
    }
}
