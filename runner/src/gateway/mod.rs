//! Privileged operation gateway.
//!
//! Every root-level change goes through a helper program that accepts an
//! operation name plus arguments and answers with an exit code and the two
//! output streams. The runner never performs privileged work itself.

use std::fmt;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, error};

use crate::errors::RunnerError;

/// Operations understood by the privileged helper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Virtualmin,
    ShellInteractive,
    ShellKill,
    ShellSudo,
    FirewallGet,
    FirewallSet,
    NginxInfoGet,
    NginxInfoSet,
    NginxConfigSet,
    NginxStart,
    NamedApply,
    PortsGet,
    PortsSet,
    ComposeGet,
    ComposeSet,
    UnitSet,
    UnitDel,
    OpensslClean,
    PhpfpmClean,
    LingerEnable,
    LingerDisable,
    PushServerConfig,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Virtualmin => "VIRTUALMIN",
            Operation::ShellInteractive => "SHELL_INTERACTIVE",
            Operation::ShellKill => "SHELL_KILL",
            Operation::ShellSudo => "SHELL_SUDO",
            Operation::FirewallGet => "FIREWALL_GET",
            Operation::FirewallSet => "FIREWALL_SET",
            Operation::NginxInfoGet => "NGINX_INFO_GET",
            Operation::NginxInfoSet => "NGINX_INFO_SET",
            Operation::NginxConfigSet => "NGINX_CONFIG_SET",
            Operation::NginxStart => "NGINX_START",
            Operation::NamedApply => "NAMED_APPLY",
            Operation::PortsGet => "PORTS_GET",
            Operation::PortsSet => "PORTS_SET",
            Operation::ComposeGet => "COMPOSE_GET",
            Operation::ComposeSet => "COMPOSE_SET",
            Operation::UnitSet => "UNIT_SET",
            Operation::UnitDel => "UNIT_DEL",
            Operation::OpensslClean => "OPENSSL_CLEAN",
            Operation::PhpfpmClean => "PHPFPM_CLEAN",
            Operation::LingerEnable => "LINGER_ENABLE",
            Operation::LingerDisable => "LINGER_DISABLE",
            Operation::PushServerConfig => "PUSH_SERVER_CONFIG",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result triple of a privileged operation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl OpOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// Turn a non-zero exit code into [`RunnerError::CommandFailed`]
    pub fn check(self, operation: impl fmt::Display) -> Result<Self, RunnerError> {
        if self.success() {
            Ok(self)
        } else {
            Err(RunnerError::CommandFailed {
                operation: operation.to_string(),
                code: self.code,
                stdout: self.stdout,
                stderr: self.stderr,
            })
        }
    }
}

/// Blocking-RPC view of the privileged helper
#[async_trait]
pub trait PrivilegedGateway: Send + Sync {
    /// Run `op` with `args`, feeding `input` to its stdin when given.
    ///
    /// A non-zero exit code is returned, not raised; callers decide whether
    /// it is fatal.
    async fn invoke(
        &self,
        op: Operation,
        args: &[String],
        input: Option<&str>,
    ) -> Result<OpOutput, RunnerError>;
}

/// Gateway that shells out to the helper through sudo
#[derive(Debug, Clone)]
pub struct SudoGateway {
    helper: Vec<String>,
}

impl SudoGateway {
    pub fn new(helper: Vec<String>) -> Result<Self, RunnerError> {
        if helper.is_empty() {
            return Err(RunnerError::ConfigError(
                "helper_command must not be empty".to_string(),
            ));
        }
        Ok(Self { helper })
    }

    /// Full argv that runs `op` through the helper
    pub fn argv(&self, op: Operation, args: &[String]) -> Vec<String> {
        let mut argv = self.helper.clone();
        argv.push(op.as_str().to_string());
        argv.extend(args.iter().cloned());
        argv
    }
}

#[async_trait]
impl PrivilegedGateway for SudoGateway {
    async fn invoke(
        &self,
        op: Operation,
        args: &[String],
        input: Option<&str>,
    ) -> Result<OpOutput, RunnerError> {
        let argv = self.argv(op, args);
        debug!("Invoking privileged operation {} {:?}", op, args);

        let mut child = Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                error!("Failed to spawn privileged helper for {}: {}", op, e);
                RunnerError::IoError(e)
            })?;

        if let (Some(input), Some(mut stdin)) = (input, child.stdin.take()) {
            stdin.write_all(input.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        Ok(OpOutput {
            // killed by a signal
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_failure() {
        let out = OpOutput {
            code: 2,
            stdout: "partial".into(),
            stderr: "denied".into(),
        };
        match out.check(Operation::FirewallSet) {
            Err(RunnerError::CommandFailed {
                operation,
                code,
                stderr,
                ..
            }) => {
                assert_eq!(operation, "FIREWALL_SET");
                assert_eq!(code, 2);
                assert_eq!(stderr, "denied");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_argv() {
        let gateway = SudoGateway::new(vec!["sudo".into(), "helper".into()]).unwrap();
        assert_eq!(
            gateway.argv(Operation::ShellKill, &["42".to_string()]),
            vec!["sudo", "helper", "SHELL_KILL", "42"]
        );
        assert!(SudoGateway::new(Vec::new()).is_err());
    }

    #[tokio::test]
    async fn test_invoke_captures_streams() {
        // `sh -c` stands in for the helper; the operation name becomes $0
        let gateway = SudoGateway::new(vec![
            "sh".into(),
            "-c".into(),
            "cat; echo \"$0 $1\"; echo oops >&2; exit 3".into(),
        ])
        .unwrap();
        let out = gateway
            .invoke(Operation::PortsSet, &["x".to_string()], Some("1000:8080\n"))
            .await
            .unwrap();
        assert_eq!(out.code, 3);
        assert_eq!(out.stdout, "1000:8080\nPORTS_SET x\n");
        assert_eq!(out.stderr, "oops\n");
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    use super::*;

    /// Recorded gateway call
    #[derive(Debug, Clone)]
    pub struct Call {
        pub op: Operation,
        pub args: Vec<String>,
        pub input: Option<String>,
    }

    /// Scripted gateway: queued replies per operation, success otherwise
    #[derive(Default)]
    pub struct FakeGateway {
        pub calls: Mutex<Vec<Call>>,
        replies: Mutex<HashMap<Operation, VecDeque<OpOutput>>>,
    }

    impl FakeGateway {
        pub fn reply(&self, op: Operation, out: OpOutput) {
            self.replies
                .lock()
                .unwrap()
                .entry(op)
                .or_default()
                .push_back(out);
        }

        pub fn calls_of(&self, op: Operation) -> Vec<Call> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.op == op)
                .cloned()
                .collect()
        }
    }

    #[async_trait]
    impl PrivilegedGateway for FakeGateway {
        async fn invoke(
            &self,
            op: Operation,
            args: &[String],
            input: Option<&str>,
        ) -> Result<OpOutput, RunnerError> {
            self.calls.lock().unwrap().push(Call {
                op,
                args: args.to_vec(),
                input: input.map(str::to_string),
            });
            let scripted = self
                .replies
                .lock()
                .unwrap()
                .get_mut(&op)
                .and_then(|q| q.pop_front());
            Ok(scripted.unwrap_or_default())
        }
    }
}
