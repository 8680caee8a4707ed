//! PTY transport for the shell session.
//!
//! The privileged helper is spawned inside a pseudo-terminal so the user's
//! login shell runs interactively and prints its prompt. Output is forwarded
//! from a blocking read loop; a second blocking task waits for the exit code.

use std::io::{Read, Write};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::errors::RunnerError;
use crate::gateway::{Operation, PrivilegedGateway};
use crate::shell::session::{SessionEvent, SessionInput, SessionKiller, ShellChannels};

const PTY_ROWS: u16 = 40;
const PTY_COLS: u16 = 250;

/// Write half of the PTY master. The master is kept alive with it, dropping
/// it hangs up the shell.
struct PtyInput {
    writer: Box<dyn Write + Send>,
    _master: Box<dyn MasterPty + Send>,
}

#[async_trait]
impl SessionInput for PtyInput {
    async fn write_all(&mut self, data: &[u8]) -> Result<(), RunnerError> {
        self.writer.write_all(data)?;
        self.writer.flush()?;
        Ok(())
    }
}

struct PtyKiller {
    pid: Option<u32>,
    gateway: Arc<dyn PrivilegedGateway>,
    fallback: std::sync::Mutex<Box<dyn ChildKiller + Send + Sync>>,
}

#[async_trait]
impl SessionKiller for PtyKiller {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    async fn kill(&self) -> i32 {
        if let Some(pid) = self.pid {
            match self
                .gateway
                .invoke(Operation::ShellKill, &[pid.to_string()], None)
                .await
            {
                Ok(out) => return out.code,
                Err(e) => warn!("{} failed for pid {}: {}", Operation::ShellKill, pid, e),
            }
        }
        match self.fallback.lock() {
            Ok(mut killer) => match killer.kill() {
                Ok(()) => 0,
                Err(e) => {
                    warn!("Failed to kill shell: {}", e);
                    1
                }
            },
            Err(_) => 1,
        }
    }
}

/// Spawn the interactive shell for `user` through the privileged helper
pub fn spawn_user_shell(
    helper_argv: Vec<String>,
    gateway: Arc<dyn PrivilegedGateway>,
) -> Result<ShellChannels, RunnerError> {
    let (program, args) = helper_argv
        .split_first()
        .ok_or_else(|| RunnerError::ConfigError("helper command is empty".into()))?;

    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            rows: PTY_ROWS,
            cols: PTY_COLS,
            pixel_width: 0,
            pixel_height: 0,
        })
        .context("opening a pseudo-terminal")?;

    let mut cmd = CommandBuilder::new(program);
    cmd.args(args);
    cmd.env("TERM", "dumb");

    let mut child = pair
        .slave
        .spawn_command(cmd)
        .context("spawning the shell helper")?;
    // the child owns its side now
    drop(pair.slave);

    let reader = pair
        .master
        .try_clone_reader()
        .context("cloning the pty reader")?;
    let writer = pair
        .master
        .take_writer()
        .context("taking the pty writer")?;

    let pid = child.process_id();
    let fallback = child.clone_killer();
    let (tx, rx) = mpsc::unbounded_channel();

    let output_tx = tx.clone();
    tokio::task::spawn_blocking(move || {
        let mut reader = reader;
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if output_tx.send(SessionEvent::Output(buf[..n].to_vec())).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    // EIO once the slave side is gone
                    info!("Shell read loop ended: {}", e);
                    break;
                }
            }
        }
    });

    let exit_tx = tx.clone();
    tokio::task::spawn_blocking(move || {
        let code = match child.wait() {
            Ok(status) => Some(status.exit_code() as i32),
            Err(e) => {
                warn!("Failed waiting for shell: {}", e);
                None
            }
        };
        info!("Shell process exited with {:?}", code);
        let _ = exit_tx.send(SessionEvent::Exited(code));
    });

    info!("Spawned shell session pid={:?}", pid);

    Ok(ShellChannels {
        input: Box::new(PtyInput {
            writer,
            _master: pair.master,
        }),
        killer: Arc::new(PtyKiller {
            pid,
            gateway,
            fallback: std::sync::Mutex::new(fallback),
        }),
        events: rx,
        events_tx: tx,
    })
}
