//! Shell session driver.
//!
//! Turns "run this command" into a future that resolves when the shell prints
//! its prompt again. A single watchdog bounds the whole run: once it fires the
//! session is killed and the pending (or next) command fails with the timeout
//! sentinel exactly once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::errors::RunnerError;
use crate::output::LogWriter;
use crate::shell::lexer::{PromptLexer, Token};
use crate::shell::Shell;
use crate::storage::settings::PromptStyle;

/// Commands run silently right after the first prompt
const INIT_COMMANDS: &[&str] = &[
    "stty -echo",
    "set -e",
    "unset HISTFILE TERM",
    "export CI=true CONTINUOUS_INTEGRATION=true LANG=en_US.UTF-8 LC_ALL=en_US.UTF-8 PIP_PROGRESS_BAR=off",
];

/// What the transport reports about the shell process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Output(Vec<u8>),
    Exited(Option<i32>),
    Watchdog,
}

/// Write end of the shell's standard input
#[async_trait]
pub trait SessionInput: Send {
    async fn write_all(&mut self, data: &[u8]) -> Result<(), RunnerError>;
}

/// Force-terminates the shell process
#[async_trait]
pub trait SessionKiller: Send + Sync {
    fn pid(&self) -> Option<u32>;

    /// Kill the process, returning the exit code of the kill operation
    async fn kill(&self) -> i32;
}

/// Transport handles a session is built from
pub struct ShellChannels {
    pub input: Box<dyn SessionInput>,
    pub killer: Arc<dyn SessionKiller>,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
    pub events_tx: mpsc::UnboundedSender<SessionEvent>,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub prompt_style: PromptStyle,
    /// Ceiling for the whole run, not per command
    pub max_execution: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            prompt_style: PromptStyle::default(),
            max_execution: Duration::from_secs(900),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Spawned,
    Ready,
    Awaiting,
    Terminated,
}

pub struct ShellSession {
    input: Box<dyn SessionInput>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    lexer: PromptLexer,
    log: LogWriter,
    state: SessionState,
    exit_code: Option<i32>,
    max_execution: Duration,
    watchdog_fired: Arc<AtomicBool>,
    timeout_reported: bool,
    watchdog: JoinHandle<()>,
}

impl ShellSession {
    /// Arm the watchdog, discard the login banner and run the silent
    /// initialization commands
    pub async fn start(
        channels: ShellChannels,
        options: SessionOptions,
        log: LogWriter,
    ) -> Result<Self, RunnerError> {
        let watchdog_fired = Arc::new(AtomicBool::new(false));
        let watchdog = tokio::spawn(run_watchdog(
            options.max_execution,
            channels.killer,
            channels.events_tx,
            log.clone(),
            watchdog_fired.clone(),
        ));

        let mut session = Self {
            input: channels.input,
            events: channels.events,
            lexer: PromptLexer::new(options.prompt_style),
            log,
            state: SessionState::Spawned,
            exit_code: None,
            max_execution: options.max_execution,
            watchdog_fired,
            timeout_reported: false,
            watchdog,
        };

        session.await_prompt(false).await?;
        for command in INIT_COMMANDS {
            session.send(command, false).await?;
        }
        info!("Shell session ready");
        Ok(session)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Write one command and wait for the prompt that closes it
    pub async fn send(&mut self, command: &str, echo: bool) -> Result<(), RunnerError> {
        self.drain_idle_events();
        if self.state == SessionState::Terminated {
            return Err(self.terminated_error());
        }

        if echo {
            self.log.write(format!("$> {}\n", command));
        }
        debug!("shell <- {}", command);
        if let Err(e) = self.input.write_all(format!("{}\n", command).as_bytes()).await {
            warn!("Failed writing to shell: {}", e);
            self.state = SessionState::Terminated;
            return Err(RunnerError::SessionTerminated {
                code: self.exit_code,
            });
        }
        self.state = SessionState::Awaiting;
        self.await_prompt(echo).await
    }

    async fn await_prompt(&mut self, echo: bool) -> Result<(), RunnerError> {
        loop {
            let event = self.events.recv().await;
            match event {
                Some(SessionEvent::Output(bytes)) => {
                    for token in self.lexer.feed(&bytes) {
                        match token {
                            Token::Partial(text) => {
                                if echo {
                                    self.log.write(text);
                                }
                            }
                            Token::Prompt(text) => {
                                if echo && !text.is_empty() {
                                    self.log.line(text);
                                }
                                self.lexer.reset();
                                self.state = SessionState::Ready;
                                return Ok(());
                            }
                        }
                    }
                }
                Some(SessionEvent::Exited(code)) => {
                    self.exit_code = code;
                    if self.watchdog_fired.load(Ordering::SeqCst) {
                        // the watchdog event follows the kill
                        continue;
                    }
                    self.state = SessionState::Terminated;
                    if code == Some(0) {
                        return Ok(());
                    }
                    self.log.line(format!("Exit status: {}\n", exit_label(code)));
                    return Err(RunnerError::SessionTerminated { code });
                }
                Some(SessionEvent::Watchdog) => {
                    self.state = SessionState::Terminated;
                    self.timeout_reported = true;
                    return Err(RunnerError::timeout(self.max_execution.as_secs()));
                }
                None => {
                    self.state = SessionState::Terminated;
                    return Err(self.terminated_error());
                }
            }
        }
    }

    /// Consume whatever the transport reported while no command was pending
    fn drain_idle_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            match event {
                SessionEvent::Output(_) => {}
                SessionEvent::Exited(code) => {
                    self.exit_code = code;
                    self.state = SessionState::Terminated;
                }
                SessionEvent::Watchdog => {
                    self.state = SessionState::Terminated;
                }
            }
        }
        self.lexer.reset();
    }

    fn terminated_error(&mut self) -> RunnerError {
        if self.watchdog_fired.load(Ordering::SeqCst) && !self.timeout_reported {
            self.timeout_reported = true;
            return RunnerError::timeout(self.max_execution.as_secs());
        }
        RunnerError::SessionTerminated {
            code: self.exit_code,
        }
    }
}

impl Drop for ShellSession {
    fn drop(&mut self) {
        self.watchdog.abort();
    }
}

#[async_trait]
impl Shell for ShellSession {
    async fn exec(&mut self, command: &str, echo: bool) -> Result<(), RunnerError> {
        self.send(command, echo).await
    }

    async fn close(&mut self) {
        self.watchdog.abort();
        if self.state != SessionState::Terminated {
            let _ = self.input.write_all(b"exit\n").await;
            self.state = SessionState::Terminated;
        }
    }
}

fn exit_label(code: Option<i32>) -> String {
    code.map(|c| c.to_string())
        .unwrap_or_else(|| "signal".to_string())
}

async fn run_watchdog(
    max_execution: Duration,
    killer: Arc<dyn SessionKiller>,
    events: mpsc::UnboundedSender<SessionEvent>,
    log: LogWriter,
    fired: Arc<AtomicBool>,
) {
    tokio::time::sleep(max_execution).await;
    fired.store(true, Ordering::SeqCst);
    warn!("Execution ceiling of {}s reached, killing shell", max_execution.as_secs());

    log.line(format!(
        "\n$> Execution took more than {}s, exiting gracefully.",
        max_execution.as_secs()
    ));
    let code = killer.kill().await;
    let pid = killer
        .pid()
        .map(|p| p.to_string())
        .unwrap_or_else(|| "?".to_string());
    log.line(format!("kill {}: Exit code {}", pid, code));
    let _ = events.send(SessionEvent::Watchdog);
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::output;

    fn drain(rx: &mut crate::output::LogReceiver) -> String {
        let mut out = String::new();
        while let Ok(chunk) = rx.try_recv() {
            out.push_str(&chunk);
        }
        out
    }

    #[tokio::test]
    async fn test_init_sequence_is_silent() {
        let h = harness();
        let (log, mut rx) = output::channel();
        let session = ShellSession::start(h.channels, SessionOptions::default(), log)
            .await
            .unwrap();

        assert_eq!(session.state(), SessionState::Ready);
        let written = h.written.lock().unwrap().clone();
        assert_eq!(written.len(), INIT_COMMANDS.len());
        assert_eq!(written[1], "set -e");
        assert_eq!(drain(&mut rx), "");
    }

    #[tokio::test]
    async fn test_echoed_command_output() {
        let h = harness();
        h.replies.lock().unwrap().push((
            "echo hi".to_string(),
            vec![SessionEvent::Output(format!("hi\r\n{}", PROMPT).into_bytes())],
        ));
        let (log, mut rx) = output::channel();
        let mut session = ShellSession::start(h.channels, SessionOptions::default(), log)
            .await
            .unwrap();

        session.exec("echo hi", true).await.unwrap();
        assert_eq!(drain(&mut rx), "$> echo hi\nhi\n");
    }

    #[tokio::test]
    async fn test_dollar_before_prompt_resolves_once() {
        let h = harness();
        h.replies.lock().unwrap().push((
            "printf '$ '".to_string(),
            vec![
                SessionEvent::Output(format!("$ {}", PROMPT).into_bytes()),
                SessionEvent::Output(b"stray".to_vec()),
            ],
        ));
        let (log, mut rx) = output::channel();
        let mut session = ShellSession::start(h.channels, SessionOptions::default(), log)
            .await
            .unwrap();

        session.exec("printf '$ '", true).await.unwrap();
        assert_eq!(drain(&mut rx), "$> printf '$ '\n$\n");

        // the stray chunk arrived while idle and is not attributed to the next command
        session.exec("true", true).await.unwrap();
        assert_eq!(drain(&mut rx), "$> true\n");
    }

    #[tokio::test]
    async fn test_exit_while_pending_fails() {
        let h = harness();
        h.replies.lock().unwrap().push((
            "false".to_string(),
            vec![SessionEvent::Exited(Some(1))],
        ));
        let (log, mut rx) = output::channel();
        let mut session = ShellSession::start(h.channels, SessionOptions::default(), log)
            .await
            .unwrap();

        let err = session.exec("false", true).await.unwrap_err();
        assert!(matches!(err, RunnerError::SessionTerminated { code: Some(1) }));
        assert!(drain(&mut rx).contains("Exit status: 1"));
        assert_eq!(session.state(), SessionState::Terminated);

        let err = session.exec("echo again", true).await.unwrap_err();
        assert!(matches!(err, RunnerError::SessionTerminated { .. }));
    }

    #[tokio::test]
    async fn test_clean_exit_resolves() {
        let h = harness();
        h.replies
            .lock()
            .unwrap()
            .push(("exit".to_string(), vec![SessionEvent::Exited(Some(0))]));
        let (log, _rx) = output::channel();
        let mut session = ShellSession::start(h.channels, SessionOptions::default(), log)
            .await
            .unwrap();

        session.exec("exit", false).await.unwrap();
        assert_eq!(session.state(), SessionState::Terminated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_fails_pending_command_once() {
        let h = harness();
        // never answers with a prompt
        h.replies
            .lock()
            .unwrap()
            .push(("sleep infinity".to_string(), vec![]));
        let killer = h.killer.clone();
        let events = h.events.clone();
        let (log, mut rx) = output::channel();
        let options = SessionOptions {
            max_execution: Duration::from_secs(900),
            ..Default::default()
        };
        let mut session = ShellSession::start(h.channels, options, log).await.unwrap();

        let err = session.exec("sleep infinity", true).await.unwrap_err();
        assert!(matches!(err, RunnerError::Timeout { code: 124, secs: 900 }));
        assert_eq!(*killer.kills.lock().unwrap(), 1);

        let logged = drain(&mut rx);
        assert!(logged.contains("Execution took more than 900s, exiting gracefully."));
        assert!(logged.contains("kill 4242: Exit code 0"));

        // the killed process exiting afterwards does not produce a second timeout
        events.send(SessionEvent::Exited(None)).unwrap();
        let err = session.exec("echo late", true).await.unwrap_err();
        assert!(matches!(err, RunnerError::SessionTerminated { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_while_idle_reports_on_next_command() {
        let h = harness();
        let (log, _rx) = output::channel();
        let options = SessionOptions {
            max_execution: Duration::from_secs(5),
            ..Default::default()
        };
        let mut session = ShellSession::start(h.channels, options, log).await.unwrap();

        tokio::time::sleep(Duration::from_secs(6)).await;

        let err = session.exec("echo hi", true).await.unwrap_err();
        assert!(matches!(err, RunnerError::Timeout { code: 124, .. }));
        let err = session.exec("echo hi", true).await.unwrap_err();
        assert!(matches!(err, RunnerError::SessionTerminated { .. }));
    }
}
