//! Deployment log stream.
//!
//! Producers (pipeline, shell session, collaborators) write plain text chunks
//! through a [`LogWriter`]; the job controller owns the receiving end.

use colored::Colorize;
use tokio::sync::mpsc;

/// Cloneable producer handle for the deployment log
#[derive(Debug, Clone)]
pub struct LogWriter {
    tx: mpsc::UnboundedSender<String>,
}

/// Consumer end of the deployment log
pub type LogReceiver = mpsc::UnboundedReceiver<String>;

/// Create a connected writer/receiver pair
pub fn channel() -> (LogWriter, LogReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (LogWriter { tx }, rx)
}

impl LogWriter {
    /// Append a raw chunk
    pub fn write(&self, chunk: impl Into<String>) {
        let chunk = chunk.into();
        if chunk.is_empty() {
            return;
        }
        // receiver gone means the run is being torn down
        let _ = self.tx.send(chunk);
    }

    /// Append a chunk followed by a newline
    pub fn line(&self, text: impl AsRef<str>) {
        self.write(format!("{}\n", text.as_ref()));
    }
}

/// Colour a finished log for terminal rendering.
///
/// `$>` lines are command and status headers, `! ` lines come from stderr,
/// `$<` lines are raw debug echoes. The log is painted for the callback
/// reader, so colours are forced even when stdout is not a terminal.
pub fn colorize(log: &str) -> String {
    colored::control::set_override(true);
    let mut out = String::with_capacity(log.len() + log.len() / 8);
    for (i, line) in log.split('\n').enumerate() {
        if i > 0 {
            out.push('\n');
        }
        if line.is_empty() {
            continue;
        }
        let painted = if line.starts_with("$>") {
            line.cyan().bold().to_string()
        } else if line.starts_with("! ") {
            line.red().to_string()
        } else if line.starts_with("Exit status:") {
            line.yellow().to_string()
        } else if line.starts_with("$<") {
            line.dimmed().to_string()
        } else {
            line.to_string()
        };
        out.push_str(&painted);
    }
    out
}
