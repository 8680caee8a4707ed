//! Job controller: runs one deployment and streams its log.
//!
//! The pipeline writes into a [`LogWriter`]; a collector drains the receiving
//! end into a full log and a chunk buffer. A periodic sender pushes the chunk
//! buffer to the callback while the run is going, and the full log is pushed
//! once the stream ends.

use std::borrow::Cow;
use std::error::Error as _;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, Mutex, Notify};
use tracing::{debug, error, info};

use crate::errors::RunnerError;
use crate::jobs::callback::CallbackClient;
use crate::output::{self, colorize, LogReceiver, LogWriter};
use crate::storage::settings::CallbackSettings;

/// Prefix of the first partial push
pub const FIRST_CHUNK_MARKER: &str = "Running runner... Please wait...\n";

/// Prefix of every later partial push
pub const CHUNK_MARKER: &str = "[Chunked data...]\n";

/// Prefix of a final push whose head was cut
pub const TRUNCATION_MARKER: &str = "[Log truncated, showing the tail only...]\n";

/// Job controller options
#[derive(Debug, Clone)]
pub struct JobOptions {
    /// Time between partial pushes
    pub interval: Duration,
    /// Largest final payload before the head is cut
    pub max_payload_bytes: usize,
    /// Colour pushed payloads with ANSI escapes
    pub colorize: bool,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self::from(&CallbackSettings::default())
    }
}

impl From<&CallbackSettings> for JobOptions {
    fn from(settings: &CallbackSettings) -> Self {
        Self {
            interval: Duration::from_secs(settings.interval_secs.max(1)),
            max_payload_bytes: settings.max_payload_bytes,
            colorize: true,
        }
    }
}

/// What a finished job looked like
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub aborted: bool,
    pub elapsed: Duration,
    /// The full, uncoloured log
    pub log: String,
}

#[derive(Debug, Default)]
struct Buffers {
    full: String,
    chunk: String,
    pushed: bool,
}

/// Run `work` with a fresh log stream, delivering it to `callback`.
///
/// Failures of `work` are rendered into the log and mark the job aborted;
/// they are never returned.
pub async fn run_job<F, Fut>(
    options: &JobOptions,
    callback: Option<CallbackClient>,
    work: F,
) -> JobOutcome
where
    F: FnOnce(LogWriter) -> Fut,
    Fut: Future<Output = Result<(), RunnerError>>,
{
    let started = Instant::now();
    let (log, rx) = output::channel();
    let buffers = Arc::new(Mutex::new(Buffers::default()));
    let first_chunk = Arc::new(Notify::new());
    let (done_tx, done_rx) = oneshot::channel();

    let periodic = callback.clone().map(|client| {
        tokio::spawn(push_periodically(
            client,
            buffers.clone(),
            first_chunk.clone(),
            options.clone(),
        ))
    });

    let worker = async move {
        let result = work(log.clone()).await;
        let aborted = match result {
            Ok(()) => false,
            Err(e) => {
                error!("Job aborted: {}", e);
                log.write(render_error(&e));
                true
            }
        };
        log.write(trailer(aborted, started.elapsed()));
        let _ = done_tx.send(());
        aborted
    };
    let collector = collect(rx, buffers.clone(), first_chunk, done_rx);
    let (aborted, ()) = tokio::join!(worker, collector);

    if let Some(handle) = periodic {
        handle.abort();
    }

    let full = std::mem::take(&mut buffers.lock().await.full);
    if let Some(client) = callback {
        let payload = final_payload(&full, options);
        match client.push(payload).await {
            Ok(()) => debug!("Final log delivered to {}", client.url()),
            Err(e) => error!("Failed to deliver final log to {}: {}", client.url(), e),
        }
    }

    let elapsed = started.elapsed();
    info!(
        "Job {} in {}s",
        if aborted { "aborted" } else { "finished" },
        format_secs(elapsed)
    );
    JobOutcome {
        aborted,
        elapsed,
        log: full,
    }
}

async fn collect(
    mut rx: LogReceiver,
    buffers: Arc<Mutex<Buffers>>,
    first_chunk: Arc<Notify>,
    done: oneshot::Receiver<()>,
) {
    tokio::pin!(done);
    let mut seen = false;
    loop {
        tokio::select! {
            biased;
            chunk = rx.recv() => match chunk {
                Some(chunk) => {
                    append(&buffers, &chunk).await;
                    if !seen {
                        seen = true;
                        first_chunk.notify_one();
                    }
                }
                None => break,
            },
            // writers may outlive the run inside detached tasks
            _ = &mut done => {
                while let Ok(chunk) = rx.try_recv() {
                    append(&buffers, &chunk).await;
                }
                break;
            }
        }
    }
}

async fn append(buffers: &Mutex<Buffers>, chunk: &str) {
    let mut buffers = buffers.lock().await;
    buffers.full.push_str(chunk);
    buffers.chunk.push_str(chunk);
}

async fn push_periodically(
    client: CallbackClient,
    buffers: Arc<Mutex<Buffers>>,
    first_chunk: Arc<Notify>,
    options: JobOptions,
) {
    first_chunk.notified().await;
    loop {
        let pending = {
            let mut buffers = buffers.lock().await;
            if buffers.chunk.is_empty() {
                None
            } else {
                let marker = if buffers.pushed {
                    CHUNK_MARKER
                } else {
                    FIRST_CHUNK_MARKER
                };
                buffers.pushed = true;
                Some(format!("{}{}", marker, std::mem::take(&mut buffers.chunk)))
            }
        };

        if let Some(body) = pending {
            let body = if options.colorize { colorize(&body) } else { body };
            if let Err(e) = client.push(body).await {
                debug!("Partial log push failed: {}", e);
            }
        }
        tokio::time::sleep(options.interval).await;
    }
}

/// Render a pipeline failure as a log block
pub fn render_error(err: &RunnerError) -> String {
    match err {
        RunnerError::CommandFailed {
            code,
            stdout,
            stderr,
            ..
        } => format!(
            "$> Error occured with exit code {}\n{}\n{}\n",
            code, stdout, stderr
        ),
        other => {
            let mut out = format!("$> Error occured: {}\n", other);
            let mut source = other.source();
            while let Some(cause) = source {
                out.push_str(&format!("$>   caused by: {}\n", cause));
                source = cause.source();
            }
            out
        }
    }
}

fn trailer(aborted: bool, elapsed: Duration) -> String {
    format!(
        "\n$> Execution {} in {}s\n",
        if aborted { "Aborted" } else { "Finished" },
        format_secs(elapsed)
    )
}

fn format_secs(elapsed: Duration) -> String {
    (elapsed.as_millis() as f64 / 1000.0).to_string()
}

/// Keep at most `max` trailing bytes of `log` behind [`TRUNCATION_MARKER`].
///
/// The cut moves forward to the next line start when one is left, otherwise
/// to the next character boundary.
pub fn truncate_tail(log: &str, max: usize) -> Cow<'_, str> {
    if log.len() <= max {
        return Cow::Borrowed(log);
    }
    let mut start = log.len() - max;
    while !log.is_char_boundary(start) {
        start += 1;
    }
    if let Some(newline) = log[start..].find('\n') {
        if start + newline + 1 < log.len() {
            start += newline + 1;
        }
    }
    Cow::Owned(format!("{}{}", TRUNCATION_MARKER, &log[start..]))
}

fn final_payload(full: &str, options: &JobOptions) -> String {
    if options.colorize {
        truncate_tail(&colorize(full), options.max_payload_bytes).into_owned()
    } else {
        truncate_tail(full, options.max_payload_bytes).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain() -> JobOptions {
        JobOptions {
            colorize: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_render_command_failure() {
        let err = RunnerError::CommandFailed {
            operation: "VIRTUALMIN".into(),
            code: 3,
            stdout: "partial".into(),
            stderr: "boom".into(),
        };
        assert_eq!(
            render_error(&err),
            "$> Error occured with exit code 3\npartial\nboom\n"
        );

        let err = RunnerError::InvalidInput("bad php".into());
        assert_eq!(render_error(&err), "$> Error occured: Invalid input: bad php\n");
    }

    #[test]
    fn test_render_error_sources() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing file");
        let rendered = render_error(&RunnerError::from(io));
        assert!(rendered.starts_with("$> Error occured: IO error: missing file\n"));
        assert!(rendered.contains("$>   caused by: missing file\n"));
    }

    #[test]
    fn test_truncate_short_log_untouched() {
        assert!(matches!(truncate_tail("abc\n", 10), Cow::Borrowed("abc\n")));
    }

    #[test]
    fn test_truncate_keeps_tail() {
        let log: String = (0..5000).map(|i| format!("line {}\n", i)).collect();
        let cut = truncate_tail(&log, 1000);
        assert!(cut.starts_with(TRUNCATION_MARKER));
        assert!(cut.ends_with("line 4999\n"));
        assert!(cut.len() <= 1000 + TRUNCATION_MARKER.len());
        assert!(cut[TRUNCATION_MARKER.len()..].starts_with("line "));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let log = "é".repeat(100);
        let cut = truncate_tail(&log, 51);
        assert!(cut.ends_with("éé"));
        assert!(cut.len() <= 51 + TRUNCATION_MARKER.len());
    }

    #[test]
    fn test_format_secs() {
        assert_eq!(format_secs(Duration::from_millis(1500)), "1.5");
        assert_eq!(format_secs(Duration::from_secs(2)), "2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_job_finished() {
        let outcome = run_job(&plain(), None, |log| async move {
            log.line("$> echo hi");
            log.line("hi");
            Ok(())
        })
        .await;

        assert!(!outcome.aborted);
        assert!(outcome.log.starts_with("$> echo hi\nhi\n"));
        assert!(outcome.log.contains("\n$> Execution Finished in "));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_job_aborted() {
        let outcome = run_job(&plain(), None, |log| async move {
            log.line("$> virtualmin modify-domain");
            Err(RunnerError::CommandFailed {
                operation: "VIRTUALMIN".into(),
                code: 1,
                stdout: String::new(),
                stderr: "no such domain".into(),
            })
        })
        .await;

        assert!(outcome.aborted);
        assert!(outcome.log.contains("$> Error occured with exit code 1\n\nno such domain\n"));
        assert!(outcome.log.contains("$> Execution Aborted in "));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_job_collects_from_lingering_writers() {
        let outcome = run_job(&plain(), None, |log| async move {
            // a clone outliving the run must not stall the collector
            let lingering = log.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                drop(lingering);
            });
            log.line("done");
            Ok(())
        })
        .await;
        assert!(outcome.log.starts_with("done\n"));
    }
}
