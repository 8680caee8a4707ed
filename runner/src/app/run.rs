//! Main application run loop

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::app::options::{AppOptions, LifecycleOptions};
use crate::app::state::ActivityTracker;
use crate::errors::RunnerError;
use crate::server::serve::serve;
use crate::server::state::ServerState;

/// Serve the submission API until `shutdown_signal` resolves or, for a
/// non-persistent server, until it has been idle for too long
pub async fn run(
    options: AppOptions,
    state: Arc<ServerState>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), RunnerError> {
    info!("Initializing hostrunner...");

    let (shutdown_tx, _shutdown_rx): (broadcast::Sender<()>, _) = broadcast::channel(1);
    let mut shutdown_manager = ShutdownManager::new(shutdown_tx.clone(), options.lifecycle.clone());

    if let Err(e) = init_socket_server(
        &options,
        state.clone(),
        &mut shutdown_manager,
        shutdown_tx.subscribe(),
    )
    .await
    {
        error!("Failed to start hostrunner: {}", e);
        shutdown_manager.shutdown().await?;
        return Err(e);
    }

    if !options.lifecycle.is_persistent {
        tokio::select! {
            _ = shutdown_signal => {
                info!("Shutdown signal received, shutting down...");
            }
            _ = await_idle_timeout(
                state.activity_tracker.clone(),
                options.lifecycle.idle_timeout,
                options.lifecycle.idle_timeout_poll_interval,
            ) => {
                info!("Idle timeout ({:?}) reached, shutting down...", options.lifecycle.idle_timeout);
            }
        }
    } else {
        shutdown_signal.await;
        info!("Shutdown signal received, shutting down...");
    }

    drop(shutdown_tx);
    shutdown_manager.shutdown().await
}

async fn await_idle_timeout(
    activity_tracker: Arc<ActivityTracker>,
    idle_timeout: Duration,
    poll_interval: Duration,
) {
    loop {
        tokio::time::sleep(poll_interval).await;
        let last_activity =
            SystemTime::UNIX_EPOCH + Duration::from_secs(activity_tracker.last_touched());
        match SystemTime::now().duration_since(last_activity) {
            Ok(idle) if idle > idle_timeout => return,
            Err(_) => error!("Idle timeout checker error, ignoring..."),
            _ => {}
        }
    }
}

async fn init_socket_server(
    options: &AppOptions,
    state: Arc<ServerState>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), RunnerError> {
    info!("Initializing HTTP server...");

    let server_handle = serve(&options.server, state, async move {
        let _ = shutdown_rx.recv().await;
    })
    .await?;

    shutdown_manager.with_socket_server_handle(server_handle)
}

// ================================= SHUTDOWN ===================================== //

struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    lifecycle_options: LifecycleOptions,
    socket_server_handle: Option<JoinHandle<Result<(), RunnerError>>>,
}

impl ShutdownManager {
    fn new(shutdown_tx: broadcast::Sender<()>, lifecycle_options: LifecycleOptions) -> Self {
        Self {
            shutdown_tx,
            lifecycle_options,
            socket_server_handle: None,
        }
    }

    fn with_socket_server_handle(
        &mut self,
        handle: JoinHandle<Result<(), RunnerError>>,
    ) -> Result<(), RunnerError> {
        if self.socket_server_handle.is_some() {
            return Err(RunnerError::Internal(
                "server_handle already set".to_string(),
            ));
        }
        self.socket_server_handle = Some(handle);
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), RunnerError> {
        let _ = self.shutdown_tx.send(());

        let delay = self.lifecycle_options.max_shutdown_delay;
        match tokio::time::timeout(delay, self.shutdown_impl()).await {
            Ok(result) => result,
            Err(_) => {
                error!("Shutdown timed out after {:?}", delay);
                Err(RunnerError::ServerError(format!(
                    "shutdown timed out after {:?}",
                    delay
                )))
            }
        }
    }

    async fn shutdown_impl(&mut self) -> Result<(), RunnerError> {
        info!("Shutting down hostrunner...");

        // running jobs live in their own processes and are left alone
        if let Some(handle) = self.socket_server_handle.take() {
            handle
                .await
                .map_err(|e| RunnerError::Internal(e.to_string()))??;
        }

        info!("Shutdown complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_idle_timeout_fires_for_stale_tracker() {
        let tracker = Arc::new(ActivityTracker::touched_at(0));
        tokio::time::timeout(
            Duration::from_secs(5),
            await_idle_timeout(tracker, Duration::from_secs(60), Duration::from_millis(5)),
        )
        .await
        .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_waits_for_fresh_tracker() {
        let tracker = Arc::new(ActivityTracker::new());
        let waited = tokio::time::timeout(
            Duration::from_secs(30),
            await_idle_timeout(tracker, Duration::from_secs(3600), Duration::from_secs(1)),
        )
        .await;
        assert!(waited.is_err());
    }
}
