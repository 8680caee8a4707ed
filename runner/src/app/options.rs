//! Application configuration options

use std::time::Duration;

use crate::storage::settings::Settings;

/// Main application options
#[derive(Debug, Clone, Default)]
pub struct AppOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Server configuration
    pub server: ServerOptions,
}

impl From<&Settings> for AppOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            lifecycle: LifecycleOptions {
                is_persistent: settings.is_persistent,
                idle_timeout: Duration::from_secs(settings.idle_timeout_secs),
                ..Default::default()
            },
            server: ServerOptions {
                host: settings.server.host.clone(),
                port: settings.server.port,
            },
        }
    }
}

/// Lifecycle options for the API server
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Whether the server runs persistently (as a service)
    pub is_persistent: bool,

    /// Time without submissions before shutdown (non-persistent mode)
    pub idle_timeout: Duration,

    /// Interval to check for idle timeout
    pub idle_timeout_poll_interval: Duration,

    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            is_persistent: true,
            idle_timeout: Duration::from_secs(3600),
            idle_timeout_poll_interval: Duration::from_secs(10),
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}

/// HTTP server options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub host: String,
    pub port: u16,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 2223,
        }
    }
}
