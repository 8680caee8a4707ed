//! hostrunner - Entry Point
//!
//! Serves the job submission API by default. With `--job` the process runs a
//! single deployment handed over by the API process and exits.

use std::collections::HashMap;
use std::env;
use std::process::ExitCode;
use std::sync::Arc;

use hostrunner::app::options::AppOptions;
use hostrunner::app::run::run;
use hostrunner::app::setup::build_deployer;
use hostrunner::app::state::ActivityTracker;
use hostrunner::filesys::file::File;
use hostrunner::jobs::{self, JobRequest, ProcessLauncher};
use hostrunner::logs::{init_logging, LogOptions};
use hostrunner::server::auth::AuthPolicy;
use hostrunner::server::state::ServerState;
use hostrunner::storage::layout::StorageLayout;
use hostrunner::storage::settings::Settings;
use hostrunner::utils::version_info;

use tracing::{error, info};

/// Exit code of a job process started without a usable payload
const BAD_PAYLOAD_EXIT_CODE: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    // Parse command line arguments
    let args: Vec<String> = env::args().collect();
    let mut cli_args: HashMap<String, String> = HashMap::new();

    for arg in args.iter().skip(1) {
        if let Some((key, value)) = arg.split_once('=') {
            // Handle --key=value format
            let clean_key = key.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with("--") {
            // Handle standalone flags like --version
            let clean_key = arg.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), "true".to_string());
        }
    }

    // Print version and exit
    let version = version_info();
    if cli_args.contains_key("version") {
        match serde_json::to_string_pretty(&version) {
            Ok(text) => println!("{}", text),
            Err(_) => println!("{}", version.version),
        }
        return ExitCode::SUCCESS;
    }

    let layout = match cli_args.get("base-dir") {
        Some(dir) => StorageLayout::new(dir),
        None => StorageLayout::default(),
    };
    let settings_file = match cli_args.get("config") {
        Some(path) => File::new(path),
        None => layout.settings_file(),
    };
    let settings = match Settings::load(&settings_file).await {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Unable to read settings file: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if cli_args.contains_key("job") {
        run_job(&settings, &layout).await
    } else {
        serve(&settings, layout, &cli_args).await
    }
}

async fn run_job(settings: &Settings, layout: &StorageLayout) -> ExitCode {
    // stdout is already redirected into the daily job log
    let log_options = LogOptions {
        log_level: settings.log_level,
        json_format: settings.json_logs,
        ..Default::default()
    };
    let _guard = match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            None
        }
    };

    let job = match JobRequest::take_from_env() {
        Ok(job) => job,
        Err(e) => {
            error!("Invalid job payload: {}", e);
            return ExitCode::from(BAD_PAYLOAD_EXIT_CODE);
        }
    };
    info!("Starting job for {} (pid {})", job.domain, std::process::id());

    let deployer = match build_deployer(settings, layout).await {
        Ok(deployer) => deployer,
        Err(e) => {
            error!("Failed to prepare the deployer: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let outcome = jobs::execute(job, &deployer, &settings.callback).await;
    if outcome.aborted {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

async fn serve(
    settings: &Settings,
    layout: StorageLayout,
    cli_args: &HashMap<String, String>,
) -> ExitCode {
    let log_options = LogOptions {
        log_level: settings.log_level,
        json_format: settings.json_logs,
        log_dir: Some(layout.logs_dir().path().to_path_buf()),
        ..Default::default()
    };
    let _guard = match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            None
        }
    };

    if let Err(e) = layout.setup().await {
        error!("Unable to prepare {}: {}", layout.base_dir.display(), e);
        return ExitCode::FAILURE;
    }

    // job processes must see the same settings as the server
    let forwarded = ["config", "base-dir"]
        .iter()
        .filter_map(|key| cli_args.get(*key).map(|value| format!("--{}={}", key, value)))
        .collect();
    let launcher = match ProcessLauncher::current(layout, forwarded) {
        Ok(launcher) => launcher,
        Err(e) => {
            error!("Unable to locate the runner executable: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let auth = match AuthPolicy::from_settings(settings) {
        Ok(auth) => auth,
        Err(e) => {
            error!("Invalid settings: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let state = Arc::new(ServerState::new(
        Arc::new(launcher),
        auth,
        Arc::new(ActivityTracker::new()),
    ));

    let options = AppOptions::from(settings);
    info!("Running hostrunner with options: {:?}", options);
    match run(options, state, await_shutdown_signal()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Failed to run hostrunner: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("Failed to listen for SIGTERM");
        let mut sigint = signal(SignalKind::interrupt()).expect("Failed to listen for SIGINT");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down...");
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down...");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
        info!("Ctrl+C received, shutting down...");
    }
}
