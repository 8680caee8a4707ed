//! Production wiring of the deployment pipeline

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::collab::Collaborators;
use crate::deploy::{Deployer, VersionCatalog};
use crate::errors::RunnerError;
use crate::filesys::file::File;
use crate::gateway::{PrivilegedGateway, SudoGateway};
use crate::lock::{LockOptions, ResourceLocks};
use crate::shell::{DryShellLauncher, PtyShellLauncher, SessionOptions, ShellLauncher};
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;

/// Catalog file named by the settings, or the layout default
pub fn catalog_file(settings: &Settings, layout: &StorageLayout) -> File {
    match &settings.catalog_file {
        Some(path) => File::new(path),
        None => layout.catalog_file(),
    }
}

/// Shell launcher matching the settings
pub fn shell_launcher(
    settings: &Settings,
    gateway: Arc<dyn PrivilegedGateway>,
) -> Arc<dyn ShellLauncher> {
    if settings.dry_shell {
        warn!("dry_shell is enabled, deployment commands will only be logged");
        return Arc::new(DryShellLauncher);
    }
    Arc::new(PtyShellLauncher::new(
        settings.helper_command.clone(),
        gateway,
        SessionOptions {
            prompt_style: settings.prompt_style,
            max_execution: Duration::from_secs(settings.max_execution_secs),
        },
    ))
}

/// Build the deployer a job process runs with
pub async fn build_deployer(
    settings: &Settings,
    layout: &StorageLayout,
) -> Result<Deployer, RunnerError> {
    layout.setup().await?;

    let gateway: Arc<dyn PrivilegedGateway> =
        Arc::new(SudoGateway::new(settings.helper_command.clone())?);
    let locks = ResourceLocks::new(layout.locks_dir(), LockOptions::from(&settings.lock));
    let collab = Collaborators::from_gateway(gateway.clone(), locks);

    let catalog = Arc::new(VersionCatalog::load(&catalog_file(settings, layout)).await?);
    let launcher = shell_launcher(settings, gateway);
    info!(
        "Deployer ready ({} shared certificates, {:?} prompts)",
        settings.shared_certificates.len(),
        settings.prompt_style
    );

    Ok(Deployer::new(collab, catalog, launcher)
        .with_shared_certificates(settings.shared_certificates.clone())
        .with_prompt_style(settings.prompt_style))
}
