//! Storage layout configuration

use std::path::PathBuf;

use crate::errors::RunnerError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;

/// Storage layout for the runner
#[derive(Debug, Clone)]
pub struct StorageLayout {
    /// Base directory for all storage
    pub base_dir: PathBuf,
}

impl StorageLayout {
    /// Create a new storage layout
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Get the settings file path
    pub fn settings_file(&self) -> File {
        File::new(self.base_dir.join("settings.json"))
    }

    /// Get the runtime version catalog file
    pub fn catalog_file(&self) -> File {
        File::new(self.base_dir.join("catalog.json"))
    }

    /// Scratch directory shared with the privileged helper
    pub fn tmp_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("tmp"))
    }

    /// Directory holding the resource lock files
    pub fn locks_dir(&self) -> Dir {
        self.tmp_dir().subdir("locks")
    }

    /// Get the logs directory
    pub fn logs_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("logs"))
    }

    /// Log file a detached job process writes its stdout/stderr to
    pub fn job_log_file(&self, date: chrono::NaiveDate) -> File {
        self.logs_dir()
            .file(&format!("{}.log", date.format("%Y-%m-%d")))
    }

    /// Setup the storage layout (create directories)
    pub async fn setup(&self) -> Result<(), RunnerError> {
        self.tmp_dir().create().await?;
        self.locks_dir().create_private().await?;
        self.logs_dir().create().await?;
        Ok(())
    }
}

impl Default for StorageLayout {
    fn default() -> Self {
        Self::new("/etc/hostrunner")
    }
}
