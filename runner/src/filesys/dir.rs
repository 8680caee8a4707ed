//! Directories owned by the runner

use std::path::{Path, PathBuf};

use tokio::fs;

use crate::errors::RunnerError;
use crate::filesys::file::File;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dir {
    path: PathBuf,
}

impl Dir {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the directory and its missing parents
    pub async fn create(&self) -> Result<(), RunnerError> {
        fs::create_dir_all(&self.path).await?;
        Ok(())
    }

    /// Like [`Dir::create`], but new directories are only accessible to the
    /// runner's own user. Domain users must not be able to plant lock files.
    pub async fn create_private(&self) -> Result<(), RunnerError> {
        let mut builder = fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        builder.mode(0o700);
        builder.create(&self.path).await?;
        Ok(())
    }

    pub fn file(&self, name: &str) -> File {
        File::new(self.path.join(name))
    }

    pub fn subdir(&self, name: &str) -> Dir {
        Dir::new(self.path.join(name))
    }
}
