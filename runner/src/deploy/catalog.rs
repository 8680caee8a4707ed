//! Known runtime versions.
//!
//! Loaded once per job from a JSON file maintained outside the runner and
//! injected into the pipeline read-only.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::RunnerError;
use crate::filesys::file::File;

/// One installable version, optionally with a prebuilt archive
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionEntry {
    pub version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary: Option<String>,
}

/// Resolved version of a runtime
pub type Resolved = VersionEntry;

/// Version lists per runtime, newest first
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionCatalog {
    #[serde(default)]
    pub php: Vec<String>,

    #[serde(default)]
    pub python: Vec<VersionEntry>,

    #[serde(default)]
    pub ruby: Vec<VersionEntry>,

    #[serde(default)]
    pub java: Vec<VersionEntry>,
}

fn is_alias(value: &str) -> bool {
    matches!(value, "" | "latest" | "lts" | "stable" | "current")
}

/// `8` matches `8.3`, `3.12` matches `3.12.4`, never `3.120`
fn has_prefix(version: &str, prefix: &str) -> bool {
    version == prefix
        || version
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('.') || rest.starts_with('-'))
}

fn pick(list: &[VersionEntry], value: &str) -> Option<VersionEntry> {
    if is_alias(value) {
        return list.first().cloned();
    }
    list.iter().find(|e| has_prefix(&e.version, value)).cloned()
}

impl VersionCatalog {
    /// Read the catalog; a missing file yields an empty catalog
    pub async fn load(file: &File) -> Result<Self, RunnerError> {
        if !file.exists().await {
            warn!(
                "Version catalog {} not found, aliases will not resolve",
                file.path().display()
            );
            return Ok(Self::default());
        }
        let catalog: Self = file.read_json().await?;
        debug!(
            "Loaded version catalog: {} php, {} python, {} ruby, {} java",
            catalog.php.len(),
            catalog.python.len(),
            catalog.ruby.len(),
            catalog.java.len()
        );
        Ok(catalog)
    }

    /// PHP `major.minor` for `lts`/`latest`, a bare major or an explicit version
    pub fn php(&self, value: &str) -> Result<String, RunnerError> {
        if value.contains('.') {
            return Ok(value.to_string());
        }
        let found = if is_alias(value) {
            self.php.first()
        } else {
            self.php.iter().find(|v| has_prefix(v, value))
        };
        found.cloned().ok_or_else(|| RunnerError::UnknownVersion {
            runtime: "PHP".to_string(),
            requested: value.to_string(),
        })
    }

    /// Python version; unknown versions are built from source by pyenv
    pub fn python(&self, value: &str) -> Resolved {
        if value == "system" {
            return VersionEntry {
                version: value.to_string(),
                binary: None,
            };
        }
        pick(&self.python, value).unwrap_or_else(|| VersionEntry {
            version: if is_alias(value) { "3" } else { value }.to_string(),
            binary: None,
        })
    }

    /// Ruby version; unknown versions are built from source by rvm
    pub fn ruby(&self, value: &str) -> Resolved {
        pick(&self.ruby, value).unwrap_or_else(|| VersionEntry {
            version: if is_alias(value) { "ruby" } else { value }.to_string(),
            binary: None,
        })
    }

    /// Java needs a prebuilt archive
    pub fn java(&self, value: &str) -> Result<Resolved, RunnerError> {
        pick(&self.java, value)
            .filter(|e| e.binary.is_some())
            .ok_or_else(|| RunnerError::UnknownVersion {
                runtime: "Java".to_string(),
                requested: value.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn catalog() -> VersionCatalog {
        serde_json::from_value(json!({
            "php": ["8.4", "8.3", "7.4"],
            "python": [
                {"version": "3.13.1", "binary": "https://example.com/py-3.13.1.tar.zst"},
                {"version": "3.12.8"}
            ],
            "java": [
                {"version": "21.0.5", "binary": "https://example.com/jdk-21.tar.gz"},
                {"version": "17.0.13"}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_php_aliases() {
        let c = catalog();
        assert_eq!(c.php("lts").unwrap(), "8.4");
        assert_eq!(c.php("7").unwrap(), "7.4");
        assert_eq!(c.php("8.1").unwrap(), "8.1");
        assert!(matches!(
            c.php("5"),
            Err(RunnerError::UnknownVersion { .. })
        ));
    }

    #[test]
    fn test_python_resolution() {
        let c = catalog();
        let v = c.python("");
        assert_eq!(v.version, "3.13.1");
        assert!(v.binary.is_some());
        assert_eq!(c.python("3.12").version, "3.12.8");
        assert_eq!(c.python("3.9.1").version, "3.9.1");
        assert!(c.python("3.9.1").binary.is_none());
    }

    #[test]
    fn test_java_requires_binary() {
        let c = catalog();
        assert_eq!(c.java("21").unwrap().version, "21.0.5");
        let err = c.java("17").unwrap_err();
        assert_eq!(err.to_string(), "No Java with version 17 is available to install");
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let file = File::new(tmp.path().join("catalog.json"));
        assert_eq!(VersionCatalog::load(&file).await.unwrap(), VersionCatalog::default());
    }
}
