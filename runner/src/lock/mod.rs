//! Named, file-backed mutual exclusion shared by every runner process.
//!
//! A lock is a file created with `O_EXCL` under the locks directory. The file
//! holds the owner's pid so a lock left behind by a crashed process can be
//! broken by the next contender.

use std::future::Future;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::errors::RunnerError;
use crate::filesys::dir::Dir;
use crate::storage::settings::LockSettings;
use crate::utils::{calc_exp_backoff, CooldownOptions};

static TOMBSTONE_SEQ: AtomicU64 = AtomicU64::new(0);

/// Resource lock options
#[derive(Debug, Clone)]
pub struct LockOptions {
    /// Attempts after the first before giving up
    pub retries: u32,

    /// Backoff between attempts
    pub cooldown: CooldownOptions,

    /// Age after which a lock may be broken if its owner is gone
    pub stale_after: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            retries: 40,
            cooldown: CooldownOptions {
                base_delay: Duration::from_millis(50),
                max_delay: Duration::from_secs(1),
                multiplier: 2.0,
            },
            stale_after: Duration::from_secs(600),
        }
    }
}

impl From<&LockSettings> for LockOptions {
    fn from(settings: &LockSettings) -> Self {
        Self {
            retries: settings.retries,
            cooldown: CooldownOptions {
                base_delay: Duration::from_millis(settings.base_delay_ms),
                max_delay: Duration::from_millis(settings.max_delay_ms),
                multiplier: 2.0,
            },
            stale_after: Duration::from_secs(settings.stale_secs),
        }
    }
}

/// Factory for named locks living in one directory
#[derive(Debug, Clone)]
pub struct ResourceLocks {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    dir: Dir,
    options: LockOptions,
}

/// Proof of ownership of a named lock.
///
/// Dropping the handle releases the lock, so early returns and `?` never
/// leave it behind.
#[derive(Debug)]
pub struct LockHandle {
    name: String,
    path: PathBuf,
    released: bool,
}

impl LockHandle {
    /// Resource name this handle guards
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!("Failed to release lock '{}': {}", self.name, e);
            }
        }
    }
}

impl ResourceLocks {
    pub fn new(dir: Dir, options: LockOptions) -> Self {
        Self {
            inner: Arc::new(Inner { dir, options }),
        }
    }

    /// Acquire the lock named `name`, waiting with backoff while it is held
    pub async fn acquire(&self, name: &str) -> Result<LockHandle, RunnerError> {
        let path = self.lock_path(name);
        self.inner.dir.create_private().await?;

        let options = &self.inner.options;
        for attempt in 0..=options.retries {
            match try_create(&path).await {
                Ok(()) => {
                    debug!("Acquired lock '{}'", name);
                    return Ok(LockHandle {
                        name: name.to_string(),
                        path,
                        released: false,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if self.break_if_stale(name, &path).await {
                        continue;
                    }
                }
                Err(e) => return Err(e.into()),
            }

            if attempt < options.retries {
                tokio::time::sleep(calc_exp_backoff(&options.cooldown, attempt)).await;
            }
        }

        Err(RunnerError::LockTimeout {
            resource: name.to_string(),
            attempts: options.retries + 1,
        })
    }

    /// Release a previously acquired lock
    pub async fn release(&self, mut handle: LockHandle) -> Result<(), RunnerError> {
        handle.released = true;
        match fs::remove_file(&handle.path).await {
            Ok(()) => {
                debug!("Released lock '{}'", handle.name);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Run `critical` while holding the lock named `name`.
    ///
    /// The lock is released on every exit path, including errors.
    pub async fn with_lock<T, F, Fut>(&self, name: &str, critical: F) -> Result<T, RunnerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, RunnerError>>,
    {
        let handle = self.acquire(name).await?;
        let result = critical().await;
        let released = self.release(handle).await;
        let value = result?;
        released?;
        Ok(value)
    }

    /// File of the lock named `name`; reserved bytes are hex-escaped so
    /// distinct names never share a file
    fn lock_path(&self, name: &str) -> PathBuf {
        let mut file_name = String::with_capacity(name.len() + 5);
        for byte in name.bytes() {
            if byte.is_ascii_alphanumeric() || b"._-".contains(&byte) {
                file_name.push(char::from(byte));
            } else {
                file_name.push_str(&format!("%{:02X}", byte));
            }
        }
        file_name.push_str(".lock");
        self.inner.dir.path().join(file_name)
    }

    async fn break_if_stale(&self, name: &str, path: &Path) -> bool {
        let Ok(meta) = fs::metadata(path).await else {
            // vanished between create and stat, retry right away
            return true;
        };
        let age = meta
            .modified()
            .ok()
            .and_then(|m| SystemTime::now().duration_since(m).ok())
            .unwrap_or_default();
        if age < self.inner.options.stale_after {
            return false;
        }

        let owner = fs::read_to_string(path)
            .await
            .ok()
            .and_then(|s| s.trim().parse::<i32>().ok());
        if let Some(pid) = owner {
            if process_alive(pid) {
                return false;
            }
        }

        match take_stale(path, &meta).await {
            Ok(true) => {
                warn!("Broke stale lock '{}' (owner {:?}, age {:?})", name, owner, age);
                true
            }
            Ok(false) => false,
            // another contender broke it first
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
            Err(e) => {
                warn!("Failed to break stale lock '{}': {}", name, e);
                false
            }
        }
    }
}

/// Move the lock file at `path` aside, provided it is still the file that was
/// judged stale as `judged`.
///
/// The rename is atomic, so of two contenders breaking the same file only one
/// gets it. If a contender already replaced it with a live lock, that lock is
/// linked back into place and `false` is returned.
async fn take_stale(path: &Path, judged: &std::fs::Metadata) -> std::io::Result<bool> {
    let seq = TOMBSTONE_SEQ.fetch_add(1, Ordering::Relaxed);
    let mut tomb = path.as_os_str().to_owned();
    tomb.push(format!(".{}-{}.stale", std::process::id(), seq));
    let tomb = PathBuf::from(tomb);

    fs::rename(path, &tomb).await?;
    let taken = fs::metadata(&tomb).await?;
    let same = taken.dev() == judged.dev() && taken.ino() == judged.ino();
    if !same {
        if let Err(e) = fs::hard_link(&tomb, path).await {
            warn!("Failed to restore lock {}: {}", path.display(), e);
        }
    }
    fs::remove_file(&tomb).await?;
    Ok(same)
}

async fn try_create(path: &Path) -> std::io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;
    file.write_all(format!("{}\n", std::process::id()).as_bytes())
        .await?;
    file.flush().await?;
    Ok(())
}

fn process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 only checks for existence and permission
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}
