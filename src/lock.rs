//! Named advisory locks guarding group mutations.
//!
//! A lock is an exclusive `flock` on `<lock dir>/<scope>-<key>.lock`. Waiters poll with
//! a bounded timeout. The kernel releases the lock when its holder exits, so a crashed
//! supervisor never leaves other invocations blocked; a hung one blocks them at most for
//! their own timeout.
//!
//! Nesting `with_lock` on a key the current task already holds fails immediately with
//! [`SupervisorError::LockReentrant`].

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::future::Future;
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ensure_private_dir;
use crate::error::{Result, SupervisorError};
use crate::state::slugify;

const POLL_INTERVAL: Duration = Duration::from_millis(25);

tokio::task_local! {
    static HELD_LOCKS: HashSet<String>;
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LockOwner {
    pid: u32,
    acquired_at: DateTime<Utc>,
}

/// Hands out exclusive (scope, key) locks under a lock directory.
#[derive(Debug, Clone)]
pub struct LockManager {
    lock_dir: PathBuf,
    poll_interval: Duration,
}

impl LockManager {
    pub fn new(lock_dir: impl Into<PathBuf>) -> Self {
        Self {
            lock_dir: lock_dir.into(),
            poll_interval: POLL_INTERVAL,
        }
    }

    /// Runs `operation` while holding the (scope, key) lock.
    ///
    /// The lock is released however `operation` ends, including when the returned
    /// future is dropped before completion.
    pub async fn with_lock<F, Fut, T>(
        &self,
        scope: &str,
        key: &str,
        timeout: Duration,
        operation: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let id = lock_id(scope, key);
        let mut held = HELD_LOCKS.try_with(Clone::clone).unwrap_or_default();
        if held.contains(&id) {
            return Err(SupervisorError::LockReentrant {
                scope: scope.to_string(),
                key: key.to_string(),
            });
        }

        let guard = self.acquire(scope, key, timeout).await?;
        held.insert(id);
        let result = HELD_LOCKS.scope(held, operation()).await;
        drop(guard);
        result
    }

    async fn acquire(&self, scope: &str, key: &str, timeout: Duration) -> Result<LockGuard> {
        ensure_private_dir(&self.lock_dir)?;
        let path = self
            .lock_dir
            .join(format!("{}-{}.lock", slugify(scope), slugify(key)));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|err| {
                SupervisorError::config(format!("failed to open lock {}", path.display()), err)
            })?;

        let started = tokio::time::Instant::now();
        let deadline = started + timeout;
        loop {
            if try_flock(&file).map_err(|err| {
                SupervisorError::config(format!("failed to lock {}", path.display()), err)
            })? {
                let mut guard = LockGuard { file, path };
                guard.record_owner();
                tracing::debug!(scope, key, "acquired lock");
                return Ok(guard);
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                let owner = read_owner(&path);
                let holder = owner.as_ref().map(|owner| owner.pid);
                let held_since = owner.as_ref().map(|owner| owner.acquired_at);
                tracing::warn!(scope, key, ?holder, ?held_since, "timed out waiting for lock");
                return Err(SupervisorError::LockTimeout {
                    scope: scope.to_string(),
                    key: key.to_string(),
                    waited: now - started,
                    holder,
                });
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }
}

/// An acquired lock. Dropping it releases the lock.
#[derive(Debug)]
struct LockGuard {
    file: File,
    path: PathBuf,
}

impl LockGuard {
    fn record_owner(&mut self) {
        let owner = LockOwner {
            pid: std::process::id(),
            acquired_at: Utc::now(),
        };
        let Ok(json) = serde_json::to_vec(&owner) else {
            return;
        };
        // Diagnostics only; the flock is what excludes other holders.
        if let Err(err) = overwrite(&mut self.file, &json) {
            tracing::debug!(path = %self.path.display(), error = %err, "failed to record lock owner");
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = self.file.set_len(0);
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
        tracing::debug!(path = %self.path.display(), "released lock");
    }
}

fn overwrite(file: &mut File, contents: &[u8]) -> std::io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(contents)?;
    file.flush()
}

fn lock_id(scope: &str, key: &str) -> String {
    format!("{scope}\u{0}{key}")
}

fn try_flock(file: &File) -> std::io::Result<bool> {
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(code) if code == libc::EWOULDBLOCK || code == libc::EINTR => Ok(false),
        _ => Err(err),
    }
}

fn read_owner(path: &Path) -> Option<LockOwner> {
    let mut raw = String::new();
    File::open(path).ok()?.read_to_string(&mut raw).ok()?;
    serde_json::from_str(&raw).ok()
}
