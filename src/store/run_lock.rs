//! Whole-cycle lock so two scheduled invocations never overlap.
//!
//! The lock is a file created with `create_new`. Replacing a stale one, and
//! removing our own on drop, happen under an advisory lock on a sidecar file
//! so two processes never both take over the same stale holder.

use super::StoreError;
use chrono::{DateTime, Duration, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

const RUN_LOCK_FILE: &str = "run.lock";
const TAKEOVER_FILE: &str = "run.lock.takeover";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunLockInfo {
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}

/// Held for the duration of a cycle; the file is removed on drop unless
/// someone else has since taken it over.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    info: RunLockInfo,
}

impl RunLock {
    /// Take the lock, replacing it when the holder is older than `stale_after`.
    pub fn acquire(state_dir: &Path, stale_after: Duration) -> Result<Self, StoreError> {
        let path = state_dir.join(RUN_LOCK_FILE);
        let info = RunLockInfo {
            pid: std::process::id(),
            acquired_at: Utc::now(),
        };

        match create_new(&path, &info) {
            Ok(()) => return Ok(Self { path, info }),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {}
            Err(err) => return Err(StoreError::io(&path, err)),
        }

        let _guard = takeover_guard(state_dir)?;
        // Read again: another process may have replaced it while we waited
        if let Some(holder) = read_holder(&path) {
            if Utc::now() - holder.acquired_at <= stale_after {
                return Err(held(holder));
            }
            tracing::warn!(pid = holder.pid, since = %holder.acquired_at, "replacing stale run lock");
        } else {
            tracing::warn!("replacing unreadable run lock");
        }

        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(StoreError::io(&path, err)),
        }
        match create_new(&path, &info) {
            Ok(()) => Ok(Self { path, info }),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                // A fresh acquirer got in between the remove and the create
                let holder = read_holder(&path).unwrap_or_else(|| info.clone());
                Err(held(holder))
            }
            Err(err) => Err(StoreError::io(&path, err)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let guard = self.path.parent().and_then(|dir| takeover_guard(dir).ok());
        if read_holder(&self.path).as_ref() == Some(&self.info) {
            let _ = fs::remove_file(&self.path);
        } else {
            tracing::warn!(path = %self.path.display(), "run lock was taken over; leaving it in place");
        }
        drop(guard);
    }
}

fn held(holder: RunLockInfo) -> StoreError {
    StoreError::RunLockHeld {
        pid: holder.pid,
        since: holder.acquired_at,
    }
}

/// Exclusive advisory lock serializing takeovers; released when the file closes.
fn takeover_guard(state_dir: &Path) -> Result<File, StoreError> {
    let path = state_dir.join(TAKEOVER_FILE);
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)
        .map_err(|e| StoreError::io(&path, e))?;
    FileExt::lock_exclusive(&file).map_err(|e| StoreError::io(&path, e))?;
    Ok(file)
}

fn create_new(path: &Path, info: &RunLockInfo) -> std::io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    let content = serde_json::to_string(info)
        .map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e))?;
    file.write_all(content.as_bytes())?;
    file.sync_all()
}

/// Unreadable or malformed lock files are treated as stale.
fn read_holder(path: &Path) -> Option<RunLockInfo> {
    let content = fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_is_refused_while_held() {
        let dir = tempfile::tempdir().unwrap();
        let lock = RunLock::acquire(dir.path(), Duration::minutes(30)).unwrap();
        assert!(lock.path().exists());

        let err = RunLock::acquire(dir.path(), Duration::minutes(30)).unwrap_err();
        assert!(matches!(err, StoreError::RunLockHeld { pid, .. } if pid == std::process::id()));

        drop(lock);
        assert!(!dir.path().join(RUN_LOCK_FILE).exists());
        assert!(RunLock::acquire(dir.path(), Duration::minutes(30)).is_ok());
    }

    #[test]
    fn stale_lock_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let old = RunLockInfo {
            pid: 1,
            acquired_at: Utc::now() - Duration::hours(2),
        };
        fs::write(
            dir.path().join(RUN_LOCK_FILE),
            serde_json::to_string(&old).unwrap(),
        )
        .unwrap();

        let lock = RunLock::acquire(dir.path(), Duration::minutes(30)).unwrap();
        let holder = read_holder(lock.path()).unwrap();
        assert_eq!(holder.pid, std::process::id());
    }

    #[test]
    fn only_one_of_two_takeovers_wins() {
        let dir = tempfile::tempdir().unwrap();
        let old = RunLockInfo {
            pid: 1,
            acquired_at: Utc::now() - Duration::hours(2),
        };
        fs::write(dir.path().join(RUN_LOCK_FILE), serde_json::to_string(&old).unwrap()).unwrap();

        let state_dir = dir.path().to_path_buf();
        let contenders: Vec<_> = (0..2)
            .map(|_| {
                let state_dir = state_dir.clone();
                std::thread::spawn(move || {
                    RunLock::acquire(&state_dir, Duration::minutes(30)).map(std::mem::forget)
                })
            })
            .collect();
        let won = contenders
            .into_iter()
            .map(|t| t.join().unwrap())
            .filter(|r| r.is_ok())
            .count();
        assert_eq!(won, 1);
    }

    #[test]
    fn drop_leaves_a_lock_taken_over_by_someone_else() {
        let dir = tempfile::tempdir().unwrap();
        let lock = RunLock::acquire(dir.path(), Duration::minutes(30)).unwrap();
        let other = RunLockInfo {
            pid: std::process::id().wrapping_add(1),
            acquired_at: Utc::now(),
        };
        fs::write(lock.path(), serde_json::to_string(&other).unwrap()).unwrap();

        drop(lock);
        assert_eq!(read_holder(&dir.path().join(RUN_LOCK_FILE)), Some(other));
    }

    #[test]
    fn garbage_lock_file_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(RUN_LOCK_FILE), "???").unwrap();
        assert!(RunLock::acquire(dir.path(), Duration::minutes(30)).is_ok());
    }
}
