//! State store for the orchestration loop
//!
//! One JSON document per collection under the state directory (`.hyphae/`
//! by default):
//!
//! ```text
//! <state_dir>/
//!   job_runs.json          # JobRunRecord
//!   retry_attempts.json    # RetryAttempt
//!   diagnostics.json       # DiagnosticEntry
//!   patch_attempts.json    # PatchAttempt
//!   health_snapshots.json  # HealthSnapshot
//!   work_items.json        # WorkItem
//!   .lock                  # advisory lock held while a document is read or written
//!   run.lock               # held for the whole cycle, see `RunLock`
//! ```
//!
//! # Error Handling
//!
//! Unlike a cache, this state cannot be regenerated. A document that exists
//! but does not parse is reported as [`StoreError::Corrupt`] and callers must
//! stop the cycle rather than continue with guessed state. A missing document
//! is an empty collection.
//!
//! The store is not safe for concurrent mutation. Callers serialize writes;
//! the advisory lock only protects readers from observing a half-replaced file
//! on platforms where rename is not atomic.

mod run_lock;

pub use run_lock::{RunLock, RunLockInfo};

use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration as StdDuration, Instant};

const DOCUMENT_VERSION: u32 = 1;
const STORE_LOCK_FILE: &str = ".lock";
const STORE_LOCK_TIMEOUT_SECS: u64 = 5;
const STORE_LOCK_RETRY_MS: u64 = 50;

/// Errors callers need to tell apart; everything fatal for the cycle.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{collection} document is corrupt: {reason}")]
    Corrupt {
        collection: &'static str,
        reason: String,
    },

    #[error("{collection} document has unsupported version {found} (expected {DOCUMENT_VERSION})")]
    UnsupportedVersion {
        collection: &'static str,
        found: u32,
    },

    #[error("failed to serialize {collection}: {source}")]
    Serialize {
        collection: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("timed out waiting for state store lock ({0}s)")]
    LockTimeout(u64),

    #[error("another cycle holds the run lock (pid {pid}, since {since})")]
    RunLockHeld {
        pid: u32,
        since: chrono::DateTime<chrono::Utc>,
    },
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Logical collections, one document each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    JobRuns,
    RetryAttempts,
    Diagnostics,
    PatchAttempts,
    HealthSnapshots,
    WorkItems,
}

impl Collection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::JobRuns => "job_runs",
            Collection::RetryAttempts => "retry_attempts",
            Collection::Diagnostics => "diagnostics",
            Collection::PatchAttempts => "patch_attempts",
            Collection::HealthSnapshots => "health_snapshots",
            Collection::WorkItems => "work_items",
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}.json", self.as_str())
    }

    pub fn all() -> [Collection; 6] {
        [
            Collection::JobRuns,
            Collection::RetryAttempts,
            Collection::Diagnostics,
            Collection::PatchAttempts,
            Collection::HealthSnapshots,
            Collection::WorkItems,
        ]
    }
}

#[derive(Serialize)]
struct DocumentRef<'a, T> {
    version: u32,
    records: &'a [T],
}

#[derive(Deserialize)]
struct Document<T> {
    version: u32,
    records: Vec<T>,
}

/// Only the envelope, for version checks without knowing the record type.
#[derive(Deserialize)]
struct Envelope {
    version: u32,
    records: Vec<serde_json::Value>,
}

/// File-backed store, one document per collection.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

struct StoreLock {
    file: std::fs::File,
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl StateStore {
    /// Open (and create if needed) the store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        let store = Self { dir };
        if let Err(err) = store.ensure_ignored() {
            tracing::debug!(error = %err, "could not add state dir to git excludes");
        }
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, collection: Collection) -> PathBuf {
        self.dir.join(collection.file_name())
    }

    /// Keep the state directory out of version control when it lives inside a
    /// repository, so auto-patch commits never pick it up.
    fn ensure_ignored(&self) -> std::io::Result<()> {
        let Some(repo_root) = self.dir.parent() else {
            return Ok(());
        };
        let Some(dir_name) = self.dir.file_name().and_then(|n| n.to_str()) else {
            return Ok(());
        };
        let entry = format!("{}/", dir_name);

        let git_dir = repo_root.join(".git");
        if git_dir.is_dir() {
            let info_dir = git_dir.join("info");
            fs::create_dir_all(&info_dir)?;
            return append_ignore_entry(&info_dir.join("exclude"), &entry);
        }

        let gitignore_path = repo_root.join(".gitignore");
        if gitignore_path.exists() {
            return append_ignore_entry(&gitignore_path, &entry);
        }
        Ok(())
    }

    fn lock(&self, exclusive: bool) -> Result<StoreLock> {
        let lock_path = self.dir.join(STORE_LOCK_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false) // Lock file content doesn't matter, just the lock
            .open(&lock_path)
            .map_err(|e| StoreError::io(&lock_path, e))?;

        let start = Instant::now();
        loop {
            let result = if exclusive {
                FileExt::try_lock_exclusive(&file)
            } else {
                FileExt::try_lock_shared(&file)
            };
            match result {
                Ok(()) => break,
                Err(err) => {
                    if err.kind() != ErrorKind::WouldBlock {
                        return Err(StoreError::io(&lock_path, err));
                    }
                    if start.elapsed() >= StdDuration::from_secs(STORE_LOCK_TIMEOUT_SECS) {
                        return Err(StoreError::LockTimeout(STORE_LOCK_TIMEOUT_SECS));
                    }
                    std::thread::sleep(StdDuration::from_millis(STORE_LOCK_RETRY_MS));
                }
            }
        }

        Ok(StoreLock { file })
    }

    /// Load every record of a collection. Missing documents are empty.
    pub fn load<T: DeserializeOwned>(&self, collection: Collection) -> Result<Vec<T>> {
        let _lock = self.lock(false)?;
        self.read_unlocked(collection)
    }

    /// Replace a collection's document atomically.
    pub fn save<T: Serialize>(&self, collection: Collection, records: &[T]) -> Result<()> {
        let _lock = self.lock(true)?;
        self.write_unlocked(collection, records)
    }

    /// Load, mutate and write back one collection under a single exclusive lock.
    pub fn update<T, R, F>(&self, collection: Collection, f: F) -> Result<R>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut Vec<T>) -> R,
    {
        let _lock = self.lock(true)?;
        let mut records = self.read_unlocked(collection)?;
        let out = f(&mut records);
        self.write_unlocked(collection, &records)?;
        Ok(out)
    }

    /// Check every collection parses, without decoding records into types.
    ///
    /// Run at the start of a cycle so corruption stops the process before any
    /// phase mutates state.
    pub fn verify(&self) -> Result<()> {
        let _lock = self.lock(false)?;
        for collection in Collection::all() {
            let path = self.path_for(collection);
            let Some(content) = read_optional(&path)? else {
                continue;
            };
            let envelope: Envelope =
                serde_json::from_str(&content).map_err(|e| StoreError::Corrupt {
                    collection: collection.as_str(),
                    reason: e.to_string(),
                })?;
            check_version(collection, envelope.version)?;
            tracing::trace!(
                collection = collection.as_str(),
                records = envelope.records.len(),
                "verified"
            );
        }
        Ok(())
    }

    fn read_unlocked<T: DeserializeOwned>(&self, collection: Collection) -> Result<Vec<T>> {
        let path = self.path_for(collection);
        let Some(content) = read_optional(&path)? else {
            return Ok(Vec::new());
        };
        let document: Document<T> =
            serde_json::from_str(&content).map_err(|e| StoreError::Corrupt {
                collection: collection.as_str(),
                reason: e.to_string(),
            })?;
        check_version(collection, document.version)?;
        Ok(document.records)
    }

    fn write_unlocked<T: Serialize>(&self, collection: Collection, records: &[T]) -> Result<()> {
        let path = self.path_for(collection);
        let document = DocumentRef {
            version: DOCUMENT_VERSION,
            records,
        };
        let content =
            serde_json::to_string_pretty(&document).map_err(|e| StoreError::Serialize {
                collection: collection.as_str(),
                source: e,
            })?;
        write_atomic(&path, &content).map_err(|e| StoreError::io(&path, e))
    }
}

fn check_version(collection: Collection, found: u32) -> Result<()> {
    if found != DOCUMENT_VERSION {
        return Err(StoreError::UnsupportedVersion {
            collection: collection.as_str(),
            found,
        });
    }
    Ok(())
}

fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StoreError::io(path, e)),
    }
}

fn append_ignore_entry(path: &Path, entry: &str) -> std::io::Result<()> {
    let content = fs::read_to_string(path).unwrap_or_default();
    let bare = entry.trim_end_matches('/');
    let already_present = content.lines().any(|line| {
        let trimmed = line.trim();
        trimmed == entry || trimmed == bare
    });
    if already_present {
        return Ok(());
    }

    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    use std::io::Write;
    if !content.trim().is_empty() && !content.ends_with('\n') {
        writeln!(file)?;
    }
    writeln!(file, "# hyphae state")?;
    writeln!(file, "{}", entry)?;
    Ok(())
}

/// Replace `path` with `content` through a sibling temp file.
///
/// On Windows the old document is first moved to `.bak`; a crash between the
/// two renames leaves only the backup, which `verify` will not read.
pub(crate) fn write_atomic(path: &Path, content: &str) -> std::io::Result<()> {
    let tmp_path = tmp_path_for(path);
    fs::write(&tmp_path, content)?;

    #[cfg(windows)]
    {
        let backup_path = path.with_extension("bak");
        if backup_path.exists() {
            let _ = fs::remove_file(&backup_path);
        }
        if path.exists() {
            if let Err(err) = fs::rename(path, &backup_path) {
                let _ = fs::remove_file(&tmp_path);
                return Err(err);
            }
        }
        if let Err(err) = fs::rename(&tmp_path, path) {
            if backup_path.exists() {
                let _ = fs::rename(&backup_path, path);
            }
            let _ = fs::remove_file(&tmp_path);
            return Err(err);
        }
        if backup_path.exists() {
            let _ = fs::remove_file(&backup_path);
        }
        return Ok(());
    }

    #[cfg(not(windows))]
    {
        if let Err(err) = fs::rename(&tmp_path, path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(err);
        }
        Ok(())
    }
}

/// `foo.json` -> `.foo.json.tmp`, next to the target so rename stays on one filesystem.
fn tmp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.tmp", name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RetryAttempt, RetryResult};
    use chrono::Utc;

    fn test_store() -> (tempfile::TempDir, StateStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path().join(".hyphae")).unwrap();
        (dir, store)
    }

    fn attempt(n: u32) -> RetryAttempt {
        RetryAttempt {
            job_name: "news-monitor".to_string(),
            run_id: format!("7-{}", n),
            lineage: "7".to_string(),
            attempt_number: n,
            issued_at: Utc::now(),
            result: RetryResult::Pending,
        }
    }

    #[test]
    fn missing_document_is_empty() {
        let (_dir, store) = test_store();
        let records: Vec<RetryAttempt> = store.load(Collection::RetryAttempts).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn save_and_load_round_trip() {
        let (_dir, store) = test_store();
        store
            .save(Collection::RetryAttempts, &[attempt(1), attempt(2)])
            .unwrap();

        let loaded: Vec<RetryAttempt> = store.load(Collection::RetryAttempts).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[1].attempt_number, 2);

        let raw = fs::read_to_string(store.dir().join("retry_attempts.json")).unwrap();
        assert!(raw.contains("\"version\": 1"));
        assert!(!store.dir().join(".retry_attempts.json.tmp").exists());
    }

    #[test]
    fn update_mutates_in_place() {
        let (_dir, store) = test_store();
        store.save(Collection::RetryAttempts, &[attempt(1)]).unwrap();

        let count = store
            .update(Collection::RetryAttempts, |records: &mut Vec<RetryAttempt>| {
                records[0].result = RetryResult::Succeeded;
                records.push(attempt(2));
                records.len()
            })
            .unwrap();
        assert_eq!(count, 2);

        let loaded: Vec<RetryAttempt> = store.load(Collection::RetryAttempts).unwrap();
        assert_eq!(loaded[0].result, RetryResult::Succeeded);
    }

    #[test]
    fn corrupt_document_is_fatal() {
        let (_dir, store) = test_store();
        fs::write(store.dir().join("diagnostics.json"), "{ not json").unwrap();

        let err = store.verify().unwrap_err();
        assert!(matches!(
            err,
            StoreError::Corrupt {
                collection: "diagnostics",
                ..
            }
        ));

        let err = store
            .load::<crate::model::DiagnosticEntry>(Collection::Diagnostics)
            .unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[test]
    fn unknown_version_is_rejected() {
        let (_dir, store) = test_store();
        fs::write(
            store.dir().join("job_runs.json"),
            r#"{"version": 9, "records": []}"#,
        )
        .unwrap();

        let err = store.verify().unwrap_err();
        assert!(matches!(
            err,
            StoreError::UnsupportedVersion { found: 9, .. }
        ));
    }

    #[test]
    fn state_dir_is_excluded_from_git() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join(".git")).unwrap();
        let _store = StateStore::open(dir.path().join(".hyphae")).unwrap();
        let _again = StateStore::open(dir.path().join(".hyphae")).unwrap();

        let exclude = fs::read_to_string(dir.path().join(".git/info/exclude")).unwrap();
        assert_eq!(exclude.matches(".hyphae/").count(), 1);
    }
}
