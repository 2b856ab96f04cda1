//! Version control seam
//!
//! Patches are committed one file at a time. The commit tree is HEAD's tree
//! with only that path replaced, so anything else staged in the working
//! copy stays out of auto-patch commits.

use anyhow::{Context, Result};
use async_trait::async_trait;
use git2::{IndexEntry, IndexTime, Oid, Repository, Signature};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[async_trait]
pub trait VersionControl: Send + Sync {
    /// Commit the current on-disk content of `path`. Returns the commit id.
    async fn commit_file(&self, path: &str, message: &str) -> Result<String>;

    /// Content of `path` at HEAD, `None` if it is not tracked.
    async fn last_committed_content(&self, path: &str) -> Result<Option<String>>;

    /// Id of the HEAD commit, `None` on an unborn branch.
    async fn head_commit(&self) -> Result<Option<String>>;
}

/// git2-backed implementation. Every call runs on the blocking pool and is
/// bounded by `timeout`. Reads are abandoned on timeout; a commit is told to
/// stop and then awaited, so a reported failure never lands later.
#[derive(Debug, Clone)]
pub struct GitRepo {
    repo_path: PathBuf,
    timeout: Duration,
}

impl GitRepo {
    pub fn new(repo_path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            repo_path: repo_path.into(),
            timeout,
        }
    }

    async fn blocking<T, F>(&self, what: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(PathBuf) -> Result<T> + Send + 'static,
    {
        let repo_path = self.repo_path.clone();
        let task = tokio::task::spawn_blocking(move || f(repo_path));
        match tokio::time::timeout(self.timeout, task).await {
            Ok(joined) => joined.with_context(|| format!("git {} task failed", what))?,
            Err(_) => Err(anyhow::anyhow!(
                "git {} timed out after {}s",
                what,
                self.timeout.as_secs()
            )),
        }
    }
}

#[async_trait]
impl VersionControl for GitRepo {
    async fn commit_file(&self, path: &str, message: &str) -> Result<String> {
        let repo_path = self.repo_path.clone();
        let rel = path.to_string();
        let message = message.to_string();
        let abandon = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&abandon);
        let mut task = tokio::task::spawn_blocking(move || {
            commit_single_path_unless(&repo_path, &rel, &message, &flag)
        });

        match tokio::time::timeout(self.timeout, &mut task).await {
            Ok(joined) => joined.context("git commit task failed")?,
            Err(_) => {
                abandon.store(true, Ordering::SeqCst);
                let outcome = task.await.context("git commit task failed")?;
                match &outcome {
                    Ok(oid) => tracing::warn!(
                        path,
                        commit = %oid,
                        "git commit finished after its {}s timeout",
                        self.timeout.as_secs()
                    ),
                    Err(_) => tracing::warn!(
                        path,
                        "git commit timed out after {}s; abandoned",
                        self.timeout.as_secs()
                    ),
                }
                outcome
            }
        }
    }

    async fn last_committed_content(&self, path: &str) -> Result<Option<String>> {
        let path = path.to_string();
        self.blocking("show", move |repo_path| head_content(&repo_path, &path))
            .await
    }

    async fn head_commit(&self) -> Result<Option<String>> {
        self.blocking("rev-parse", |repo_path| head_commit(&repo_path))
            .await
    }
}

/// Author from git config, falling back to a fixed identity on bare CI runners.
fn signature(repo: &Repository) -> Result<Signature<'static>> {
    match repo.signature() {
        Ok(sig) => Ok(sig),
        Err(_) => Ok(Signature::now("hyphae", "hyphae@localhost")?),
    }
}

/// Commit the working-tree content of one path on top of HEAD, giving up
/// without touching HEAD once `abandon` is set. The flag is checked right
/// before the ref moves.
fn commit_single_path_unless(
    repo_path: &Path,
    rel_path: &str,
    message: &str,
    abandon: &AtomicBool,
) -> Result<String> {
    let repo = Repository::open(repo_path).context("Failed to open repository")?;
    let content = std::fs::read(repo_path.join(rel_path))
        .with_context(|| format!("Failed to read {}", rel_path))?;

    let parent = match repo.head() {
        Ok(head) => Some(head.peel_to_commit()?),
        Err(e) if e.code() == git2::ErrorCode::UnbornBranch => None,
        Err(e) => return Err(e.into()),
    };

    let mut index = git2::Index::new()?;
    let mut mode = 0o100644;
    if let Some(parent) = &parent {
        let tree = parent.tree()?;
        index.read_tree(&tree)?;
        if let Ok(existing) = tree.get_path(Path::new(rel_path)) {
            mode = existing.filemode() as u32;
        }
    }

    let blob = repo.blob(&content)?;
    index.add(&index_entry(rel_path, blob, mode, content.len()))?;
    let tree_id = index.write_tree_to(&repo)?;
    let tree = repo.find_tree(tree_id)?;

    let sig = signature(&repo)?;
    let parents: Vec<&git2::Commit> = parent.iter().collect();
    if abandon.load(Ordering::SeqCst) {
        anyhow::bail!("git commit of {} abandoned after timeout", rel_path);
    }
    let oid = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;

    // HEAD has moved, so the commit stands even if the index cannot follow
    if let Err(err) = sync_index(&repo, rel_path) {
        tracing::warn!(path = rel_path, error = %err, "committed, but the index was not updated");
    }

    Ok(oid.to_string())
}

/// Keep the real index in step so the path does not show as modified.
fn sync_index(repo: &Repository, rel_path: &str) -> Result<(), git2::Error> {
    let mut index = repo.index()?;
    index.add_path(Path::new(rel_path))?;
    index.write()
}

fn index_entry(rel_path: &str, id: Oid, mode: u32, size: usize) -> IndexEntry {
    IndexEntry {
        ctime: IndexTime::new(0, 0),
        mtime: IndexTime::new(0, 0),
        dev: 0,
        ino: 0,
        mode,
        uid: 0,
        gid: 0,
        file_size: size as u32,
        id,
        flags: 0,
        flags_extended: 0,
        path: rel_path.as_bytes().to_vec(),
    }
}

pub fn head_commit(repo_path: &Path) -> Result<Option<String>> {
    let repo = Repository::open(repo_path).context("Failed to open repository")?;
    let result = match repo.head() {
        Ok(head) => Ok(Some(head.peel_to_commit()?.id().to_string())),
        Err(e) if e.code() == git2::ErrorCode::UnbornBranch => Ok(None),
        Err(e) => Err(e.into()),
    };
    result
}

/// Content of a path at HEAD.
pub fn head_content(repo_path: &Path, rel_path: &str) -> Result<Option<String>> {
    let repo = Repository::open(repo_path).context("Failed to open repository")?;
    let head = match repo.head() {
        Ok(head) => head,
        Err(e) if e.code() == git2::ErrorCode::UnbornBranch => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let tree = head.peel_to_tree()?;
    let entry = match tree.get_path(Path::new(rel_path)) {
        Ok(entry) => entry,
        Err(e) if e.code() == git2::ErrorCode::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let object = entry.to_object(&repo)?;
    let Some(blob) = object.as_blob() else {
        return Ok(None);
    };
    Ok(Some(String::from_utf8_lossy(blob.content()).into_owned()))
}
