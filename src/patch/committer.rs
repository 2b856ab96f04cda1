use super::generator::PatchCandidate;
use crate::inbox::DiagnosticInbox;
use crate::model::{DiagnosticEntry, PatchAttempt, ResolutionMethod};
use crate::store::{write_atomic, Collection, StateStore};
use crate::util::{confine_path, hash_str, truncate};
use crate::vcs::VersionControl;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Writes a candidate and commits it, or puts the file back.
pub struct PatchCommitter {
    repo_root: PathBuf,
    store: StateStore,
    inbox: DiagnosticInbox,
    vcs: Arc<dyn VersionControl>,
}

impl PatchCommitter {
    pub fn new(
        repo_root: impl Into<PathBuf>,
        store: StateStore,
        inbox: DiagnosticInbox,
        vcs: Arc<dyn VersionControl>,
    ) -> Self {
        Self {
            repo_root: repo_root.into(),
            store,
            inbox,
            vcs,
        }
    }

    /// Apply `candidate` for `entry`. The returned attempt is already
    /// persisted. `Err` only for store failures or when the original content
    /// could not be put back.
    ///
    /// A candidate with an empty `original` may create its file.
    pub async fn commit(
        &self,
        entry: &DiagnosticEntry,
        candidate: &PatchCandidate,
        now: DateTime<Utc>,
    ) -> Result<PatchAttempt> {
        let resolved = confine_path(&self.repo_root, Path::new(&candidate.artifact_path))?;
        let path = resolved.absolute;
        let rel = candidate.artifact_path.as_str();

        let mut attempt = PatchAttempt {
            id: uuid::Uuid::new_v4(),
            diagnostic_entry_id: entry.id.clone(),
            job_name: entry.job_name.clone(),
            artifact_path: rel.to_string(),
            artifact_path_before: String::new(),
            artifact_path_after: hash_str(&candidate.content),
            generated_at: now,
            committed: false,
            commit_ref: None,
            failure_reason: None,
        };

        let (current, existed) = match fs::read_to_string(&path) {
            Ok(current) => (current, true),
            Err(err) if err.kind() == ErrorKind::NotFound && candidate.original.is_empty() => {
                (String::new(), false)
            }
            Err(err) => {
                return self
                    .record_failure(attempt, format!("could not read artifact: {}", err))
                    .await;
            }
        };
        attempt.artifact_path_before = hash_str(&current);
        if current != candidate.original {
            return self
                .record_failure(attempt, "artifact changed since the patch was generated".to_string())
                .await;
        }

        let permissions = fs::metadata(&path).map(|m| m.permissions()).ok();
        if let Some(parent) = path.parent().filter(|_| !existed) {
            if let Err(err) = fs::create_dir_all(parent) {
                return self
                    .record_failure(attempt, format!("write failed: {}", err))
                    .await;
            }
        }
        if let Err(err) = write_with_permissions(&path, &candidate.content, permissions.as_ref()) {
            return self
                .record_failure(attempt, format!("write failed: {}", err))
                .await;
        }

        let message = format!(
            "fix({}): auto-patch diagnostic {}\n\n{}",
            entry.job_name,
            entry.id,
            truncate(entry.description.lines().next().unwrap_or_default(), 200)
        );
        let commit_ref = match self.vcs.commit_file(rel, &message).await {
            Ok(commit_ref) => commit_ref,
            Err(err) => match self.landed_anyway(rel, &attempt).await {
                Some(commit_ref) => {
                    tracing::warn!(
                        id = %entry.id,
                        path = rel,
                        error = %format!("{:#}", err),
                        "commit reported failure but HEAD holds the patch"
                    );
                    commit_ref
                }
                None => {
                    let reason = format!("commit failed: {:#}", err);
                    if existed {
                        let restore_to =
                            self.restore_content(rel, &attempt.artifact_path_before, current).await;
                        write_with_permissions(&path, &restore_to, permissions.as_ref())
                            .with_context(|| format!("Failed to restore {} after a failed commit", rel))?;
                    } else {
                        fs::remove_file(&path)
                            .with_context(|| format!("Failed to remove {} after a failed commit", rel))?;
                    }
                    tracing::warn!(id = %entry.id, path = rel, "restored artifact after failed commit");
                    return self.record_failure(attempt, reason).await;
                }
            },
        };

        attempt.committed = true;
        attempt.commit_ref = Some(commit_ref.clone());
        self.persist(&attempt)?;
        self.inbox.resolve(&entry.id, ResolutionMethod::AutoPatch, now)?;
        tracing::info!(
            id = %entry.id,
            path = rel,
            commit = %commit_ref,
            "patch committed"
        );
        Ok(attempt)
    }

    /// After a reported failure, the HEAD commit id when HEAD already holds
    /// the candidate.
    async fn landed_anyway(&self, rel: &str, attempt: &PatchAttempt) -> Option<String> {
        if attempt.artifact_path_after == attempt.artifact_path_before {
            return None;
        }
        let committed = self.vcs.last_committed_content(rel).await.ok().flatten()?;
        if hash_str(&committed) != attempt.artifact_path_after {
            return None;
        }
        match self.vcs.head_commit().await {
            Ok(Some(head)) => Some(head),
            Ok(None) => None,
            Err(err) => {
                tracing::debug!(error = %format!("{:#}", err), "could not read HEAD");
                None
            }
        }
    }

    /// Last committed content when it is what we overwrote, else the in-memory copy.
    async fn restore_content(&self, rel: &str, before_hash: &str, in_memory: String) -> String {
        match self.vcs.last_committed_content(rel).await {
            Ok(Some(committed)) if hash_str(&committed) == before_hash => committed,
            Ok(_) => in_memory,
            Err(err) => {
                tracing::debug!(path = rel, error = %format!("{:#}", err), "could not read committed content");
                in_memory
            }
        }
    }

    /// Jobs with a patch attempt generated after `since`.
    pub fn jobs_attempted_since(&self, since: DateTime<Utc>) -> Result<HashSet<String>> {
        let attempts: Vec<PatchAttempt> = self.store.load(Collection::PatchAttempts)?;
        let mut jobs = HashSet::new();
        for attempt in attempts.into_iter().filter(|a| a.generated_at > since) {
            if !attempt.job_name.is_empty() {
                jobs.insert(attempt.job_name);
            } else if let Some(entry) = self.inbox.get(&attempt.diagnostic_entry_id)? {
                jobs.insert(entry.job_name);
            }
        }
        Ok(jobs)
    }

    async fn record_failure(&self, mut attempt: PatchAttempt, reason: String) -> Result<PatchAttempt> {
        tracing::warn!(id = %attempt.diagnostic_entry_id, path = %attempt.artifact_path, %reason, "patch not committed");
        attempt.committed = false;
        attempt.failure_reason = Some(reason);
        self.persist(&attempt)?;
        self.inbox.record_patch_attempt(&attempt.diagnostic_entry_id)?;
        Ok(attempt)
    }

    fn persist(&self, attempt: &PatchAttempt) -> Result<()> {
        self.store
            .update(Collection::PatchAttempts, |attempts: &mut Vec<PatchAttempt>| {
                attempts.push(attempt.clone());
            })?;
        Ok(())
    }
}

fn write_with_permissions(
    path: &Path,
    content: &str,
    permissions: Option<&fs::Permissions>,
) -> std::io::Result<()> {
    write_atomic(path, content)?;
    if let Some(permissions) = permissions {
        fs::set_permissions(path, permissions.clone())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inbox::NewDiagnostic;
    use crate::model::DiagnosticSource;
    use crate::testing::FakeVcs;

    const ORIGINAL: &str = "def run():\n    return {}['x']\n";
    const PATCHED: &str = "def run():\n    return {}.get('x')\n";

    struct Fixture {
        dir: tempfile::TempDir,
        store: StateStore,
        inbox: DiagnosticInbox,
        vcs: Arc<FakeVcs>,
        entry: DiagnosticEntry,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/job.py"), ORIGINAL).unwrap();
        let store = StateStore::open(dir.path().join(".hyphae")).unwrap();
        let inbox = DiagnosticInbox::new(store.clone(), 3);
        let out = inbox
            .enqueue(
                NewDiagnostic {
                    job_name: "job".to_string(),
                    subject: None,
                    artifact_path: Some("src/job.py".to_string()),
                    description: "[unhandled_access] KeyError".to_string(),
                    error_excerpt: "KeyError: 'x'".to_string(),
                    source: DiagnosticSource::JobFailure,
                },
                Utc::now(),
            )
            .unwrap();
        let entry = inbox.get(&out.id).unwrap().unwrap();
        let vcs = Arc::new(FakeVcs::new());
        vcs.set_committed("src/job.py", ORIGINAL);
        Fixture {
            dir,
            store,
            inbox,
            vcs,
            entry,
        }
    }

    fn candidate(entry: &DiagnosticEntry) -> PatchCandidate {
        PatchCandidate {
            diagnostic_id: entry.id.clone(),
            artifact_path: "src/job.py".to_string(),
            original: ORIGINAL.to_string(),
            content: PATCHED.to_string(),
        }
    }

    #[tokio::test]
    async fn successful_commit_resolves_entry() {
        let f = fixture();
        let committer = PatchCommitter::new(f.dir.path(), f.store.clone(), f.inbox.clone(), f.vcs.clone());

        let attempt = committer.commit(&f.entry, &candidate(&f.entry), Utc::now()).await.unwrap();
        assert!(attempt.committed);
        assert_eq!(attempt.artifact_path_before, hash_str(ORIGINAL));
        assert_eq!(attempt.artifact_path_after, hash_str(PATCHED));

        let on_disk = fs::read_to_string(f.dir.path().join("src/job.py")).unwrap();
        assert_eq!(hash_str(&on_disk), attempt.artifact_path_after);
        let commit_ref = attempt.commit_ref.clone().unwrap();
        assert!(f.vcs.has_commit(&commit_ref));
        assert!(f.vcs.commits()[0].1.starts_with(&format!("fix(job): auto-patch diagnostic {}", f.entry.id)));

        let entry = f.inbox.get(&f.entry.id).unwrap().unwrap();
        assert_eq!(entry.resolution_method, Some(ResolutionMethod::AutoPatch));

        let stored: Vec<PatchAttempt> = f.store.load(Collection::PatchAttempts).unwrap();
        assert_eq!(stored[0].job_name, "job");
        assert_eq!(stored, vec![attempt]);
    }

    #[tokio::test]
    async fn failed_commit_restores_the_file() {
        let f = fixture();
        f.vcs.fail_commits();
        let committer = PatchCommitter::new(f.dir.path(), f.store.clone(), f.inbox.clone(), f.vcs.clone());

        let attempt = committer.commit(&f.entry, &candidate(&f.entry), Utc::now()).await.unwrap();
        assert!(!attempt.committed);
        assert!(attempt.commit_ref.is_none());
        assert!(attempt.failure_reason.as_deref().unwrap().contains("commit failed"));

        let on_disk = fs::read_to_string(f.dir.path().join("src/job.py")).unwrap();
        assert_eq!(on_disk, ORIGINAL);

        let entry = f.inbox.get(&f.entry.id).unwrap().unwrap();
        assert!(!entry.resolved);
        assert_eq!(entry.patch_attempts, 1);
    }

    #[tokio::test]
    async fn commit_that_lands_despite_an_error_is_kept() {
        let f = fixture();
        f.vcs.land_then_fail(f.dir.path());
        let committer = PatchCommitter::new(f.dir.path(), f.store.clone(), f.inbox.clone(), f.vcs.clone());

        let attempt = committer.commit(&f.entry, &candidate(&f.entry), Utc::now()).await.unwrap();
        assert!(attempt.committed);
        assert_eq!(attempt.commit_ref.as_deref(), Some(format!("{:040x}", 1).as_str()));
        assert_eq!(f.vcs.committed("src/job.py").as_deref(), Some(PATCHED));

        let on_disk = fs::read_to_string(f.dir.path().join("src/job.py")).unwrap();
        assert_eq!(on_disk, PATCHED);
        let entry = f.inbox.get(&f.entry.id).unwrap().unwrap();
        assert_eq!(entry.resolution_method, Some(ResolutionMethod::AutoPatch));
        assert_eq!(entry.patch_attempts, 0);
    }

    #[tokio::test]
    async fn timed_out_git_commit_keeps_disk_and_head_in_step() {
        let f = fixture();
        let repo = git2::Repository::init(f.dir.path()).unwrap();
        {
            let mut index = repo.index().unwrap();
            index.add_path(Path::new("src/job.py")).unwrap();
            index.write().unwrap();
            let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
            let sig = git2::Signature::now("Test", "test@example.com").unwrap();
            repo.commit(Some("HEAD"), &sig, &sig, "init", &tree, &[]).unwrap();
        }
        let vcs = Arc::new(crate::vcs::GitRepo::new(f.dir.path(), std::time::Duration::ZERO));
        let committer = PatchCommitter::new(f.dir.path(), f.store.clone(), f.inbox.clone(), vcs);

        let attempt = committer.commit(&f.entry, &candidate(&f.entry), Utc::now()).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;

        let on_disk = fs::read_to_string(f.dir.path().join("src/job.py")).unwrap();
        let head = crate::vcs::head_content(f.dir.path(), "src/job.py").unwrap();
        assert_eq!(head.as_deref(), Some(on_disk.as_str()));
        assert_eq!(attempt.committed, on_disk == PATCHED);
    }

    #[tokio::test]
    async fn failed_commit_removes_a_created_file() {
        let f = fixture();
        f.vcs.fail_commits();
        let committer = PatchCommitter::new(f.dir.path(), f.store.clone(), f.inbox.clone(), f.vcs.clone());
        let created = PatchCandidate {
            diagnostic_id: f.entry.id.clone(),
            artifact_path: "requirements.txt".to_string(),
            original: String::new(),
            content: "requests\n".to_string(),
        };

        let attempt = committer.commit(&f.entry, &created, Utc::now()).await.unwrap();
        assert!(!attempt.committed);
        assert!(!f.dir.path().join("requirements.txt").exists());
    }

    #[tokio::test]
    async fn concurrent_edit_aborts_without_writing() {
        let f = fixture();
        fs::write(f.dir.path().join("src/job.py"), "def run():\n    return None\n").unwrap();
        let committer = PatchCommitter::new(f.dir.path(), f.store.clone(), f.inbox.clone(), f.vcs.clone());

        let attempt = committer.commit(&f.entry, &candidate(&f.entry), Utc::now()).await.unwrap();
        assert!(!attempt.committed);
        assert!(f.vcs.commits().is_empty());
        let on_disk = fs::read_to_string(f.dir.path().join("src/job.py")).unwrap();
        assert_eq!(on_disk, "def run():\n    return None\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn executable_bit_survives_the_write() {
        use std::os::unix::fs::PermissionsExt;
        let f = fixture();
        let path = f.dir.path().join("src/job.py");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        let committer = PatchCommitter::new(f.dir.path(), f.store.clone(), f.inbox.clone(), f.vcs.clone());

        committer.commit(&f.entry, &candidate(&f.entry), Utc::now()).await.unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }
}
