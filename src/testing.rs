//! Scripted fakes for the runner, code generator and version control seams.

use crate::model::{DiagnosticEntry, DiagnosticSource, JobRunRecord, RunOutcome};
use crate::patch::backend::{CodeGenerator, CompletionRequest};
use crate::runner::{JobDefinition, JobRunner, JobState, RunObservation};
use crate::vcs::VersionControl;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Mutex;

pub fn observation(
    job: &str,
    lineage: &str,
    attempt: u32,
    outcome: RunOutcome,
    started_at: DateTime<Utc>,
) -> RunObservation {
    RunObservation {
        job_name: job.to_string(),
        lineage: lineage.to_string(),
        attempt,
        started_at,
        ended_at: outcome
            .is_terminal()
            .then(|| started_at + Duration::minutes(5)),
        outcome,
        error_text: String::new(),
        workflow_path: Some(format!(".github/workflows/{}.yml", job)),
        url: None,
    }
}

pub fn record(
    job: &str,
    lineage: &str,
    attempt: u32,
    outcome: RunOutcome,
    started_at: DateTime<Utc>,
) -> JobRunRecord {
    observation(job, lineage, attempt, outcome, started_at).into_record(4000)
}

pub fn diagnostic(job: &str, artifact_path: Option<&str>, source: DiagnosticSource) -> DiagnosticEntry {
    let now = Utc::now();
    DiagnosticEntry {
        id: format!("{:016x}", job.len() as u64 * 7919),
        job_name: job.to_string(),
        artifact_path: artifact_path.map(str::to_string),
        description: format!("[unhandled_access] {} failed", job),
        error_excerpt: "KeyError: 'items'".to_string(),
        source,
        created_at: now,
        last_seen_at: now,
        occurrences: 1,
        patch_attempts: 0,
        escalated: false,
        resolved: false,
        resolved_at: None,
        resolution_method: None,
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  RUNNER
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct RunnerState {
    jobs: Vec<JobDefinition>,
    runs: Vec<RunObservation>,
    logs: HashMap<String, String>,
    list_jobs_fails: bool,
    failing_listings: HashSet<String>,
    enable_fails: bool,
    enabled: Vec<String>,
    rerun_failed_fails: bool,
    rerun_fails: bool,
    reruns: Vec<(String, String)>,
    dispatches: Vec<(String, String)>,
}

/// In-memory job runner. Runs pushed here are what the next collect sees.
#[derive(Default)]
pub struct FakeRunner {
    state: Mutex<RunnerState>,
}

impl FakeRunner {
    pub fn new(jobs: &[&str]) -> Self {
        let jobs = jobs
            .iter()
            .enumerate()
            .map(|(i, name)| JobDefinition {
                name: name.to_string(),
                id: (i + 1).to_string(),
                path: Some(format!(".github/workflows/{}.yml", name)),
                state: JobState::Active,
            })
            .collect();
        Self {
            state: Mutex::new(RunnerState {
                jobs,
                ..RunnerState::default()
            }),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut RunnerState) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn set_state(&self, job: &str, state: JobState) {
        self.with(|s| {
            for j in s.jobs.iter_mut().filter(|j| j.name == job) {
                j.state = state.clone();
            }
        });
    }

    pub fn fail_enable(&self) {
        self.with(|s| s.enable_fails = true);
    }

    /// Names of jobs enabled through the runner.
    pub fn enabled(&self) -> Vec<String> {
        self.with(|s| s.enabled.clone())
    }

    pub fn push_run(&self, obs: RunObservation) {
        self.with(|s| s.runs.push(obs));
    }

    pub fn clear_runs(&self) {
        self.with(|s| s.runs.clear());
    }

    pub fn set_log(&self, lineage: &str, text: &str) {
        self.with(|s| s.logs.insert(lineage.to_string(), text.to_string()));
    }

    pub fn fail_list_jobs(&self) {
        self.with(|s| s.list_jobs_fails = true);
    }

    pub fn fail_list_runs(&self, job: &str) {
        self.with(|s| s.failing_listings.insert(job.to_string()));
    }

    pub fn fail_rerun_failed(&self) {
        self.with(|s| s.rerun_failed_fails = true);
    }

    pub fn fail_rerun(&self) {
        self.with(|s| s.rerun_fails = true);
    }

    /// `(kind, lineage)` for every accepted re-run request.
    pub fn reruns(&self) -> Vec<(String, String)> {
        self.with(|s| s.reruns.clone())
    }

    /// `(job, ref)` for every accepted dispatch.
    pub fn dispatches(&self) -> Vec<(String, String)> {
        self.with(|s| s.dispatches.clone())
    }
}

#[async_trait]
impl JobRunner for FakeRunner {
    async fn list_jobs(&self) -> Result<Vec<JobDefinition>> {
        self.with(|s| {
            if s.list_jobs_fails {
                Err(anyhow!("connection refused"))
            } else {
                Ok(s.jobs.clone())
            }
        })
    }

    async fn list_runs(&self, job: &JobDefinition, since: DateTime<Utc>) -> Result<Vec<RunObservation>> {
        self.with(|s| {
            if s.failing_listings.contains(&job.name) {
                return Err(anyhow!("502 bad gateway listing {}", job.name));
            }
            Ok(s.runs
                .iter()
                .filter(|r| r.job_name == job.name && r.started_at >= since)
                .cloned()
                .collect())
        })
    }

    async fn run_log_tail(&self, run: &JobRunRecord, _max_chars: usize) -> Result<String> {
        self.with(|s| {
            s.logs
                .get(&run.lineage)
                .cloned()
                .ok_or_else(|| anyhow!("no log for run {}", run.run_id))
        })
    }

    async fn rerun_failed(&self, lineage: &str) -> Result<()> {
        self.with(|s| {
            if s.rerun_failed_fails {
                return Err(anyhow!("rerun of failed jobs is not allowed"));
            }
            s.reruns.push(("rerun_failed".to_string(), lineage.to_string()));
            Ok(())
        })
    }

    async fn rerun(&self, lineage: &str) -> Result<()> {
        self.with(|s| {
            if s.rerun_fails {
                return Err(anyhow!("rerun refused"));
            }
            s.reruns.push(("rerun".to_string(), lineage.to_string()));
            Ok(())
        })
    }

    async fn dispatch(&self, job: &JobDefinition, git_ref: &str) -> Result<()> {
        self.with(|s| {
            s.dispatches.push((job.name.clone(), git_ref.to_string()));
            Ok(())
        })
    }

    async fn enable(&self, job: &JobDefinition) -> Result<()> {
        self.with(|s| {
            if s.enable_fails {
                return Err(anyhow!("403 resource not accessible by integration"));
            }
            for j in s.jobs.iter_mut().filter(|j| j.name == job.name) {
                j.state = JobState::Active;
            }
            s.enabled.push(job.name.clone());
            Ok(())
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  CODE GENERATOR
// ═══════════════════════════════════════════════════════════════════════════

/// Answers requests from a queue; an empty queue is a backend error.
pub struct FakeGenerator {
    responses: Mutex<VecDeque<Result<String, String>>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl FakeGenerator {
    pub fn new(responses: Vec<Result<String, String>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl CodeGenerator for FakeGenerator {
    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        self.requests.lock().unwrap().push(request.clone());
        match self.responses.lock().unwrap().pop_front() {
            Some(Ok(content)) => Ok(content),
            Some(Err(reason)) => Err(anyhow!(reason)),
            None => Err(anyhow!("no scripted response")),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  VERSION CONTROL
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct VcsState {
    committed: HashMap<String, String>,
    commits: Vec<(String, String, String)>,
    fail_commits: bool,
    /// Commits land (reading content from this root) but report failure
    land_then_fail: Option<PathBuf>,
}

/// Records commits instead of touching a repository.
#[derive(Default)]
pub struct FakeVcs {
    state: Mutex<VcsState>,
}

impl FakeVcs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_committed(&self, path: &str, content: &str) {
        self.state
            .lock()
            .unwrap()
            .committed
            .insert(path.to_string(), content.to_string());
    }

    pub fn fail_commits(&self) {
        self.state.lock().unwrap().fail_commits = true;
    }

    /// Every commit lands with the file's content under `root`, then reports
    /// an error, like a git call that outlived its timeout.
    pub fn land_then_fail(&self, root: impl Into<PathBuf>) {
        self.state.lock().unwrap().land_then_fail = Some(root.into());
    }

    pub fn committed(&self, path: &str) -> Option<String> {
        self.state.lock().unwrap().committed.get(path).cloned()
    }

    pub fn has_commit(&self, commit_ref: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .commits
            .iter()
            .any(|(id, _, _)| id == commit_ref)
    }

    /// `(path, message)` of every commit, oldest first.
    pub fn commits(&self) -> Vec<(String, String)> {
        self.state
            .lock()
            .unwrap()
            .commits
            .iter()
            .map(|(_, path, message)| (path.clone(), message.clone()))
            .collect()
    }
}

#[async_trait]
impl VersionControl for FakeVcs {
    async fn commit_file(&self, path: &str, message: &str) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        if state.fail_commits {
            return Err(anyhow!("pre-commit hook rejected the commit"));
        }
        let id = format!("{:040x}", state.commits.len() + 1);
        state
            .commits
            .push((id.clone(), path.to_string(), message.to_string()));
        if let Some(root) = state.land_then_fail.clone() {
            let content = std::fs::read_to_string(root.join(path))?;
            state.committed.insert(path.to_string(), content);
            return Err(anyhow!("git commit timed out after 0s"));
        }
        Ok(id)
    }

    async fn last_committed_content(&self, path: &str) -> Result<Option<String>> {
        Ok(self.state.lock().unwrap().committed.get(path).cloned())
    }

    async fn head_commit(&self) -> Result<Option<String>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .commits
            .last()
            .map(|(id, _, _)| id.clone()))
    }
}
