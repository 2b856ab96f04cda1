//! GitHub Actions job runner
//!
//! Each workflow file is one job. A workflow run is a lineage; re-running it
//! keeps the run id and bumps `run_attempt`, which is what the retry
//! dispatcher counts against.

use super::{JobDefinition, JobRunner, JobState, RunObservation};
use crate::config::{secret_from_env, RunnerConfig};
use crate::model::{JobRunRecord, RunOutcome};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use git2::Repository;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Maximum length for error body content in error messages
const MAX_ERROR_BODY_LEN: usize = 200;
const PER_PAGE: usize = 100;
/// Stop paging a run listing after this many pages
const MAX_RUN_PAGES: u32 = 10;
const USER_AGENT: &str = concat!("hyphae/", env!("CARGO_PKG_VERSION"));

/// Sanitize an API error body to prevent credential leakage.
/// Truncates long responses and redacts potential secrets.
fn sanitize_error_body(body: &str) -> String {
    // Patterns that might indicate secrets in error responses
    const SECRET_PATTERNS: &[&str] = &[
        "token",
        "secret",
        "password",
        "credential",
        "bearer",
        "ghp_",        // GitHub personal access token prefix
        "gho_",        // GitHub OAuth token prefix
        "ghs_",        // GitHub Actions installation token prefix
        "github_pat_", // GitHub PAT prefix
    ];

    let truncated = crate::util::truncate(body, MAX_ERROR_BODY_LEN);
    let lower = truncated.to_lowercase();
    if SECRET_PATTERNS.iter().any(|p| lower.contains(p)) {
        return "(error details redacted - may contain sensitive data)".to_string();
    }
    truncated
}

/// Extract owner and repo from a git remote URL.
///
/// Supports:
/// - git@github.com:owner/repo.git
/// - https://github.com/owner/repo.git
/// - https://github.com/owner/repo
pub fn parse_remote_url(url: &str) -> Option<(String, String)> {
    if let Some(rest) = url.strip_prefix("git@github.com:") {
        let path = rest.trim_end_matches(".git");
        let parts: Vec<&str> = path.splitn(2, '/').collect();
        if parts.len() == 2 && !parts[0].is_empty() && !parts[1].is_empty() {
            return Some((parts[0].to_string(), parts[1].to_string()));
        }
    }

    if url.contains("github.com") {
        if let Ok(parsed) = url::Url::parse(url) {
            let path = parsed
                .path()
                .trim_start_matches('/')
                .trim_end_matches('/')
                .trim_end_matches(".git");
            let parts: Vec<&str> = path.splitn(2, '/').collect();
            if parts.len() == 2 && !parts[0].is_empty() && !parts[1].is_empty() {
                return Some((parts[0].to_string(), parts[1].to_string()));
            }
        }
    }

    None
}

/// Resolve `owner/name` from config, falling back to the repository's remotes.
pub fn resolve_repository(config: &RunnerConfig, repo_path: &Path) -> Result<(String, String)> {
    if let Some(full) = config.repository.as_deref() {
        let (owner, name) = full
            .split_once('/')
            .filter(|(o, n)| !o.is_empty() && !n.is_empty())
            .ok_or_else(|| anyhow::anyhow!("runner.repository must be owner/name, got {}", full))?;
        return Ok((owner.to_string(), name.to_string()));
    }

    let repo = Repository::open(repo_path).context("Failed to open repository")?;
    for remote_name in ["origin", "upstream", "github"] {
        if let Ok(remote) = repo.find_remote(remote_name) {
            if let Some(parsed) = remote.url().and_then(parse_remote_url) {
                return Ok(parsed);
            }
        }
    }

    Err(anyhow::anyhow!(
        "No GitHub remote found. Set runner.repository or add a remote pointing to github.com"
    ))
}

// ============================================================================
// API payloads
// ============================================================================

#[derive(Deserialize)]
struct WorkflowList {
    #[serde(default)]
    total_count: usize,
    #[serde(default)]
    workflows: Vec<Workflow>,
}

#[derive(Deserialize)]
struct Workflow {
    id: u64,
    path: String,
    #[serde(default)]
    state: String,
}

#[derive(Deserialize)]
struct RunList {
    #[serde(default)]
    total_count: usize,
    #[serde(default)]
    workflow_runs: Vec<WorkflowRun>,
}

/// Whether another page follows one that returned `page_len` items,
/// `fetched` in total so far, out of `total`.
fn has_next_page(page_len: usize, fetched: usize, total: usize) -> bool {
    page_len == PER_PAGE && fetched < total
}

#[derive(Deserialize)]
struct WorkflowRun {
    id: u64,
    #[serde(default = "default_attempt")]
    run_attempt: u32,
    status: Option<String>,
    conclusion: Option<String>,
    run_started_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: Option<DateTime<Utc>>,
    html_url: Option<String>,
    path: Option<String>,
}

fn default_attempt() -> u32 {
    1
}

#[derive(Deserialize)]
struct JobList {
    #[serde(default)]
    jobs: Vec<RunJob>,
}

#[derive(Deserialize)]
struct RunJob {
    id: u64,
    name: String,
    conclusion: Option<String>,
    #[serde(default)]
    steps: Vec<RunStep>,
}

#[derive(Deserialize)]
struct RunStep {
    name: String,
    conclusion: Option<String>,
}

#[derive(Serialize)]
struct DispatchRequest<'a> {
    #[serde(rename = "ref")]
    git_ref: &'a str,
}

#[derive(Deserialize)]
struct ApiErrorResponse {
    message: String,
}

/// Map a workflow run's status and conclusion onto a run outcome.
fn outcome_for(status: Option<&str>, conclusion: Option<&str>) -> RunOutcome {
    if status != Some("completed") {
        return RunOutcome::Running;
    }
    match conclusion {
        Some("success") => RunOutcome::Success,
        Some("failure") | Some("timed_out") | Some("startup_failure") => RunOutcome::Failure,
        _ => RunOutcome::Cancelled,
    }
}

/// `.github/workflows/art-cause.yml` -> `art-cause`
fn job_name_for(path: &str) -> String {
    Path::new(path)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string())
}

// ============================================================================
// Client
// ============================================================================

pub struct GitHubRunner {
    client: reqwest::Client,
    api_base: String,
    owner: String,
    repo: String,
    token: Option<String>,
    jobs_filter: Vec<String>,
}

impl GitHubRunner {
    pub fn new(config: &RunnerConfig, owner: String, repo: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(USER_AGENT)
            .build()
            .context("Failed to create HTTP client")?;

        let token = secret_from_env(&config.token_env);
        if token.is_none() {
            tracing::warn!(
                env = %config.token_env,
                "no GitHub token set; only public read access will work"
            );
        }

        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            owner,
            repo,
            token,
            jobs_filter: config.jobs.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/repos/{}/{}{}",
            self.api_base, self.owner, self.repo, path
        )
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .request(method, self.url(path))
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28");
        match &self.token {
            Some(token) => builder.header("Authorization", format!("Bearer {}", token)),
            None => builder,
        }
    }

    async fn send(&self, builder: reqwest::RequestBuilder, what: &str) -> Result<reqwest::Response> {
        let resp = builder
            .send()
            .await
            .with_context(|| format!("Failed to send {} request", what))?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let error_body = resp.text().await.unwrap_or_default();
        if let Ok(api_error) = serde_json::from_str::<ApiErrorResponse>(&error_body) {
            return Err(anyhow::anyhow!(
                "GitHub API error on {} ({}): {}",
                what,
                status,
                sanitize_error_body(&api_error.message)
            ));
        }
        Err(anyhow::anyhow!(
            "GitHub API error on {} ({}): {}",
            what,
            status,
            sanitize_error_body(&error_body)
        ))
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, path: &str, what: &str) -> Result<T> {
        let resp = self.send(self.request(reqwest::Method::GET, path), what).await?;
        resp.json::<T>()
            .await
            .with_context(|| format!("Failed to parse {} response", what))
    }

    fn wants(&self, job_name: &str) -> bool {
        self.jobs_filter.is_empty() || self.jobs_filter.iter().any(|j| j == job_name)
    }
}

#[async_trait]
impl JobRunner for GitHubRunner {
    async fn list_jobs(&self) -> Result<Vec<JobDefinition>> {
        let mut workflows = Vec::new();
        for page in 1.. {
            let path = format!("/actions/workflows?per_page={}&page={}", PER_PAGE, page);
            let list: WorkflowList = self.get_json(&path, "list workflows").await?;
            let page_len = list.workflows.len();
            workflows.extend(list.workflows);
            if !has_next_page(page_len, workflows.len(), list.total_count) {
                break;
            }
        }
        Ok(workflows
            .into_iter()
            .filter(|w| w.state != "deleted")
            .map(|w| JobDefinition {
                name: job_name_for(&w.path),
                id: w.id.to_string(),
                state: JobState::from_api(&w.state),
                path: Some(w.path),
            })
            .filter(|job| self.wants(&job.name))
            .collect())
    }

    async fn list_runs(
        &self,
        job: &JobDefinition,
        since: DateTime<Utc>,
    ) -> Result<Vec<RunObservation>> {
        let mut runs = Vec::new();
        for page in 1..=MAX_RUN_PAGES {
            let path = format!(
                "/actions/workflows/{}/runs?per_page={}&page={}&created=>={}",
                job.id,
                PER_PAGE,
                page,
                since.format("%Y-%m-%dT%H:%M:%SZ")
            );
            let list: RunList = self.get_json(&path, "list runs").await?;
            let page_len = list.workflow_runs.len();
            runs.extend(list.workflow_runs);
            if !has_next_page(page_len, runs.len(), list.total_count) {
                break;
            }
            if page == MAX_RUN_PAGES {
                tracing::warn!(job = %job.name, fetched = runs.len(), total = list.total_count, "run listing truncated");
            }
        }

        Ok(runs
            .into_iter()
            .map(|run| {
                let outcome = outcome_for(run.status.as_deref(), run.conclusion.as_deref());
                RunObservation {
                    job_name: job.name.clone(),
                    lineage: run.id.to_string(),
                    attempt: run.run_attempt.max(1),
                    started_at: run.run_started_at.unwrap_or(run.created_at),
                    ended_at: if outcome.is_terminal() {
                        run.updated_at
                    } else {
                        None
                    },
                    outcome,
                    // Run listings carry no error text; the collector fetches the log tail
                    error_text: String::new(),
                    workflow_path: run.path.or_else(|| job.path.clone()),
                    url: run.html_url,
                }
            })
            .collect())
    }

    async fn run_log_tail(&self, run: &JobRunRecord, max_chars: usize) -> Result<String> {
        let path = format!(
            "/actions/runs/{}/attempts/{}/jobs",
            run.lineage, run.attempt
        );
        let jobs: JobList = self.get_json(&path, "list run jobs").await?;

        let mut tail = String::new();
        for job in jobs
            .jobs
            .iter()
            .filter(|j| j.conclusion.as_deref() == Some("failure"))
        {
            let failed_steps: Vec<&str> = job
                .steps
                .iter()
                .filter(|s| s.conclusion.as_deref() == Some("failure"))
                .map(|s| s.name.as_str())
                .collect();
            let resp = self
                .send(
                    self.request(reqwest::Method::GET, &format!("/actions/jobs/{}/logs", job.id)),
                    "job logs",
                )
                .await?;
            let log = resp.text().await.context("Failed to read job log")?;
            tail.push_str(&format!(
                "[{}] failed steps: {}\n{}\n",
                job.name,
                failed_steps.join(", "),
                crate::util::tail(&log, max_chars)
            ));
        }
        Ok(crate::util::tail(&tail, max_chars))
    }

    async fn rerun_failed(&self, lineage: &str) -> Result<()> {
        let path = format!("/actions/runs/{}/rerun-failed-jobs", lineage);
        self.send(self.request(reqwest::Method::POST, &path), "rerun failed jobs")
            .await?;
        Ok(())
    }

    async fn rerun(&self, lineage: &str) -> Result<()> {
        let path = format!("/actions/runs/{}/rerun", lineage);
        self.send(self.request(reqwest::Method::POST, &path), "rerun")
            .await?;
        Ok(())
    }

    async fn dispatch(&self, job: &JobDefinition, git_ref: &str) -> Result<()> {
        let path = format!("/actions/workflows/{}/dispatches", job.id);
        let builder = self
            .request(reqwest::Method::POST, &path)
            .json(&DispatchRequest { git_ref });
        self.send(builder, "workflow dispatch").await?;
        Ok(())
    }

    async fn enable(&self, job: &JobDefinition) -> Result<()> {
        let path = format!("/actions/workflows/{}/enable", job.id);
        self.send(self.request(reqwest::Method::PUT, &path), "enable workflow")
            .await?;
        Ok(())
    }
}
