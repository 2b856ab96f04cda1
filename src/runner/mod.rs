//! Job runner seam
//!
//! The loop only talks to the scheduler through [`JobRunner`], so the cycle
//! can be driven by GitHub Actions in production and by a scripted fake in
//! tests.

pub mod github;

use crate::model::{JobRunRecord, RunOutcome};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// Whether the runner will start scheduled runs of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Active,
    /// Turned off by the runner after a stretch without repository activity
    DisabledInactivity,
    DisabledManually,
    /// Any other disabled state the runner reports
    Disabled(String),
}

impl JobState {
    /// Map a GitHub workflow state. An empty state counts as active.
    pub fn from_api(state: &str) -> Self {
        match state {
            "" | "active" => JobState::Active,
            "disabled_inactivity" => JobState::DisabledInactivity,
            "disabled_manually" => JobState::DisabledManually,
            other => JobState::Disabled(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            JobState::Active => "active",
            JobState::DisabledInactivity => "disabled_inactivity",
            JobState::DisabledManually => "disabled_manually",
            JobState::Disabled(other) => other,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A scheduled job known to the runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDefinition {
    /// Stable name used across the store (the workflow file stem for GitHub)
    pub name: String,
    /// Runner-side identifier
    pub id: String,
    /// Path of the job definition in the repository
    pub path: Option<String>,
    pub state: JobState,
}

/// One run as reported by the runner, before it becomes a [`JobRunRecord`].
#[derive(Debug, Clone, PartialEq)]
pub struct RunObservation {
    pub job_name: String,
    /// Runner run id; shared by every attempt of the run
    pub lineage: String,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub outcome: RunOutcome,
    pub error_text: String,
    pub workflow_path: Option<String>,
    pub url: Option<String>,
}

impl RunObservation {
    /// Identifier of this particular attempt.
    pub fn run_id(&self) -> String {
        format!("{}-{}", self.lineage, self.attempt)
    }

    pub fn into_record(self, max_excerpt: usize) -> JobRunRecord {
        JobRunRecord {
            run_id: self.run_id(),
            job_name: self.job_name,
            lineage: self.lineage,
            attempt: self.attempt,
            started_at: self.started_at,
            ended_at: self.ended_at,
            outcome: self.outcome,
            error_excerpt: crate::util::tail(&self.error_text, max_excerpt),
            workflow_path: self.workflow_path,
            url: self.url,
            classification: None,
        }
    }
}

#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Every job definition, disabled ones included. Failure here means the
    /// runner is unreachable.
    async fn list_jobs(&self) -> Result<Vec<JobDefinition>>;

    /// Runs of `job` started at or after `since`.
    async fn list_runs(&self, job: &JobDefinition, since: DateTime<Utc>)
        -> Result<Vec<RunObservation>>;

    /// Tail of the log of a failed run, for runners that do not report error text inline.
    async fn run_log_tail(&self, run: &JobRunRecord, max_chars: usize) -> Result<String>;

    /// Re-run only the failed parts of a run.
    async fn rerun_failed(&self, lineage: &str) -> Result<()>;

    /// Re-run a whole run.
    async fn rerun(&self, lineage: &str) -> Result<()>;

    /// Start a fresh run of a job on `git_ref`.
    async fn dispatch(&self, job: &JobDefinition, git_ref: &str) -> Result<()>;

    /// Let the runner schedule a disabled job again.
    async fn enable(&self, job: &JobDefinition) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observation_becomes_attempt_scoped_record() {
        let obs = RunObservation {
            job_name: "news-monitor".to_string(),
            lineage: "991".to_string(),
            attempt: 2,
            started_at: Utc::now(),
            ended_at: None,
            outcome: RunOutcome::Failure,
            error_text: "x".repeat(50),
            workflow_path: Some(".github/workflows/news-monitor.yml".to_string()),
            url: None,
        };
        let record = obs.into_record(10);
        assert_eq!(record.run_id, "991-2");
        assert_eq!(record.lineage, "991");
        assert_eq!(record.error_excerpt.len(), 10);
        assert!(record.needs_triage());
    }

    #[test]
    fn workflow_states_map_to_job_states() {
        assert_eq!(JobState::from_api(""), JobState::Active);
        assert_eq!(JobState::from_api("disabled_inactivity"), JobState::DisabledInactivity);
        assert_eq!(
            JobState::from_api("disabled_fork"),
            JobState::Disabled("disabled_fork".to_string())
        );
        assert_eq!(JobState::DisabledManually.to_string(), "disabled_manually");
    }
}
