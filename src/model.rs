//! Records persisted by the orchestration loop.
//!
//! Every type here round-trips through the state store as camelCase JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ═══════════════════════════════════════════════════════════════════════════
//  JOB RUNS
// ═══════════════════════════════════════════════════════════════════════════

/// Outcome of one job execution as reported by the job runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    Failure,
    Running,
    Cancelled,
}

impl RunOutcome {
    /// Terminal outcomes never change once observed.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunOutcome::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Success => "success",
            RunOutcome::Failure => "failure",
            RunOutcome::Running => "running",
            RunOutcome::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure taxonomy assigned by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Network, timeout or rate-limit shaped; expected to pass on retry
    Transient,
    /// Defect in the job's own code or data; retrying will not help
    Structural,
    /// Matched no rule
    Unknown,
}

impl FailureKind {
    /// Unknown failures are retried like transient ones.
    pub fn is_retriable(&self) -> bool {
        matches!(self, FailureKind::Transient | FailureKind::Unknown)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Transient => "transient",
            FailureKind::Structural => "structural",
            FailureKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observed execution of a scheduled job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRunRecord {
    pub job_name: String,
    /// Unique per execution, including each retry attempt
    pub run_id: String,
    /// The run this execution is a retry of (itself for first attempts)
    pub lineage: String,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    pub outcome: RunOutcome,
    #[serde(default)]
    pub error_excerpt: String,
    /// Path of the job definition, used to locate the artifact it runs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification: Option<FailureKind>,
}

impl JobRunRecord {
    /// Failing terminal record that has not been triaged yet.
    pub fn needs_triage(&self) -> bool {
        self.outcome == RunOutcome::Failure && self.classification.is_none()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  DIAGNOSTICS
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionMethod {
    AutoPatch,
    RetrySucceeded,
    Human,
    StaleExpired,
    /// The job it was about is enabled again
    JobEnabled,
}

impl ResolutionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionMethod::AutoPatch => "auto_patch",
            ResolutionMethod::RetrySucceeded => "retry_succeeded",
            ResolutionMethod::Human => "human",
            ResolutionMethod::StaleExpired => "stale_expired",
            ResolutionMethod::JobEnabled => "job_enabled",
        }
    }
}

impl fmt::Display for ResolutionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a diagnostic came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticSource {
    /// Structural job failure
    JobFailure,
    /// Transient failure that kept failing after the retry budget
    RetryExhausted,
    /// Work item left dangling by the reconciler sweep
    DanglingWork,
    /// Scheduled job the runner reports as disabled
    JobDisabled,
}

/// A deduplicated unit of "needs repair" work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticEntry {
    pub id: String,
    pub job_name: String,
    #[serde(default)]
    pub artifact_path: Option<String>,
    pub description: String,
    #[serde(default)]
    pub error_excerpt: String,
    pub source: DiagnosticSource,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    /// How many times the same failure was enqueued while this entry was open
    #[serde(default = "default_occurrences")]
    pub occurrences: u32,
    /// Failed or committed patch attempts made against this entry
    #[serde(default)]
    pub patch_attempts: u32,
    /// Needs a human: automated repair has been tried too often
    #[serde(default)]
    pub escalated: bool,
    #[serde(default)]
    pub resolved: bool,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resolution_method: Option<ResolutionMethod>,
}

fn default_occurrences() -> u32 {
    1
}

// ═══════════════════════════════════════════════════════════════════════════
//  RETRIES
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryResult {
    Pending,
    Succeeded,
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryAttempt {
    pub job_name: String,
    /// The failing run this attempt re-runs
    pub run_id: String,
    pub lineage: String,
    pub attempt_number: u32,
    pub issued_at: DateTime<Utc>,
    pub result: RetryResult,
}

// ═══════════════════════════════════════════════════════════════════════════
//  PATCHES
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchAttempt {
    pub id: uuid::Uuid,
    pub diagnostic_entry_id: String,
    /// Job the diagnostic belongs to; attempts written before this field existed read as ""
    #[serde(default)]
    pub job_name: String,
    pub artifact_path: String,
    /// sha256 of the artifact before the write
    pub artifact_path_before: String,
    /// sha256 of the candidate that was written
    pub artifact_path_after: String,
    pub generated_at: DateTime<Utc>,
    pub committed: bool,
    #[serde(default)]
    pub commit_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

// ═══════════════════════════════════════════════════════════════════════════
//  HEALTH
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorBand {
    Green,
    Yellow,
    Red,
}

impl ColorBand {
    pub fn from_score(score: u8) -> Self {
        match score {
            90..=u8::MAX => ColorBand::Green,
            70..=89 => ColorBand::Yellow,
            _ => ColorBand::Red,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ColorBand::Green => "GREEN",
            ColorBand::Yellow => "YELLOW",
            ColorBand::Red => "RED",
        }
    }
}

impl fmt::Display for ColorBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailingJob {
    pub job_name: String,
    pub run_id: String,
    #[serde(default)]
    pub url: Option<String>,
}

/// Single pass/fail view of the fleet for dashboards and alerting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub generated_at: DateTime<Utc>,
    pub total_jobs: usize,
    pub passing: usize,
    pub failing: usize,
    pub running: usize,
    pub retried: usize,
    pub open_diagnostics: usize,
    pub score_percent: u8,
    pub color_band: ColorBand,
    #[serde(default)]
    pub failures: Vec<FailingJob>,
}

// ═══════════════════════════════════════════════════════════════════════════
//  WORK ITEMS
// ═══════════════════════════════════════════════════════════════════════════

/// Lifecycle position of an item a job produced for later action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    Drafted,
    Submitted,
    Generated,
    Published,
}

impl WorkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkStatus::Drafted => "drafted",
            WorkStatus::Submitted => "submitted",
            WorkStatus::Generated => "generated",
            WorkStatus::Published => "published",
        }
    }
}

/// Something a job drafted or generated that still needs a follow-up step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    pub id: String,
    pub job_name: String,
    pub kind: String,
    pub status: WorkStatus,
    #[serde(default)]
    pub artifact_path: Option<String>,
    pub updated_at: DateTime<Utc>,
}
