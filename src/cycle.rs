//! One orchestration cycle
//!
//! Phases run strictly in order: collect, triage, heal, reconcile, report.
//! The cycle is bounded by a deadline. Collection and code generation are
//! dropped when it fires; a re-run request or a patch write and commit is
//! never cut short, and the deadline is checked between them instead.
//! Anything left unfinished is still in the store and gets picked up next
//! time.

use crate::artifact::ArtifactResolver;
use crate::classify;
use crate::collector::{self, CollectOptions, Collected};
use crate::config::Config;
use crate::health::{self, HealthReporter};
use crate::inbox::{DiagnosticInbox, NewDiagnostic};
use crate::model::{
    DiagnosticSource, FailureKind, HealthSnapshot, JobRunRecord, ResolutionMethod, RunOutcome,
};
use crate::patch::backend::CodeGenerator;
use crate::patch::committer::PatchCommitter;
use crate::patch::generator::PatchGenerator;
use crate::patch::{heal_pass, HealLimits, HealSummary};
use crate::reconcile::{LoopReconciler, ReconcileSummary};
use crate::retry::{RetryDecision, RetryDispatcher};
use crate::runner::JobRunner;
use crate::store::{Collection, RunLock, StateStore, StoreError};
use crate::vcs::VersionControl;
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::time::Instant;

/// External collaborators a cycle talks to.
#[derive(Clone)]
pub struct Services {
    pub runner: Arc<dyn JobRunner>,
    /// `None` leaves healing to the rule fixes
    pub generator: Option<Arc<dyn CodeGenerator>>,
    pub vcs: Arc<dyn VersionControl>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TriageSummary {
    pub classified: usize,
    pub retried: usize,
    pub filed: usize,
    /// Re-run requests that failed; triaged again next cycle
    pub deferred: usize,
    /// Failures already followed by a successful run of the same job
    pub superseded: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    pub collected: usize,
    pub triage: TriageSummary,
    pub settled: usize,
    pub heal: Option<HealSummary>,
    pub reconcile: Option<ReconcileSummary>,
    pub health: Option<HealthSnapshot>,
    pub deadline_exceeded: bool,
}

pub struct Cycle {
    repo_root: PathBuf,
    config: Config,
    store: StateStore,
    inbox: DiagnosticInbox,
    services: Services,
}

impl Cycle {
    pub fn new(repo_root: impl Into<PathBuf>, config: Config, store: StateStore, services: Services) -> Self {
        let inbox = DiagnosticInbox::new(store.clone(), config.patch.max_patch_attempts);
        Self {
            repo_root: repo_root.into(),
            config,
            store,
            inbox,
            services,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn inbox(&self) -> &DiagnosticInbox {
        &self.inbox
    }

    /// Take the cross-process run lock.
    pub fn lock(&self) -> Result<RunLock, StoreError> {
        RunLock::acquire(
            self.store.dir(),
            Duration::minutes(self.config.cycle.lock_stale_minutes),
        )
    }

    fn retry(&self) -> RetryDispatcher {
        RetryDispatcher::new(
            self.store.clone(),
            self.services.runner.clone(),
            self.config.retry.max_attempts,
        )
    }

    fn reporter(&self) -> HealthReporter {
        HealthReporter::new(self.store.clone(), self.inbox.clone(), self.config.collect.window_hours)
    }

    /// Every phase, under the run lock and the cycle deadline.
    pub async fn run_all(&self, now: DateTime<Utc>) -> Result<CycleReport> {
        let _lock = self.lock()?;
        self.store.verify()?;

        let deadline = Instant::now() + std::time::Duration::from_secs(self.config.cycle.deadline_secs);
        let mut report = CycleReport::default();
        if !self.phases(&mut report, now, deadline).await? {
            report.deadline_exceeded = true;
            tracing::warn!(
                deadline_secs = self.config.cycle.deadline_secs,
                "cycle deadline reached; remaining phases skipped"
            );
        }
        Ok(report)
    }

    /// `Ok(false)` when the deadline cut the cycle short.
    async fn phases(&self, report: &mut CycleReport, now: DateTime<Utc>, deadline: Instant) -> Result<bool> {
        let expired = || Instant::now() >= deadline;

        match tokio::time::timeout_at(deadline, self.collect(now)).await {
            Ok(collected) => report.collected = collected?.records.len(),
            Err(_) => return Ok(false),
        }

        let (triage, complete) = self.triage_until(now, Some(deadline)).await?;
        report.triage = triage;
        if !complete || expired() {
            return Ok(false);
        }

        report.settled = self.retry().settle(&self.inbox, now)?.len();
        if expired() {
            return Ok(false);
        }

        let heal = self.heal_until(now, Some(deadline)).await?;
        let interrupted = heal.as_ref().is_some_and(|h| h.interrupted);
        report.heal = heal;
        if interrupted || expired() {
            return Ok(false);
        }

        report.reconcile = Some(self.reconcile(now)?);
        if expired() {
            return Ok(false);
        }

        let snapshot = self.report(now, now)?;
        health::persist(&self.store, &snapshot, self.config.health.keep_snapshots)?;
        tracing::info!(
            score = snapshot.score_percent,
            band = %snapshot.color_band,
            "cycle finished"
        );
        report.health = Some(snapshot);
        Ok(true)
    }

    pub async fn collect(&self, now: DateTime<Utc>) -> Result<Collected> {
        let options = CollectOptions {
            window_hours: self.config.collect.window_hours,
            concurrency: self.config.runner.concurrency,
            reenable_inactive: self.config.collect.reenable_inactive,
        };
        let collected = collector::collect(self.services.runner.as_ref(), &self.store, &options, now).await?;
        self.track_disabled(&collected, now)?;
        Ok(collected)
    }

    /// File jobs left disabled and close the entries of jobs that run again.
    fn track_disabled(&self, collected: &Collected, now: DateTime<Utc>) -> Result<()> {
        for job in &collected.disabled {
            let mut description = format!(
                "[job_disabled] {} is {}; its scheduled runs are not happening",
                job.name, job.state
            );
            if let Some(err) = &job.enable_error {
                description.push_str(&format!(" (re-enable failed: {})", err));
            }
            self.inbox.enqueue(
                NewDiagnostic {
                    job_name: job.name.clone(),
                    subject: None,
                    artifact_path: None,
                    description,
                    error_excerpt: format!("workflow state: {}", job.state),
                    source: DiagnosticSource::JobDisabled,
                },
                now,
            )?;
        }
        for name in &collected.active {
            self.inbox.resolve_job_source(
                name,
                DiagnosticSource::JobDisabled,
                ResolutionMethod::JobEnabled,
                now,
            )?;
        }
        Ok(())
    }

    /// Classify new failures and route each to a retry or the inbox.
    pub async fn triage(&self, now: DateTime<Utc>) -> Result<TriageSummary> {
        Ok(self.triage_until(now, None).await?.0)
    }

    /// Triage, stopping between records once `deadline` passes. The flag is
    /// `false` when records were left for the next cycle.
    async fn triage_until(&self, now: DateTime<Utc>, deadline: Option<Instant>) -> Result<(TriageSummary, bool)> {
        let mut summary = TriageSummary::default();
        let pending = collector::untriaged(&self.store)?;
        if pending.is_empty() {
            return Ok((summary, true));
        }

        let records: Vec<JobRunRecord> = self.store.load(Collection::JobRuns)?;
        let resolver = ArtifactResolver::new(&self.repo_root, &self.config.patch.source_dir);
        let retry = self.retry();

        let mut complete = true;
        for record in &pending {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                complete = false;
                break;
            }
            let kind = classify::classify(record);

            if superseded(record, &records) {
                tracing::debug!(job = %record.job_name, run = %record.run_id, "failure already followed by a success");
                collector::set_classification(&self.store, &record.run_id, kind)?;
                summary.classified += 1;
                summary.superseded += 1;
                continue;
            }

            let source = match retry.maybe_retry(record, kind, now).await? {
                RetryDecision::Issued { .. } => {
                    collector::set_classification(&self.store, &record.run_id, kind)?;
                    summary.classified += 1;
                    summary.retried += 1;
                    continue;
                }
                RetryDecision::RequestFailed(_) => {
                    summary.deferred += 1;
                    continue;
                }
                RetryDecision::NotRetriable => DiagnosticSource::JobFailure,
                RetryDecision::Exhausted => DiagnosticSource::RetryExhausted,
            };

            collector::set_classification(&self.store, &record.run_id, kind)?;
            summary.classified += 1;
            let new = self.diagnostic_for(record, kind, source, &resolver);
            if self.inbox.enqueue(new, now)?.inserted {
                summary.filed += 1;
            }
        }

        tracing::info!(
            classified = summary.classified,
            retried = summary.retried,
            filed = summary.filed,
            deferred = summary.deferred,
            complete,
            "triage finished"
        );
        Ok((summary, complete))
    }

    fn diagnostic_for(
        &self,
        record: &JobRunRecord,
        kind: FailureKind,
        source: DiagnosticSource,
        resolver: &ArtifactResolver,
    ) -> NewDiagnostic {
        let mut description = classify::describe(record);
        if source == DiagnosticSource::RetryExhausted {
            description = format!(
                "{} ({} failure, still failing after {} retries)",
                description, kind, self.config.retry.max_attempts
            );
        }
        NewDiagnostic {
            job_name: record.job_name.clone(),
            subject: None,
            artifact_path: resolver.resolve(&record.job_name, record.workflow_path.as_deref()),
            description,
            error_excerpt: record.error_excerpt.clone(),
            source,
        }
    }

    /// Generate and commit patches for the oldest open diagnostics.
    pub async fn heal(&self, now: DateTime<Utc>) -> Result<Option<HealSummary>> {
        self.heal_until(now, None).await
    }

    async fn heal_until(&self, now: DateTime<Utc>, deadline: Option<Instant>) -> Result<Option<HealSummary>> {
        if !self.config.patch.enabled {
            tracing::debug!("patching disabled");
            return Ok(None);
        }
        if self.services.generator.is_none() && !self.config.patch.rule_fixes {
            tracing::info!("no code generation backend and rule fixes off; skipping heal");
            return Ok(None);
        }

        let generator = PatchGenerator::new(
            &self.repo_root,
            self.config.patch.clone(),
            self.services.generator.clone(),
        );
        let committer = PatchCommitter::new(
            &self.repo_root,
            self.store.clone(),
            self.inbox.clone(),
            self.services.vcs.clone(),
        );
        let limits = HealLimits {
            max_per_cycle: self.config.patch.max_per_cycle,
            cooldown: Duration::hours(self.config.patch.cooldown_hours),
            deadline,
        };
        let summary = heal_pass(&self.inbox, &generator, &committer, &limits, now).await?;
        Ok(Some(summary))
    }

    pub fn reconcile(&self, now: DateTime<Utc>) -> Result<ReconcileSummary> {
        let reconciler = LoopReconciler::new(
            self.store.clone(),
            self.inbox.clone(),
            self.config.reconcile.clone(),
            self.config.collect.window_hours,
        );
        Ok(reconciler.reconcile(now)?)
    }

    pub fn report(&self, now: DateTime<Utc>, cycle_started: DateTime<Utc>) -> Result<HealthSnapshot> {
        Ok(self.reporter().report(now, cycle_started)?)
    }

    /// Start a fresh run of `job_name` on `git_ref`.
    pub async fn dispatch(&self, job_name: &str, git_ref: &str) -> Result<()> {
        let jobs = self
            .services
            .runner
            .list_jobs()
            .await
            .context("Failed to list jobs")?;
        let job = jobs
            .iter()
            .find(|j| j.name == job_name)
            .with_context(|| format!("No job named '{}'", job_name))?;
        self.services.runner.dispatch(job, git_ref).await?;
        tracing::info!(job = job_name, git_ref, "dispatched");
        Ok(())
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }
}

/// A later run of the same job succeeded, so there is nothing left to fix.
fn superseded(record: &JobRunRecord, records: &[JobRunRecord]) -> bool {
    records.iter().any(|r| {
        r.job_name == record.job_name
            && r.outcome == RunOutcome::Success
            && (r.started_at, r.attempt) > (record.started_at, record.attempt)
    })
}
