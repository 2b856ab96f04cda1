//! Job status collection
//!
//! Polls the runner for every job's recent runs and folds new observations
//! into the `job_runs` collection. Reads fan out with bounded concurrency;
//! the store is written once, after every read has finished.
//!
//! Jobs the runner disabled for inactivity are switched back on first.
//! Other disabled jobs are reported so they do not drop out of sight.

use crate::model::{JobRunRecord, RunOutcome};
use crate::runner::{JobDefinition, JobRunner, JobState, RunObservation};
use crate::store::{Collection, StateStore, StoreError};
use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::HashMap;

/// Characters of log tail kept as the error excerpt.
pub const EXCERPT_CHARS: usize = 4000;

#[derive(Debug, thiserror::Error)]
pub enum CollectError {
    #[error("job runner unreachable: {0:#}")]
    RunnerUnreachable(anyhow::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct CollectOptions {
    pub window_hours: i64,
    pub concurrency: usize,
    pub reenable_inactive: bool,
}

/// A job that stays disabled after collection.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisabledJob {
    pub name: String,
    pub path: Option<String>,
    pub state: JobState,
    /// Why turning it back on failed
    pub enable_error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Collected {
    /// Inserted or refreshed records
    pub records: Vec<JobRunRecord>,
    /// Jobs whose runs were listed
    pub active: Vec<String>,
    /// Jobs switched back on during this pass
    pub reenabled: Vec<String>,
    pub disabled: Vec<DisabledJob>,
}

/// Split jobs into those to poll and those left disabled, re-enabling
/// inactivity-disabled jobs on the way when allowed.
async fn sort_jobs(
    runner: &dyn JobRunner,
    jobs: Vec<JobDefinition>,
    reenable_inactive: bool,
    collected: &mut Collected,
) -> Vec<JobDefinition> {
    let mut active = Vec::new();
    for mut job in jobs {
        let enable_error = match job.state.clone() {
            JobState::Active => {
                active.push(job);
                continue;
            }
            JobState::DisabledInactivity if reenable_inactive => match runner.enable(&job).await {
                Ok(()) => {
                    tracing::info!(job = %job.name, "re-enabled job disabled for inactivity");
                    collected.reenabled.push(job.name.clone());
                    job.state = JobState::Active;
                    active.push(job);
                    continue;
                }
                Err(err) => {
                    let err = format!("{:#}", err);
                    tracing::warn!(job = %job.name, error = %err, "could not re-enable job");
                    Some(err)
                }
            },
            state => {
                tracing::info!(job = %job.name, %state, "job is disabled");
                None
            }
        };
        collected.disabled.push(DisabledJob {
            name: job.name,
            path: job.path,
            state: job.state,
            enable_error,
        });
    }
    collected.active = active.iter().map(|j| j.name.clone()).collect();
    active
}

/// Poll the runner and persist what changed.
pub async fn collect(
    runner: &dyn JobRunner,
    store: &StateStore,
    options: &CollectOptions,
    now: DateTime<Utc>,
) -> Result<Collected, CollectError> {
    let jobs = runner
        .list_jobs()
        .await
        .map_err(CollectError::RunnerUnreachable)?;
    let mut collected = Collected::default();
    let jobs = sort_jobs(runner, jobs, options.reenable_inactive, &mut collected).await;
    let since = now - Duration::hours(options.window_hours);
    tracing::debug!(jobs = jobs.len(), %since, "collecting runs");

    let listings: Vec<(JobDefinition, anyhow::Result<Vec<RunObservation>>)> =
        stream::iter(jobs)
            .map(|job| async move {
                let runs = runner.list_runs(&job, since).await;
                (job, runs)
            })
            .buffer_unordered(options.concurrency.max(1))
            .collect()
            .await;

    let existing: HashMap<String, JobRunRecord> = store
        .load::<JobRunRecord>(Collection::JobRuns)?
        .into_iter()
        .map(|r| (r.run_id.clone(), r))
        .collect();

    let mut changed = Vec::new();
    for (job, result) in listings {
        let observations = match result {
            Ok(observations) => observations,
            Err(err) => {
                tracing::warn!(job = %job.name, error = %format!("{:#}", err), "listing runs failed; skipping job");
                continue;
            }
        };
        for obs in observations {
            let record = obs.into_record(EXCERPT_CHARS);
            match existing.get(&record.run_id) {
                None => changed.push(record),
                Some(prior) if prior.outcome == RunOutcome::Running && prior != &record => {
                    changed.push(record)
                }
                Some(_) => {}
            }
        }
    }

    // Fill in error text for newly terminal failures
    let changed: Vec<JobRunRecord> = stream::iter(changed)
        .map(|mut record| async move {
            if record.outcome == RunOutcome::Failure && record.error_excerpt.trim().is_empty() {
                match runner.run_log_tail(&record, EXCERPT_CHARS).await {
                    Ok(tail) => record.error_excerpt = crate::util::tail(&tail, EXCERPT_CHARS),
                    Err(err) => tracing::warn!(
                        job = %record.job_name,
                        run = %record.run_id,
                        error = %format!("{:#}", err),
                        "could not fetch log tail"
                    ),
                }
            }
            record
        })
        .buffer_unordered(options.concurrency.max(1))
        .collect()
        .await;

    if changed.is_empty() {
        return Ok(collected);
    }

    let changed = store.update(Collection::JobRuns, |records: &mut Vec<JobRunRecord>| {
        let mut applied = Vec::new();
        for record in changed {
            match records.iter_mut().find(|r| r.run_id == record.run_id) {
                None => {
                    records.push(record.clone());
                    applied.push(record);
                }
                Some(prior) if prior.outcome == RunOutcome::Running => {
                    *prior = record.clone();
                    applied.push(record);
                }
                // Terminal records are immutable
                Some(_) => {}
            }
        }
        applied
    })?;

    for record in &changed {
        tracing::info!(
            job = %record.job_name,
            run = %record.run_id,
            outcome = %record.outcome,
            "run observed"
        );
    }
    collected.records = changed;
    Ok(collected)
}

/// Failing terminal records that still need a classification.
pub fn untriaged(store: &StateStore) -> Result<Vec<JobRunRecord>, StoreError> {
    let mut records: Vec<JobRunRecord> = store
        .load::<JobRunRecord>(Collection::JobRuns)?
        .into_iter()
        .filter(|r| r.needs_triage())
        .collect();
    records.sort_by_key(|r| r.started_at);
    Ok(records)
}

/// Attach a classification to a terminal failure. The only permitted edit
/// to a terminal record.
pub fn set_classification(
    store: &StateStore,
    run_id: &str,
    kind: crate::model::FailureKind,
) -> Result<bool, StoreError> {
    store.update(Collection::JobRuns, |records: &mut Vec<JobRunRecord>| {
        match records
            .iter_mut()
            .find(|r| r.run_id == run_id && r.outcome == RunOutcome::Failure)
        {
            Some(record) => {
                record.classification = Some(kind);
                true
            }
            None => false,
        }
    })
}
