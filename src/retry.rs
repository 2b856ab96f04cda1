//! Bounded retries for transient failures
//!
//! Attempts are counted per `(jobName, lineage)`. Once the budget is spent
//! the failure stops being a retry candidate and becomes a diagnostic.

use crate::inbox::DiagnosticInbox;
use crate::model::{
    FailureKind, JobRunRecord, ResolutionMethod, RetryAttempt, RetryResult, RunOutcome,
};
use crate::runner::JobRunner;
use crate::store::{Collection, StateStore, StoreError};
use chrono::{DateTime, Utc};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-run requested and recorded
    Issued { attempt_number: u32 },
    /// Budget spent; hand the failure to the inbox
    Exhausted,
    /// Structural failures are never retried
    NotRetriable,
    /// The re-run request itself failed; leave the record for next cycle
    RequestFailed(String),
}

pub struct RetryDispatcher {
    store: StateStore,
    runner: Arc<dyn JobRunner>,
    max_attempts: u32,
}

impl RetryDispatcher {
    pub fn new(store: StateStore, runner: Arc<dyn JobRunner>, max_attempts: u32) -> Self {
        Self {
            store,
            runner,
            max_attempts,
        }
    }

    fn attempts_for(&self, job_name: &str, lineage: &str) -> Result<Vec<RetryAttempt>, StoreError> {
        Ok(self
            .store
            .load::<RetryAttempt>(Collection::RetryAttempts)?
            .into_iter()
            .filter(|a| a.job_name == job_name && a.lineage == lineage)
            .collect())
    }

    pub async fn maybe_retry(
        &self,
        record: &JobRunRecord,
        kind: FailureKind,
        now: DateTime<Utc>,
    ) -> Result<RetryDecision, StoreError> {
        if !kind.is_retriable() {
            return Ok(RetryDecision::NotRetriable);
        }

        let prior = self.attempts_for(&record.job_name, &record.lineage)?;
        if let Some(existing) = prior.iter().find(|a| a.run_id == record.run_id) {
            return Ok(RetryDecision::Issued {
                attempt_number: existing.attempt_number,
            });
        }

        let used = prior.len() as u32;
        if used >= self.max_attempts {
            self.mark_exhausted(&record.job_name, &record.lineage)?;
            tracing::warn!(
                job = %record.job_name,
                lineage = %record.lineage,
                attempts = used,
                "retry budget exhausted"
            );
            return Ok(RetryDecision::Exhausted);
        }

        if let Err(err) = self.runner.rerun_failed(&record.lineage).await {
            tracing::debug!(
                lineage = %record.lineage,
                error = %format!("{:#}", err),
                "rerun of failed jobs refused; requesting a full rerun"
            );
            if let Err(err) = self.runner.rerun(&record.lineage).await {
                let reason = format!("{:#}", err);
                tracing::warn!(job = %record.job_name, lineage = %record.lineage, %reason, "rerun request failed");
                return Ok(RetryDecision::RequestFailed(reason));
            }
        }

        let attempt_number = used + 1;
        let attempt = RetryAttempt {
            job_name: record.job_name.clone(),
            run_id: record.run_id.clone(),
            lineage: record.lineage.clone(),
            attempt_number,
            issued_at: now,
            result: RetryResult::Pending,
        };
        self.store
            .update(Collection::RetryAttempts, |attempts: &mut Vec<RetryAttempt>| {
                attempts.push(attempt);
            })?;
        tracing::info!(
            job = %record.job_name,
            run = %record.run_id,
            attempt = attempt_number,
            max = self.max_attempts,
            "retry issued"
        );
        Ok(RetryDecision::Issued { attempt_number })
    }

    fn mark_exhausted(&self, job_name: &str, lineage: &str) -> Result<(), StoreError> {
        self.store
            .update(Collection::RetryAttempts, |attempts: &mut Vec<RetryAttempt>| {
                for attempt in attempts
                    .iter_mut()
                    .filter(|a| a.job_name == job_name && a.lineage == lineage)
                    .filter(|a| a.result == RetryResult::Pending)
                {
                    attempt.result = RetryResult::Exhausted;
                }
            })
    }

    /// Resolve pending attempts whose lineage later succeeded, closing the
    /// job's older failure diagnostics. Returns the settled attempts.
    pub fn settle(
        &self,
        inbox: &DiagnosticInbox,
        now: DateTime<Utc>,
    ) -> Result<Vec<RetryAttempt>, StoreError> {
        let records: Vec<JobRunRecord> = self.store.load(Collection::JobRuns)?;

        let settled = self
            .store
            .update(Collection::RetryAttempts, |attempts: &mut Vec<RetryAttempt>| {
                let mut settled = Vec::new();
                for attempt in attempts
                    .iter_mut()
                    .filter(|a| a.result == RetryResult::Pending)
                {
                    let failed_attempt = records
                        .iter()
                        .find(|r| r.run_id == attempt.run_id)
                        .map(|r| r.attempt)
                        .unwrap_or(0);
                    let success = records.iter().find(|r| {
                        r.job_name == attempt.job_name
                            && r.lineage == attempt.lineage
                            && r.outcome == RunOutcome::Success
                            && r.attempt > failed_attempt
                    });
                    if let Some(success) = success {
                        attempt.result = RetryResult::Succeeded;
                        settled.push((attempt.clone(), success.ended_at.unwrap_or(success.started_at)));
                    }
                }
                settled
            })?;

        for (attempt, succeeded_at) in &settled {
            tracing::info!(job = %attempt.job_name, lineage = %attempt.lineage, "retry succeeded");
            inbox.resolve_job_failures_before(
                &attempt.job_name,
                *succeeded_at,
                ResolutionMethod::RetrySucceeded,
                now,
            )?;
        }
        Ok(settled.into_iter().map(|(attempt, _)| attempt).collect())
    }
}

/// Mark pending attempts issued before `cutoff` as exhausted, for lineages
/// the runner stopped reporting.
pub fn expire_pending(store: &StateStore, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
    store.update(Collection::RetryAttempts, |attempts: &mut Vec<RetryAttempt>| {
        let mut expired = 0;
        for attempt in attempts
            .iter_mut()
            .filter(|a| a.result == RetryResult::Pending && a.issued_at < cutoff)
        {
            attempt.result = RetryResult::Exhausted;
            expired += 1;
        }
        expired
    })
}

/// Attempts issued at or after `since`.
pub fn issued_since(store: &StateStore, since: DateTime<Utc>) -> Result<usize, StoreError> {
    Ok(store
        .load::<RetryAttempt>(Collection::RetryAttempts)?
        .iter()
        .filter(|a| a.issued_at >= since)
        .count())
}
