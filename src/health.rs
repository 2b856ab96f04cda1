//! Fleet health snapshot
//!
//! One pass/fail number over the latest run of every job in the window.

use crate::inbox::DiagnosticInbox;
use crate::model::{ColorBand, FailingJob, HealthSnapshot, JobRunRecord, RunOutcome};
use crate::retry::issued_since;
use crate::store::{Collection, StateStore, StoreError};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

pub struct HealthReporter {
    store: StateStore,
    inbox: DiagnosticInbox,
    window_hours: i64,
}

impl HealthReporter {
    pub fn new(store: StateStore, inbox: DiagnosticInbox, window_hours: i64) -> Self {
        Self {
            store,
            inbox,
            window_hours,
        }
    }

    /// Build a snapshot. Reads only.
    pub fn report(
        &self,
        now: DateTime<Utc>,
        cycle_started: DateTime<Utc>,
    ) -> Result<HealthSnapshot, StoreError> {
        let since = now - Duration::hours(self.window_hours);
        let records: Vec<JobRunRecord> = self.store.load(Collection::JobRuns)?;
        let latest = latest_per_job(&records, since);

        let mut passing = 0;
        let mut failing = 0;
        let mut running = 0;
        let mut failures = Vec::new();
        for record in latest.values() {
            match record.outcome {
                RunOutcome::Success => passing += 1,
                RunOutcome::Running => running += 1,
                RunOutcome::Failure => {
                    failing += 1;
                    failures.push(FailingJob {
                        job_name: record.job_name.clone(),
                        run_id: record.run_id.clone(),
                        url: record.url.clone(),
                    });
                }
                RunOutcome::Cancelled => {}
            }
        }
        failures.sort_by(|a, b| a.job_name.cmp(&b.job_name));

        let total_jobs = latest.len();
        let score_percent = score(passing, total_jobs);
        Ok(HealthSnapshot {
            generated_at: now,
            total_jobs,
            passing,
            failing,
            running,
            retried: issued_since(&self.store, cycle_started)?,
            open_diagnostics: self.inbox.open_count()?,
            score_percent,
            color_band: ColorBand::from_score(score_percent),
            failures,
        })
    }
}

fn latest_per_job(records: &[JobRunRecord], since: DateTime<Utc>) -> HashMap<&str, &JobRunRecord> {
    let mut latest: HashMap<&str, &JobRunRecord> = HashMap::new();
    for record in records.iter().filter(|r| r.started_at >= since) {
        let newer = latest
            .get(record.job_name.as_str())
            .map(|prior| (record.started_at, record.attempt) > (prior.started_at, prior.attempt))
            .unwrap_or(true);
        if newer {
            latest.insert(record.job_name.as_str(), record);
        }
    }
    latest
}

fn score(passing: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    (passing * 100 / total).min(100) as u8
}

/// Append a snapshot, dropping the oldest beyond `keep`.
pub fn persist(store: &StateStore, snapshot: &HealthSnapshot, keep: usize) -> Result<(), StoreError> {
    store.update(Collection::HealthSnapshots, |snapshots: &mut Vec<HealthSnapshot>| {
        snapshots.push(snapshot.clone());
        if snapshots.len() > keep {
            let excess = snapshots.len() - keep;
            snapshots.drain(..excess);
        }
    })
}

/// Most recent persisted snapshot.
pub fn latest(store: &StateStore) -> Result<Option<HealthSnapshot>, StoreError> {
    Ok(store
        .load::<HealthSnapshot>(Collection::HealthSnapshots)?
        .into_iter()
        .max_by_key(|s| s.generated_at))
}

/// One-line summary for humans.
pub fn render(snapshot: &HealthSnapshot) -> String {
    let mut out = format!(
        "{} {}% ({}/{} passing, {} failing, {} running, {} retried, {} open diagnostics)",
        snapshot.color_band,
        snapshot.score_percent,
        snapshot.passing,
        snapshot.total_jobs,
        snapshot.failing,
        snapshot.running,
        snapshot.retried,
        snapshot.open_diagnostics
    );
    for failure in &snapshot.failures {
        out.push_str(&format!("\n  x {} (run {})", failure.job_name, failure.run_id));
        if let Some(url) = &failure.url {
            out.push_str(&format!(" {}", url));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::record;

    fn setup() -> (tempfile::TempDir, StateStore, HealthReporter) {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path().join(".hyphae")).unwrap();
        let inbox = DiagnosticInbox::new(store.clone(), 3);
        let reporter = HealthReporter::new(store.clone(), inbox, 24);
        (dir, store, reporter)
    }

    #[test]
    fn empty_store_scores_zero() {
        let (_dir, _store, reporter) = setup();
        let now = Utc::now();
        let snapshot = reporter.report(now, now).unwrap();
        assert_eq!(snapshot.total_jobs, 0);
        assert_eq!(snapshot.score_percent, 0);
        assert_eq!(snapshot.color_band, ColorBand::Red);
    }

    #[test]
    fn latest_run_per_job_decides() {
        let (_dir, store, reporter) = setup();
        let now = Utc::now();
        let t = |h: i64| now - Duration::hours(h);
        store
            .save(
                Collection::JobRuns,
                &[
                    // recovered on retry
                    record("a", "1", 1, RunOutcome::Failure, t(3)),
                    record("a", "1", 2, RunOutcome::Success, t(3)),
                    // regressed
                    record("b", "2", 1, RunOutcome::Success, t(5)),
                    record("b", "3", 1, RunOutcome::Failure, t(1)),
                    record("c", "4", 1, RunOutcome::Running, t(1)),
                    record("d", "5", 1, RunOutcome::Success, t(2)),
                    // outside the window
                    record("e", "6", 1, RunOutcome::Failure, t(30)),
                ],
            )
            .unwrap();

        let snapshot = reporter.report(now, now).unwrap();
        assert_eq!(snapshot.total_jobs, 4);
        assert_eq!(snapshot.passing, 2);
        assert_eq!(snapshot.failing, 1);
        assert_eq!(snapshot.running, 1);
        assert_eq!(snapshot.score_percent, 50);
        assert_eq!(snapshot.failures.len(), 1);
        assert_eq!(snapshot.failures[0].run_id, "3-1");
    }

    #[test]
    fn all_passing_is_green() {
        let (_dir, store, reporter) = setup();
        let now = Utc::now();
        store
            .save(
                Collection::JobRuns,
                &[
                    record("a", "1", 1, RunOutcome::Success, now),
                    record("b", "2", 1, RunOutcome::Success, now),
                ],
            )
            .unwrap();
        let snapshot = reporter.report(now, now).unwrap();
        assert_eq!(snapshot.score_percent, 100);
        assert_eq!(snapshot.color_band, ColorBand::Green);
        assert!(render(&snapshot).starts_with("GREEN 100%"));
    }

    #[test]
    fn report_writes_nothing() {
        let (_dir, store, reporter) = setup();
        let now = Utc::now();
        reporter.report(now, now).unwrap();
        assert!(latest(&store).unwrap().is_none());
    }

    #[test]
    fn persisted_snapshots_are_capped() {
        let (_dir, store, reporter) = setup();
        let start = Utc::now();
        for minutes in 0..5 {
            let now = start + Duration::minutes(minutes);
            let snapshot = reporter.report(now, now).unwrap();
            persist(&store, &snapshot, 3).unwrap();
        }
        let snapshots: Vec<HealthSnapshot> = store.load(Collection::HealthSnapshots).unwrap();
        assert_eq!(snapshots.len(), 3);
        assert_eq!(latest(&store).unwrap().unwrap().generated_at, start + Duration::minutes(4));
    }
}
