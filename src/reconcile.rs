//! Loop reconciler
//!
//! Sweeps for work nobody owns: items a job drafted or generated and then
//! never moved forward, diagnostics nobody got to, retries the runner lost.
//! It only files diagnostics; it never submits or publishes anything itself.

use crate::config::ReconcileConfig;
use crate::inbox::{DiagnosticInbox, NewDiagnostic};
use crate::model::{DiagnosticEntry, DiagnosticSource, WorkItem, WorkStatus};
use crate::retry;
use crate::store::{Collection, StateStore, StoreError};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileSummary {
    /// Entries filed by this sweep
    pub enqueued: Vec<DiagnosticEntry>,
    /// Ids closed as stale
    pub expired: Vec<String>,
    pub retries_expired: usize,
}

pub struct LoopReconciler {
    store: StateStore,
    inbox: DiagnosticInbox,
    config: ReconcileConfig,
    window_hours: i64,
}

impl LoopReconciler {
    pub fn new(store: StateStore, inbox: DiagnosticInbox, config: ReconcileConfig, window_hours: i64) -> Self {
        Self {
            store,
            inbox,
            config,
            window_hours,
        }
    }

    pub fn reconcile(&self, now: DateTime<Utc>) -> Result<ReconcileSummary, StoreError> {
        let mut summary = ReconcileSummary::default();

        let items: Vec<WorkItem> = self.store.load(Collection::WorkItems)?;
        for item in &items {
            let Some(new) = self.dangling(item, now) else {
                continue;
            };
            let outcome = self.inbox.enqueue(new, now)?;
            if outcome.inserted {
                if let Some(entry) = self.inbox.get(&outcome.id)? {
                    summary.enqueued.push(entry);
                }
            }
        }

        summary.expired = self
            .inbox
            .expire_stale(Duration::days(self.config.staleness_days), now)?;
        for id in &summary.expired {
            tracing::info!(id = %id, "diagnostic expired as stale");
        }

        summary.retries_expired =
            retry::expire_pending(&self.store, now - Duration::hours(self.window_hours))?;

        tracing::info!(
            items = items.len(),
            enqueued = summary.enqueued.len(),
            expired = summary.expired.len(),
            retries_expired = summary.retries_expired,
            "reconcile finished"
        );
        Ok(summary)
    }

    /// The diagnostic to file for an item stuck past its window, if any.
    fn dangling(&self, item: &WorkItem, now: DateTime<Utc>) -> Option<NewDiagnostic> {
        let (limit_days, next_step) = match item.status {
            WorkStatus::Drafted => (self.config.cooling_off_days, WorkStatus::Submitted),
            WorkStatus::Generated => (self.config.freshness_days, WorkStatus::Published),
            WorkStatus::Submitted | WorkStatus::Published => return None,
        };
        let age = now - item.updated_at;
        if age <= Duration::days(limit_days) {
            return None;
        }

        Some(NewDiagnostic {
            job_name: item.job_name.clone(),
            subject: Some(format!("{}:{}", item.kind, item.id)),
            // The item's file is output, not source; never hand it to the patcher
            artifact_path: None,
            description: format!(
                "{} {} was {} {} days ago and never {}",
                item.kind,
                item.id,
                item.status.as_str(),
                age.num_days(),
                next_step.as_str()
            ),
            error_excerpt: format!(
                "{} left {} without reaching {}",
                item.kind,
                item.status.as_str(),
                next_step.as_str()
            ),
            source: DiagnosticSource::DanglingWork,
        })
    }
}

/// Insert or update a work item by id.
pub fn track(store: &StateStore, item: WorkItem) -> Result<bool, StoreError> {
    store.update(Collection::WorkItems, |items: &mut Vec<WorkItem>| {
        match items.iter_mut().find(|i| i.id == item.id) {
            Some(existing) => {
                *existing = item;
                false
            }
            None => {
                items.push(item);
                true
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ResolutionMethod, RetryAttempt, RetryResult};

    fn setup() -> (tempfile::TempDir, StateStore, DiagnosticInbox, LoopReconciler) {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path().join(".hyphae")).unwrap();
        let inbox = DiagnosticInbox::new(store.clone(), 3);
        let reconciler = LoopReconciler::new(store.clone(), inbox.clone(), ReconcileConfig::default(), 24);
        (dir, store, inbox, reconciler)
    }

    fn item(id: &str, status: WorkStatus, days_old: i64, now: DateTime<Utc>) -> WorkItem {
        WorkItem {
            id: id.to_string(),
            job_name: "grant-writer".to_string(),
            kind: "grant_application".to_string(),
            status,
            artifact_path: Some(format!("drafts/{}.md", id)),
            updated_at: now - Duration::days(days_old),
        }
    }

    #[test]
    fn old_draft_becomes_a_diagnostic() {
        let (_dir, store, inbox, reconciler) = setup();
        let now = Utc::now();
        track(&store, item("g-20", WorkStatus::Drafted, 20, now)).unwrap();

        let summary = reconciler.reconcile(now).unwrap();
        assert_eq!(summary.enqueued.len(), 1);
        let entry = &summary.enqueued[0];
        assert_eq!(entry.source, DiagnosticSource::DanglingWork);
        assert_eq!(entry.job_name, "grant-writer");
        assert!(entry.artifact_path.is_none());
        assert!(entry.description.contains("never submitted"));
        assert_eq!(inbox.open_count().unwrap(), 1);
    }

    #[test]
    fn fresh_and_finished_items_are_left_alone() {
        let (_dir, store, _inbox, reconciler) = setup();
        let now = Utc::now();
        track(&store, item("a", WorkStatus::Drafted, 14, now)).unwrap();
        track(&store, item("b", WorkStatus::Submitted, 90, now)).unwrap();
        track(&store, item("c", WorkStatus::Generated, 2, now)).unwrap();
        track(&store, item("d", WorkStatus::Published, 90, now)).unwrap();

        assert!(reconciler.reconcile(now).unwrap().enqueued.is_empty());
    }

    #[test]
    fn unpublished_output_uses_the_freshness_window() {
        let (_dir, store, _inbox, reconciler) = setup();
        let now = Utc::now();
        track(&store, item("post", WorkStatus::Generated, 4, now)).unwrap();

        let summary = reconciler.reconcile(now).unwrap();
        assert_eq!(summary.enqueued.len(), 1);
        assert!(summary.enqueued[0].description.contains("never published"));
    }

    #[test]
    fn repeated_sweeps_do_not_duplicate() {
        let (_dir, store, inbox, reconciler) = setup();
        let now = Utc::now();
        track(&store, item("g-1", WorkStatus::Drafted, 20, now)).unwrap();
        track(&store, item("g-2", WorkStatus::Drafted, 20, now)).unwrap();

        assert_eq!(reconciler.reconcile(now).unwrap().enqueued.len(), 2);
        assert!(reconciler.reconcile(now + Duration::hours(1)).unwrap().enqueued.is_empty());

        let open = inbox.list_unresolved().unwrap();
        assert_eq!(open.len(), 2);
        assert!(open.iter().all(|e| e.occurrences == 2));
    }

    #[test]
    fn staleness_boundary() {
        let (_dir, _store, inbox, reconciler) = setup();
        let now = Utc::now();
        let at_threshold = inbox
            .enqueue(
                NewDiagnostic {
                    job_name: "a".to_string(),
                    subject: None,
                    artifact_path: None,
                    description: "d".to_string(),
                    error_excerpt: "KeyError: 'a'".to_string(),
                    source: DiagnosticSource::JobFailure,
                },
                now - Duration::days(14),
            )
            .unwrap();
        let past = inbox
            .enqueue(
                NewDiagnostic {
                    job_name: "b".to_string(),
                    subject: None,
                    artifact_path: None,
                    description: "d".to_string(),
                    error_excerpt: "KeyError: 'b'".to_string(),
                    source: DiagnosticSource::JobFailure,
                },
                now - Duration::days(14) - Duration::seconds(1),
            )
            .unwrap();

        let summary = reconciler.reconcile(now).unwrap();
        assert_eq!(summary.expired, vec![past.id.clone()]);
        assert!(!inbox.get(&at_threshold.id).unwrap().unwrap().resolved);
        assert_eq!(
            inbox.get(&past.id).unwrap().unwrap().resolution_method,
            Some(ResolutionMethod::StaleExpired)
        );
    }

    #[test]
    fn lost_retries_are_exhausted() {
        let (_dir, store, _inbox, reconciler) = setup();
        let now = Utc::now();
        store
            .save(
                Collection::RetryAttempts,
                &[RetryAttempt {
                    job_name: "a".to_string(),
                    run_id: "5-1".to_string(),
                    lineage: "5".to_string(),
                    attempt_number: 1,
                    issued_at: now - Duration::hours(30),
                    result: RetryResult::Pending,
                }],
            )
            .unwrap();

        assert_eq!(reconciler.reconcile(now).unwrap().retries_expired, 1);
        let attempts: Vec<RetryAttempt> = store.load(Collection::RetryAttempts).unwrap();
        assert_eq!(attempts[0].result, RetryResult::Exhausted);
    }

    #[test]
    fn track_replaces_by_id() {
        let (_dir, store, _inbox, _reconciler) = setup();
        let now = Utc::now();
        assert!(track(&store, item("x", WorkStatus::Drafted, 1, now)).unwrap());
        assert!(!track(&store, item("x", WorkStatus::Submitted, 0, now)).unwrap());
        let items: Vec<WorkItem> = store.load(Collection::WorkItems).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].status, WorkStatus::Submitted);
    }
}
