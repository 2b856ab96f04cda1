//! Diagnostic inbox
//!
//! Deduplicated queue of things that need repair. The same failure seen
//! again while its entry is open bumps `occurrences` instead of adding a
//! second entry. Resolved entries stay in the store as history.

use crate::model::{DiagnosticEntry, DiagnosticSource, ResolutionMethod};
use crate::store::{Collection, StateStore, StoreError};
use crate::util::hash_str;
use chrono::{DateTime, Utc};
use regex::Regex;
use std::sync::OnceLock;

const ID_LEN: usize = 16;

/// A failure to be filed.
#[derive(Debug, Clone)]
pub struct NewDiagnostic {
    pub job_name: String,
    /// What the failure is about beyond the job, e.g. a work item id.
    /// Kept verbatim in the id so distinct items never share an entry.
    pub subject: Option<String>,
    pub artifact_path: Option<String>,
    pub description: String,
    pub error_excerpt: String,
    pub source: DiagnosticSource,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueOutcome {
    pub inserted: bool,
    pub id: String,
    pub escalated: bool,
}

/// Strip the parts of an error that change between otherwise identical runs.
pub fn normalize_excerpt(excerpt: &str) -> String {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        [
            // ISO timestamps, GitHub log prefixes included
            r"\d{4}-\d{2}-\d{2}[t ]\d{2}:\d{2}:\d{2}(\.\d+)?(z|[+-]\d{2}:?\d{2})?",
            r"\b[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}\b",
            r"\b(0x)?[0-9a-f]{7,}\b",
            r"\d+",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    });

    let mut text = excerpt.to_lowercase();
    for re in patterns {
        text = re.replace_all(&text, " ").into_owned();
    }
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Stable id for a job's failure signature.
pub fn diagnostic_id(job_name: &str, excerpt: &str) -> String {
    let digest = hash_str(&format!("{}\n{}", job_name, normalize_excerpt(excerpt)));
    digest[..ID_LEN].to_string()
}

fn id_for(new: &NewDiagnostic) -> String {
    match &new.subject {
        Some(subject) => diagnostic_id(&format!("{}\n{}", new.job_name, subject), &new.error_excerpt),
        None => diagnostic_id(&new.job_name, &new.error_excerpt),
    }
}

#[derive(Debug, Clone)]
pub struct DiagnosticInbox {
    store: StateStore,
    max_patch_attempts: u32,
}

impl DiagnosticInbox {
    pub fn new(store: StateStore, max_patch_attempts: u32) -> Self {
        Self {
            store,
            max_patch_attempts,
        }
    }

    /// File a diagnostic, or bump the open entry with the same id.
    pub fn enqueue(
        &self,
        new: NewDiagnostic,
        now: DateTime<Utc>,
    ) -> Result<EnqueueOutcome, StoreError> {
        let id = id_for(&new);
        let max_attempts = self.max_patch_attempts;

        let outcome = self
            .store
            .update(Collection::Diagnostics, |entries: &mut Vec<DiagnosticEntry>| {
                if let Some(open) = entries.iter_mut().find(|e| e.id == id && !e.resolved) {
                    open.occurrences = open.occurrences.saturating_add(1);
                    open.last_seen_at = now;
                    if open.artifact_path.is_none() {
                        open.artifact_path = new.artifact_path.clone();
                    }
                    return EnqueueOutcome {
                        inserted: false,
                        id: id.clone(),
                        escalated: open.escalated,
                    };
                }

                let failed_repairs = entries
                    .iter()
                    .filter(|e| e.id == id && e.resolved)
                    .filter(|e| {
                        matches!(
                            e.resolution_method,
                            Some(ResolutionMethod::AutoPatch | ResolutionMethod::StaleExpired)
                        )
                    })
                    .count();
                let escalated = max_attempts > 0 && failed_repairs >= max_attempts as usize;

                entries.push(DiagnosticEntry {
                    id: id.clone(),
                    job_name: new.job_name.clone(),
                    artifact_path: new.artifact_path.clone(),
                    description: new.description.clone(),
                    error_excerpt: new.error_excerpt.clone(),
                    source: new.source,
                    created_at: now,
                    last_seen_at: now,
                    occurrences: 1,
                    patch_attempts: 0,
                    escalated,
                    resolved: false,
                    resolved_at: None,
                    resolution_method: None,
                });
                EnqueueOutcome {
                    inserted: true,
                    id: id.clone(),
                    escalated,
                }
            })?;

        if outcome.inserted {
            tracing::info!(
                id = %outcome.id,
                job = %new.job_name,
                escalated = outcome.escalated,
                "diagnostic filed"
            );
        } else {
            tracing::debug!(id = %outcome.id, job = %new.job_name, "diagnostic seen again");
        }
        Ok(outcome)
    }

    /// Open entries, oldest first.
    pub fn list_unresolved(&self) -> Result<Vec<DiagnosticEntry>, StoreError> {
        let mut open: Vec<DiagnosticEntry> = self
            .store
            .load::<DiagnosticEntry>(Collection::Diagnostics)?
            .into_iter()
            .filter(|e| !e.resolved)
            .collect();
        open.sort_by_key(|e| e.created_at);
        Ok(open)
    }

    /// The open entry for `id`, or the most recent resolved one.
    pub fn get(&self, id: &str) -> Result<Option<DiagnosticEntry>, StoreError> {
        let entries: Vec<DiagnosticEntry> = self.store.load(Collection::Diagnostics)?;
        let open = entries.iter().find(|e| e.id == id && !e.resolved).cloned();
        Ok(open.or_else(|| {
            entries
                .into_iter()
                .filter(|e| e.id == id)
                .max_by_key(|e| e.resolved_at.unwrap_or(e.created_at))
        }))
    }

    /// Close the open entry for `id`. Returns `false` when there is none.
    pub fn resolve(
        &self,
        id: &str,
        method: ResolutionMethod,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let resolved = self
            .store
            .update(Collection::Diagnostics, |entries: &mut Vec<DiagnosticEntry>| {
                match entries.iter_mut().find(|e| e.id == id && !e.resolved) {
                    Some(entry) => {
                        mark_resolved(entry, method, now);
                        true
                    }
                    None => false,
                }
            })?;
        if resolved {
            tracing::info!(id, method = %method, "diagnostic resolved");
        }
        Ok(resolved)
    }

    /// Close open failure entries for a job filed before `before`.
    ///
    /// Used when a later run of the job succeeded. Dangling-work and
    /// disabled-job entries are not about runs and are left alone.
    pub fn resolve_job_failures_before(
        &self,
        job_name: &str,
        before: DateTime<Utc>,
        method: ResolutionMethod,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, StoreError> {
        let closed = self
            .store
            .update(Collection::Diagnostics, |entries: &mut Vec<DiagnosticEntry>| {
                let mut closed = Vec::new();
                for entry in entries.iter_mut().filter(|e| {
                    !e.resolved
                        && !e.escalated
                        && e.job_name == job_name
                        && !matches!(e.source, DiagnosticSource::DanglingWork | DiagnosticSource::JobDisabled)
                        && e.created_at < before
                }) {
                    mark_resolved(entry, method, now);
                    closed.push(entry.id.clone());
                }
                closed
            })?;
        for id in &closed {
            tracing::info!(id = %id, job = job_name, method = %method, "diagnostic resolved");
        }
        Ok(closed)
    }

    /// Close every open entry of `source` for a job.
    pub fn resolve_job_source(
        &self,
        job_name: &str,
        source: DiagnosticSource,
        method: ResolutionMethod,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, StoreError> {
        let closed = self
            .store
            .update(Collection::Diagnostics, |entries: &mut Vec<DiagnosticEntry>| {
                entries
                    .iter_mut()
                    .filter(|e| !e.resolved && e.job_name == job_name && e.source == source)
                    .map(|entry| {
                        mark_resolved(entry, method, now);
                        entry.id.clone()
                    })
                    .collect::<Vec<_>>()
            })?;
        for id in &closed {
            tracing::info!(id = %id, job = job_name, method = %method, "diagnostic resolved");
        }
        Ok(closed)
    }

    /// Count a failed repair on the open entry, escalating it once the
    /// budget is spent. Returns the escalation state.
    pub fn record_patch_attempt(&self, id: &str) -> Result<bool, StoreError> {
        let max_attempts = self.max_patch_attempts;
        let escalated = self
            .store
            .update(Collection::Diagnostics, |entries: &mut Vec<DiagnosticEntry>| {
                let Some(entry) = entries.iter_mut().find(|e| e.id == id && !e.resolved) else {
                    return false;
                };
                entry.patch_attempts = entry.patch_attempts.saturating_add(1);
                if max_attempts > 0 && entry.patch_attempts >= max_attempts && !entry.escalated {
                    entry.escalated = true;
                    tracing::warn!(id, attempts = entry.patch_attempts, "diagnostic escalated to a human");
                }
                entry.escalated
            })?;
        Ok(escalated)
    }

    /// Close every open, non-escalated entry older than `max_age`.
    ///
    /// Age is strictly compared: an entry exactly `max_age` old stays open.
    pub fn expire_stale(
        &self,
        max_age: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, StoreError> {
        self.store
            .update(Collection::Diagnostics, |entries: &mut Vec<DiagnosticEntry>| {
                let mut expired = Vec::new();
                for entry in entries
                    .iter_mut()
                    .filter(|e| !e.resolved && !e.escalated && now - e.created_at > max_age)
                {
                    mark_resolved(entry, ResolutionMethod::StaleExpired, now);
                    expired.push(entry.id.clone());
                }
                expired
            })
    }

    pub fn open_count(&self) -> Result<usize, StoreError> {
        Ok(self.list_unresolved()?.len())
    }
}

fn mark_resolved(entry: &mut DiagnosticEntry, method: ResolutionMethod, now: DateTime<Utc>) {
    entry.resolved = true;
    entry.resolved_at = Some(now);
    entry.resolution_method = Some(method);
}
