//! Automated repair of job source files
//!
//! [`generator`] asks a [`backend::CodeGenerator`] for a corrected file and
//! validates it, falling back to the deterministic fixes in [`rules`];
//! [`committer`] writes and commits it or puts the original back.

pub mod backend;
pub mod committer;
pub mod generator;
pub mod rules;
pub mod syntax;

use crate::inbox::DiagnosticInbox;
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use committer::PatchCommitter;
use generator::PatchGenerator;
use serde::Serialize;
use tokio::time::Instant;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealSummary {
    pub considered: usize,
    pub committed: usize,
    pub failed: usize,
    pub deferred: usize,
    /// Skipped because the job was patched within the cooldown
    pub cooling_down: usize,
    /// The deadline stopped the pass before every entry was seen
    pub interrupted: bool,
}

/// Bounds on one heal pass.
#[derive(Debug, Clone)]
pub struct HealLimits {
    pub max_per_cycle: usize,
    /// Minimum gap between attempts on the same job; zero disables it
    pub cooldown: Duration,
    /// No new entry is started after this
    pub deadline: Option<Instant>,
}

/// One generate-and-commit pass over the oldest open diagnostics.
///
/// Entries that cannot be patched yet (escalated, protected, nothing to
/// generate from) or whose job is cooling down do not count against
/// `max_per_cycle`. Generation is abandoned when the deadline passes; a
/// write and its commit always run to completion.
pub async fn heal_pass(
    inbox: &DiagnosticInbox,
    generator: &PatchGenerator,
    committer: &PatchCommitter,
    limits: &HealLimits,
    now: DateTime<Utc>,
) -> Result<HealSummary> {
    let mut summary = HealSummary::default();
    let cooling = limits.cooldown > Duration::zero();
    let mut recent = if cooling {
        committer.jobs_attempted_since(now - limits.cooldown)?
    } else {
        Default::default()
    };
    let candidates = inbox
        .list_unresolved()?
        .into_iter()
        .filter(|e| generator.can_attempt(e));

    for entry in candidates {
        if summary.considered >= limits.max_per_cycle {
            break;
        }
        if limits.deadline.is_some_and(|d| Instant::now() >= d) {
            summary.interrupted = true;
            break;
        }
        if recent.contains(&entry.job_name) {
            tracing::debug!(id = %entry.id, job = %entry.job_name, "job patched recently; waiting");
            summary.cooling_down += 1;
            continue;
        }

        summary.considered += 1;
        let generated = match limits.deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, generator.generate(&entry)).await {
                Ok(generated) => generated,
                Err(_) => {
                    tracing::info!(id = %entry.id, "deadline reached during generation");
                    summary.deferred += 1;
                    summary.interrupted = true;
                    break;
                }
            },
            None => generator.generate(&entry).await,
        };
        let Some(candidate) = generated else {
            summary.deferred += 1;
            continue;
        };

        let attempt = committer.commit(&entry, &candidate, now).await?;
        if cooling {
            recent.insert(entry.job_name.clone());
        }
        if attempt.committed {
            summary.committed += 1;
        } else {
            summary.failed += 1;
        }
    }

    tracing::info!(
        considered = summary.considered,
        committed = summary.committed,
        failed = summary.failed,
        deferred = summary.deferred,
        cooling_down = summary.cooling_down,
        interrupted = summary.interrupted,
        "heal pass finished"
    );
    Ok(summary)
}
