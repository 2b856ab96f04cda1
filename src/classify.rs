//! Failure classification
//!
//! An ordered signature table maps error text to a [`FailureKind`]. Transient
//! signatures are checked before structural ones, so a log that mentions both
//! a timeout and a traceback is retried before anyone edits code.

use crate::model::{FailureKind, JobRunRecord};
use regex::Regex;
use std::sync::OnceLock;

/// One known failure signature.
#[derive(Debug)]
pub struct SignatureRule {
    pub id: &'static str,
    pub kind: FailureKind,
    pub diagnosis: &'static str,
    patterns: Vec<Regex>,
}

impl SignatureRule {
    fn matches(&self, text: &str) -> bool {
        self.patterns.iter().any(|re| re.is_match(text))
    }
}

struct RuleSpec {
    id: &'static str,
    kind: FailureKind,
    diagnosis: &'static str,
    patterns: &'static [&'static str],
}

const RULES: &[RuleSpec] = &[
    // ─ transient ───────────────────────────────────────────────────────────
    RuleSpec {
        id: "rate_limit",
        kind: FailureKind::Transient,
        diagnosis: "Hit an API rate limit; the job made too many requests too fast.",
        patterns: &[
            r"rate[\s_-]?limit",
            r"too many requests",
            r"\b429\b",
            r"x-ratelimit",
        ],
    },
    RuleSpec {
        id: "timeout",
        kind: FailureKind::Transient,
        diagnosis: "An operation timed out waiting on an external service.",
        patterns: &[
            r"\btimed?[\s_-]?out\b",
            r"\btimeout\b",
            r"etimedout",
            r"deadline exceeded",
        ],
    },
    RuleSpec {
        id: "connection",
        kind: FailureKind::Transient,
        diagnosis: "A network connection was refused or dropped.",
        patterns: &[
            r"connection (reset|refused|aborted)",
            r"econnreset",
            r"econnrefused",
            r"remotedisconnected",
            r"urlopen error",
            r"chunkedencodingerror",
            r"broken pipe",
        ],
    },
    RuleSpec {
        id: "upstream_unavailable",
        kind: FailureKind::Transient,
        diagnosis: "An upstream service answered with a gateway or availability error.",
        patterns: &[
            r"\b50[234]\b",
            r"bad gateway",
            r"service unavailable",
            r"gateway time-?out",
        ],
    },
    RuleSpec {
        id: "dns",
        kind: FailureKind::Transient,
        diagnosis: "A host name could not be resolved.",
        patterns: &[
            r"name or service not known",
            r"temporary failure in name resolution",
            r"could not resolve host",
            r"getaddrinfo",
            r"nodename nor servname",
        ],
    },
    // ─ structural ──────────────────────────────────────────────────────────
    RuleSpec {
        id: "syntax_error",
        kind: FailureKind::Structural,
        diagnosis: "The job's source has a syntax or indentation error.",
        patterns: &[
            r"syntaxerror",
            r"indentationerror",
            r"taberror",
            r"invalid syntax",
        ],
    },
    RuleSpec {
        id: "missing_module",
        kind: FailureKind::Structural,
        diagnosis: "The job imports a module that is not available.",
        patterns: &[
            r"modulenotfounderror",
            r"no module named",
            r"importerror",
            r"cannot find module",
            r"unresolved import",
        ],
    },
    RuleSpec {
        id: "malformed_json",
        kind: FailureKind::Structural,
        diagnosis: "A JSON document is malformed or an API returned unexpected data.",
        patterns: &[
            r"jsondecodeerror",
            r"json\.decoder",
            r"expecting value",
            r"unexpected token",
            r"invalid json",
        ],
    },
    RuleSpec {
        id: "unhandled_access",
        kind: FailureKind::Structural,
        diagnosis: "The job reads a key or attribute that is not there.",
        patterns: &[
            r"keyerror",
            r"attributeerror",
            r"'nonetype' object",
            r"cannot read propert(y|ies) of (undefined|null)",
            r"nil pointer dereference",
        ],
    },
    RuleSpec {
        id: "missing_file",
        kind: FailureKind::Structural,
        diagnosis: "The job reads a file or directory that does not exist yet.",
        patterns: &[
            r"filenotfounderror",
            r"no such file or directory",
            r"cannot find the path",
            r"\benoent\b",
        ],
    },
];

fn rules() -> &'static [SignatureRule] {
    static COMPILED: OnceLock<Vec<SignatureRule>> = OnceLock::new();
    COMPILED.get_or_init(|| {
        RULES
            .iter()
            .map(|spec| SignatureRule {
                id: spec.id,
                kind: spec.kind,
                diagnosis: spec.diagnosis,
                patterns: spec
                    .patterns
                    .iter()
                    .filter_map(|p| Regex::new(&format!("(?i){}", p)).ok())
                    .collect(),
            })
            .collect()
    })
}

/// First rule matching the error text, in table order.
pub fn diagnose(excerpt: &str) -> Option<&'static SignatureRule> {
    if excerpt.trim().is_empty() {
        return None;
    }
    rules().iter().find(|rule| rule.matches(excerpt))
}

/// Classify error text. Unmatched text is `Unknown`.
pub fn classify_excerpt(excerpt: &str) -> FailureKind {
    diagnose(excerpt)
        .map(|rule| rule.kind)
        .unwrap_or(FailureKind::Unknown)
}

/// Classify a failed run, logging unmatched errors for rule tuning.
pub fn classify(record: &JobRunRecord) -> FailureKind {
    let kind = classify_excerpt(&record.error_excerpt);
    if kind == FailureKind::Unknown {
        tracing::warn!(
            job = %record.job_name,
            run = %record.run_id,
            excerpt = %crate::util::truncate(&record.error_excerpt, 200),
            "failure matched no signature"
        );
    }
    kind
}

/// Human readable description for a diagnostic.
pub fn describe(record: &JobRunRecord) -> String {
    match diagnose(&record.error_excerpt) {
        Some(rule) => format!("[{}] {}", rule.id, rule.diagnosis),
        None => format!("{} failed with an unrecognized error.", record.job_name),
    }
}
