//! Deterministic fixes for signatures with a known remedy
//!
//! A fix may target a different file than the failing artifact: a missing
//! Python module is repaired in the dependency manifest, not in the script
//! that imports it.

use crate::classify;
use crate::config::PatchConfig;
use crate::model::{DiagnosticEntry, DiagnosticSource};
use crate::util::confine_path;
use regex::Regex;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::OnceLock;

/// A rule-produced replacement for one file.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleEdit {
    pub rule_id: &'static str,
    pub path: String,
    /// Empty when the file does not exist yet
    pub original: String,
    pub content: String,
}

type FixFn = fn(&Path, &PatchConfig, &DiagnosticEntry) -> Option<RuleEdit>;

struct RuleFix {
    rule_id: &'static str,
    fix: FixFn,
}

const FIXES: &[RuleFix] = &[RuleFix {
    rule_id: "missing_module",
    fix: add_requirement,
}];

/// Import names whose distribution is published under another name.
const DISTRIBUTIONS: &[(&str, &str)] = &[
    ("bs4", "beautifulsoup4"),
    ("cv2", "opencv-python"),
    ("dateutil", "python-dateutil"),
    ("dotenv", "python-dotenv"),
    ("googleapiclient", "google-api-python-client"),
    ("jwt", "PyJWT"),
    ("PIL", "pillow"),
    ("sklearn", "scikit-learn"),
    ("yaml", "PyYAML"),
];

/// Whether a rule knows how to repair the failure behind `entry`.
pub fn has_fix(entry: &DiagnosticEntry) -> bool {
    matching_fix(entry).is_some()
}

fn matching_fix(entry: &DiagnosticEntry) -> Option<&'static RuleFix> {
    if entry.source != DiagnosticSource::JobFailure {
        return None;
    }
    let rule = classify::diagnose(&entry.error_excerpt)?;
    FIXES.iter().find(|fix| fix.rule_id == rule.id)
}

/// Edit proposed by the first rule matching `entry`, if it applies.
pub fn fix_for(repo_root: &Path, config: &PatchConfig, entry: &DiagnosticEntry) -> Option<RuleEdit> {
    let fix = matching_fix(entry)?;
    let edit = (fix.fix)(repo_root, config, entry)?;
    tracing::debug!(id = %entry.id, rule = fix.rule_id, path = %edit.path, "rule fix applies");
    Some(edit)
}

/// Top-level module named in a Python import error.
pub fn missing_module(excerpt: &str) -> Option<String> {
    static NAMED: OnceLock<Option<Regex>> = OnceLock::new();
    let re = NAMED
        .get_or_init(|| Regex::new(r#"No module named ['"]([A-Za-z0-9_.]+)['"]"#).ok())
        .as_ref()?;
    let full = re.captures_iter(excerpt).last()?.get(1)?.as_str();
    let top = full.split('.').next().filter(|m| !m.is_empty())?;
    Some(top.to_string())
}

/// Distribution to install for an import name.
pub fn distribution_for(module: &str) -> String {
    DISTRIBUTIONS
        .iter()
        .find(|(import, _)| *import == module)
        .map(|(_, dist)| dist.to_string())
        .unwrap_or_else(|| module.replace('_', "-"))
}

fn normalize(name: &str) -> String {
    name.to_lowercase().replace('_', "-")
}

/// Names already listed in a requirements file, normalized.
fn listed(requirements: &str) -> Vec<String> {
    requirements
        .lines()
        .map(|line| line.split('#').next().unwrap_or_default().trim())
        .filter(|line| !line.is_empty() && !line.starts_with('-'))
        .filter_map(|line| {
            line.split(|c: char| "<>=!~[;@ ".contains(c))
                .next()
                .map(normalize)
        })
        .collect()
}

fn add_requirement(repo_root: &Path, config: &PatchConfig, entry: &DiagnosticEntry) -> Option<RuleEdit> {
    let module = missing_module(&entry.error_excerpt)?;
    let dist = distribution_for(&module);

    let resolved = match confine_path(repo_root, &config.requirements_file) {
        Ok(resolved) => resolved,
        Err(reason) => {
            tracing::warn!(id = %entry.id, %reason, "requirements file is outside the repository");
            return None;
        }
    };
    let original = match std::fs::read_to_string(&resolved.absolute) {
        Ok(content) => content,
        Err(err) if err.kind() == ErrorKind::NotFound => String::new(),
        Err(err) => {
            tracing::warn!(id = %entry.id, error = %err, "could not read requirements file");
            return None;
        }
    };

    // Already declared: installing again will not help
    if listed(&original).contains(&normalize(&dist)) {
        tracing::debug!(id = %entry.id, module = %module, "module already listed");
        return None;
    }

    let mut content = original.clone();
    if !content.is_empty() && !content.ends_with('\n') {
        content.push('\n');
    }
    content.push_str(&dist);
    content.push('\n');

    Some(RuleEdit {
        rule_id: "missing_module",
        path: resolved.relative.to_string_lossy().replace('\\', "/"),
        original,
        content,
    })
}
