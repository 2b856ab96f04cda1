//! Locating the source file a job runs
//!
//! Tried in order:
//! 1. a source path named in the job definition (`run: python src/news_monitor.py`)
//! 2. `<source_dir>/<job name with '-' as '_'>.<ext>`
//! 3. the file under `<source_dir>` sharing the most name words with the job

use regex::Regex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use walkdir::WalkDir;

const SOURCE_EXTENSIONS: &[&str] = &["py", "js", "mjs", "ts", "rs", "go"];
const MAX_SCAN_DEPTH: usize = 4;

#[derive(Debug, Clone)]
pub struct ArtifactResolver {
    repo_root: PathBuf,
    source_dir: PathBuf,
}

impl ArtifactResolver {
    pub fn new(repo_root: impl Into<PathBuf>, source_dir: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
            source_dir: source_dir.into(),
        }
    }

    /// Repository-relative path of the job's source, if one can be found.
    pub fn resolve(&self, job_name: &str, workflow_path: Option<&str>) -> Option<String> {
        if let Some(found) = workflow_path.and_then(|p| self.from_definition(p)) {
            return Some(found);
        }
        if let Some(found) = self.exact_match(job_name) {
            return Some(found);
        }
        let fuzzy = self.fuzzy_match(job_name);
        if fuzzy.is_none() {
            tracing::debug!(job = job_name, "no source artifact found");
        }
        fuzzy
    }

    fn from_definition(&self, workflow_path: &str) -> Option<String> {
        static SOURCE_REF: OnceLock<Option<Regex>> = OnceLock::new();
        let re = SOURCE_REF
            .get_or_init(|| Regex::new(r"([A-Za-z0-9_./-]+\.(?:py|mjs|js|ts|rs|go))\b").ok())
            .as_ref()?;

        let content = std::fs::read_to_string(self.repo_root.join(workflow_path)).ok()?;
        re.captures_iter(&content)
            .filter_map(|c| c.get(1))
            .map(|m| m.as_str().trim_start_matches("./"))
            .find(|candidate| {
                !candidate.contains("..")
                    && !Path::new(candidate).is_absolute()
                    && self.repo_root.join(candidate).is_file()
            })
            .map(str::to_string)
    }

    fn exact_match(&self, job_name: &str) -> Option<String> {
        let stem = job_name.replace('-', "_");
        SOURCE_EXTENSIONS
            .iter()
            .map(|ext| self.source_dir.join(format!("{}.{}", stem, ext)))
            .find(|rel| self.repo_root.join(rel).is_file())
            .map(|rel| to_repo_string(&rel))
    }

    fn fuzzy_match(&self, job_name: &str) -> Option<String> {
        let job_words = words(job_name);
        if job_words.is_empty() {
            return None;
        }

        let root = self.repo_root.join(&self.source_dir);
        let mut best: Option<(usize, String)> = None;
        for entry in WalkDir::new(&root)
            .max_depth(MAX_SCAN_DEPTH)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let path = entry.path();
            let has_source_ext = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| SOURCE_EXTENSIONS.contains(&e))
                .unwrap_or(false);
            if !has_source_ext {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let overlap = words(stem).intersection(&job_words).count();
            if overlap == 0 {
                continue;
            }
            let Ok(rel) = path.strip_prefix(&self.repo_root) else {
                continue;
            };
            let rel = to_repo_string(rel);
            let better = match &best {
                None => true,
                Some((score, current)) => overlap > *score || (overlap == *score && rel < *current),
            };
            if better {
                best = Some((overlap, rel));
            }
        }
        best.map(|(_, rel)| rel)
    }
}

fn words(name: &str) -> HashSet<String> {
    name.to_lowercase()
        .split(|c: char| c == '_' || c == '-' || c == ' ' || c == '.')
        .filter(|w| w.len() > 1)
        .map(str::to_string)
        .collect()
}

fn to_repo_string(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect::<Vec<_>>()
        .join("/")
}
