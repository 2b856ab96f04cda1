use super::backend::{CodeGenerator, CompletionRequest};
use super::rules;
use super::syntax::{has_syntax_errors, plausible_preamble, Language};
use crate::config::PatchConfig;
use crate::model::DiagnosticEntry;
use crate::util::{confine_path, tail, truncate};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const SYSTEM_PROMPT: &str = "You repair source files of unattended scheduled jobs. \
Be precise and conservative. Output only the complete corrected file, with no explanation.";

const PROMPT_EXCERPT_CHARS: usize = 4000;

/// Replacement content for one artifact, validated but not yet written.
#[derive(Debug, Clone, PartialEq)]
pub struct PatchCandidate {
    pub diagnostic_id: String,
    pub artifact_path: String,
    pub original: String,
    pub content: String,
}

/// Produces candidates from the model backend when one is configured, and
/// from the deterministic rule table when the model has nothing usable.
pub struct PatchGenerator {
    repo_root: PathBuf,
    config: PatchConfig,
    backend: Option<Arc<dyn CodeGenerator>>,
}

impl PatchGenerator {
    pub fn new(
        repo_root: impl Into<PathBuf>,
        config: PatchConfig,
        backend: Option<Arc<dyn CodeGenerator>>,
    ) -> Self {
        Self {
            repo_root: repo_root.into(),
            config,
            backend,
        }
    }

    /// Entry is not escalated, its job is not protected, and either the model
    /// has an artifact to rewrite or a rule knows the fix.
    pub fn can_attempt(&self, entry: &DiagnosticEntry) -> bool {
        if entry.escalated || self.config.is_protected(&entry.job_name) {
            return false;
        }
        let rewritable = self.backend.is_some() && entry.artifact_path.is_some();
        rewritable || (self.config.rule_fixes && rules::has_fix(entry))
    }

    /// Corrected content for the entry. `None` means try again later.
    pub async fn generate(&self, entry: &DiagnosticEntry) -> Option<PatchCandidate> {
        if entry.escalated {
            tracing::debug!(id = %entry.id, "escalated; waiting for a human");
            return None;
        }
        if self.config.is_protected(&entry.job_name) {
            tracing::info!(id = %entry.id, job = %entry.job_name, "protected job; not patching");
            return None;
        }
        if let Some(candidate) = self.rewrite(entry).await {
            return Some(candidate);
        }
        self.rule_candidate(entry)
    }

    fn rule_candidate(&self, entry: &DiagnosticEntry) -> Option<PatchCandidate> {
        if !self.config.rule_fixes {
            return None;
        }
        let edit = rules::fix_for(&self.repo_root, &self.config, entry)?;
        tracing::info!(
            id = %entry.id,
            rule = edit.rule_id,
            path = %edit.path,
            "rule fix candidate ready"
        );
        Some(PatchCandidate {
            diagnostic_id: entry.id.clone(),
            artifact_path: edit.path,
            original: edit.original,
            content: edit.content,
        })
    }

    async fn rewrite(&self, entry: &DiagnosticEntry) -> Option<PatchCandidate> {
        let backend = self.backend.as_ref()?;
        let Some(artifact_path) = entry.artifact_path.as_deref() else {
            tracing::debug!(id = %entry.id, "no artifact to patch");
            return None;
        };

        let resolved = match confine_path(&self.repo_root, Path::new(artifact_path)) {
            Ok(resolved) => resolved,
            Err(reason) => {
                tracing::warn!(id = %entry.id, path = artifact_path, %reason, "rejected artifact path");
                return None;
            }
        };
        let original = match std::fs::read_to_string(&resolved.absolute) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!(id = %entry.id, path = artifact_path, error = %err, "could not read artifact");
                return None;
            }
        };

        let request = CompletionRequest {
            system: SYSTEM_PROMPT.to_string(),
            artifact_path: artifact_path.to_string(),
            artifact: truncate(&original, self.config.max_file_chars),
            description: format!(
                "{}\n\nERROR (last {} chars):\n{}",
                entry.description,
                PROMPT_EXCERPT_CHARS,
                tail(&entry.error_excerpt, PROMPT_EXCERPT_CHARS)
            ),
        };

        let timeout = Duration::from_secs(self.config.timeout_secs);
        let raw = match tokio::time::timeout(timeout, backend.complete(&request)).await {
            Ok(Ok(raw)) => raw,
            Ok(Err(err)) => {
                tracing::warn!(id = %entry.id, error = %format!("{:#}", err), "code generation failed");
                return None;
            }
            Err(_) => {
                tracing::warn!(id = %entry.id, timeout_secs = self.config.timeout_secs, "code generation timed out");
                return None;
            }
        };

        let content = extract_code_block(&raw, original.ends_with('\n'));
        if let Err(reason) = validate_candidate(Path::new(artifact_path), &original, &content, &self.config) {
            tracing::warn!(id = %entry.id, path = artifact_path, %reason, "rejected generated patch");
            return None;
        }

        tracing::info!(
            id = %entry.id,
            path = artifact_path,
            language = Language::from_path(Path::new(artifact_path)).as_str(),
            before = original.len(),
            after = content.len(),
            "patch candidate ready"
        );
        Some(PatchCandidate {
            diagnostic_id: entry.id.clone(),
            artifact_path: resolved.relative.to_string_lossy().replace('\\', "/"),
            original,
            content,
        })
    }
}

/// Pull the body out of a fenced block if the model wrapped its answer in one.
pub fn extract_code_block(raw: &str, trailing_newline: bool) -> String {
    let mut lines = raw.lines();
    let body: Vec<&str> = if raw.contains("```") {
        let mut inside = Vec::new();
        let mut started = false;
        for line in lines.by_ref() {
            if line.trim_start().starts_with("```") {
                if started {
                    break;
                }
                started = true;
                continue;
            }
            if started {
                inside.push(line);
            }
        }
        inside
    } else {
        lines.collect()
    };

    let mut content = body.join("\n").trim_matches('\n').to_string();
    if trailing_newline && !content.is_empty() {
        content.push('\n');
    }
    content
}

/// Reasons a candidate cannot replace the original.
pub fn validate_candidate(
    path: &Path,
    original: &str,
    candidate: &str,
    config: &PatchConfig,
) -> Result<(), String> {
    if candidate.trim().is_empty() {
        return Err("empty output".to_string());
    }
    if candidate == original {
        return Err("output identical to the original".to_string());
    }
    if !plausible_preamble(path, original, candidate) {
        return Err("output does not start like source code".to_string());
    }

    if !original.is_empty() {
        let before = original.len() as f64;
        let after = candidate.len() as f64;
        if after > before * config.max_size_multiplier {
            return Err(format!(
                "output is {:.1}x the original (limit {:.1}x)",
                after / before,
                config.max_size_multiplier
            ));
        }
        if after < before * config.min_size_ratio {
            return Err(format!(
                "output is {:.0}% of the original (minimum {:.0}%)",
                after / before * 100.0,
                config.min_size_ratio * 100.0
            ));
        }
    }

    match has_syntax_errors(path, candidate) {
        Ok(Some(true)) => Err("output does not parse".to_string()),
        Ok(_) => Ok(()),
        Err(err) => Err(format!("parser failed: {}", err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DiagnosticSource;
    use crate::testing::{diagnostic, FakeGenerator};
    use std::fs;

    const ORIGINAL: &str = "import json\n\ndef run():\n    data = json.loads('{}')\n    return data['items']\n";
    const FIXED: &str = "import json\n\ndef run():\n    data = json.loads('{}')\n    return data.get('items', [])\n";

    fn setup(response: &str) -> (tempfile::TempDir, PatchGenerator, Arc<FakeGenerator>) {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/news.py"), ORIGINAL).unwrap();
        let backend = Arc::new(FakeGenerator::new(vec![Ok(response.to_string())]));
        let config = PatchConfig {
            protected_jobs: vec!["self_evolution".to_string()],
            ..PatchConfig::default()
        };
        let generator = PatchGenerator::new(dir.path(), config, Some(backend.clone() as Arc<dyn CodeGenerator>));
        (dir, generator, backend)
    }

    #[test]
    fn code_fence_is_stripped() {
        let raw = "Here you go:\n```python\nimport os\nprint(1)\n```\nThanks";
        assert_eq!(extract_code_block(raw, true), "import os\nprint(1)\n");
        assert_eq!(extract_code_block("import os\n", false), "import os");
    }

    #[test]
    fn size_bounds_are_enforced() {
        let config = PatchConfig::default();
        let path = Path::new("job.py");
        let original = "x = 1\n".repeat(20);

        let bloated = "x = 1\n".repeat(61);
        assert!(validate_candidate(path, &original, &bloated, &config).unwrap_err().contains("limit"));

        let truncated = "x = 1\n".repeat(9);
        assert!(validate_candidate(path, &original, &truncated, &config).unwrap_err().contains("minimum"));

        let ok = format!("{}y = 2\n", original);
        assert!(validate_candidate(path, &original, &ok, &config).is_ok());
    }

    #[test]
    fn unparseable_output_is_rejected() {
        let config = PatchConfig::default();
        let original = "def run():\n    return 1\n";
        let broken = "def run(:\n    return 2\n";
        assert_eq!(
            validate_candidate(Path::new("job.py"), original, broken, &config).unwrap_err(),
            "output does not parse"
        );
    }

    #[tokio::test]
    async fn generates_validated_candidate() {
        let (_dir, generator, backend) = setup(&format!("```python\n{}```", FIXED));
        let entry = diagnostic("news", Some("src/news.py"), DiagnosticSource::JobFailure);

        let candidate = generator.generate(&entry).await.unwrap();
        assert_eq!(candidate.artifact_path, "src/news.py");
        assert_eq!(candidate.original, ORIGINAL);
        assert_eq!(candidate.content, FIXED);

        let requests = backend.requests();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].artifact.contains("data['items']"));
    }

    #[tokio::test]
    async fn skips_protected_escalated_and_pathless_entries() {
        let (_dir, generator, backend) = setup(FIXED);

        let protected = diagnostic("self_evolution", Some("src/news.py"), DiagnosticSource::JobFailure);
        assert!(generator.generate(&protected).await.is_none());

        let mut escalated = diagnostic("news", Some("src/news.py"), DiagnosticSource::JobFailure);
        escalated.escalated = true;
        assert!(generator.generate(&escalated).await.is_none());

        let pathless = diagnostic("news", None, DiagnosticSource::DanglingWork);
        assert!(generator.generate(&pathless).await.is_none());

        assert!(backend.requests().is_empty());
    }

    #[tokio::test]
    async fn prose_answer_is_deferred() {
        let (_dir, generator, _backend) = setup("I cannot fix this without more context.");
        let entry = diagnostic("news", Some("src/news.py"), DiagnosticSource::JobFailure);
        assert!(generator.generate(&entry).await.is_none());
    }

    #[tokio::test]
    async fn backend_error_is_deferred() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/news.py"), ORIGINAL).unwrap();
        let backend = Arc::new(FakeGenerator::new(vec![Err("backend down".to_string())]));
        let generator = PatchGenerator::new(dir.path(), PatchConfig::default(), Some(backend as Arc<dyn CodeGenerator>));
        let entry = diagnostic("news", Some("src/news.py"), DiagnosticSource::JobFailure);
        assert!(generator.generate(&entry).await.is_none());
    }

    #[tokio::test]
    async fn missing_module_is_fixed_without_a_model() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/news.py"), "import feedparser\n").unwrap();
        fs::write(dir.path().join("requirements.txt"), "requests\n").unwrap();
        let generator = PatchGenerator::new(dir.path(), PatchConfig::default(), None);

        let mut entry = diagnostic("news", Some("src/news.py"), DiagnosticSource::JobFailure);
        entry.error_excerpt = "ModuleNotFoundError: No module named 'feedparser'".to_string();
        assert!(generator.can_attempt(&entry));
        let candidate = generator.generate(&entry).await.unwrap();
        assert_eq!(candidate.artifact_path, "requirements.txt");
        assert_eq!(candidate.content, "requests\nfeedparser\n");

        // Without a model or a rule there is nothing to try
        let keyerror = diagnostic("news", Some("src/news.py"), DiagnosticSource::JobFailure);
        assert!(!generator.can_attempt(&keyerror));
    }

    #[tokio::test]
    async fn rejected_model_output_falls_back_to_the_rule() {
        let (dir, generator, backend) = setup("Sorry, I cannot help with that.");
        let mut entry = diagnostic("news", Some("src/news.py"), DiagnosticSource::JobFailure);
        entry.error_excerpt = "ModuleNotFoundError: No module named 'yaml'".to_string();

        let candidate = generator.generate(&entry).await.unwrap();
        assert_eq!(backend.requests().len(), 1);
        assert_eq!(candidate.artifact_path, "requirements.txt");
        assert_eq!(candidate.original, "");
        assert_eq!(candidate.content, "PyYAML\n");
        assert!(!dir.path().join("requirements.txt").exists());
    }

    #[tokio::test]
    async fn traversal_paths_are_refused() {
        let (_dir, generator, backend) = setup(FIXED);
        let entry = diagnostic("news", Some("../outside.py"), DiagnosticSource::JobFailure);
        assert!(generator.generate(&entry).await.is_none());
        assert!(backend.requests().is_empty());
    }
}
