//! Configuration for hyphae
//!
//! Read from TOML, first match wins:
//! 1. `--config <path>`
//! 2. `<repo>/hyphae.toml`
//! 3. `~/.config/hyphae/config.toml`
//!
//! Every section has defaults, so an absent file is a valid configuration.
//! Secrets never live in the file; only the names of the environment
//! variables holding them do.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const REPO_CONFIG_FILE: &str = "hyphae.toml";
pub const DEFAULT_STATE_DIR: &str = ".hyphae";
/// One year; keeps every window inside chrono's duration range.
pub const MAX_WINDOW_HOURS: i64 = 8760;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// State directory, relative to the repository root unless absolute
    pub state_dir: Option<PathBuf>,
    pub collect: CollectConfig,
    pub runner: RunnerConfig,
    pub retry: RetryConfig,
    pub patch: PatchConfig,
    pub reconcile: ReconcileConfig,
    pub cycle: CycleConfig,
    pub health: HealthConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectConfig {
    /// Trailing window of runs to consider
    pub window_hours: i64,
    /// Turn back on jobs the runner disabled for repository inactivity
    pub reenable_inactive: bool,
}

impl Default for CollectConfig {
    fn default() -> Self {
        Self {
            window_hours: 24,
            reenable_inactive: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// `owner/name`; detected from the git remote when unset
    pub repository: Option<String>,
    pub api_base: String,
    pub token_env: String,
    /// Concurrent per-job run listings
    pub concurrency: usize,
    pub timeout_secs: u64,
    /// Only consider workflows whose file stem is listed (empty = all)
    pub jobs: Vec<String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            repository: None,
            api_base: "https://api.github.com".to_string(),
            token_env: "GITHUB_TOKEN".to_string(),
            concurrency: 6,
            timeout_secs: 30,
            jobs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_attempts: 2 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatchConfig {
    pub enabled: bool,
    pub api_base: String,
    pub api_key_env: String,
    pub model: String,
    pub max_tokens: u32,
    pub timeout_secs: u64,
    /// Content beyond this many characters is cut from the prompt
    pub max_file_chars: usize,
    /// Reject candidates larger than this multiple of the original
    pub max_size_multiplier: f64,
    /// Reject candidates smaller than this fraction of the original
    pub min_size_ratio: f64,
    /// Automated attempts on one failure before a human is asked
    pub max_patch_attempts: u32,
    /// Entries processed per heal pass
    pub max_per_cycle: usize,
    /// Jobs never patched automatically (substring match on the job name)
    pub protected_jobs: Vec<String>,
    /// Directory searched for the source a workflow runs
    pub source_dir: PathBuf,
    /// Apply deterministic fixes for known signatures when the model has none
    pub rule_fixes: bool,
    /// Dependency manifest the missing-module fix appends to
    pub requirements_file: PathBuf,
    /// Minimum hours between patch attempts on the same job
    pub cooldown_hours: i64,
}

impl Default for PatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_base: "https://openrouter.ai/api/v1".to_string(),
            api_key_env: "OPENROUTER_API_KEY".to_string(),
            model: "meta-llama/llama-3.3-70b-instruct".to_string(),
            max_tokens: 8192,
            timeout_secs: 120,
            max_file_chars: 20_000,
            max_size_multiplier: 3.0,
            min_size_ratio: 0.5,
            max_patch_attempts: 3,
            max_per_cycle: 3,
            protected_jobs: Vec::new(),
            source_dir: PathBuf::from("src"),
            rule_fixes: true,
            requirements_file: PathBuf::from("requirements.txt"),
            cooldown_hours: 24,
        }
    }
}

impl PatchConfig {
    pub fn is_protected(&self, job_name: &str) -> bool {
        let name = job_name.to_lowercase();
        self.protected_jobs
            .iter()
            .any(|p| !p.is_empty() && name.contains(&p.to_lowercase()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Drafted items older than this are dangling
    pub cooling_off_days: i64,
    /// Generated items older than this were never published
    pub freshness_days: i64,
    /// Open diagnostics older than this expire
    pub staleness_days: i64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            cooling_off_days: 14,
            freshness_days: 3,
            staleness_days: 14,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CycleConfig {
    pub deadline_secs: u64,
    pub lock_stale_minutes: i64,
    /// Timeout for a single version-control operation
    pub vcs_timeout_secs: u64,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            deadline_secs: 600,
            lock_stale_minutes: 30,
            vcs_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Snapshots kept in the store
    pub keep_snapshots: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self { keep_snapshots: 50 }
    }
}

impl Config {
    /// Global config file location
    fn global_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("hyphae").join("config.toml"))
    }

    /// Load config for `repo_root`, honoring an explicit path first.
    ///
    /// An explicit path that does not exist is an error; the implicit
    /// locations fall through to defaults.
    pub fn load(explicit: Option<&Path>, repo_root: &Path) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load_from(path);
        }

        let repo_path = repo_root.join(REPO_CONFIG_FILE);
        if repo_path.exists() {
            return Self::load_from(&repo_path);
        }

        if let Some(path) = Self::global_path() {
            if path.exists() {
                return Self::load_from(&path);
            }
        }

        tracing::debug!("no config file found, using defaults");
        Ok(Self::default())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        match toml::from_str::<Config>(&content) {
            Ok(config) => {
                config
                    .validate()
                    .with_context(|| format!("Invalid config {}", path.display()))?;
                tracing::debug!(path = %path.display(), "loaded config");
                Ok(config)
            }
            Err(err) => {
                let backup = preserve_corrupt_config(path, &content);
                Err(anyhow::anyhow!(
                    "Config file {} is malformed ({}). A copy was saved to {}",
                    path.display(),
                    err,
                    backup.display()
                ))
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if self.collect.window_hours <= 0 || self.collect.window_hours > MAX_WINDOW_HOURS {
            anyhow::bail!(
                "collect.window_hours must be between 1 and {}",
                MAX_WINDOW_HOURS
            );
        }
        if self.patch.cooldown_hours < 0 || self.patch.cooldown_hours > MAX_WINDOW_HOURS {
            anyhow::bail!(
                "patch.cooldown_hours must be between 0 and {}",
                MAX_WINDOW_HOURS
            );
        }
        if self.runner.concurrency == 0 {
            anyhow::bail!("runner.concurrency must be at least 1");
        }
        if self.patch.min_size_ratio < 0.0
            || self.patch.max_size_multiplier < self.patch.min_size_ratio
        {
            anyhow::bail!("patch size bounds are inconsistent");
        }
        if self.reconcile.staleness_days < 0
            || self.reconcile.cooling_off_days < 0
            || self.reconcile.freshness_days < 0
        {
            anyhow::bail!("reconcile thresholds must not be negative");
        }
        Ok(())
    }

    /// Absolute state directory for a repository.
    pub fn state_dir(&self, repo_root: &Path) -> PathBuf {
        match &self.state_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => repo_root.join(dir),
            None => repo_root.join(DEFAULT_STATE_DIR),
        }
    }
}

/// Keep a copy of a config that failed to parse, next to the original.
fn preserve_corrupt_config(path: &Path, content: &str) -> PathBuf {
    let corrupt_path = path.with_extension("toml.corrupt");
    if fs::copy(path, &corrupt_path).is_err() {
        let _ = fs::write(&corrupt_path, content);
    }
    corrupt_path
}

/// Read a secret from the environment, treating empty values as unset.
pub fn secret_from_env(var: &str) -> Option<String> {
    match std::env::var(var) {
        Ok(value) if !value.trim().is_empty() => Some(value),
        _ => None,
    }
}
