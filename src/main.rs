use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use hyphae::config::Config;
use hyphae::cycle::{Cycle, Services};
use hyphae::health::{self, HealthReporter};
use hyphae::inbox::DiagnosticInbox;
use hyphae::model::{ResolutionMethod, WorkItem, WorkStatus};
use hyphae::patch::backend::{ChatCompletionsGenerator, CodeGenerator};
use hyphae::reconcile::{self, LoopReconciler};
use hyphae::runner::github::{resolve_repository, GitHubRunner};
use hyphae::store::{RunLock, StateStore, StoreError};
use hyphae::util::truncate;
use hyphae::vcs::GitRepo;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

/// Exit code when another invocation holds the run lock.
const EXIT_LOCKED: u8 = 2;

#[derive(Parser, Debug)]
#[command(
    name = "hyphae",
    about = "Self-healing orchestration loop for a fleet of scheduled jobs",
    version
)]
struct Cli {
    /// Config file (defaults to <repo>/hyphae.toml, then the user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Repository the jobs live in
    #[arg(long, global = true, default_value = ".")]
    repo: PathBuf,

    /// Print machine-readable JSON on stdout
    #[arg(long, global = true)]
    json: bool,

    /// Debug logging (overridden by HYPHAE_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Poll the runner and record new runs
    Collect,
    /// Sweep dangling work, stale diagnostics and lost retries
    Reconcile,
    /// Print the current health snapshot without storing it
    Report,
    /// Collect, triage, heal, reconcile and report in one locked cycle
    RunAll,
    /// Generate and commit patches for open diagnostics
    Heal,
    /// List unresolved diagnostics
    Inbox,
    /// Close a diagnostic by hand
    Resolve(ResolveArgs),
    /// Record or update a work item
    Track(TrackArgs),
    /// Start a fresh run of a job
    Dispatch(DispatchArgs),
}

#[derive(Args, Debug)]
struct ResolveArgs {
    id: String,
    #[arg(long, value_enum, default_value_t = ResolutionMethod::Human)]
    method: ResolutionMethod,
}

#[derive(Args, Debug)]
struct TrackArgs {
    id: String,
    #[arg(long)]
    job: String,
    #[arg(long)]
    kind: String,
    #[arg(long, value_enum)]
    status: WorkStatus,
    #[arg(long)]
    artifact: Option<String>,
}

#[derive(Args, Debug)]
struct DispatchArgs {
    job: String,
    #[arg(long = "ref", default_value = "main")]
    git_ref: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    hyphae::logging::init(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            if let Some(StoreError::RunLockHeld { pid, since }) = err.downcast_ref::<StoreError>() {
                eprintln!("Another hyphae cycle is running (pid {}, since {})", pid, since);
                return ExitCode::from(EXIT_LOCKED);
            }
            eprintln!("Error: {:#}", err);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let repo_root = cli
        .repo
        .canonicalize()
        .with_context(|| format!("Repository not found: {}", cli.repo.display()))?;
    let config = Config::load(cli.config.as_deref(), &repo_root)?;
    let store = StateStore::open(config.state_dir(&repo_root))?;
    let inbox = DiagnosticInbox::new(store.clone(), config.patch.max_patch_attempts);
    let now = Utc::now();

    match cli.command {
        Commands::Collect => {
            let cycle = connect(&repo_root, config, store)?;
            let _lock = cycle.lock()?;
            cycle.store().verify()?;
            let collected = cycle.collect(now).await?;
            emit(cli.json, &collected, || {
                let mut line = format!("{} runs recorded", collected.records.len());
                if !collected.reenabled.is_empty() {
                    line.push_str(&format!(", re-enabled {}", collected.reenabled.join(", ")));
                }
                if !collected.disabled.is_empty() {
                    let names: Vec<&str> = collected.disabled.iter().map(|j| j.name.as_str()).collect();
                    line.push_str(&format!(", disabled {}", names.join(", ")));
                }
                line
            })
        }
        Commands::Reconcile => {
            let _lock = lock(&store, &config)?;
            store.verify()?;
            let reconciler = LoopReconciler::new(
                store.clone(),
                inbox,
                config.reconcile.clone(),
                config.collect.window_hours,
            );
            let summary = reconciler.reconcile(now)?;
            emit(cli.json, &summary, || {
                format!(
                    "{} filed, {} expired, {} lost retries closed",
                    summary.enqueued.len(),
                    summary.expired.len(),
                    summary.retries_expired
                )
            })
        }
        Commands::Report => {
            store.verify()?;
            let window = chrono::Duration::hours(config.collect.window_hours);
            let reporter = HealthReporter::new(store, inbox, config.collect.window_hours);
            let snapshot = reporter.report(now, now - window)?;
            emit(cli.json, &snapshot, || health::render(&snapshot))
        }
        Commands::RunAll => {
            let cycle = connect(&repo_root, config, store)?;
            let report = cycle.run_all(now).await?;
            emit(cli.json, &report, || match &report.health {
                Some(snapshot) => health::render(snapshot),
                None => "cycle stopped at the deadline; no snapshot".to_string(),
            })
        }
        Commands::Heal => {
            let cycle = connect(&repo_root, config, store)?;
            let _lock = cycle.lock()?;
            cycle.store().verify()?;
            let summary = cycle.heal(now).await?;
            emit(cli.json, &summary, || match &summary {
                Some(s) => format!(
                    "{} considered, {} committed, {} failed, {} deferred, {} cooling down",
                    s.considered, s.committed, s.failed, s.deferred, s.cooling_down
                ),
                None => "healing is disabled".to_string(),
            })
        }
        Commands::Inbox => {
            let open = inbox.list_unresolved()?;
            emit(cli.json, &open, || {
                if open.is_empty() {
                    return "inbox is empty".to_string();
                }
                open.iter()
                    .map(|e| {
                        format!(
                            "{}  {:<24} x{:<3} {}{}",
                            e.id,
                            truncate(&e.job_name, 24),
                            e.occurrences,
                            truncate(&e.description, 80),
                            if e.escalated { "  [needs human]" } else { "" }
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })
        }
        Commands::Resolve(args) => {
            let resolved = inbox.resolve(&args.id, args.method, now)?;
            emit(cli.json, &resolved, || {
                if resolved {
                    format!("resolved {} ({})", args.id, args.method)
                } else {
                    format!("no open diagnostic {}", args.id)
                }
            })
        }
        Commands::Track(args) => {
            let item = WorkItem {
                id: args.id,
                job_name: args.job,
                kind: args.kind,
                status: args.status,
                artifact_path: args.artifact,
                updated_at: now,
            };
            let inserted = reconcile::track(&store, item.clone())?;
            emit(cli.json, &item, || {
                format!(
                    "{} {} {}",
                    if inserted { "tracking" } else { "updated" },
                    item.id,
                    item.status.as_str()
                )
            })
        }
        Commands::Dispatch(args) => {
            let cycle = connect(&repo_root, config, store)?;
            cycle.dispatch(&args.job, &args.git_ref).await?;
            emit(cli.json, &args.job, || format!("dispatched {} on {}", args.job, args.git_ref))
        }
    }
}

fn lock(store: &StateStore, config: &Config) -> Result<RunLock, StoreError> {
    RunLock::acquire(
        store.dir(),
        chrono::Duration::minutes(config.cycle.lock_stale_minutes),
    )
}

/// Build a cycle wired to GitHub, the configured code generator and git.
fn connect(repo_root: &Path, config: Config, store: StateStore) -> Result<Cycle> {
    let (owner, repo) = resolve_repository(&config.runner, repo_root)?;
    let runner = GitHubRunner::new(&config.runner, owner, repo)?;

    let generator: Option<Arc<dyn CodeGenerator>> = match ChatCompletionsGenerator::from_config(&config.patch)? {
        Some(backend) => Some(Arc::new(backend)),
        None => {
            tracing::info!(
                env = %config.patch.api_key_env,
                "no code generation key set; only rule fixes will be applied"
            );
            None
        }
    };
    let vcs = GitRepo::new(repo_root, Duration::from_secs(config.cycle.vcs_timeout_secs));

    let services = Services {
        runner: Arc::new(runner),
        generator,
        vcs: Arc::new(vcs),
    };
    Ok(Cycle::new(repo_root, config, store, services))
}

fn emit<T: Serialize>(json: bool, value: &T, human: impl FnOnce() -> String) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        println!("{}", human());
    }
    Ok(())
}
