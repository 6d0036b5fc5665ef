//! Mirrorsync CLI
//!
//! Inspection and one-shot administration of mirror sync state.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use mirrorsync::config::{ensure_config, MirrorConfig, DEFAULT_CONFIG_PATH, DEFAULT_DB_PATH};
use mirrorsync::error::Result;
use mirrorsync::storage::queries::count_by_status;
use mirrorsync::storage::StateStore;
use mirrorsync::sync::conflict::compute_file_digest;
use mirrorsync::sync::{
    shutdown_channel, ExecutorSettings, RepositorySource, Scheduler, SchedulerSettings,
    SyncExecutor,
};
use mirrorsync::transfer::{derive_command, local_content_source, ProcessRunner, ShapingPolicy};
use mirrorsync::types::{SyncOutcome, SyncStatus};

#[derive(Parser)]
#[command(name = "mirrorsync")]
#[command(about = "Repository mirror sync CLI")]
#[command(version)]
struct Cli {
    /// Configuration document
    #[arg(long, env = "MIRROR_SYNC_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Database path
    #[arg(long, env = "MIRROR_SYNC_DB", default_value = DEFAULT_DB_PATH)]
    db_path: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the last outcome per repository
    Status {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Run a single sync cycle and exit
    RunOnce {
        /// Print the cycle report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Write the default configuration if none exists
    InitConfig,
    /// Validate the configuration and show derived commands
    CheckConfig,
    /// Drop the recorded outcome of a repository
    Forget {
        /// Repository name
        repo: String,
    },
    /// Print SHA-256 digests of files
    Digest {
        /// Files to hash
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Expand ~ in paths
    let config_path = PathBuf::from(shellexpand::tilde(&cli.config).as_ref());
    let db_path = shellexpand::tilde(&cli.db_path).to_string();

    match cli.command {
        Commands::Status { json } => {
            let store = StateStore::open_read_only(db_path)?;
            let outcomes = store.get_all()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&outcomes)?);
            } else {
                print_table(&outcomes);
                let (ok, failed) = store.with_connection(|conn| {
                    Ok((
                        count_by_status(conn, SyncStatus::Success)?,
                        count_by_status(conn, SyncStatus::Failure)?,
                    ))
                })?;
                if ok + failed > 0 {
                    println!("\n{} succeeded, {} failed", ok, failed);
                }
            }
        }

        Commands::RunOnce { json } => {
            init_tracing();
            let config = MirrorConfig::load(&config_path)?;
            let store = StateStore::open(db_path)?;

            let executor = Arc::new(SyncExecutor::with_runner(
                store,
                Arc::new(ProcessRunner::new()),
                ShapingPolicy::detect(),
                ExecutorSettings::from(&config),
            ));
            let scheduler = Scheduler::new(
                executor,
                RepositorySource::Static(config.repos.clone()),
                SchedulerSettings::from(&config),
            );

            let runtime = tokio::runtime::Runtime::new()?;
            let (_handle, signal) = shutdown_channel();
            let report = runtime.block_on(scheduler.run_cycle(&signal));

            if let Some(report) = report {
                if json {
                    println!("{}", serde_json::to_string_pretty(&report)?);
                } else {
                    print_table(&report.outcomes);
                    println!(
                        "\n{} succeeded, {} failed",
                        report.succeeded(),
                        report.failed()
                    );
                }
                if report.failed() > 0 {
                    std::process::exit(1);
                }
            }
        }

        Commands::InitConfig => {
            let existed = config_path.exists();
            let config = ensure_config(&config_path)?;
            if existed {
                println!(
                    "{} already exists ({} repositories)",
                    config_path.display(),
                    config.repos.len()
                );
            } else {
                println!("Wrote default configuration to {}", config_path.display());
            }
        }

        Commands::CheckConfig => {
            let config = MirrorConfig::load(&config_path)?;
            println!(
                "interval {}s, timeout {}s, bandwidth {} kbps, max parallel {}, remediation {:?}",
                config.interval_seconds,
                config.timeout_seconds,
                config.bandwidth_limit_kbps,
                config.max_parallel,
                config.remediation
            );
            for repo in &config.repos {
                println!("{} ({:?})", repo.name, repo.kind);
                if let Some(source) = local_content_source(repo) {
                    println!("  Copy: {} -> {}", source.display(), repo.target_path.display());
                    continue;
                }
                match derive_command(repo) {
                    Ok(plan) => println!("  {:?}: {}", plan.mode, plan.command),
                    Err(e) => println!("  {}", e),
                }
            }
        }

        Commands::Forget { repo } => {
            let store = StateStore::open(db_path)?;
            if store.forget(&repo)? {
                println!("Forgot {}", repo);
            } else {
                println!("No record for {}", repo);
            }
        }

        Commands::Digest { files } => {
            for file in files {
                println!("{}  {}", compute_file_digest(&file)?, file.display());
            }
        }
    }

    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(false),
        )
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

fn print_table(outcomes: &[SyncOutcome]) {
    if outcomes.is_empty() {
        println!("No sync outcomes recorded");
        return;
    }

    let width = outcomes
        .iter()
        .map(|o| o.repo_name.len())
        .max()
        .unwrap_or(0)
        .max(4);

    println!(
        "{:<width$}  {:<7}  {:<20}  MESSAGE",
        "REPO",
        "STATUS",
        "LAST SYNC",
        width = width
    );
    for outcome in outcomes {
        println!(
            "{:<width$}  {:<7}  {:<20}  {}",
            outcome.repo_name,
            outcome.status.as_str(),
            outcome.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
            truncate(&outcome.message, 80),
            width = width
        );
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    let first_line = s.lines().next().unwrap_or("");
    if first_line.chars().count() <= max_len {
        first_line.to_string()
    } else {
        let cut: String = first_line.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}
