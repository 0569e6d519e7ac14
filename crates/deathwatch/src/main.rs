//! # dw
//!
//! Command-line front end for deathwatch.
//!
//! ## Usage
//! ```bash
//! # Run the guardian in the foreground until SIGTERM / SIGINT / SIGABRT
//! dw run
//!
//! # Report (and archive) a death note left by a previous run
//! dw check --json
//!
//! # List archived death notes, newest first
//! dw history --limit 5
//! ```
//!
//! `dw run` drives a single-threaded runtime so the lag probe sees any task
//! that blocks it.
//!
//! Paths default to `logs/` under the working directory; `deathwatch.toml`
//! in the working directory (or `--config`) overrides them.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use deathwatch_core::death_note::list_history;
use deathwatch_core::logging::{LogError, init_logging};
use deathwatch_core::{DeathNote, Guardian, GuardianConfig, NoWork, PostMortem};

#[derive(Parser)]
#[command(
    name = "dw",
    about = "In-process crash guardian: watchdog, death notes and post-mortem checks",
    version
)]
struct Cli {
    /// Path to a TOML configuration file (default: ./deathwatch.toml if present).
    #[arg(short, long, global = true, env = "DEATHWATCH_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the guardian in the foreground and wait for a trapped signal.
    Run {
        /// Exit normally after this many milliseconds.
        #[arg(long, hide = true)]
        exit_after_ms: Option<u64>,

        /// Panic inside a task after this many milliseconds.
        #[arg(long, hide = true)]
        crash_after_ms: Option<u64>,
    },

    /// Run the post-mortem check once and print the outcome.
    Check {
        /// Print the outcome as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List archived death notes, newest first.
    History {
        /// Maximum number of entries.
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,

        /// Print entries as a JSON array.
        #[arg(long)]
        json: bool,
    },
}

/// Exit status when a marker is present but could not be processed.
const EXIT_UNPROCESSED_MARKER: u8 = 2;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = GuardianConfig::load(cli.config.as_deref()).context("failed to load config")?;

    match init_logging(&config.logging) {
        Ok(()) | Err(LogError::AlreadyInitialized) => {}
        Err(e) => return Err(e).context("failed to initialize logging"),
    }

    match cli.command {
        Commands::Run {
            exit_after_ms,
            crash_after_ms,
        } => run(config, exit_after_ms, crash_after_ms).await,
        Commands::Check { json } => check(config, json),
        Commands::History { limit, json } => history(&config, limit, json),
    }
}

async fn run(
    config: GuardianConfig,
    exit_after_ms: Option<u64>,
    crash_after_ms: Option<u64>,
) -> Result<ExitCode> {
    let guardian = Guardian::new(config, Arc::new(NoWork));
    let post_mortem = guardian.start().context("failed to start guardian")?;
    if let Some(note) = post_mortem.note() {
        eprintln!("dw: previous run ended with {}", describe(note));
    }
    println!("dw: guardian running (pid {})", std::process::id());

    if let Some(ms) = crash_after_ms {
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            panic!("boom");
        });
    }

    match exit_after_ms {
        Some(ms) => tokio::time::sleep(Duration::from_millis(ms)).await,
        None => std::future::pending::<()>().await,
    }

    guardian.stop().await;
    let code = guardian.exit(0);
    tracing::info!(code, "Guardian exiting");
    Ok(ExitCode::from(u8::try_from(code).unwrap_or(1)))
}

fn check(config: GuardianConfig, json: bool) -> Result<ExitCode> {
    let guardian = Guardian::new(config, Arc::new(NoWork));
    let outcome = guardian.death_notes().check_post_mortem();

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        match &outcome {
            PostMortem::Clean => println!("clean: no death note from a previous run"),
            PostMortem::Recovered { note, archived_to } => {
                println!("recovered: {}", describe(note));
                println!("archived to {}", archived_to.display());
            }
            PostMortem::Corrupt { path, error } => {
                println!("corrupt: {} left in place ({error})", path.display());
            }
            PostMortem::ArchiveFailed { note, error } => {
                println!("recovered: {}", describe(note));
                println!("archive failed: {error}");
            }
        }
    }

    Ok(match outcome {
        PostMortem::Clean | PostMortem::Recovered { .. } => ExitCode::SUCCESS,
        PostMortem::Corrupt { .. } | PostMortem::ArchiveFailed { .. } => {
            ExitCode::from(EXIT_UNPROCESSED_MARKER)
        }
    })
}

fn history(config: &GuardianConfig, limit: usize, json: bool) -> Result<ExitCode> {
    let entries = list_history(&config.paths.history_dir, limit);

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else if entries.is_empty() {
        println!("no archived death notes in {}", config.paths.history_dir.display());
    } else {
        for entry in &entries {
            println!("{}  {}", describe(&entry.note), entry.path.display());
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn describe(note: &DeathNote) -> String {
    let kind = if note.graceful { "signal" } else { "fault" };
    let mut line = format!(
        "{} {} (pid {}, {kind})",
        note.timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
        note.reason,
        note.pid
    );
    if let Some(error) = &note.error {
        line.push_str(": ");
        line.push_str(&error.message);
    }
    line
}
