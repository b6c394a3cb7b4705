//! Netsieve - command-line front end for the interception engine.
//!
//! - Manage block rules in the local database
//! - Replay captured traffic through the engine and print its verdicts
//! - Inspect and prune the verdict log

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use directories::ProjectDirs;
use netsieve_app::{capture, channel_sink, replay, write_verdicts};
use netsieve_core::{EngineConfig, InterceptEngine, RuleType};
use netsieve_storage::{Database, NewRule};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Netsieve - reconstruct HTTP traffic and decide what to block
#[derive(Parser, Debug)]
#[command(name = "netsieve", version, about)]
struct Args {
    /// Engine configuration file (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Database file (defaults to the platform data directory)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Manage block rules
    Rules {
        #[command(subcommand)]
        action: RulesCommand,
    },
    /// Replay a JSON-lines capture through the engine
    Replay {
        /// Capture file
        capture: PathBuf,

        /// Print verdicts without storing them in the verdict log
        #[arg(long)]
        no_log: bool,
    },
    /// Show the most recent verdicts
    Verdicts {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Delete verdicts older than the given number of days
    Prune { days: i64 },
}

#[derive(Subcommand, Debug)]
enum RulesCommand {
    /// Add a rule (type: url, domain or keyword)
    Add {
        #[arg(value_parser = parse_rule_type)]
        rule_type: RuleType,
        value: String,
        #[arg(long)]
        note: Option<String>,
    },
    /// List rules
    List {
        #[arg(long = "type", value_parser = parse_rule_type)]
        rule_type: Option<RuleType>,
    },
    /// Remove a rule by id
    Remove { id: i64 },
    /// Enable a rule by id
    Enable { id: i64 },
    /// Disable a rule by id
    Disable { id: i64 },
}

fn parse_rule_type(s: &str) -> Result<RuleType, String> {
    RuleType::parse(s).ok_or_else(|| format!("unknown rule type '{s}' (expected url, domain or keyword)"))
}

/// Get the logs directory path.
fn logs_dir() -> Option<PathBuf> {
    ProjectDirs::from("com", "netsieve", "netsieve").map(|dirs| dirs.data_dir().join("logs"))
}

/// Initialize logging with file rotation.
///
/// Console output goes to stderr; stdout carries verdict JSON lines.
fn init_logging(args: &Args) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_level = if args.debug { "debug" } else { &args.log_level };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "netsieve={level},netsieve_core={level},netsieve_storage={level},netsieve_app={level},warn",
            level = log_level
        ))
    });

    if let Some(log_dir) = logs_dir() {
        if std::fs::create_dir_all(&log_dir).is_ok() {
            let file_appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .max_log_files(5)
                .filename_prefix("netsieve")
                .filename_suffix("log")
                .build(&log_dir)
                .ok();

            if let Some(appender) = file_appender {
                let (non_blocking, guard) = tracing_appender::non_blocking(appender);

                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().with_writer(std::io::stderr))
                    .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                    .init();

                tracing::debug!("Logging to {:?}", log_dir);
                return Some(guard);
            }
        }
    }

    // Fallback: console logging only
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    tracing::warn!("File logging unavailable, using console only");
    None
}

fn open_database(args: &Args) -> anyhow::Result<Database> {
    let db = match &args.db {
        Some(path) => Database::with_path(path),
        None => Database::new(),
    };
    db.context("Failed to open database")
}

fn load_config(args: &Args) -> anyhow::Result<EngineConfig> {
    match &args.config {
        Some(path) => EngineConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Ok(EngineConfig::default()),
    }
}

fn run_rules(db: &Database, action: RulesCommand) -> anyhow::Result<()> {
    match action {
        RulesCommand::Add {
            rule_type,
            value,
            note,
        } => {
            let mut rule = NewRule::new(rule_type, value);
            if let Some(note) = note {
                rule = rule.with_note(note);
            }
            let id = db.add_rule(rule)?;
            println!("Added rule {id}");
        }
        RulesCommand::List { rule_type } => {
            for rule in db.list_rules(rule_type)? {
                println!(
                    "{:>5}  {:<8} {:<8} {}{}",
                    rule.id,
                    rule.rule_type.as_str(),
                    if rule.enabled { "enabled" } else { "disabled" },
                    rule.value,
                    rule.note.map(|n| format!("  # {n}")).unwrap_or_default()
                );
            }
        }
        RulesCommand::Remove { id } => {
            db.remove_rule(id)?;
            println!("Removed rule {id}");
        }
        RulesCommand::Enable { id } => db.set_rule_enabled(id, true)?,
        RulesCommand::Disable { id } => db.set_rule_enabled(id, false)?,
    }
    Ok(())
}

async fn run_replay(
    db: Database,
    config: EngineConfig,
    capture_path: PathBuf,
    no_log: bool,
) -> anyhow::Result<()> {
    let events = capture::read_capture_file(&capture_path)
        .with_context(|| format!("Failed to read capture {}", capture_path.display()))?;

    let (sink, rx) = channel_sink();
    let engine = InterceptEngine::new(
        config,
        Arc::new(db.clone()),
        Arc::new(db.clone()),
        Arc::new(sink),
    )?;

    // The engine owns the only sink; dropping it at the end of the replay
    // closes the channel and lets the writer finish.
    let replay_task = tokio::task::spawn_blocking(move || replay(&engine, events));

    // Printing and logging block, so the writer gets its own thread too.
    let writer_task = tokio::task::spawn_blocking(move || {
        write_verdicts(rx, (!no_log).then_some(db), &mut std::io::stdout().lock())
    });
    let stats = writer_task.await??;
    let summary = replay_task.await?;

    tracing::info!(
        frames = summary.frames,
        resolutions = summary.resolutions,
        aborted = summary.aborted,
        closed = summary.closed,
        unanswered = summary.unanswered,
        verdicts = stats.written,
        logged = stats.logged,
        "Replay complete"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _log_guard = init_logging(&args);

    let db = open_database(&args)?;
    let config = load_config(&args)?;

    match args.command {
        Command::Rules { action } => run_rules(&db, action)?,
        Command::Replay { capture, no_log } => run_replay(db, config, capture, no_log).await?,
        Command::Verdicts { limit } => {
            for verdict in db.recent_verdicts(limit, 0)? {
                println!("{}", serde_json::to_string(&verdict)?);
            }
            let counts = db.verdict_counts()?;
            eprintln!("blocked: {}, passed: {}", counts.blocked, counts.passed);
        }
        Command::Prune { days } => {
            let deleted = db.prune_verdicts(days)?;
            println!("Deleted {deleted} verdicts");
        }
    }

    Ok(())
}
