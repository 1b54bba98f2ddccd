//! `fairmeta` binary: run the lifecycle engine against a directory tree.

use std::path::PathBuf;
use std::process::ExitCode;
use std::thread;

use clap::{Parser, Subcommand};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::{error, info};

use fairmeta_core::{config as engine_config, EngineConfig, MetaResult};
use fairmeta_engine::engine::MetadataEngine;
use fairmeta_engine::tracing_setup::{init_subscriber, Verbosity};

#[derive(Debug, Parser)]
#[command(name = "fairmeta", version, about = "Filesystem-driven metadata lifecycle engine")]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory tree to monitor (overrides the config file).
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Packaged schema directory (overrides the config file).
    #[arg(long, global = true)]
    schemas: Option<PathBuf>,

    /// Debug-level output.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Errors only.
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Suppress ANSI colors.
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Watch the tree and maintain metadata sidecars until interrupted.
    Run,
    /// List every schema visible through the override and packaged stores.
    Schemas,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_subscriber(
        Verbosity::from_flags(cli.verbose, cli.quiet),
        cli.no_color,
    );

    match execute(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn execute(cli: Cli) -> MetaResult<()> {
    let config = load_config(&cli)?;

    match cli.command {
        Command::Run => run_engine(config),
        Command::Schemas => list_schemas(config),
    }
}

/// Precedence: CLI flags over config file over defaults.
fn load_config(cli: &Cli) -> MetaResult<EngineConfig> {
    let mut config = match &cli.config {
        Some(path) => engine_config::load_from_path(path)?,
        None => EngineConfig::default(),
    };
    if let Some(root) = &cli.root {
        config.monitored_root = root.clone();
    }
    if let Some(schemas) = &cli.schemas {
        config.packaged_schema_dir = schemas.clone();
    }
    config.validate()?;
    Ok(config)
}

fn run_engine(config: EngineConfig) -> MetaResult<()> {
    let engine = MetadataEngine::new(config)?;

    // Log every record write; this stream is also where a version-control
    // collaborator would hook in.
    if let Some(notifications) = engine.change_notifications() {
        thread::Builder::new()
            .name("fairmeta-notify-log".to_owned())
            .spawn(move || {
                for change in notifications {
                    info!(
                        entity_id = change.entity_id,
                        record_type = %change.record_type,
                        "{}",
                        change.summary
                    );
                }
            })
            .map_err(|error| fairmeta_core::MetaError::Watch {
                detail: format!("failed to spawn notification logger: {error}"),
            })?;
    }

    engine.start()?;

    let mut signals = Signals::new([SIGINT, SIGTERM]).map_err(fairmeta_core::MetaError::Io)?;
    if let Some(signal) = signals.forever().next() {
        info!(signal, "shutdown requested; draining in-flight work");
    }

    engine.shutdown();
    let stats = engine.stats();
    info!(
        events = stats.events_received,
        dispatched = stats.work_items_dispatched,
        written = stats.records_written,
        errors = stats.errors,
        "final statistics"
    );
    Ok(())
}

fn list_schemas(config: EngineConfig) -> MetaResult<()> {
    let engine = MetadataEngine::new(config)?;
    for info in engine.list_schemas() {
        println!("{}\t{}\t{}", info.schema_id, info.source, info.path.display());
    }
    Ok(())
}
