//! Tracing subscriber initialization for the fairmeta binary.
//!
//! Wires CLI flags (`--verbose`, `--quiet`, `--no-color`) and environment
//! variables (`FAIRMETA_LOG`, `RUST_LOG`) into a single
//! `tracing-subscriber` stack that writes structured logs to stderr.
//!
//! # Priority (highest to lowest)
//!
//! 1. `FAIRMETA_LOG` env var (per-target directives, e.g. `fairmeta=debug,warn`)
//! 2. `RUST_LOG` env var (standard fallback)
//! 3. CLI flags (`-v` → debug, `-q` → error)
//! 4. Default level: `info`

use tracing::Level;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Target prefix shared by both fairmeta crates.
const TARGET_PREFIX: &str = "fairmeta";

/// Verbosity level derived from CLI flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    /// `--quiet` / `-q`: only errors.
    Quiet,
    /// Default: informational output.
    Normal,
    /// `--verbose` / `-v`: debug-level output.
    Verbose,
}

impl Verbosity {
    /// Determine verbosity from the parsed CLI flags.
    #[must_use]
    pub const fn from_flags(verbose: bool, quiet: bool) -> Self {
        // If both are set, verbose wins (more information is safer for debugging).
        if verbose {
            Self::Verbose
        } else if quiet {
            Self::Quiet
        } else {
            Self::Normal
        }
    }

    /// Map to a default `tracing::Level`.
    #[must_use]
    pub const fn default_level(self) -> Level {
        match self {
            Self::Quiet => Level::ERROR,
            Self::Normal => Level::INFO,
            Self::Verbose => Level::DEBUG,
        }
    }
}

/// Initialize the global tracing subscriber.
///
/// Must be called exactly once, as early as possible in `main()` — before
/// config loading so that config-parsing traces are captured.
///
/// # Panics
///
/// Panics if a global subscriber has already been set (double-init).
pub fn init_subscriber(verbosity: Verbosity, no_color: bool) {
    let filter = build_env_filter(verbosity);

    let stderr_is_tty = std::io::IsTerminal::is_terminal(&std::io::stderr());
    let use_ansi = !no_color && stderr_is_tty;

    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(use_ansi)
        .with_target(true)
        .with_thread_ids(false)
        .with_level(true);

    // Verbose mode: full timestamps for diagnostics. Normal/quiet:
    // compact output without timestamps.
    if verbosity == Verbosity::Verbose {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer.with_timer(fmt::time::uptime()))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer.without_time().compact())
            .init();
    }
}

/// Build an `EnvFilter` respecting the priority chain:
/// `FAIRMETA_LOG` > `RUST_LOG` > CLI verbosity default.
fn build_env_filter(verbosity: Verbosity) -> EnvFilter {
    // FAIRMETA_LOG first (project-specific). An unparseable value falls
    // through to RUST_LOG / default rather than failing hard.
    if let Ok(directives) = std::env::var("FAIRMETA_LOG") {
        if let Ok(filter) = EnvFilter::try_new(&directives) {
            return filter;
        }
    }

    // RUST_LOG (standard ecosystem convention).
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }

    // Fall back to CLI-derived level. Verbose elevates fairmeta internals
    // to debug so the event pipeline becomes visible.
    let level = verbosity.default_level();
    let directive = if verbosity == Verbosity::Verbose {
        format!("{level},{TARGET_PREFIX}=debug")
    } else {
        level.to_string()
    };

    EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new(level.as_str()))
}
