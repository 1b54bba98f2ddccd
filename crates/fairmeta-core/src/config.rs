//! Engine configuration.
//!
//! Serde-derived structs with sensible defaults; a TOML file is applied as
//! a patch over defaults, then validated. Precedence (CLI flags over file
//! over defaults) is the binary's concern.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MetaError, MetaResult};

/// Default debounce window in milliseconds.
pub const DEFAULT_DEBOUNCE_MS: u64 = 500;
/// Default per-work-item processing budget.
pub const DEFAULT_WORK_ITEM_TIMEOUT_MS: u64 = 30_000;
/// Default linear backoff step between retries of a failed work item.
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 1_000;
/// Default cap on delivery attempts before a work item is dropped.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Path fragments that never denote entities or data files.
///
/// Matches the noise set the monitor has always ignored: VCS internals,
/// tool caches, and editor temp files.
pub const DEFAULT_IGNORE_PATTERNS: [&str; 12] = [
    ".git",
    ".dvc",
    "__pycache__",
    ".DS_Store",
    "node_modules",
    ".venv",
    ".tmp",
    ".swp",
    ".swo",
    ".bak",
    "~",
    ".next",
];

/// Everything the engine consumes from the outside world, minus the event
/// stream itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Root directory the engine watches for projects.
    pub monitored_root: PathBuf,
    /// Directory holding the packaged default schemas.
    pub packaged_schema_dir: PathBuf,
    /// Local override schema directory; defaults to
    /// `<monitored_root>/.template_schemas` when unset.
    pub override_schema_dir: Option<PathBuf>,
    /// Debounce window for coalescing filesystem events, in milliseconds.
    pub debounce_window_ms: u64,
    /// Substring patterns for paths the engine ignores entirely.
    pub ignore_patterns: Vec<String>,
    /// Worker pool size; 0 means "derive from available parallelism".
    pub worker_threads: usize,
    /// Per-work-item processing budget in milliseconds.
    pub work_item_timeout_ms: u64,
    /// Linear backoff step for requeued work items, in milliseconds.
    pub retry_backoff_ms: u64,
    /// Maximum delivery attempts per work item.
    pub max_attempts: u32,
    /// Actor name stamped into audit fields for engine-initiated writes.
    pub actor: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            monitored_root: PathBuf::from("."),
            packaged_schema_dir: PathBuf::from("packaged_schemas"),
            override_schema_dir: None,
            debounce_window_ms: DEFAULT_DEBOUNCE_MS,
            ignore_patterns: DEFAULT_IGNORE_PATTERNS
                .iter()
                .map(|s| (*s).to_owned())
                .collect(),
            worker_threads: 0,
            work_item_timeout_ms: DEFAULT_WORK_ITEM_TIMEOUT_MS,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            actor: crate::types::SYSTEM_ACTOR.to_owned(),
        }
    }
}

impl EngineConfig {
    /// Effective override schema directory.
    #[must_use]
    pub fn override_dir(&self) -> PathBuf {
        self.override_schema_dir
            .clone()
            .unwrap_or_else(|| self.monitored_root.join(".template_schemas"))
    }

    /// Debounce window as a `Duration`.
    #[must_use]
    pub const fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_window_ms)
    }

    /// Per-item budget as a `Duration`.
    #[must_use]
    pub const fn work_item_timeout(&self) -> Duration {
        Duration::from_millis(self.work_item_timeout_ms)
    }

    /// Effective worker pool size.
    #[must_use]
    pub fn effective_workers(&self) -> usize {
        if self.worker_threads > 0 {
            return self.worker_threads;
        }
        std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(2)
            .max(2)
    }

    /// Reject configurations the engine cannot run with.
    ///
    /// # Errors
    ///
    /// Returns `MetaError::InvalidConfig` naming the offending field.
    pub fn validate(&self) -> MetaResult<()> {
        if self.monitored_root.as_os_str().is_empty() {
            return Err(MetaError::InvalidConfig {
                field: "monitored_root".into(),
                value: String::new(),
                reason: "must name a directory".into(),
            });
        }
        if self.packaged_schema_dir.as_os_str().is_empty() {
            return Err(MetaError::InvalidConfig {
                field: "packaged_schema_dir".into(),
                value: String::new(),
                reason: "must name a directory".into(),
            });
        }
        if !(1..=60_000).contains(&self.debounce_window_ms) {
            return Err(MetaError::InvalidConfig {
                field: "debounce_window_ms".into(),
                value: self.debounce_window_ms.to_string(),
                reason: "must be between 1 and 60000".into(),
            });
        }
        if self.work_item_timeout_ms == 0 {
            return Err(MetaError::InvalidConfig {
                field: "work_item_timeout_ms".into(),
                value: "0".into(),
                reason: "must be positive".into(),
            });
        }
        if self.max_attempts == 0 {
            return Err(MetaError::InvalidConfig {
                field: "max_attempts".into(),
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }
        if self.actor.trim().is_empty() {
            return Err(MetaError::InvalidConfig {
                field: "actor".into(),
                value: self.actor.clone(),
                reason: "must be non-empty".into(),
            });
        }
        Ok(())
    }
}

/// Optional-field mirror of `EngineConfig`, applied as a patch over
/// defaults when loading from TOML.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct EngineConfigPatch {
    monitored_root: Option<PathBuf>,
    packaged_schema_dir: Option<PathBuf>,
    override_schema_dir: Option<PathBuf>,
    debounce_window_ms: Option<u64>,
    ignore_patterns: Option<Vec<String>>,
    worker_threads: Option<usize>,
    work_item_timeout_ms: Option<u64>,
    retry_backoff_ms: Option<u64>,
    max_attempts: Option<u32>,
    actor: Option<String>,
}

fn apply_patch(config: &mut EngineConfig, patch: EngineConfigPatch) {
    if let Some(v) = patch.monitored_root {
        config.monitored_root = v;
    }
    if let Some(v) = patch.packaged_schema_dir {
        config.packaged_schema_dir = v;
    }
    if let Some(v) = patch.override_schema_dir {
        config.override_schema_dir = Some(v);
    }
    if let Some(v) = patch.debounce_window_ms {
        config.debounce_window_ms = v;
    }
    if let Some(v) = patch.ignore_patterns {
        config.ignore_patterns = v;
    }
    if let Some(v) = patch.worker_threads {
        config.worker_threads = v;
    }
    if let Some(v) = patch.work_item_timeout_ms {
        config.work_item_timeout_ms = v;
    }
    if let Some(v) = patch.retry_backoff_ms {
        config.retry_backoff_ms = v;
    }
    if let Some(v) = patch.max_attempts {
        config.max_attempts = v;
    }
    if let Some(v) = patch.actor {
        config.actor = v;
    }
}

/// Load configuration from a TOML string applied over defaults.
///
/// # Errors
///
/// Returns `MetaError::InvalidConfig` on parse or validation failure.
pub fn load_from_str(config_toml: &str) -> MetaResult<EngineConfig> {
    let patch: EngineConfigPatch =
        toml::from_str(config_toml).map_err(|error| MetaError::InvalidConfig {
            field: "config_file".into(),
            value: "<toml>".into(),
            reason: error.to_string(),
        })?;
    let mut config = EngineConfig::default();
    apply_patch(&mut config, patch);
    config.validate()?;
    Ok(config)
}

/// Load configuration from a TOML file applied over defaults.
///
/// # Errors
///
/// Returns `MetaError::Io` if the file cannot be read and
/// `MetaError::InvalidConfig` on parse or validation failure.
pub fn load_from_path(path: &Path) -> MetaResult<EngineConfig> {
    let contents = std::fs::read_to_string(path)?;
    load_from_str(&contents)
}
