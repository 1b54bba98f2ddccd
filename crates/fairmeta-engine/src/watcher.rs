//! Filesystem event plumbing: normalization, per-directory debounce, and
//! the startup catch-up scan.
//!
//! Raw backend events are noisy (editors write temp files, copies emit a
//! create+modify burst per file). The engine coalesces them per owning
//! directory inside a debounce window, so one `cp -r` of a thousand files
//! becomes one work item, not a thousand.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, TrySendError};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fairmeta_core::{MetaError, MetaResult};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::warn;

use crate::classify::{Classification, Classifier};

/// One normalized filesystem change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
    pub is_dir: bool,
    pub observed_at_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
}

impl ChangeEvent {
    #[must_use]
    pub fn created(path: impl Into<PathBuf>, is_dir: bool, observed_at_ms: u64) -> Self {
        Self {
            path: path.into(),
            kind: ChangeKind::Created,
            is_dir,
            observed_at_ms,
        }
    }

    #[must_use]
    pub fn modified(path: impl Into<PathBuf>, is_dir: bool, observed_at_ms: u64) -> Self {
        Self {
            path: path.into(),
            kind: ChangeKind::Modified,
            is_dir,
            observed_at_ms,
        }
    }

    #[must_use]
    pub fn deleted(path: impl Into<PathBuf>, observed_at_ms: u64) -> Self {
        Self {
            path: path.into(),
            kind: ChangeKind::Deleted,
            // Deleted paths can no longer be stat-ed; the consumer decides
            // from its registry whether this was an entity directory.
            is_dir: false,
            observed_at_ms,
        }
    }
}

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// All coalesced activity for one entity directory within a window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirChanges {
    /// The project or dataset directory the activity belongs to.
    pub directory: PathBuf,
    /// Whether the directory itself appeared during the window.
    pub dir_created: bool,
    /// Data files created or modified, deduplicated.
    pub changed_paths: BTreeSet<PathBuf>,
    /// Data files deleted, deduplicated.
    pub deleted_paths: BTreeSet<PathBuf>,
    /// When the most recent contributing event arrived; the window is
    /// measured from here so a steady stream keeps extending it.
    pub last_observed_at_ms: u64,
}

impl DirChanges {
    fn new(directory: PathBuf, observed_at_ms: u64) -> Self {
        Self {
            directory,
            dir_created: false,
            changed_paths: BTreeSet::new(),
            deleted_paths: BTreeSet::new(),
            last_observed_at_ms: observed_at_ms,
        }
    }
}

/// Debounce queue keyed by owning entity directory.
#[derive(Debug, Default)]
pub struct DebounceQueue {
    by_dir: HashMap<PathBuf, DirChanges>,
}

impl DebounceQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_dir.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_dir.is_empty()
    }

    fn entry(&mut self, directory: &Path, observed_at_ms: u64) -> &mut DirChanges {
        let changes = self
            .by_dir
            .entry(directory.to_path_buf())
            .or_insert_with(|| DirChanges::new(directory.to_path_buf(), observed_at_ms));
        changes.last_observed_at_ms = changes.last_observed_at_ms.max(observed_at_ms);
        changes
    }

    /// Record that the entity directory itself appeared.
    pub fn push_dir_created(&mut self, directory: &Path, observed_at_ms: u64) {
        self.entry(directory, observed_at_ms).dir_created = true;
    }

    /// Record a created/modified data file under its entity directory.
    ///
    /// Returns `true` when the path was already pending (coalesced).
    pub fn push_changed(&mut self, directory: &Path, path: PathBuf, observed_at_ms: u64) -> bool {
        let changes = self.entry(directory, observed_at_ms);
        changes.deleted_paths.remove(&path);
        !changes.changed_paths.insert(path)
    }

    /// Record a deleted data file under its entity directory.
    pub fn push_deleted(&mut self, directory: &Path, path: PathBuf, observed_at_ms: u64) -> bool {
        let changes = self.entry(directory, observed_at_ms);
        changes.changed_paths.remove(&path);
        !changes.deleted_paths.insert(path)
    }

    /// Remove and return every group whose window has elapsed.
    ///
    /// A group is ready when no contributing event arrived within
    /// `window_ms` of `now_ms`. Output is ordered by directory path so
    /// parent directories (projects) precede their datasets.
    pub fn drain_ready(&mut self, now_ms: u64, window_ms: u64) -> Vec<DirChanges> {
        let ready_dirs: Vec<PathBuf> = self
            .by_dir
            .iter()
            .filter(|(_, c)| now_ms.saturating_sub(c.last_observed_at_ms) >= window_ms)
            .map(|(dir, _)| dir.clone())
            .collect();

        let mut ready: Vec<DirChanges> = ready_dirs
            .into_iter()
            .filter_map(|dir| self.by_dir.remove(&dir))
            .collect();
        ready.sort_by(|a, b| a.directory.cmp(&b.directory));
        ready
    }

    /// Earliest moment any pending group becomes ready, if one is pending.
    #[must_use]
    pub fn earliest_deadline(&self, window_ms: u64) -> Option<u64> {
        self.by_dir
            .values()
            .map(|c| c.last_observed_at_ms.saturating_add(window_ms))
            .min()
    }

    pub fn clear(&mut self) -> usize {
        let dropped = self.by_dir.len();
        self.by_dir.clear();
        dropped
    }
}

/// Public engine statistics snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStats {
    pub events_received: u64,
    pub events_dropped: u64,
    pub events_coalesced: u64,
    pub work_items_dispatched: u64,
    pub work_items_retried: u64,
    pub work_items_dropped: u64,
    pub records_written: u64,
    pub errors: u64,
    pub entities_tracked: usize,
    pub last_event_at: Option<SystemTime>,
}

#[derive(Debug, Default)]
pub(crate) struct EngineStatsInner {
    events_received: AtomicU64,
    events_dropped: AtomicU64,
    events_coalesced: AtomicU64,
    work_items_dispatched: AtomicU64,
    work_items_retried: AtomicU64,
    work_items_dropped: AtomicU64,
    records_written: AtomicU64,
    errors: AtomicU64,
    entities_tracked: AtomicUsize,
    last_event_at_ms: AtomicU64,
}

impl EngineStatsInner {
    pub(crate) fn mark_event(&self, observed_at_ms: u64) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
        self.last_event_at_ms
            .store(observed_at_ms, Ordering::Relaxed);
    }

    pub(crate) fn add_events_dropped(&self, count: u64) {
        self.events_dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn add_coalesced(&self) {
        self.events_coalesced.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_dispatched(&self) {
        self.work_items_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_retried(&self) {
        self.work_items_retried.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_dropped(&self) {
        self.work_items_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_records_written(&self, count: usize) {
        self.records_written
            .fetch_add(u64::try_from(count).unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    pub(crate) fn add_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn set_entities_tracked(&self, count: usize) {
        self.entities_tracked.store(count, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> EngineStats {
        let raw_last = self.last_event_at_ms.load(Ordering::Relaxed);
        let last_event_at = if raw_last == 0 {
            None
        } else {
            UNIX_EPOCH.checked_add(Duration::from_millis(raw_last))
        };
        EngineStats {
            events_received: self.events_received.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            events_coalesced: self.events_coalesced.load(Ordering::Relaxed),
            work_items_dispatched: self.work_items_dispatched.load(Ordering::Relaxed),
            work_items_retried: self.work_items_retried.load(Ordering::Relaxed),
            work_items_dropped: self.work_items_dropped.load(Ordering::Relaxed),
            records_written: self.records_written.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            entities_tracked: self.entities_tracked.load(Ordering::Relaxed),
            last_event_at,
        }
    }
}

/// Backend-to-dispatcher channel bound. The backend callback never
/// blocks; events beyond this backlog are dropped and counted, and the
/// catch-up scan on the next start reconciles anything missed.
pub const EVENT_CHANNEL_CAPACITY: usize = 4096;

/// Live filesystem event source backed by the platform notify backend.
///
/// Owns the backend watcher; dropping the source stops the stream.
pub struct FsEventSource {
    _watcher: RecommendedWatcher,
    events: Receiver<notify::Result<Event>>,
    dropped: Arc<AtomicU64>,
}

impl FsEventSource {
    /// Start watching `root` recursively.
    ///
    /// # Errors
    ///
    /// Returns `MetaError::Watch` when the backend cannot be created or
    /// the root cannot be watched.
    pub fn start(root: &Path) -> MetaResult<Self> {
        let (tx, rx) = sync_channel::<notify::Result<Event>>(EVENT_CHANNEL_CAPACITY);
        let dropped = Arc::new(AtomicU64::new(0));
        let dropped_in_callback = Arc::clone(&dropped);
        let mut watcher = notify::recommended_watcher(move |event| {
            match tx.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    dropped_in_callback.fetch_add(1, Ordering::Relaxed);
                }
                // Receiver gone means the engine is shutting down.
                Err(TrySendError::Disconnected(_)) => {}
            }
        })
        .map_err(|error| MetaError::Watch {
            detail: error.to_string(),
        })?;
        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(|error| MetaError::Watch {
                detail: format!("cannot watch {}: {error}", root.display()),
            })?;
        Ok(Self {
            _watcher: watcher,
            events: rx,
            dropped,
        })
    }

    /// Events discarded because the channel was full since the last call.
    pub fn take_dropped(&self) -> u64 {
        self.dropped.swap(0, Ordering::Relaxed)
    }

    /// Blocking receive with timeout; `None` on timeout, error when the
    /// backend disconnected.
    ///
    /// # Errors
    ///
    /// Returns `MetaError::Watch` when the backend channel is gone.
    pub fn recv_timeout(&self, timeout: Duration) -> MetaResult<Option<notify::Result<Event>>> {
        match self.events.recv_timeout(timeout) {
            Ok(event) => Ok(Some(event)),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => Ok(None),
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => Err(MetaError::Watch {
                detail: "event channel disconnected".into(),
            }),
        }
    }

    /// Drain any immediately available events without blocking.
    pub fn drain_pending(&self) -> Vec<notify::Result<Event>> {
        let mut drained = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            drained.push(event);
        }
        drained
    }
}

/// Flatten one backend event into normalized change events.
#[must_use]
pub fn map_notify_event(event: Event) -> Vec<ChangeEvent> {
    let Event { kind, paths, .. } = event;
    let observed_at_ms = now_millis();
    match kind {
        EventKind::Create(_) => paths
            .into_iter()
            .map(|p| {
                let is_dir = p.is_dir();
                ChangeEvent::created(p, is_dir, observed_at_ms)
            })
            .collect(),
        EventKind::Modify(_) => paths
            .into_iter()
            .map(|p| {
                // Rename events arrive as Modify with both halves; a half
                // that no longer exists is a deletion, one that does is a
                // creation/modification of the new name.
                if p.exists() {
                    let is_dir = p.is_dir();
                    ChangeEvent::modified(p, is_dir, observed_at_ms)
                } else {
                    ChangeEvent::deleted(p, observed_at_ms)
                }
            })
            .collect(),
        EventKind::Remove(_) => paths
            .into_iter()
            .map(|p| ChangeEvent::deleted(p, observed_at_ms))
            .collect(),
        _ => Vec::new(),
    }
}

/// Walk the monitored root and synthesize creation events for everything
/// already on disk, parents before children.
///
/// Used at startup so entities created while the engine was down are
/// still picked up. Sidecar contents and ignored paths are skipped.
///
/// # Errors
///
/// Returns I/O errors from the traversal; unreadable subtrees are logged
/// and skipped rather than aborting the scan.
pub fn scan_existing(root: &Path, classifier: &Classifier) -> MetaResult<Vec<ChangeEvent>> {
    let mut events = Vec::new();
    let observed_at_ms = now_millis();
    walk(root, classifier, observed_at_ms, &mut events)?;
    Ok(events)
}

fn walk(
    dir: &Path,
    classifier: &Classifier,
    observed_at_ms: u64,
    out: &mut Vec<ChangeEvent>,
) -> MetaResult<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(error) => {
            warn!(path = %dir.display(), %error, "skipping unreadable directory during catch-up scan");
            return Ok(());
        }
    };

    let mut children: Vec<(PathBuf, bool)> = Vec::new();
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        children.push((path, is_dir));
    }
    // Deterministic order keeps catch-up reproducible across runs.
    children.sort();

    for (path, is_dir) in children {
        if classifier.is_ignored(&path) {
            continue;
        }
        match classifier.classify(&path, is_dir) {
            Ok(Classification::Irrelevant) => {
                if is_dir {
                    walk(&path, classifier, observed_at_ms, out)?;
                }
            }
            Ok(_) => {
                out.push(ChangeEvent::created(path.clone(), is_dir, observed_at_ms));
                if is_dir {
                    walk(&path, classifier, observed_at_ms, out)?;
                }
            }
            Err(error) => {
                // Orphan datasets and friends: record and keep scanning.
                warn!(%error, "catch-up scan skipped entity");
            }
        }
    }
    Ok(())
}
