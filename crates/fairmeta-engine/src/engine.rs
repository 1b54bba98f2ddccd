//! The metadata engine: event dispatch, per-entity scheduling, and the
//! synchronous API surface.
//!
//! Concurrency model: one dispatcher thread owns the watch backend and
//! the debounce queue; a worker pool executes lifecycle transitions. The
//! scheduler guarantees per-entity FIFO — work for the same directory is
//! never in flight on two workers at once — while distinct entities
//! proceed in parallel. Synchronous API writes take the same per-entity
//! slot, so a human edit and a watcher merge cannot interleave.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread;
use std::time::{Duration, SystemTime};

use fairmeta_core::{
    Content, EngineConfig, Entity, LifecycleState, MetaError, MetaResult, MetadataRecord,
    RecordChanged, RecordType,
};
use tracing::{debug, info, warn};

use crate::classify::{Classification, Classifier};
use crate::lifecycle::LifecycleMachine;
use crate::schema::{SchemaInfo, SchemaStore};
use crate::watcher::{
    map_notify_event, now_millis, scan_existing, ChangeEvent, ChangeKind, DebounceQueue,
    DirChanges, EngineStats, EngineStatsInner, FsEventSource,
};

/// Recover the guard from a poisoned mutex; engine state stays usable
/// after a worker panic.
fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One scheduled unit of work: all coalesced activity for one directory.
#[derive(Debug, Clone)]
struct WorkItem {
    changes: DirChanges,
    attempt: u32,
    not_before_ms: u64,
}

#[derive(Default)]
struct SchedulerState {
    /// Per-directory FIFO of pending items.
    queues: HashMap<PathBuf, VecDeque<WorkItem>>,
    /// Directories with queued work that are not currently active.
    ready: VecDeque<PathBuf>,
    /// Directories a worker (or an API call) currently holds.
    active: HashSet<PathBuf>,
    /// Items waiting out a retry backoff.
    delayed: Vec<WorkItem>,
    shutdown: bool,
}

impl SchedulerState {
    fn enqueue(&mut self, item: WorkItem) {
        let dir = item.changes.directory.clone();
        self.queues.entry(dir.clone()).or_default().push_back(item);
        if !self.active.contains(&dir) && !self.ready.contains(&dir) {
            self.ready.push_back(dir);
        }
    }

    fn promote_delayed(&mut self, now_ms: u64) {
        let mut index = 0;
        while index < self.delayed.len() {
            if self.delayed[index].not_before_ms <= now_ms {
                let item = self.delayed.swap_remove(index);
                self.enqueue(item);
            } else {
                index += 1;
            }
        }
    }

    fn pop_ready(&mut self) -> Option<WorkItem> {
        while let Some(dir) = self.ready.pop_front() {
            if self.active.contains(&dir) {
                continue;
            }
            let Some(queue) = self.queues.get_mut(&dir) else {
                continue;
            };
            let Some(item) = queue.pop_front() else {
                self.queues.remove(&dir);
                continue;
            };
            if queue.is_empty() {
                self.queues.remove(&dir);
            }
            self.active.insert(dir);
            return Some(item);
        }
        None
    }

    fn is_drained(&self) -> bool {
        self.queues.is_empty() && self.delayed.is_empty() && self.active.is_empty()
    }
}

/// Per-entity FIFO scheduler shared by the worker pool and the API.
struct WorkScheduler {
    state: Mutex<SchedulerState>,
    ready_cv: Condvar,
}

impl WorkScheduler {
    fn new() -> Self {
        Self {
            state: Mutex::new(SchedulerState::default()),
            ready_cv: Condvar::new(),
        }
    }

    fn submit(&self, item: WorkItem) {
        let mut state = lock_or_recover(&self.state);
        if item.not_before_ms > now_millis() {
            state.delayed.push(item);
        } else {
            state.enqueue(item);
        }
        drop(state);
        self.ready_cv.notify_all();
    }

    /// Next item for a worker; blocks until work arrives or the queue is
    /// drained after shutdown.
    fn next(&self) -> Option<WorkItem> {
        let mut state = lock_or_recover(&self.state);
        loop {
            state.promote_delayed(now_millis());
            if let Some(item) = state.pop_ready() {
                return Some(item);
            }
            if state.shutdown && state.queues.is_empty() && state.delayed.is_empty() {
                return None;
            }
            let (guard, _) = self
                .ready_cv
                .wait_timeout(state, Duration::from_millis(50))
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
    }

    /// Release a directory after processing.
    fn complete(&self, dir: &Path) {
        let mut state = lock_or_recover(&self.state);
        state.active.remove(dir);
        if state.queues.contains_key(dir) && !state.ready.contains(&dir.to_path_buf()) {
            state.ready.push_back(dir.to_path_buf());
        }
        drop(state);
        self.ready_cv.notify_all();
    }

    /// Block until this directory's slot is free, then hold it.
    fn acquire(&self, dir: &Path) {
        let mut state = lock_or_recover(&self.state);
        while state.active.contains(dir) {
            let guard = self
                .ready_cv
                .wait_timeout(state, Duration::from_millis(50))
                .unwrap_or_else(PoisonError::into_inner)
                .0;
            state = guard;
        }
        state.active.insert(dir.to_path_buf());
    }

    fn begin_shutdown(&self) {
        lock_or_recover(&self.state).shutdown = true;
        self.ready_cv.notify_all();
    }

    /// Wait until every queued and in-flight item is done.
    fn wait_drained(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = lock_or_recover(&self.state);
        while !state.is_drained() {
            if std::time::Instant::now() >= deadline {
                return false;
            }
            let guard = self
                .ready_cv
                .wait_timeout(state, Duration::from_millis(50))
                .unwrap_or_else(PoisonError::into_inner)
                .0;
            state = guard;
        }
        true
    }
}

/// Entity registry: id and path views of the same set.
#[derive(Default)]
struct Registry {
    by_id: HashMap<String, Entity>,
    by_path: HashMap<PathBuf, String>,
}

impl Registry {
    fn register(&mut self, entity: Entity) {
        self.by_path.insert(entity.path.clone(), entity.id.clone());
        self.by_id.insert(entity.id.clone(), entity);
    }

    /// Remove the entity at `path` and everything registered beneath it.
    fn unregister_subtree(&mut self, path: &Path) -> usize {
        let doomed: Vec<String> = self
            .by_path
            .iter()
            .filter(|(p, _)| p.starts_with(path))
            .map(|(_, id)| id.clone())
            .collect();
        for id in &doomed {
            if let Some(entity) = self.by_id.remove(id) {
                self.by_path.remove(&entity.path);
            }
        }
        doomed.len()
    }

    fn len(&self) -> usize {
        self.by_id.len()
    }
}

#[derive(Default)]
struct EngineControl {
    stop_flag: Option<Arc<AtomicBool>>,
    threads: Vec<thread::JoinHandle<()>>,
}

/// The running engine. Construct with [`MetadataEngine::new`], call
/// [`start`](Self::start), interact through the synchronous API, and
/// [`shutdown`](Self::shutdown) to drain.
pub struct MetadataEngine {
    config: EngineConfig,
    classifier: Classifier,
    machine: Arc<LifecycleMachine>,
    registry: Arc<RwLock<Registry>>,
    scheduler: Arc<WorkScheduler>,
    stats: Arc<EngineStatsInner>,
    control: Mutex<EngineControl>,
    notifications: Mutex<Option<Receiver<RecordChanged>>>,
}

impl MetadataEngine {
    /// Build an engine from validated configuration.
    ///
    /// # Errors
    ///
    /// `MetaError::InvalidConfig` from validation.
    pub fn new(config: EngineConfig) -> MetaResult<Self> {
        config.validate()?;
        let schemas = Arc::new(SchemaStore::new(
            config.packaged_schema_dir.clone(),
            config.override_dir(),
        ));
        let (notify_tx, notify_rx) = channel();
        let machine = Arc::new(
            LifecycleMachine::new(schemas, config.actor.clone()).with_notifications(notify_tx),
        );
        let classifier = Classifier::new(
            config.monitored_root.clone(),
            config.ignore_patterns.clone(),
        );
        Ok(Self {
            config,
            classifier,
            machine,
            registry: Arc::new(RwLock::new(Registry::default())),
            scheduler: Arc::new(WorkScheduler::new()),
            stats: Arc::new(EngineStatsInner::default()),
            control: Mutex::new(EngineControl::default()),
            notifications: Mutex::new(Some(notify_rx)),
        })
    }

    /// Take the record-change notification stream. Yields one message per
    /// successful write; can be taken once.
    pub fn change_notifications(&self) -> Option<Receiver<RecordChanged>> {
        lock_or_recover(&self.notifications).take()
    }

    #[must_use]
    pub fn stats(&self) -> EngineStats {
        self.stats.snapshot()
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Start the dispatcher and worker pool, then run the catch-up scan.
    ///
    /// # Errors
    ///
    /// `MetaError::Watch` when the backend cannot watch the root; I/O
    /// errors from the catch-up scan.
    pub fn start(&self) -> MetaResult<()> {
        let mut control = lock_or_recover(&self.control);
        if control.stop_flag.is_some() {
            return Ok(());
        }
        if !self.config.monitored_root.is_dir() {
            return Err(MetaError::InvalidConfig {
                field: "monitored_root".into(),
                value: self.config.monitored_root.display().to_string(),
                reason: "directory does not exist".into(),
            });
        }

        let stop_flag = Arc::new(AtomicBool::new(false));

        // Watch before scanning, so changes landing mid-scan still emit
        // events and nothing falls between the two.
        let source = FsEventSource::start(&self.config.monitored_root)?;

        for worker_id in 0..self.config.effective_workers() {
            let context = WorkerContext {
                machine: Arc::clone(&self.machine),
                classifier: self.classifier.clone(),
                registry: Arc::clone(&self.registry),
                scheduler: Arc::clone(&self.scheduler),
                stats: Arc::clone(&self.stats),
                config: self.config.clone(),
            };
            let handle = thread::Builder::new()
                .name(format!("fairmeta-worker-{worker_id}"))
                .spawn(move || run_worker(&context))
                .map_err(|error| MetaError::Watch {
                    detail: format!("failed to spawn worker: {error}"),
                })?;
            control.threads.push(handle);
        }

        let dispatcher = DispatcherContext {
            source,
            classifier: self.classifier.clone(),
            registry: Arc::clone(&self.registry),
            scheduler: Arc::clone(&self.scheduler),
            stats: Arc::clone(&self.stats),
            window_ms: self.config.debounce_window_ms,
            stop_flag: Arc::clone(&stop_flag),
        };
        let handle = thread::Builder::new()
            .name("fairmeta-dispatcher".to_owned())
            .spawn(move || run_dispatcher(dispatcher))
            .map_err(|error| MetaError::Watch {
                detail: format!("failed to spawn dispatcher: {error}"),
            })?;
        control.threads.push(handle);
        control.stop_flag = Some(stop_flag);
        drop(control);

        // Catch up on entities created while the engine was down.
        let events = scan_existing(&self.config.monitored_root, &self.classifier)?;
        let count = events.len();
        let mut queue = DebounceQueue::new();
        for event in &events {
            route_event(event, &self.classifier, &self.registry, &mut queue, &self.stats);
        }
        let flush_at = now_millis().saturating_add(self.config.debounce_window_ms);
        for changes in queue.drain_ready(flush_at, self.config.debounce_window_ms) {
            self.stats.add_dispatched();
            self.scheduler.submit(WorkItem {
                changes,
                attempt: 1,
                not_before_ms: 0,
            });
        }
        info!(root = %self.config.monitored_root.display(), events = count, "engine started");
        Ok(())
    }

    /// Stop accepting events, drain queued work, and join all threads.
    pub fn shutdown(&self) {
        let (stop_flag, threads) = {
            let mut control = lock_or_recover(&self.control);
            (control.stop_flag.take(), std::mem::take(&mut control.threads))
        };
        let Some(flag) = stop_flag else {
            return;
        };
        flag.store(true, Ordering::Release);

        let drained = self
            .scheduler
            .wait_drained(Duration::from_millis(self.config.work_item_timeout_ms));
        if !drained {
            warn!("shutdown drain timed out; remaining work abandoned");
        }
        self.scheduler.begin_shutdown();
        for handle in threads {
            if handle.join().is_err() {
                warn!("engine thread panicked during shutdown");
            }
        }
        info!("engine stopped");
    }

    /// All registered entities, sorted by path.
    #[must_use]
    pub fn entities(&self) -> Vec<Entity> {
        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        let mut entities: Vec<Entity> = registry.by_id.values().cloned().collect();
        entities.sort_by(|a, b| a.path.cmp(&b.path));
        entities
    }

    /// Look up one entity.
    ///
    /// # Errors
    ///
    /// `MetaError::EntityNotFound`.
    pub fn entity_by_id(&self, entity_id: &str) -> MetaResult<Entity> {
        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        registry
            .by_id
            .get(entity_id)
            .cloned()
            .ok_or_else(|| MetaError::EntityNotFound {
                entity_id: entity_id.to_owned(),
            })
    }

    /// Current lifecycle state of an entity, derived from its sidecar.
    ///
    /// # Errors
    ///
    /// Lookup and record read failures.
    pub fn lifecycle_state(&self, entity_id: &str) -> MetaResult<LifecycleState> {
        let entity = self.entity_by_id(entity_id)?;
        self.machine.lifecycle_state(&entity)
    }

    /// Read one record.
    ///
    /// # Errors
    ///
    /// Lookup failures, `RecordNotFound`, corrupt-file errors.
    pub fn get_record(&self, entity_id: &str, record_type: RecordType) -> MetaResult<MetadataRecord> {
        let entity = self.entity_by_id(entity_id)?;
        self.machine.get_record(&entity, record_type)
    }

    /// Validate and persist caller-supplied record content, serialized
    /// against watcher work on the same entity.
    ///
    /// # Errors
    ///
    /// `ImmutableRecord`, `Validation`, `ConcurrentWriteConflict`, lookup
    /// and persistence failures.
    pub fn put_record(
        &self,
        entity_id: &str,
        record_type: RecordType,
        content: Content,
        expected_mtime: Option<SystemTime>,
        actor: &str,
    ) -> MetaResult<MetadataRecord> {
        let entity = self.entity_by_id(entity_id)?;
        self.with_entity_slot(&entity, || {
            self.machine
                .put_record(&entity, record_type, content, expected_mtime, actor)
        })
    }

    /// Materialize a contextual template for a dataset.
    ///
    /// # Errors
    ///
    /// Lookup failures, `SchemaNotFound`, persistence failures.
    pub fn request_contextual(
        &self,
        entity_id: &str,
        experiment_type: &str,
    ) -> MetaResult<MetadataRecord> {
        let entity = self.entity_by_id(entity_id)?;
        self.with_entity_slot(&entity, || {
            self.machine.request_contextual(&entity, experiment_type)
        })
    }

    /// Finalize a dataset into its aggregate record.
    ///
    /// # Errors
    ///
    /// `FinalizationBlocked` naming the unmet gate; lookup and
    /// persistence failures.
    pub fn finalize(&self, entity_id: &str, force: bool) -> MetaResult<MetadataRecord> {
        let entity = self.entity_by_id(entity_id)?;
        let project_path = entity
            .parent_id
            .as_ref()
            .and_then(|id| self.entity_by_id(id).ok())
            .map(|p| p.path);
        self.with_entity_slot(&entity, || {
            self.machine
                .finalize(&entity, project_path.as_deref(), force)
        })
    }

    /// Where a schema id currently resolves, and from which store.
    ///
    /// # Errors
    ///
    /// `SchemaNotFound`.
    pub fn resolve_schema_info(&self, schema_id: &str) -> MetaResult<SchemaInfo> {
        self.machine.schemas().resolve_info(schema_id)
    }

    /// Every schema visible through the override and packaged stores.
    #[must_use]
    pub fn list_schemas(&self) -> Vec<SchemaInfo> {
        self.machine.schemas().list_available()
    }

    fn with_entity_slot<T>(
        &self,
        entity: &Entity,
        operation: impl FnOnce() -> MetaResult<T>,
    ) -> MetaResult<T> {
        self.scheduler.acquire(&entity.path);
        let result = operation();
        self.scheduler.complete(&entity.path);
        if result.is_ok() {
            self.stats.add_records_written(1);
        }
        result
    }
}

impl Drop for MetadataEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct DispatcherContext {
    source: FsEventSource,
    classifier: Classifier,
    registry: Arc<RwLock<Registry>>,
    scheduler: Arc<WorkScheduler>,
    stats: Arc<EngineStatsInner>,
    window_ms: u64,
    stop_flag: Arc<AtomicBool>,
}

fn run_dispatcher(context: DispatcherContext) {
    let mut queue = DebounceQueue::new();

    while !context.stop_flag.load(Ordering::Acquire) {
        let timeout = queue.earliest_deadline(context.window_ms).map_or(
            Duration::from_millis(100),
            |deadline| Duration::from_millis(deadline.saturating_sub(now_millis()).min(100)),
        );

        match context.source.recv_timeout(timeout) {
            Ok(Some(result)) => handle_notify_result(result, &context, &mut queue),
            Ok(None) => {}
            Err(error) => {
                context.stats.add_error();
                warn!(%error, "watch backend lost; dispatcher exiting");
                break;
            }
        }
        for result in context.source.drain_pending() {
            handle_notify_result(result, &context, &mut queue);
        }

        let dropped = context.source.take_dropped();
        if dropped > 0 {
            context.stats.add_events_dropped(dropped);
            warn!(dropped, "event channel overflowed; backend events discarded");
        }

        dispatch_ready(&context, &mut queue, now_millis());
    }

    // Flush whatever is still pending so shutdown drains it.
    let flush_at = now_millis().saturating_add(context.window_ms);
    dispatch_ready(&context, &mut queue, flush_at);
    debug!("dispatcher exited");
}

fn handle_notify_result(
    result: notify::Result<notify::Event>,
    context: &DispatcherContext,
    queue: &mut DebounceQueue,
) {
    match result {
        Ok(event) => {
            for change in map_notify_event(event) {
                route_event(
                    &change,
                    &context.classifier,
                    &context.registry,
                    queue,
                    &context.stats,
                );
            }
        }
        Err(error) => {
            context.stats.add_error();
            warn!(%error, "watch backend reported an error");
        }
    }
}

fn dispatch_ready(context: &DispatcherContext, queue: &mut DebounceQueue, now_ms: u64) {
    for changes in queue.drain_ready(now_ms, context.window_ms) {
        context.stats.add_dispatched();
        context.scheduler.submit(WorkItem {
            changes,
            attempt: 1,
            not_before_ms: 0,
        });
    }
}

/// Classify one change and fold it into the debounce queue (or apply it
/// directly, for entity removals).
fn route_event(
    event: &ChangeEvent,
    classifier: &Classifier,
    registry: &Arc<RwLock<Registry>>,
    queue: &mut DebounceQueue,
    stats: &EngineStatsInner,
) {
    stats.mark_event(event.observed_at_ms);

    if event.kind == ChangeKind::Deleted {
        // A vanished registered directory takes its subtree with it.
        let mut registry = registry.write().unwrap_or_else(PoisonError::into_inner);
        if registry.by_path.contains_key(&event.path) {
            let removed = registry.unregister_subtree(&event.path);
            stats.set_entities_tracked(registry.len());
            drop(registry);
            info!(path = %event.path.display(), removed, "entity removed from registry");
            return;
        }
    }

    match classifier.classify(&event.path, event.is_dir) {
        Ok(Classification::Project { path }) => {
            if event.kind != ChangeKind::Deleted {
                queue.push_dir_created(&path, event.observed_at_ms);
            }
        }
        Ok(Classification::Dataset { path, .. }) => {
            if event.kind != ChangeKind::Deleted {
                queue.push_dir_created(&path, event.observed_at_ms);
            }
        }
        Ok(Classification::DataFile { path, dataset }) => {
            let coalesced = match event.kind {
                ChangeKind::Created | ChangeKind::Modified => {
                    queue.push_changed(&dataset, path, event.observed_at_ms)
                }
                ChangeKind::Deleted => queue.push_deleted(&dataset, path, event.observed_at_ms),
            };
            if coalesced {
                stats.add_coalesced();
            }
        }
        Ok(Classification::Irrelevant) => {}
        Err(error) => {
            stats.add_error();
            warn!(%error, "event not processable");
        }
    }
}

struct WorkerContext {
    machine: Arc<LifecycleMachine>,
    classifier: Classifier,
    registry: Arc<RwLock<Registry>>,
    scheduler: Arc<WorkScheduler>,
    stats: Arc<EngineStatsInner>,
    config: EngineConfig,
}

fn run_worker(context: &WorkerContext) {
    while let Some(item) = context.scheduler.next() {
        let dir = item.changes.directory.clone();
        let outcome = process_item(context, &item);
        context.scheduler.complete(&dir);

        match outcome {
            Ok(writes) => {
                context.stats.add_records_written(writes);
            }
            Err(error) if error.is_retryable() && item.attempt < context.config.max_attempts => {
                context.stats.add_error();
                context.stats.add_retried();
                let backoff_ms = context
                    .config
                    .retry_backoff_ms
                    .saturating_mul(u64::from(item.attempt));
                warn!(
                    path = %dir.display(),
                    attempt = item.attempt,
                    backoff_ms,
                    %error,
                    "work item failed; retrying with backoff"
                );
                context.scheduler.submit(WorkItem {
                    changes: item.changes,
                    attempt: item.attempt + 1,
                    not_before_ms: now_millis().saturating_add(backoff_ms),
                });
            }
            Err(error) => {
                context.stats.add_error();
                context.stats.add_dropped();
                warn!(path = %dir.display(), attempts = item.attempt, %error, "work item dropped");
            }
        }
    }
    debug!("worker exited");
}

/// Execute one work item. Returns the number of record writes performed.
fn process_item(context: &WorkerContext, item: &WorkItem) -> MetaResult<usize> {
    let dir = &item.changes.directory;
    if !dir.is_dir() {
        // Deleted before the window closed; the removal event already
        // handled the registry.
        return Ok(0);
    }

    match context.classifier.classify(dir, true)? {
        Classification::Project { path } => {
            let entity = context.machine.on_project_created(&path)?;
            register(context, entity);
            Ok(1)
        }
        Classification::Dataset { path, project } => {
            // Project records are shared with the project's own work item;
            // hold the project's slot so both cannot initialize it at once.
            context.scheduler.acquire(&project);
            let project_result = context.machine.on_project_created(&project);
            context.scheduler.complete(&project);
            let project_entity = project_result?;

            let entity = context.machine.on_dataset_created(&path, &project)?;
            register(context, project_entity);
            register(context, entity.clone());

            let mut writes = 1_usize;
            if !item.changes.changed_paths.is_empty() || !item.changes.deleted_paths.is_empty() {
                context.machine.on_files_changed(
                    &entity,
                    &item.changes.changed_paths,
                    &item.changes.deleted_paths,
                    Some(context.config.work_item_timeout()),
                )?;
                writes += 1;
            }
            Ok(writes)
        }
        Classification::DataFile { .. } | Classification::Irrelevant => Ok(0),
    }
}

fn register(context: &WorkerContext, entity: Entity) {
    let mut registry = context
        .registry
        .write()
        .unwrap_or_else(PoisonError::into_inner);
    registry.register(entity);
    context.stats.set_entities_tracked(registry.len());
}
