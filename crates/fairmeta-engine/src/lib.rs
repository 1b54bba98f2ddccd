//! Filesystem-driven metadata lifecycle engine.
//!
//! Watches a directory tree for projects (`p_*`) and datasets (`d_*`),
//! maintains schema-validated metadata records in hidden `.metadata`
//! sidecar directories, and aggregates a dataset's records into one
//! immutable `complete_metadata` document when it is finalized.
//!
//! The pipeline: raw filesystem events are classified lexically,
//! coalesced per entity directory inside a debounce window, and executed
//! by a worker pool with per-entity FIFO ordering. Every record write is
//! schema-validated first and atomic on disk.

#![forbid(unsafe_code)]

pub mod classify;
pub mod descriptor;
pub mod engine;
pub mod lifecycle;
pub mod schema;
pub mod store;
pub mod tracing_setup;
pub mod watcher;

pub use classify::{Classification, Classifier, DATASET_PREFIX, PROJECT_PREFIX, SIDECAR_DIR};
pub use engine::MetadataEngine;
pub use lifecycle::LifecycleMachine;
pub use schema::{SchemaInfo, SchemaStore};
pub use store::{RecordStore, StoredRecord, WritePrecondition};
pub use watcher::EngineStats;
