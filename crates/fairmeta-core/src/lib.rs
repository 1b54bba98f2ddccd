//! Shared vocabulary for the fairmeta metadata lifecycle engine.
//!
//! This crate defines the types every other fairmeta crate speaks:
//! record types and entities, the unified error enum, audit provenance,
//! and engine configuration. It performs no I/O beyond config loading.

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod types;

pub use config::EngineConfig;
pub use error::{FieldViolation, FinalizeBlocked, MetaError, MetaResult};
pub use types::{
    new_entity_id, utc_now, utc_string, AuditInfo, Content, Entity, EntityKind, FileDescriptor,
    LifecycleState, MetadataRecord, RecordChanged, RecordType, SchemaRef, SchemaSource,
    SYSTEM_ACTOR,
};
