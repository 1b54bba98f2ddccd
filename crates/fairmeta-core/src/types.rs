//! Core vocabulary: entities, record types, file descriptors, lifecycle state.
//!
//! Record content is an insertion-ordered JSON object (`serde_json::Map`
//! with the `preserve_order` feature), the closed value set (string, number,
//! bool, list, nested map, null) that schema-validated documents need.

use std::fmt;
use std::path::PathBuf;
use std::time::SystemTime;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Insertion-ordered record document, as read from or written to disk.
pub type Content = serde_json::Map<String, serde_json::Value>;

/// Actor name stamped into audit fields for engine-initiated writes.
pub const SYSTEM_ACTOR: &str = "system";

/// The fixed categories of metadata document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordType {
    ProjectDescriptive,
    ProjectAdministrative,
    DatasetAdministrative,
    DatasetStructural,
    ExperimentContextual,
    InstrumentTechnical,
    CompleteMetadata,
}

impl RecordType {
    /// All record types, in aggregation order.
    pub const ALL: [Self; 7] = [
        Self::ProjectDescriptive,
        Self::ProjectAdministrative,
        Self::DatasetAdministrative,
        Self::DatasetStructural,
        Self::ExperimentContextual,
        Self::InstrumentTechnical,
        Self::CompleteMetadata,
    ];

    /// Snake-case name used in APIs and notifications.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ProjectDescriptive => "project_descriptive",
            Self::ProjectAdministrative => "project_administrative",
            Self::DatasetAdministrative => "dataset_administrative",
            Self::DatasetStructural => "dataset_structural",
            Self::ExperimentContextual => "experiment_contextual",
            Self::InstrumentTechnical => "instrument_technical",
            Self::CompleteMetadata => "complete_metadata",
        }
    }

    /// Sidecar file name for this record type.
    ///
    /// These names are part of the on-disk contract and must not change:
    /// external tooling reads the sidecar directly.
    #[must_use]
    pub const fn file_name(self) -> &'static str {
        match self {
            Self::ProjectDescriptive => "project_descriptive.json",
            Self::ProjectAdministrative => "project_administrative.json",
            Self::DatasetAdministrative => "dataset_administrative.json",
            Self::DatasetStructural => "dataset_structural.json",
            Self::ExperimentContextual => "experiment_contextual.json",
            Self::InstrumentTechnical => "instrument_technical.json",
            Self::CompleteMetadata => "complete_metadata.json",
        }
    }

    /// Logical schema id governing this record type.
    ///
    /// Naming follows the packaged schema set; `project_descriptive` is the
    /// historical odd one out without a `_schema` suffix.
    #[must_use]
    pub const fn schema_id(self) -> &'static str {
        match self {
            Self::ProjectDescriptive => "project_descriptive",
            Self::ProjectAdministrative => "project_administrative_schema",
            Self::DatasetAdministrative => "dataset_administrative_schema",
            Self::DatasetStructural => "dataset_structural_schema",
            Self::ExperimentContextual => "experiment_contextual_schema",
            Self::InstrumentTechnical => "instrument_technical_schema",
            Self::CompleteMetadata => "complete_metadata_schema",
        }
    }

    /// Which entity kind owns records of this type.
    #[must_use]
    pub const fn applies_to(self) -> EntityKind {
        match self {
            Self::ProjectDescriptive | Self::ProjectAdministrative => EntityKind::Project,
            _ => EntityKind::Dataset,
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The two entity kinds backed by filesystem directories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Project,
    Dataset,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Project => f.write_str("project"),
            Self::Dataset => f.write_str("dataset"),
        }
    }
}

/// A Project or Dataset, backed by one directory.
///
/// `id` is minted once (UUID v4, stored in the sidecar's descriptive or
/// structural record) and read back on re-scan; it is never recomputed
/// from content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Entity {
    pub id: String,
    pub kind: EntityKind,
    pub path: PathBuf,
    /// Owning project id for datasets; `None` for projects.
    pub parent_id: Option<String>,
}

/// Where a resolved schema definition came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaSource {
    LocalOverride,
    PackagedDefault,
}

impl SchemaSource {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LocalOverride => "local_override",
            Self::PackagedDefault => "packaged_default",
        }
    }
}

impl fmt::Display for SchemaSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolution provenance attached to a record at last write/validate time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaRef {
    pub schema_id: String,
    pub source: SchemaSource,
}

/// Engine-stamped provenance fields.
///
/// Persisted inline in the record document under the historical field
/// names (`created_by`, `created_date`, `last_modified_by`,
/// `last_modified_date`) so sidecars stay byte-compatible with existing
/// tooling. Callers never set these directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditInfo {
    pub created_by: String,
    pub created_at: String,
    pub last_modified_by: String,
    pub last_modified_at: String,
}

/// RFC 3339 UTC timestamp with microsecond precision.
#[must_use]
pub fn utc_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Convert an OS timestamp to the audit/descriptor string form.
#[must_use]
pub fn utc_string(time: SystemTime) -> String {
    DateTime::<Utc>::from(time).to_rfc3339_opts(SecondsFormat::Micros, true)
}

impl AuditInfo {
    /// Fresh audit block for a record that did not exist before.
    #[must_use]
    pub fn stamp_new(actor: &str) -> Self {
        let now = utc_now();
        Self {
            created_by: actor.to_owned(),
            created_at: now.clone(),
            last_modified_by: actor.to_owned(),
            last_modified_at: now,
        }
    }

    /// Refresh modification fields, keeping creation provenance intact.
    pub fn refresh(&mut self, actor: &str) {
        self.last_modified_by = actor.to_owned();
        self.last_modified_at = utc_now();
    }

    /// Read the audit block out of a record document, if present.
    #[must_use]
    pub fn from_content(content: &Content) -> Option<Self> {
        let get = |key: &str| {
            content
                .get(key)
                .and_then(serde_json::Value::as_str)
                .map(str::to_owned)
        };
        Some(Self {
            created_by: get("created_by")?,
            created_at: get("created_date")?,
            last_modified_by: get("last_modified_by")?,
            last_modified_at: get("last_modified_date")?,
        })
    }

    /// Write the audit block into a record document under the on-disk
    /// field names.
    pub fn apply_to(&self, content: &mut Content) {
        content.insert("created_by".into(), self.created_by.clone().into());
        content.insert("created_date".into(), self.created_at.clone().into());
        content.insert(
            "last_modified_by".into(),
            self.last_modified_by.clone().into(),
        );
        content.insert(
            "last_modified_date".into(),
            self.last_modified_at.clone().into(),
        );
    }
}

/// A named, typed, versioned structured document from an entity's sidecar.
///
/// The persisted form is `content` alone (audit fields inline);
/// `schema_ref`, `audit` and the mtime token are assembled by the engine.
#[derive(Debug, Clone)]
pub struct MetadataRecord {
    pub record_type: RecordType,
    pub content: Content,
    pub schema_ref: SchemaRef,
    pub audit: AuditInfo,
    /// On-disk modification time at read/write, used as the optimistic
    /// concurrency token for read-modify-write callers.
    pub mtime: Option<SystemTime>,
}

/// One entry in a `dataset_structural` record's file list.
///
/// Uniquely keyed by `relative_path` within a dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub file_name: String,
    pub relative_path: String,
    pub extension: String,
    pub size_bytes: u64,
    pub checksum_sha256: String,
    pub mime_type: String,
    pub created_utc: String,
    pub modified_utc: String,
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(default)]
    pub description: String,
}

fn default_role() -> String {
    "raw_data".to_owned()
}

impl FileDescriptor {
    /// Whether re-processing this path produced the same bytes.
    #[must_use]
    pub fn same_checksum(&self, other: &Self) -> bool {
        self.checksum_sha256 == other.checksum_sha256
    }
}

/// Derived lifecycle position of an entity.
///
/// Never stored: always computed from which records exist and validate,
/// so there is no second source of truth to drift.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Initialized,
    Ingested,
    ContextPending,
    Finalized,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initialized => f.write_str("initialized"),
            Self::Ingested => f.write_str("ingested"),
            Self::ContextPending => f.write_str("context_pending"),
            Self::Finalized => f.write_str("finalized"),
        }
    }
}

/// Emitted once per successful record write, for the version-control
/// collaborator to act on (e.g. commit the sidecar change).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordChanged {
    pub entity_id: String,
    pub entity_path: PathBuf,
    pub record_type: RecordType,
    /// Short human summary suitable for a commit message.
    pub summary: String,
}

/// Mint a new entity identifier.
#[must_use]
pub fn new_entity_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_type_names_match_on_disk_contract() {
        assert_eq!(
            RecordType::ProjectDescriptive.file_name(),
            "project_descriptive.json"
        );
        assert_eq!(
            RecordType::DatasetStructural.file_name(),
            "dataset_structural.json"
        );
        assert_eq!(
            RecordType::CompleteMetadata.file_name(),
            "complete_metadata.json"
        );
        // project_descriptive schema historically lacks the _schema suffix.
        assert_eq!(RecordType::ProjectDescriptive.schema_id(), "project_descriptive");
        assert_eq!(
            RecordType::DatasetStructural.schema_id(),
            "dataset_structural_schema"
        );
    }

    #[test]
    fn record_type_ownership() {
        assert_eq!(
            RecordType::ProjectDescriptive.applies_to(),
            EntityKind::Project
        );
        assert_eq!(
            RecordType::ProjectAdministrative.applies_to(),
            EntityKind::Project
        );
        for rt in [
            RecordType::DatasetAdministrative,
            RecordType::DatasetStructural,
            RecordType::ExperimentContextual,
            RecordType::CompleteMetadata,
        ] {
            assert_eq!(rt.applies_to(), EntityKind::Dataset);
        }
    }

    #[test]
    fn audit_refresh_preserves_creation_provenance() {
        let mut audit = AuditInfo::stamp_new("system");
        let created_at = audit.created_at.clone();
        audit.refresh("alice");
        assert_eq!(audit.created_by, "system");
        assert_eq!(audit.created_at, created_at);
        assert_eq!(audit.last_modified_by, "alice");
    }

    #[test]
    fn audit_round_trips_through_content() {
        let audit = AuditInfo::stamp_new("system");
        let mut content = Content::new();
        content.insert("dataset_title".into(), "CohortA".into());
        audit.apply_to(&mut content);

        let parsed = AuditInfo::from_content(&content).expect("audit fields present");
        assert_eq!(parsed, audit);
        // Non-audit fields untouched.
        assert_eq!(
            content.get("dataset_title").and_then(|v| v.as_str()),
            Some("CohortA")
        );
    }

    #[test]
    fn audit_from_content_absent_when_unstamped() {
        let content = Content::new();
        assert!(AuditInfo::from_content(&content).is_none());
    }

    #[test]
    fn lifecycle_states_are_ordered() {
        assert!(LifecycleState::Initialized < LifecycleState::Ingested);
        assert!(LifecycleState::Ingested < LifecycleState::ContextPending);
        assert!(LifecycleState::ContextPending < LifecycleState::Finalized);
    }

    #[test]
    fn entity_ids_are_unique() {
        assert_ne!(new_entity_id(), new_entity_id());
    }

    #[test]
    fn file_descriptor_defaults_on_deserialize() {
        let json = r#"{
            "file_name": "reads.fastq.gz",
            "relative_path": "reads.fastq.gz",
            "extension": "gz",
            "size_bytes": 1024,
            "checksum_sha256": "abc",
            "mime_type": "application/gzip",
            "created_utc": "2025-01-01T00:00:00Z",
            "modified_utc": "2025-01-01T00:00:00Z"
        }"#;
        let fd: FileDescriptor = serde_json::from_str(json).expect("parse descriptor");
        assert_eq!(fd.role, "raw_data");
        assert_eq!(fd.description, "");
    }

    #[test]
    fn content_preserves_insertion_order() {
        let mut content = Content::new();
        content.insert("zulu".into(), 1.into());
        content.insert("alpha".into(), 2.into());
        content.insert("mike".into(), 3.into());
        let keys: Vec<&str> = content.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["zulu", "alpha", "mike"]);
    }
}
