//! Lifecycle orchestration: the state machine behind every record write.
//!
//! Each operation here is one lifecycle transition: a project or dataset
//! appearing, data files changing, a contextual template being requested,
//! or a dataset being finalized into its aggregate. Lifecycle state is
//! never persisted; it is always re-derived from which records exist and
//! validate, so a crash can never leave a stale state marker behind.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::Duration;

use fairmeta_core::{
    new_entity_id, utc_now, utc_string, AuditInfo, Content, Entity, EntityKind, FileDescriptor,
    FinalizeBlocked, LifecycleState, MetaError, MetaResult, MetadataRecord, RecordChanged,
    RecordType, SchemaRef, SchemaSource,
};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::classify::{DATASET_PREFIX, PROJECT_PREFIX};
use crate::descriptor;
use crate::schema::{self, SchemaStore, PLACEHOLDER};
use crate::store::{RecordStore, WritePrecondition};

/// Fields every record carries that do not count toward completeness.
const BOOKKEEPING_FIELDS: [&str; 7] = [
    "created_by",
    "created_date",
    "last_modified_by",
    "last_modified_date",
    "experiment_template_type",
    "dataset_identifier_link",
    "schema_version",
];

/// Record types embedded in a finalized aggregate, in embedding order.
const AGGREGATE_COMPONENTS: [RecordType; 6] = [
    RecordType::ProjectDescriptive,
    RecordType::ProjectAdministrative,
    RecordType::DatasetAdministrative,
    RecordType::DatasetStructural,
    RecordType::ExperimentContextual,
    RecordType::InstrumentTechnical,
];

/// Components a finalize refuses to proceed without.
const REQUIRED_COMPONENTS: [RecordType; 3] = [
    RecordType::DatasetAdministrative,
    RecordType::DatasetStructural,
    RecordType::ExperimentContextual,
];

/// Executes lifecycle transitions against one schema store.
pub struct LifecycleMachine {
    schemas: Arc<SchemaStore>,
    actor: String,
    notifications: Option<Sender<RecordChanged>>,
}

impl LifecycleMachine {
    #[must_use]
    pub fn new(schemas: Arc<SchemaStore>, actor: String) -> Self {
        Self {
            schemas,
            actor,
            notifications: None,
        }
    }

    /// Attach a channel that receives one message per successful record
    /// write.
    #[must_use]
    pub fn with_notifications(mut self, sender: Sender<RecordChanged>) -> Self {
        self.notifications = Some(sender);
        self
    }

    #[must_use]
    pub fn schemas(&self) -> &SchemaStore {
        &self.schemas
    }

    fn emit(&self, entity: &Entity, record_type: RecordType, summary: String) {
        if let Some(sender) = &self.notifications {
            let _ = sender.send(RecordChanged {
                entity_id: entity.id.clone(),
                entity_path: entity.path.clone(),
                record_type,
                summary,
            });
        }
    }

    /// Handle a project directory appearing. Idempotent: an existing
    /// descriptive record is read back, never regenerated.
    ///
    /// # Errors
    ///
    /// Schema resolution, validation, or persistence failures.
    pub fn on_project_created(&self, project_dir: &Path) -> MetaResult<Entity> {
        RecordStore::sweep_orphan_temps(project_dir)?;

        if let Some(existing) = RecordStore::read(project_dir, RecordType::ProjectDescriptive)? {
            let id = string_field(&existing.content, "project_identifier")
                .unwrap_or_else(new_entity_id);
            debug!(path = %project_dir.display(), id, "project already initialized");
            return Ok(Entity {
                id,
                kind: EntityKind::Project,
                path: project_dir.to_path_buf(),
                parent_id: None,
            });
        }

        let id = new_entity_id();
        let title = display_title(project_dir, PROJECT_PREFIX);
        let entity = Entity {
            id: id.clone(),
            kind: EntityKind::Project,
            path: project_dir.to_path_buf(),
            parent_id: None,
        };

        for record_type in [RecordType::ProjectDescriptive, RecordType::ProjectAdministrative] {
            let mut content = self.template_for(record_type)?;
            content.insert("project_identifier".into(), id.clone().into());
            if record_type == RecordType::ProjectDescriptive {
                content.insert("project_title".into(), title.clone().into());
            }
            self.write_validated(&entity, record_type, content, WritePrecondition::Absent, &self.actor)?;
            self.emit(
                &entity,
                record_type,
                format!("initialized {record_type} for project {title}"),
            );
        }
        info!(path = %project_dir.display(), id, "project initialized");
        Ok(entity)
    }

    /// Handle a dataset directory appearing inside a project. Creates the
    /// administrative and structural seeds; idempotent like projects.
    ///
    /// # Errors
    ///
    /// Schema resolution, validation, or persistence failures.
    pub fn on_dataset_created(&self, dataset_dir: &Path, project_dir: &Path) -> MetaResult<Entity> {
        let project = self.on_project_created(project_dir)?;
        RecordStore::sweep_orphan_temps(dataset_dir)?;

        if let Some(existing) = RecordStore::read(dataset_dir, RecordType::DatasetAdministrative)? {
            let id = string_field(&existing.content, "dataset_identifier")
                .unwrap_or_else(new_entity_id);
            debug!(path = %dataset_dir.display(), id, "dataset already initialized");
            return Ok(Entity {
                id,
                kind: EntityKind::Dataset,
                path: dataset_dir.to_path_buf(),
                parent_id: Some(project.id),
            });
        }

        let id = new_entity_id();
        let title = display_title(dataset_dir, DATASET_PREFIX);
        let entity = Entity {
            id: id.clone(),
            kind: EntityKind::Dataset,
            path: dataset_dir.to_path_buf(),
            parent_id: Some(project.id.clone()),
        };

        let mut administrative = self.template_for(RecordType::DatasetAdministrative)?;
        administrative.insert("dataset_identifier".into(), id.clone().into());
        administrative.insert("dataset_title".into(), title.clone().into());
        administrative.insert("project_identifier".into(), project.id.clone().into());
        self.write_validated(
            &entity,
            RecordType::DatasetAdministrative,
            administrative,
            WritePrecondition::Absent,
            &self.actor,
        )?;
        self.emit(
            &entity,
            RecordType::DatasetAdministrative,
            format!("initialized dataset_administrative for dataset {title}"),
        );

        let mut structural = self.template_for(RecordType::DatasetStructural)?;
        structural.insert("dataset_identifier".into(), id.clone().into());
        structural.insert("file_descriptions".into(), Value::Array(Vec::new()));
        structural.insert("file_organization".into(), file_organization(&[]));
        self.write_validated(
            &entity,
            RecordType::DatasetStructural,
            structural,
            WritePrecondition::Absent,
            &self.actor,
        )?;
        self.emit(
            &entity,
            RecordType::DatasetStructural,
            format!("initialized dataset_structural for dataset {title}"),
        );

        info!(path = %dataset_dir.display(), id, project_id = project.id, "dataset initialized");
        Ok(entity)
    }

    /// Merge changed and deleted data files into the structural record.
    ///
    /// Returns how many descriptors were added or refreshed. Unreadable
    /// files are logged and skipped so one bad file never blocks the
    /// batch.
    ///
    /// # Errors
    ///
    /// Persistence and validation failures; `ConcurrentWriteConflict`
    /// when the structural record changed underneath the merge.
    pub fn on_files_changed(
        &self,
        dataset: &Entity,
        changed: &BTreeSet<PathBuf>,
        deleted: &BTreeSet<PathBuf>,
        budget: Option<Duration>,
    ) -> MetaResult<usize> {
        self.merge_files(dataset, changed, deleted, budget, false)
    }

    /// Re-extract descriptors for `changed` even when size and mtime
    /// match the stored entry, recomputing every checksum.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`Self::on_files_changed`].
    pub fn reverify_files(
        &self,
        dataset: &Entity,
        changed: &BTreeSet<PathBuf>,
        budget: Option<Duration>,
    ) -> MetaResult<usize> {
        self.merge_files(dataset, changed, &BTreeSet::new(), budget, true)
    }

    fn merge_files(
        &self,
        dataset: &Entity,
        changed: &BTreeSet<PathBuf>,
        deleted: &BTreeSet<PathBuf>,
        budget: Option<Duration>,
        verify: bool,
    ) -> MetaResult<usize> {
        let Some(stored) = RecordStore::read(&dataset.path, RecordType::DatasetStructural)? else {
            return Err(MetaError::RecordNotFound {
                entity_id: dataset.id.clone(),
                record_type: RecordType::DatasetStructural,
            });
        };
        let mut content = stored.content;
        let mut descriptors = descriptors_from(&content);

        let mut updated = 0_usize;
        for path in changed {
            if !verify && stat_matches_existing(&dataset.path, path, &descriptors) {
                debug!(path = %path.display(), "descriptor unchanged; reused");
                continue;
            }
            match descriptor::extract(&dataset.path, path, budget) {
                Ok(fresh) => {
                    let replaced = upsert_descriptor(&mut descriptors, fresh);
                    if replaced {
                        debug!(path = %path.display(), "descriptor refreshed");
                    }
                    updated += 1;
                }
                Err(error @ MetaError::Timeout { .. }) => return Err(error),
                Err(error) => {
                    warn!(path = %path.display(), %error, "descriptor extraction failed; skipping file");
                }
            }
        }
        let before = descriptors.len();
        for path in deleted {
            let relative = relative_to(&dataset.path, path);
            descriptors.retain(|d| d.get("relative_path").and_then(Value::as_str) != Some(&relative));
        }
        let removed = before - descriptors.len();
        if updated == 0 && removed == 0 {
            // Every path was reused or skipped; the record is current.
            return Ok(0);
        }

        content.insert("file_organization".into(), file_organization(&descriptors));
        content.insert("file_descriptions".into(), Value::Array(descriptors));

        self.write_validated(
            dataset,
            RecordType::DatasetStructural,
            content,
            WritePrecondition::UnchangedSince(stored.mtime),
            &self.actor,
        )?;
        self.emit(
            dataset,
            RecordType::DatasetStructural,
            format!(
                "updated dataset_structural ({updated} changed, {} removed)",
                deleted.len()
            ),
        );
        Ok(updated)
    }

    /// Materialize a contextual template for an experiment type.
    ///
    /// Idempotent: an existing contextual record is returned untouched so
    /// human edits are never clobbered.
    ///
    /// # Errors
    ///
    /// `SchemaNotFound` for an unknown experiment type; persistence
    /// failures.
    pub fn request_contextual(
        &self,
        dataset: &Entity,
        experiment_type: &str,
    ) -> MetaResult<MetadataRecord> {
        if let Some(existing) = RecordStore::read(&dataset.path, RecordType::ExperimentContextual)? {
            return Ok(self.record_from_stored(RecordType::ExperimentContextual, existing));
        }

        let (schema_value, schema_ref) = self.schemas.resolve(experiment_type)?;
        let mut content = schema::template_from_schema(&schema_value);
        content.insert("experiment_template_type".into(), experiment_type.into());
        content.insert("dataset_identifier_link".into(), dataset.id.clone().into());

        let audit = AuditInfo::stamp_new(&self.actor);
        audit.apply_to(&mut content);
        let violations = schema::validate_document(&schema_value, &content);
        if !violations.is_empty() {
            return Err(MetaError::Validation {
                schema_id: schema_ref.schema_id,
                violations,
            });
        }
        let mtime = RecordStore::write(
            &dataset.path,
            RecordType::ExperimentContextual,
            &content,
            WritePrecondition::Absent,
        )?;
        self.emit(
            dataset,
            RecordType::ExperimentContextual,
            format!("created experiment_contextual template ({experiment_type})"),
        );
        info!(dataset_id = dataset.id, experiment_type, "contextual template created");

        Ok(MetadataRecord {
            record_type: RecordType::ExperimentContextual,
            content,
            schema_ref,
            audit,
            mtime: Some(mtime),
        })
    }

    /// Validate and persist caller-supplied record content.
    ///
    /// The aggregate record type is refused: it is only ever issued by
    /// `finalize`. Creation provenance of an existing record is kept.
    ///
    /// # Errors
    ///
    /// `ImmutableRecord`, `Validation`, `ConcurrentWriteConflict`, or
    /// persistence failures.
    pub fn put_record(
        &self,
        entity: &Entity,
        record_type: RecordType,
        mut content: Content,
        expected_mtime: Option<std::time::SystemTime>,
        actor: &str,
    ) -> MetaResult<MetadataRecord> {
        if record_type == RecordType::CompleteMetadata {
            return Err(MetaError::ImmutableRecord { record_type });
        }
        if record_type.applies_to() != entity.kind {
            return Err(MetaError::Validation {
                schema_id: record_type.schema_id().to_owned(),
                violations: vec![fairmeta_core::FieldViolation {
                    path: "record_type".into(),
                    message: format!(
                        "{record_type} records apply to {} entities, not {}",
                        record_type.applies_to(),
                        entity.kind
                    ),
                }],
            });
        }

        // Creation provenance survives even when the caller stripped the
        // audit fields from their copy.
        let existing = RecordStore::read(&entity.path, record_type)?;
        if let Some(audit) = existing
            .as_ref()
            .and_then(|s| AuditInfo::from_content(&s.content))
        {
            audit.apply_to(&mut content);
        }

        let precondition = match expected_mtime {
            Some(mtime) => WritePrecondition::UnchangedSince(mtime),
            None => WritePrecondition::Any,
        };
        let record = self.write_validated(entity, record_type, content, precondition, actor)?;
        self.emit(
            entity,
            record_type,
            format!("updated {record_type} (edited by {actor})"),
        );
        Ok(record)
    }

    /// Finalize a dataset: check every gate, then aggregate all component
    /// records into one immutable `complete_metadata` document.
    ///
    /// With `force`, an existing aggregate is archived as the next
    /// `complete_metadata.v<N>.json` before the new revision is written.
    ///
    /// # Errors
    ///
    /// `FinalizationBlocked` naming the first unmet gate; persistence
    /// failures.
    pub fn finalize(
        &self,
        dataset: &Entity,
        project_dir: Option<&Path>,
        force: bool,
    ) -> MetaResult<MetadataRecord> {
        let structural = RecordStore::read(&dataset.path, RecordType::DatasetStructural)?;
        let ingested = structural
            .as_ref()
            .map(|s| !descriptors_from(&s.content).is_empty())
            .unwrap_or(false);
        if !ingested {
            return Err(blocked(FinalizeBlocked::NotIngested));
        }

        let Some(contextual) = RecordStore::read(&dataset.path, RecordType::ExperimentContextual)?
        else {
            return Err(blocked(FinalizeBlocked::MissingContextual));
        };

        let (contextual_schema, _) = self.contextual_schema(&contextual.content)?;
        let violations = schema::validate_document(&contextual_schema, &contextual.content);
        if !violations.is_empty() {
            return Err(blocked(FinalizeBlocked::ContextualInvalid { violations }));
        }

        // Only schema-required fields gate finalization; optional fields
        // may stay at their template placeholder.
        let unfilled = unfilled_required_fields(&contextual_schema, &contextual.content);
        if !unfilled.is_empty() {
            return Err(blocked(FinalizeBlocked::ContextualIncomplete { fields: unfilled }));
        }

        let already = RecordStore::read(&dataset.path, RecordType::CompleteMetadata)?.is_some();
        if already && !force {
            return Err(blocked(FinalizeBlocked::AlreadyFinalized));
        }

        // Gather components; project records come from the parent dir.
        let mut components = Content::new();
        let mut present = 0_usize;
        for record_type in AGGREGATE_COMPONENTS {
            let source_dir = match record_type.applies_to() {
                EntityKind::Project => match project_dir {
                    Some(dir) => dir.to_path_buf(),
                    None => continue,
                },
                EntityKind::Dataset => dataset.path.clone(),
            };
            match RecordStore::read(&source_dir, record_type)? {
                Some(stored) => {
                    components.insert(record_type.as_str().into(), Value::Object(stored.content));
                    present += 1;
                }
                None if REQUIRED_COMPONENTS.contains(&record_type) => {
                    return Err(blocked(FinalizeBlocked::MissingRecord { record_type }));
                }
                None => {}
            }
        }

        if already {
            let archived = RecordStore::archive_revision(&dataset.path)?;
            if let Some(path) = archived {
                info!(dataset_id = dataset.id, archive = %path.display(), "archived prior revision");
            }
        }

        let (total, filled) = field_fill_counts(&contextual.content);
        let mut aggregate = Content::new();
        aggregate.insert("schema_version".into(), "2.0".into());
        aggregate.insert("dataset_identifier".into(), dataset.id.clone().into());
        aggregate.insert("generated_date".into(), utc_now().into());
        aggregate.insert(
            "relationships".into(),
            json!({
                "project_identifier": dataset.parent_id.clone(),
                "dataset_identifier": dataset.id.clone(),
            }),
        );
        aggregate.insert("metadata_components".into(), Value::Object(components));
        aggregate.insert(
            "completeness".into(),
            json!({
                "components_present": present,
                "components_expected": AGGREGATE_COMPONENTS.len(),
                "contextual_fields_filled": filled,
                "contextual_fields_total": total,
            }),
        );

        let audit = AuditInfo::stamp_new(&self.actor);
        audit.apply_to(&mut aggregate);
        let mtime = RecordStore::write(
            &dataset.path,
            RecordType::CompleteMetadata,
            &aggregate,
            WritePrecondition::Absent,
        )?;
        self.emit(
            dataset,
            RecordType::CompleteMetadata,
            format!("finalized dataset ({present} components)"),
        );
        info!(dataset_id = dataset.id, components = present, force, "dataset finalized");

        let (_, schema_ref) = self
            .schemas
            .resolve(RecordType::CompleteMetadata.schema_id())
            .unwrap_or_else(|_| {
                // The aggregate is engine-issued; a missing aggregate
                // schema only affects provenance reporting.
                (
                    Arc::new(Value::Object(serde_json::Map::new())),
                    fairmeta_core::SchemaRef {
                        schema_id: RecordType::CompleteMetadata.schema_id().to_owned(),
                        source: fairmeta_core::SchemaSource::PackagedDefault,
                    },
                )
            });
        Ok(MetadataRecord {
            record_type: RecordType::CompleteMetadata,
            content: aggregate,
            schema_ref,
            audit,
            mtime: Some(mtime),
        })
    }

    /// Re-derive an entity's lifecycle position from its sidecar.
    ///
    /// # Errors
    ///
    /// Propagates record read failures (corrupt sidecar files).
    pub fn lifecycle_state(&self, entity: &Entity) -> MetaResult<LifecycleState> {
        if entity.kind == EntityKind::Project {
            // Projects do not finalize; they are initialized once their
            // descriptive record exists.
            return Ok(LifecycleState::Initialized);
        }
        if RecordStore::read(&entity.path, RecordType::CompleteMetadata)?.is_some() {
            return Ok(LifecycleState::Finalized);
        }
        if RecordStore::read(&entity.path, RecordType::ExperimentContextual)?.is_some() {
            return Ok(LifecycleState::ContextPending);
        }
        let ingested = RecordStore::read(&entity.path, RecordType::DatasetStructural)?
            .map(|s| !descriptors_from(&s.content).is_empty())
            .unwrap_or(false);
        if ingested {
            return Ok(LifecycleState::Ingested);
        }
        Ok(LifecycleState::Initialized)
    }

    /// Read one record with schema provenance attached.
    ///
    /// # Errors
    ///
    /// `RecordNotFound` when absent; read failures otherwise.
    pub fn get_record(&self, entity: &Entity, record_type: RecordType) -> MetaResult<MetadataRecord> {
        let Some(stored) = RecordStore::read(&entity.path, record_type)? else {
            return Err(MetaError::RecordNotFound {
                entity_id: entity.id.clone(),
                record_type,
            });
        };
        Ok(self.record_from_stored(record_type, stored))
    }

    fn template_for(&self, record_type: RecordType) -> MetaResult<Content> {
        let (schema_value, _) = self.schemas.resolve(record_type.schema_id())?;
        Ok(schema::template_from_schema(&schema_value))
    }

    /// Assemble an API record from a stored document, re-resolving where
    /// its governing schema currently lives.
    fn record_from_stored(
        &self,
        record_type: RecordType,
        stored: crate::store::StoredRecord,
    ) -> MetadataRecord {
        let audit = AuditInfo::from_content(&stored.content)
            .unwrap_or_else(|| AuditInfo::stamp_new(fairmeta_core::SYSTEM_ACTOR));
        let schema_id = if record_type == RecordType::ExperimentContextual {
            string_field(&stored.content, "experiment_template_type")
                .unwrap_or_else(|| record_type.schema_id().to_owned())
        } else {
            record_type.schema_id().to_owned()
        };
        let schema_ref = match self.schemas.resolve_info(&schema_id) {
            Ok(info) => SchemaRef {
                schema_id: info.schema_id,
                source: info.source,
            },
            // A record can outlive its schema; report the default tier.
            Err(_) => SchemaRef {
                schema_id,
                source: SchemaSource::PackagedDefault,
            },
        };
        MetadataRecord {
            record_type,
            content: stored.content,
            schema_ref,
            audit,
            mtime: Some(stored.mtime),
        }
    }

    /// The schema governing a contextual record: the template it was
    /// created from when `experiment_template_type` names one, otherwise
    /// the generic contextual schema.
    fn contextual_schema(&self, content: &Content) -> MetaResult<(Arc<Value>, SchemaRef)> {
        if let Some(template) = string_field(content, "experiment_template_type") {
            if let Ok(resolved) = self.schemas.resolve(&template) {
                return Ok(resolved);
            }
        }
        self.schemas.resolve(RecordType::ExperimentContextual.schema_id())
    }

    /// Stamp audit, validate, persist, in that order. Nothing reaches
    /// disk when validation fails. Creation provenance already present in
    /// the content is kept; modification fields always refresh to `actor`.
    fn write_validated(
        &self,
        entity: &Entity,
        record_type: RecordType,
        mut content: Content,
        precondition: WritePrecondition,
        actor: &str,
    ) -> MetaResult<MetadataRecord> {
        let mut audit = AuditInfo::from_content(&content)
            .unwrap_or_else(|| AuditInfo::stamp_new(actor));
        audit.refresh(actor);
        audit.apply_to(&mut content);

        let (schema_value, schema_ref) = if record_type == RecordType::ExperimentContextual {
            self.contextual_schema(&content)?
        } else {
            self.schemas.resolve(record_type.schema_id())?
        };
        let violations = schema::validate_document(&schema_value, &content);
        if !violations.is_empty() {
            return Err(MetaError::Validation {
                schema_id: schema_ref.schema_id,
                violations,
            });
        }

        let mtime = RecordStore::write(&entity.path, record_type, &content, precondition)?;
        Ok(MetadataRecord {
            record_type,
            content,
            schema_ref,
            audit,
            mtime: Some(mtime),
        })
    }
}

fn blocked(reason: FinalizeBlocked) -> MetaError {
    MetaError::FinalizationBlocked { reason }
}

/// Human-facing title derived from a directory name, prefix stripped and
/// separators spaced.
fn display_title(dir: &Path, prefix: &str) -> String {
    let name = dir
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    name.strip_prefix(prefix)
        .unwrap_or(name)
        .replace('_', " ")
}

fn string_field(content: &Content, key: &str) -> Option<String> {
    content.get(key).and_then(Value::as_str).map(str::to_owned)
}

fn descriptors_from(content: &Content) -> Vec<Value> {
    content
        .get("file_descriptions")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

/// Insert or replace a descriptor keyed by `relative_path`, preserving a
/// human-entered role and description across refreshes.
fn upsert_descriptor(descriptors: &mut Vec<Value>, fresh: fairmeta_core::FileDescriptor) -> bool {
    let mut fresh_value = serde_json::to_value(&fresh).unwrap_or(Value::Null);
    for existing in descriptors.iter_mut() {
        if existing.get("relative_path").and_then(Value::as_str) == Some(fresh.relative_path.as_str())
        {
            if let (Some(new_obj), Some(old_obj)) =
                (fresh_value.as_object_mut(), existing.as_object())
            {
                for key in ["role", "description"] {
                    if let Some(kept) = old_obj.get(key) {
                        if !kept.as_str().map(str::is_empty).unwrap_or(false) {
                            new_obj.insert(key.to_owned(), kept.clone());
                        }
                    }
                }
            }
            *existing = fresh_value;
            return true;
        }
    }
    descriptors.push(fresh_value);
    false
}

/// Whether the on-disk file still matches its stored descriptor (size
/// and mtime), making re-extraction unnecessary.
fn stat_matches_existing(dataset_dir: &Path, path: &Path, descriptors: &[Value]) -> bool {
    let relative = relative_to(dataset_dir, path);
    let Some(existing) = descriptors
        .iter()
        .find(|d| d.get("relative_path").and_then(Value::as_str) == Some(relative.as_str()))
    else {
        return false;
    };
    let Ok(existing) = serde_json::from_value::<FileDescriptor>(existing.clone()) else {
        return false;
    };
    let Ok(metadata) = fs::metadata(path) else {
        return false;
    };
    let Ok(modified) = metadata.modified() else {
        return false;
    };
    descriptor::reusable(&existing, metadata.len(), &utc_string(modified))
}

fn relative_to(base: &Path, path: &Path) -> String {
    path.strip_prefix(base)
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|_| path.to_string_lossy().into_owned())
}

/// Summary block derived from the descriptor list.
fn file_organization(descriptors: &[Value]) -> Value {
    let mut total_size = 0_u64;
    let mut by_type: serde_json::Map<String, Value> = serde_json::Map::new();
    for descriptor in descriptors {
        total_size += descriptor
            .get("size_bytes")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let ext = descriptor
            .get("extension")
            .and_then(Value::as_str)
            .filter(|e| !e.is_empty())
            .unwrap_or("none");
        let count = by_type.get(ext).and_then(Value::as_u64).unwrap_or(0);
        by_type.insert(ext.to_owned(), Value::from(count + 1));
    }
    json!({
        "file_count": descriptors.len(),
        "total_size_bytes": total_size,
        "file_types": by_type,
    })
}

/// A value counts as unfilled when it is null, an empty string or array,
/// or still the template placeholder.
fn value_is_unfilled(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty() || s == PLACEHOLDER,
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

/// The schema's `required` fields that are still unfilled in `content`.
/// Optional fields never appear here; only these gate finalization.
#[must_use]
pub fn unfilled_required_fields(schema: &Value, content: &Content) -> Vec<String> {
    let Some(required) = schema.get("required").and_then(Value::as_array) else {
        return Vec::new();
    };
    required
        .iter()
        .filter_map(Value::as_str)
        .filter(|name| content.get(*name).map_or(true, value_is_unfilled))
        .map(str::to_owned)
        .collect()
}

/// Exhaustive unfilled scan over every non-bookkeeping field, used for
/// completeness reporting (not gating).
#[must_use]
pub fn unfilled_fields(content: &Content) -> Vec<String> {
    let mut unfilled = Vec::new();
    scan_unfilled(content, "", &mut unfilled);
    unfilled
}

/// Completeness tally over the same field set `unfilled_fields` scans:
/// `(total, filled)` counts of non-bookkeeping leaf fields.
#[must_use]
pub fn field_fill_counts(content: &Content) -> (usize, usize) {
    let total = count_leaf_fields(content, true);
    let filled = total.saturating_sub(unfilled_fields(content).len());
    (total, filled)
}

fn count_leaf_fields(object: &Content, top_level: bool) -> usize {
    let mut count = 0;
    for (key, value) in object {
        if top_level && BOOKKEEPING_FIELDS.contains(&key.as_str()) {
            continue;
        }
        match value {
            Value::Object(map) => count += count_leaf_fields(map, false),
            _ => count += 1,
        }
    }
    count
}

fn scan_unfilled(object: &Content, prefix: &str, out: &mut Vec<String>) {
    for (key, value) in object {
        if prefix.is_empty() && BOOKKEEPING_FIELDS.contains(&key.as_str()) {
            continue;
        }
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            Value::Object(map) => scan_unfilled(map, &path, out),
            leaf if value_is_unfilled(leaf) => out.push(path),
            _ => {}
        }
    }
}
