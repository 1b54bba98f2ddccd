//! Sidecar record persistence.
//!
//! Every record write is atomic: serialize to a uniquely named temp file
//! in the sidecar directory, fsync, rename over the target, fsync the
//! directory. Readers of the sidecar (humans, git, external tooling)
//! never observe a partially written document.

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use fairmeta_core::{Content, MetaError, MetaResult, RecordType};
use serde::Serialize as _;
use tracing::{debug, warn};

use crate::classify::SIDECAR_DIR;

const TMP_PREFIX: &str = ".tmp.";

/// A record document as read from disk, with its concurrency token.
#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub content: Content,
    /// File mtime at read. Passed back via
    /// `WritePrecondition::UnchangedSince` for read-modify-write flows.
    pub mtime: SystemTime,
}

/// Guard applied before a write replaces what is on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePrecondition {
    /// Replace whatever is there.
    Any,
    /// The record must not exist yet.
    Absent,
    /// The record must still carry this mtime (optimistic concurrency).
    UnchangedSince(SystemTime),
}

/// Stateless persistence layer for one entity's sidecar.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordStore;

impl RecordStore {
    /// The sidecar directory of an entity.
    #[must_use]
    pub fn sidecar_dir(entity_path: &Path) -> PathBuf {
        entity_path.join(SIDECAR_DIR)
    }

    /// On-disk path of one record.
    #[must_use]
    pub fn record_path(entity_path: &Path, record_type: RecordType) -> PathBuf {
        Self::sidecar_dir(entity_path).join(record_type.file_name())
    }

    /// Read a record if present.
    ///
    /// # Errors
    ///
    /// `MetaError::Json` when the file exists but does not parse; I/O
    /// errors otherwise.
    pub fn read(entity_path: &Path, record_type: RecordType) -> MetaResult<Option<StoredRecord>> {
        let path = Self::record_path(entity_path, record_type);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(error.into()),
        };
        let content: Content = serde_json::from_str(&raw).map_err(|source| MetaError::Json {
            path: path.clone(),
            source,
        })?;
        let mtime = fs::metadata(&path)?.modified()?;
        Ok(Some(StoredRecord { content, mtime }))
    }

    /// Atomically persist a record, enforcing the precondition.
    ///
    /// Returns the new on-disk mtime.
    ///
    /// # Errors
    ///
    /// `MetaError::ConcurrentWriteConflict` when the precondition fails;
    /// I/O errors from the write path.
    pub fn write(
        entity_path: &Path,
        record_type: RecordType,
        content: &Content,
        precondition: WritePrecondition,
    ) -> MetaResult<SystemTime> {
        let sidecar = Self::sidecar_dir(entity_path);
        fs::create_dir_all(&sidecar)?;
        let target = sidecar.join(record_type.file_name());

        check_precondition(&target, precondition)?;

        let tmp = sidecar.join(format!(
            "{TMP_PREFIX}{}.{}",
            std::process::id(),
            crate::watcher::now_millis()
        ));
        let bytes = to_pretty_json(content)?;
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.write_all(b"\n")?;
            file.sync_all()?;
        }
        if let Err(error) = fs::rename(&tmp, &target) {
            let _ = fs::remove_file(&tmp);
            return Err(error.into());
        }
        sync_directory(&sidecar);

        let mtime = fs::metadata(&target)?.modified()?;
        debug!(path = %target.display(), "record persisted");
        Ok(mtime)
    }

    /// Delete a record if present. Returns whether anything was removed.
    ///
    /// # Errors
    ///
    /// Propagates I/O errors other than the file already being gone.
    pub fn remove(entity_path: &Path, record_type: RecordType) -> MetaResult<bool> {
        let path = Self::record_path(entity_path, record_type);
        match fs::remove_file(&path) {
            Ok(()) => {
                sync_directory(&Self::sidecar_dir(entity_path));
                Ok(true)
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(error) => Err(error.into()),
        }
    }

    /// Move the current `complete_metadata.json` aside as the next
    /// `complete_metadata.v<N>.json` revision.
    ///
    /// Returns the archive path, or `None` when there was nothing to
    /// archive.
    ///
    /// # Errors
    ///
    /// Propagates I/O errors from the rename.
    pub fn archive_revision(entity_path: &Path) -> MetaResult<Option<PathBuf>> {
        let sidecar = Self::sidecar_dir(entity_path);
        let current = sidecar.join(RecordType::CompleteMetadata.file_name());
        if !current.is_file() {
            return Ok(None);
        }

        let next = next_revision_number(&sidecar)?;
        let archive = sidecar.join(format!("complete_metadata.v{next}.json"));
        fs::rename(&current, &archive)?;
        sync_directory(&sidecar);
        debug!(path = %archive.display(), "archived finalized revision");
        Ok(Some(archive))
    }

    /// Remove temp files left behind by a crashed writer.
    ///
    /// # Errors
    ///
    /// Propagates directory read errors; individual unlink failures are
    /// logged and skipped.
    pub fn sweep_orphan_temps(entity_path: &Path) -> MetaResult<usize> {
        let sidecar = Self::sidecar_dir(entity_path);
        let entries = match fs::read_dir(&sidecar) {
            Ok(entries) => entries,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(error) => return Err(error.into()),
        };

        let mut swept = 0_usize;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with(TMP_PREFIX) {
                continue;
            }
            match fs::remove_file(entry.path()) {
                Ok(()) => swept += 1,
                Err(error) => {
                    warn!(path = %entry.path().display(), %error, "could not sweep temp file");
                }
            }
        }
        Ok(swept)
    }
}

fn check_precondition(target: &Path, precondition: WritePrecondition) -> MetaResult<()> {
    match precondition {
        WritePrecondition::Any => Ok(()),
        WritePrecondition::Absent => {
            if target.exists() {
                Err(MetaError::ConcurrentWriteConflict {
                    path: target.to_path_buf(),
                })
            } else {
                Ok(())
            }
        }
        WritePrecondition::UnchangedSince(expected) => {
            let actual = fs::metadata(target)?.modified()?;
            if actual == expected {
                Ok(())
            } else {
                Err(MetaError::ConcurrentWriteConflict {
                    path: target.to_path_buf(),
                })
            }
        }
    }
}

/// Serialize with four-space indentation, matching the documents humans
/// and external tooling already have in their sidecars.
fn to_pretty_json(content: &Content) -> MetaResult<Vec<u8>> {
    let mut bytes = Vec::with_capacity(1024);
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut bytes, formatter);
    content
        .serialize(&mut serializer)
        .map_err(|source| MetaError::Json {
            path: PathBuf::new(),
            source,
        })?;
    Ok(bytes)
}

/// Fsync a directory so a completed rename survives power loss. Best
/// effort on platforms where directories cannot be opened for sync.
fn sync_directory(dir: &Path) {
    if let Ok(handle) = fs::File::open(dir) {
        let _ = handle.sync_all();
    }
}

fn next_revision_number(sidecar: &Path) -> MetaResult<u32> {
    let mut max_seen = 0_u32;
    for entry in fs::read_dir(sidecar)?.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(rest) = name.strip_prefix("complete_metadata.v") else {
            continue;
        };
        let Some(digits) = rest.strip_suffix(".json") else {
            continue;
        };
        if let Ok(n) = digits.parse::<u32>() {
            max_seen = max_seen.max(n);
        }
    }
    Ok(max_seen + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn content(value: serde_json::Value) -> Content {
        serde_json::from_value(value).expect("object")
    }

    #[test]
    fn write_then_read_round_trip() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let entity = tmp.path().join("d_a");
        fs::create_dir_all(&entity).expect("entity dir");

        let doc = content(json!({"dataset_title": "CohortA", "file_descriptions": []}));
        RecordStore::write(
            &entity,
            RecordType::DatasetStructural,
            &doc,
            WritePrecondition::Absent,
        )
        .expect("write");

        let stored = RecordStore::read(&entity, RecordType::DatasetStructural)
            .expect("read")
            .expect("present");
        assert_eq!(stored.content, doc);
        assert!(RecordStore::record_path(&entity, RecordType::DatasetStructural).is_file());
    }

    #[test]
    fn read_absent_record_is_none() {
        let tmp = tempfile::tempdir().expect("tempdir");
        assert!(RecordStore::read(tmp.path(), RecordType::ProjectDescriptive)
            .expect("read")
            .is_none());
    }

    #[test]
    fn output_uses_four_space_indent_and_trailing_newline() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let entity = tmp.path().join("d_a");
        let doc = content(json!({"k": {"nested": 1}}));
        RecordStore::write(&entity, RecordType::DatasetStructural, &doc, WritePrecondition::Any)
            .expect("write");

        let raw = fs::read_to_string(RecordStore::record_path(&entity, RecordType::DatasetStructural))
            .expect("raw");
        assert!(raw.contains("\n    \"k\""), "raw was: {raw}");
        assert!(raw.ends_with('\n'));
    }

    #[test]
    fn absent_precondition_refuses_existing_file() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let entity = tmp.path().join("d_a");
        let doc = content(json!({"a": 1}));
        RecordStore::write(&entity, RecordType::DatasetStructural, &doc, WritePrecondition::Absent)
            .expect("first");
        let err = RecordStore::write(
            &entity,
            RecordType::DatasetStructural,
            &doc,
            WritePrecondition::Absent,
        )
        .expect_err("second must conflict");
        assert!(matches!(err, MetaError::ConcurrentWriteConflict { .. }));
    }

    #[test]
    fn stale_mtime_precondition_conflicts() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let entity = tmp.path().join("d_a");
        RecordStore::write(
            &entity,
            RecordType::DatasetStructural,
            &content(json!({"v": 1})),
            WritePrecondition::Any,
        )
        .expect("v1");
        let stale = RecordStore::read(&entity, RecordType::DatasetStructural)
            .expect("read")
            .expect("present")
            .mtime;

        std::thread::sleep(std::time::Duration::from_millis(50));
        RecordStore::write(
            &entity,
            RecordType::DatasetStructural,
            &content(json!({"v": 2})),
            WritePrecondition::Any,
        )
        .expect("v2");

        let err = RecordStore::write(
            &entity,
            RecordType::DatasetStructural,
            &content(json!({"v": 3})),
            WritePrecondition::UnchangedSince(stale),
        )
        .expect_err("stale token");
        assert!(matches!(err, MetaError::ConcurrentWriteConflict { .. }));

        // The losing write left the winner intact.
        let kept = RecordStore::read(&entity, RecordType::DatasetStructural)
            .expect("read")
            .expect("present");
        assert_eq!(kept.content, content(json!({"v": 2})));
    }

    #[test]
    fn matching_mtime_precondition_succeeds() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let entity = tmp.path().join("d_a");
        RecordStore::write(
            &entity,
            RecordType::DatasetStructural,
            &content(json!({"v": 1})),
            WritePrecondition::Any,
        )
        .expect("v1");
        let token = RecordStore::read(&entity, RecordType::DatasetStructural)
            .expect("read")
            .expect("present")
            .mtime;
        RecordStore::write(
            &entity,
            RecordType::DatasetStructural,
            &content(json!({"v": 2})),
            WritePrecondition::UnchangedSince(token),
        )
        .expect("token still valid");
    }

    #[test]
    fn archive_revision_numbers_monotonically() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let entity = tmp.path().join("d_a");
        RecordStore::write(
            &entity,
            RecordType::CompleteMetadata,
            &content(json!({"rev": 1})),
            WritePrecondition::Any,
        )
        .expect("first");

        let archived = RecordStore::archive_revision(&entity)
            .expect("archive")
            .expect("had current");
        assert!(archived.ends_with("complete_metadata.v1.json"));
        assert!(!RecordStore::record_path(&entity, RecordType::CompleteMetadata).exists());

        RecordStore::write(
            &entity,
            RecordType::CompleteMetadata,
            &content(json!({"rev": 2})),
            WritePrecondition::Any,
        )
        .expect("second");
        let archived = RecordStore::archive_revision(&entity)
            .expect("archive")
            .expect("had current");
        assert!(archived.ends_with("complete_metadata.v2.json"));

        assert!(RecordStore::archive_revision(&entity).expect("none").is_none());
    }

    #[test]
    fn sweep_removes_only_temp_files() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let entity = tmp.path().join("d_a");
        let sidecar = RecordStore::sidecar_dir(&entity);
        fs::create_dir_all(&sidecar).expect("sidecar");
        fs::write(sidecar.join(".tmp.1234.99"), b"{").expect("orphan");
        fs::write(sidecar.join("dataset_structural.json"), b"{}").expect("real");

        assert_eq!(RecordStore::sweep_orphan_temps(&entity).expect("sweep"), 1);
        assert!(sidecar.join("dataset_structural.json").is_file());
        assert_eq!(RecordStore::sweep_orphan_temps(&entity).expect("sweep"), 0);
    }

    #[test]
    fn corrupt_record_reports_json_error() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let entity = tmp.path().join("d_a");
        let sidecar = RecordStore::sidecar_dir(&entity);
        fs::create_dir_all(&sidecar).expect("sidecar");
        fs::write(sidecar.join("dataset_structural.json"), b"{ nope").expect("corrupt");

        let err = RecordStore::read(&entity, RecordType::DatasetStructural)
            .expect_err("corrupt");
        assert!(matches!(err, MetaError::Json { .. }));
    }
}
