use std::fmt;
use std::path::PathBuf;

use crate::types::RecordType;

/// One field-level schema violation: where it happened and what went wrong.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct FieldViolation {
    /// Dotted path into the document (e.g. `contributors.0.orcid`).
    pub path: String,
    /// Human-readable description of the violation.
    pub message: String,
}

impl fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Why a finalize request was refused.
///
/// Each variant names the exact missing or invalid precondition so the
/// caller can render actionable feedback; finalize never partially
/// aggregates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeBlocked {
    /// The dataset has no validated structural record with at least one
    /// file descriptor.
    NotIngested,
    /// No `experiment_contextual` record exists; request one first.
    MissingContextual,
    /// The contextual record exists but required fields are unfilled.
    ContextualIncomplete {
        /// Required fields that are empty, null, or still placeholders.
        fields: Vec<String>,
    },
    /// The contextual record exists but fails its schema.
    ContextualInvalid {
        /// Field-level violations from validation.
        violations: Vec<FieldViolation>,
    },
    /// A record the aggregate embeds is missing.
    MissingRecord {
        /// Which record type was not found.
        record_type: RecordType,
    },
    /// A `complete_metadata` record already exists; pass `force` to issue
    /// a new revision.
    AlreadyFinalized,
}

impl FinalizeBlocked {
    /// Stable machine-readable reason code.
    #[must_use]
    pub const fn reason_code(&self) -> &'static str {
        match self {
            Self::NotIngested => "not_ingested",
            Self::MissingContextual => "missing_contextual",
            Self::ContextualIncomplete { .. } => "contextual_incomplete",
            Self::ContextualInvalid { .. } => "contextual_invalid",
            Self::MissingRecord { .. } => "missing_record",
            Self::AlreadyFinalized => "already_finalized",
        }
    }
}

impl fmt::Display for FinalizeBlocked {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotIngested => {
                write!(f, "not_ingested: no validated file descriptors present")
            }
            Self::MissingContextual => {
                write!(f, "missing_contextual: no experiment_contextual record")
            }
            Self::ContextualIncomplete { fields } => {
                write!(f, "contextual_incomplete: unfilled fields {fields:?}")
            }
            Self::ContextualInvalid { violations } => {
                write!(f, "contextual_invalid: {} violation(s)", violations.len())
            }
            Self::MissingRecord { record_type } => {
                write!(f, "missing_record: {record_type} not found")
            }
            Self::AlreadyFinalized => write!(
                f,
                "already_finalized: complete_metadata exists; re-run with force to issue a new revision"
            ),
        }
    }
}

/// Unified error type covering every failure mode in the fairmeta engine.
///
/// Classification and descriptor errors are recorded and processing
/// continues for unaffected entities; validation and finalization errors
/// surface synchronously and never leave a partial write on disk.
#[derive(Debug, thiserror::Error)]
pub enum MetaError {
    // === Classification ===
    /// A dataset-prefixed folder was found with no enclosing project.
    #[error(
        "Orphan dataset at {path}: dataset folders must live inside a project (p_*) folder. Not ingested."
    )]
    OrphanDataset {
        /// The offending directory.
        path: PathBuf,
    },

    // === Schema resolution ===
    /// No schema definition exists in the override or packaged stores.
    #[error("Schema \"{schema_id}\" not found. Searched: {searched:?}")]
    SchemaNotFound {
        /// The logical schema name requested.
        schema_id: String,
        /// Every path that was checked, in resolution order.
        searched: Vec<PathBuf>,
    },

    /// A schema file exists but is not valid JSON.
    #[error("Schema file {path} is unreadable: {detail}. Fix or remove the override.")]
    SchemaInvalid {
        /// Path to the broken schema file.
        path: PathBuf,
        /// Parse failure detail.
        detail: String,
    },

    // === Record validation ===
    /// Document content failed schema validation; nothing was written.
    #[error("Validation against \"{schema_id}\" failed with {} violation(s); prior on-disk version retained", violations.len())]
    Validation {
        /// Schema the content was checked against.
        schema_id: String,
        /// Field-level violations (path + message).
        violations: Vec<FieldViolation>,
    },

    // === Lifecycle ===
    /// A finalize precondition is unmet; no aggregate was produced.
    #[error("Finalization blocked: {reason}")]
    FinalizationBlocked {
        /// The precise unmet precondition.
        reason: FinalizeBlocked,
    },

    /// Direct writes to an engine-issued record type are refused.
    #[error("{record_type} records are issued by the engine and cannot be written directly")]
    ImmutableRecord {
        /// The protected record type.
        record_type: RecordType,
    },

    // === Extraction ===
    /// A data file could not be read during descriptor extraction.
    #[error("Cannot extract descriptor for {path}: {source}. Remaining files in the batch still process.")]
    Descriptor {
        /// The unreadable file.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    // === Concurrency ===
    /// The record changed on disk between read and write of a merge.
    #[error("Concurrent write conflict on {path}: record changed since it was read. Re-read and retry.")]
    ConcurrentWriteConflict {
        /// The contested record file.
        path: PathBuf,
    },

    /// A work item exceeded its processing budget.
    #[error("{phase} timed out after {elapsed_ms}ms (budget: {budget_ms}ms); item requeued with backoff")]
    Timeout {
        /// Which phase was running.
        phase: String,
        /// Observed elapsed time.
        elapsed_ms: u64,
        /// Configured budget.
        budget_ms: u64,
    },

    /// The engine is draining and refuses new work.
    #[error("Engine is shutting down; in-flight writes are draining")]
    ShuttingDown,

    // === Lookup ===
    /// No registered entity carries the given id.
    #[error("Entity \"{entity_id}\" is not registered. Has its folder been scanned?")]
    EntityNotFound {
        /// The unknown id.
        entity_id: String,
    },

    /// The entity exists but the requested record does not.
    #[error("No {record_type} record for entity \"{entity_id}\"")]
    RecordNotFound {
        /// Owning entity id.
        entity_id: String,
        /// The absent record type.
        record_type: RecordType,
    },

    // === Ambient ===
    /// The filesystem watch backend failed.
    #[error("Watch backend error: {detail}")]
    Watch {
        /// Backend-reported detail.
        detail: String,
    },

    /// A configuration value is invalid.
    #[error("Invalid config: {field} = \"{value}\" — {reason}")]
    InvalidConfig {
        /// Which config field.
        field: String,
        /// The invalid value.
        value: String,
        /// Why it is invalid.
        reason: String,
    },

    /// A record file exists but does not parse as JSON.
    #[error("Record file {path} is corrupt or not JSON: {source}")]
    Json {
        /// The unreadable record file.
        path: PathBuf,
        /// The underlying parse error.
        #[source]
        source: serde_json::Error,
    },

    /// Wraps `std::io::Error` for file operations.
    #[error("I/O error: {0}. Check file permissions and disk space.")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the fairmeta crate hierarchy.
pub type MetaResult<T> = Result<T, MetaError>;

impl MetaError {
    /// Whether a failed work item should be retried with backoff rather
    /// than dropped.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Timeout { .. } | Self::ConcurrentWriteConflict { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<MetaError>();
    }

    #[test]
    fn io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: MetaError = io_err.into();
        assert!(matches!(err, MetaError::Io(_)));
        assert!(err.to_string().contains("gone"));
    }

    #[test]
    fn finalize_blocked_reason_codes_are_stable() {
        assert_eq!(FinalizeBlocked::NotIngested.reason_code(), "not_ingested");
        assert_eq!(
            FinalizeBlocked::AlreadyFinalized.reason_code(),
            "already_finalized"
        );
        assert_eq!(
            FinalizeBlocked::MissingRecord {
                record_type: RecordType::ExperimentContextual
            }
            .reason_code(),
            "missing_record"
        );
    }

    #[test]
    fn validation_error_counts_violations() {
        let err = MetaError::Validation {
            schema_id: "dataset_structural_schema".into(),
            violations: vec![
                FieldViolation {
                    path: "dataset_title".into(),
                    message: "expected string, got number".into(),
                },
                FieldViolation {
                    path: "file_descriptions".into(),
                    message: "required field missing".into(),
                },
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("2 violation(s)"));
        assert!(msg.contains("prior on-disk version retained"));
    }

    #[test]
    fn schema_not_found_lists_searched_paths() {
        let err = MetaError::SchemaNotFound {
            schema_id: "genomics_sequencing".into(),
            searched: vec![
                PathBuf::from("/data/.template_schemas/contextual/genomics_sequencing.json"),
                PathBuf::from("/pkg/contextual/genomics_sequencing.json"),
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("genomics_sequencing"));
        assert!(msg.contains(".template_schemas"));
    }

    #[test]
    fn orphan_dataset_message_is_actionable() {
        let err = MetaError::OrphanDataset {
            path: PathBuf::from("/data/d_stray"),
        };
        let msg = err.to_string();
        assert!(msg.contains("/data/d_stray"));
        assert!(msg.contains("p_*"), "should name the convention");
    }

    #[test]
    fn retryable_classification() {
        assert!(MetaError::Timeout {
            phase: "descriptor.extract".into(),
            elapsed_ms: 31_000,
            budget_ms: 30_000,
        }
        .is_retryable());
        assert!(MetaError::ConcurrentWriteConflict {
            path: PathBuf::from("/x"),
        }
        .is_retryable());
        assert!(!MetaError::FinalizationBlocked {
            reason: FinalizeBlocked::MissingContextual,
        }
        .is_retryable());
    }

    #[test]
    fn field_violation_display() {
        let violation = FieldViolation {
            path: "contributors.0.email".into(),
            message: "not one of the allowed values".into(),
        };
        assert_eq!(
            violation.to_string(),
            "contributors.0.email: not one of the allowed values"
        );
    }
}
