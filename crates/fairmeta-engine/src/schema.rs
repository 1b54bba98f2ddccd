//! Schema resolution, validation, and template synthesis.
//!
//! Schemas are plain JSON documents resolved from two stores: a local
//! override directory (wins) and the packaged defaults. Resolution is
//! cached per schema id and keyed on file mtime, so editing an override
//! takes effect on the next lookup without a restart.
//!
//! Validation covers the subset of JSON Schema the packaged set actually
//! uses: `type`, `required`, `const`, `enum`, nested `properties`, and
//! uniform `items`. Unknown keywords are ignored.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use fairmeta_core::{Content, FieldViolation, MetaError, MetaResult, SchemaRef, SchemaSource};
use serde_json::Value;
use tracing::debug;

/// Placeholder written into string fields of synthesized templates.
pub const PLACEHOLDER: &str = "To be filled";

/// Subdirectory (in both stores) holding experiment-type contextual
/// schemas.
pub const CONTEXTUAL_SUBDIR: &str = "contextual";

/// Where a schema id resolved to, without loading it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaInfo {
    pub schema_id: String,
    pub source: SchemaSource,
    pub path: PathBuf,
}

struct CacheEntry {
    path: PathBuf,
    source: SchemaSource,
    mtime: SystemTime,
    schema: Arc<Value>,
}

/// Two-tier schema store with mtime-validated caching.
pub struct SchemaStore {
    packaged_dir: PathBuf,
    override_dir: PathBuf,
    cache: RwLock<HashMap<String, CacheEntry>>,
}

impl SchemaStore {
    #[must_use]
    pub fn new(packaged_dir: PathBuf, override_dir: PathBuf) -> Self {
        Self {
            packaged_dir,
            override_dir,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Candidate paths for a schema id, in resolution order.
    fn candidates(&self, schema_id: &str) -> [(PathBuf, SchemaSource); 4] {
        let file = format!("{schema_id}.json");
        [
            (self.override_dir.join(&file), SchemaSource::LocalOverride),
            (
                self.override_dir.join(CONTEXTUAL_SUBDIR).join(&file),
                SchemaSource::LocalOverride,
            ),
            (self.packaged_dir.join(&file), SchemaSource::PackagedDefault),
            (
                self.packaged_dir.join(CONTEXTUAL_SUBDIR).join(&file),
                SchemaSource::PackagedDefault,
            ),
        ]
    }

    /// Locate a schema without loading its contents.
    ///
    /// # Errors
    ///
    /// Returns `MetaError::SchemaNotFound` listing every searched path.
    pub fn resolve_info(&self, schema_id: &str) -> MetaResult<SchemaInfo> {
        let candidates = self.candidates(schema_id);
        for (path, source) in &candidates {
            if path.is_file() {
                return Ok(SchemaInfo {
                    schema_id: schema_id.to_owned(),
                    source: *source,
                    path: path.clone(),
                });
            }
        }
        Err(MetaError::SchemaNotFound {
            schema_id: schema_id.to_owned(),
            searched: candidates.into_iter().map(|(p, _)| p).collect(),
        })
    }

    /// Resolve and load a schema, reusing the cache when the backing file
    /// is unchanged.
    ///
    /// # Errors
    ///
    /// `SchemaNotFound` when no candidate exists, `SchemaInvalid` when the
    /// file does not parse as a JSON object.
    pub fn resolve(&self, schema_id: &str) -> MetaResult<(Arc<Value>, SchemaRef)> {
        let info = self.resolve_info(schema_id)?;
        let mtime = fs::metadata(&info.path)?.modified()?;

        if let Ok(cache) = self.cache.read() {
            if let Some(entry) = cache.get(schema_id) {
                if entry.path == info.path && entry.mtime == mtime {
                    return Ok((
                        Arc::clone(&entry.schema),
                        SchemaRef {
                            schema_id: schema_id.to_owned(),
                            source: entry.source,
                        },
                    ));
                }
            }
        }

        let raw = fs::read_to_string(&info.path)?;
        let parsed: Value = serde_json::from_str(&raw).map_err(|error| MetaError::SchemaInvalid {
            path: info.path.clone(),
            detail: error.to_string(),
        })?;
        if !parsed.is_object() {
            return Err(MetaError::SchemaInvalid {
                path: info.path.clone(),
                detail: "top-level value must be a JSON object".into(),
            });
        }
        debug!(schema_id, path = %info.path.display(), source = %info.source, "loaded schema");

        let schema = Arc::new(parsed);
        if let Ok(mut cache) = self.cache.write() {
            cache.insert(
                schema_id.to_owned(),
                CacheEntry {
                    path: info.path,
                    source: info.source,
                    mtime,
                    schema: Arc::clone(&schema),
                },
            );
        }
        Ok((
            schema,
            SchemaRef {
                schema_id: schema_id.to_owned(),
                source: info.source,
            },
        ))
    }

    /// Every schema id visible through the store, override entries
    /// shadowing packaged ones of the same id.
    #[must_use]
    pub fn list_available(&self) -> Vec<SchemaInfo> {
        let mut seen: HashMap<String, SchemaInfo> = HashMap::new();
        // Packaged first so overrides replace them.
        for (dir, source) in [
            (&self.packaged_dir, SchemaSource::PackagedDefault),
            (&self.override_dir, SchemaSource::LocalOverride),
        ] {
            collect_schema_ids(dir, source, &mut seen);
            collect_schema_ids(&dir.join(CONTEXTUAL_SUBDIR), source, &mut seen);
        }
        let mut infos: Vec<SchemaInfo> = seen.into_values().collect();
        infos.sort_by(|a, b| a.schema_id.cmp(&b.schema_id));
        infos
    }
}

fn collect_schema_ids(dir: &Path, source: SchemaSource, out: &mut HashMap<String, SchemaInfo>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        out.insert(
            stem.to_owned(),
            SchemaInfo {
                schema_id: stem.to_owned(),
                source,
                path,
            },
        );
    }
}

/// Check a document against a schema, collecting every violation rather
/// than stopping at the first.
#[must_use]
pub fn validate_document(schema: &Value, content: &Content) -> Vec<FieldViolation> {
    let mut violations = Vec::new();
    validate_object(schema, content, "", &mut violations);
    violations
}

fn validate_object(schema: &Value, object: &Content, prefix: &str, out: &mut Vec<FieldViolation>) {
    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for name in required.iter().filter_map(Value::as_str) {
            if !object.contains_key(name) {
                out.push(FieldViolation {
                    path: join_path(prefix, name),
                    message: "required field missing".into(),
                });
            }
        }
    }

    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return;
    };
    for (name, prop_schema) in properties {
        if let Some(value) = object.get(name) {
            validate_value(prop_schema, value, &join_path(prefix, name), out);
        }
    }
}

fn validate_value(schema: &Value, value: &Value, path: &str, out: &mut Vec<FieldViolation>) {
    if let Some(expected) = schema.get("const") {
        if value != expected {
            out.push(FieldViolation {
                path: path.to_owned(),
                message: format!("must equal {expected}"),
            });
            return;
        }
    }

    if let Some(allowed) = schema.get("enum").and_then(Value::as_array) {
        if !allowed.contains(value) {
            out.push(FieldViolation {
                path: path.to_owned(),
                message: "not one of the allowed values".into(),
            });
            return;
        }
    }

    if let Some(type_name) = schema.get("type").and_then(Value::as_str) {
        if !type_matches(type_name, value) {
            out.push(FieldViolation {
                path: path.to_owned(),
                message: format!("expected {type_name}, got {}", type_name_of(value)),
            });
            return;
        }
    }

    match value {
        Value::Object(map) => validate_object(schema, map, path, out),
        Value::Array(items) => {
            if let Some(item_schema) = schema.get("items") {
                for (index, item) in items.iter().enumerate() {
                    validate_value(item_schema, item, &format!("{path}.{index}"), out);
                }
            }
        }
        _ => {}
    }
}

fn join_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_owned()
    } else {
        format!("{prefix}.{name}")
    }
}

fn type_matches(type_name: &str, value: &Value) -> bool {
    match type_name {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn type_name_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Synthesize a fill-in template document from a schema.
///
/// Fixed values (`const`) are written as-is, enums take their first
/// member, strings get the placeholder, numerics zero, booleans false,
/// arrays empty, and nested objects recurse. Property order follows the
/// schema so templates read like their schema.
#[must_use]
pub fn template_from_schema(schema: &Value) -> Content {
    let mut template = Content::new();
    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return template;
    };
    for (name, prop_schema) in properties {
        template.insert(name.clone(), template_value(prop_schema));
    }
    template
}

fn template_value(schema: &Value) -> Value {
    if let Some(fixed) = schema.get("const") {
        return fixed.clone();
    }
    if let Some(first) = schema
        .get("enum")
        .and_then(Value::as_array)
        .and_then(|a| a.first())
    {
        return first.clone();
    }
    match schema.get("type").and_then(Value::as_str) {
        Some("string") => Value::String(PLACEHOLDER.to_owned()),
        Some("integer") => Value::from(0),
        Some("number") => Value::from(0.0),
        Some("boolean") => Value::Bool(false),
        Some("array") => Value::Array(Vec::new()),
        Some("object") => Value::Object(template_from_schema(schema)),
        _ => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store(tmp: &tempfile::TempDir) -> SchemaStore {
        let packaged = tmp.path().join("packaged_schemas");
        let overrides = tmp.path().join(".template_schemas");
        fs::create_dir_all(packaged.join(CONTEXTUAL_SUBDIR)).expect("packaged dirs");
        fs::create_dir_all(&overrides).expect("override dir");
        SchemaStore::new(packaged, overrides)
    }

    fn write_schema(dir: &Path, name: &str, schema: &Value) {
        fs::write(
            dir.join(format!("{name}.json")),
            serde_json::to_string_pretty(schema).expect("serialize"),
        )
        .expect("write schema");
    }

    #[test]
    fn packaged_schema_resolves_when_no_override() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = store(&tmp);
        write_schema(
            &tmp.path().join("packaged_schemas"),
            "dataset_structural_schema",
            &json!({"type": "object", "properties": {}}),
        );

        let (_, schema_ref) = store.resolve("dataset_structural_schema").expect("resolve");
        assert_eq!(schema_ref.source, SchemaSource::PackagedDefault);
    }

    #[test]
    fn override_shadows_packaged() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = store(&tmp);
        write_schema(
            &tmp.path().join("packaged_schemas"),
            "project_descriptive",
            &json!({"properties": {"title": {"type": "string"}}}),
        );
        write_schema(
            &tmp.path().join(".template_schemas"),
            "project_descriptive",
            &json!({"properties": {"title": {"type": "string"}, "extra": {"type": "boolean"}}}),
        );

        let (schema, schema_ref) = store.resolve("project_descriptive").expect("resolve");
        assert_eq!(schema_ref.source, SchemaSource::LocalOverride);
        assert!(schema["properties"].get("extra").is_some());

        // Removing the override falls back on the very next resolution.
        fs::remove_file(
            tmp.path()
                .join(".template_schemas")
                .join("project_descriptive.json"),
        )
        .expect("remove override");
        let (schema, schema_ref) = store.resolve("project_descriptive").expect("re-resolve");
        assert_eq!(schema_ref.source, SchemaSource::PackagedDefault);
        assert!(schema["properties"].get("extra").is_none());
    }

    #[test]
    fn contextual_subdir_is_searched() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = store(&tmp);
        write_schema(
            &tmp.path().join("packaged_schemas").join(CONTEXTUAL_SUBDIR),
            "genomics_sequencing",
            &json!({"properties": {"platform": {"type": "string"}}}),
        );
        let info = store.resolve_info("genomics_sequencing").expect("resolve");
        assert_eq!(info.source, SchemaSource::PackagedDefault);
        assert!(info.path.ends_with("contextual/genomics_sequencing.json"));
    }

    #[test]
    fn missing_schema_lists_searched_paths() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = store(&tmp);
        let err = store.resolve("no_such_schema").expect_err("missing");
        let MetaError::SchemaNotFound { searched, .. } = err else {
            panic!("expected SchemaNotFound");
        };
        assert_eq!(searched.len(), 4);
    }

    #[test]
    fn cache_reloads_when_file_changes() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = store(&tmp);
        let packaged = tmp.path().join("packaged_schemas");
        write_schema(&packaged, "s", &json!({"properties": {"a": {"type": "string"}}}));
        let (first, _) = store.resolve("s").expect("first");
        assert!(first["properties"].get("a").is_some());

        // Sleep past coarse mtime granularity so the rewrite is visibly
        // newer, then resolve again.
        std::thread::sleep(std::time::Duration::from_millis(50));
        write_schema(&packaged, "s", &json!({"properties": {"b": {"type": "string"}}}));

        let (second, _) = store.resolve("s").expect("second");
        assert!(second["properties"].get("b").is_some());
    }

    #[test]
    fn broken_schema_reports_invalid() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = store(&tmp);
        fs::write(
            tmp.path().join("packaged_schemas").join("bad.json"),
            b"{ not json",
        )
        .expect("write");
        let err = store.resolve("bad").expect_err("broken");
        assert!(matches!(err, MetaError::SchemaInvalid { .. }));
    }

    #[test]
    fn list_available_shadows_by_id() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = store(&tmp);
        write_schema(
            &tmp.path().join("packaged_schemas"),
            "x",
            &json!({"properties": {}}),
        );
        write_schema(
            &tmp.path().join(".template_schemas"),
            "x",
            &json!({"properties": {}}),
        );
        write_schema(
            &tmp.path().join("packaged_schemas").join(CONTEXTUAL_SUBDIR),
            "y",
            &json!({"properties": {}}),
        );

        let infos = store.list_available();
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].schema_id, "x");
        assert_eq!(infos[0].source, SchemaSource::LocalOverride);
        assert_eq!(infos[1].schema_id, "y");
    }

    #[test]
    fn validator_collects_all_violations() {
        let schema = json!({
            "required": ["title", "count"],
            "properties": {
                "title": {"type": "string"},
                "count": {"type": "integer"},
                "status": {"enum": ["draft", "final"]},
                "version": {"const": "2.0"}
            }
        });
        let content: Content = serde_json::from_value(json!({
            "title": 7,
            "status": "published",
            "version": "1.0"
        }))
        .expect("content");

        let mut violations = validate_document(&schema, &content);
        violations.sort_by(|a, b| a.path.cmp(&b.path));
        let paths: Vec<&str> = violations.iter().map(|v| v.path.as_str()).collect();
        assert_eq!(paths, vec!["count", "status", "title", "version"]);
    }

    #[test]
    fn validator_recurses_into_objects_and_arrays() {
        let schema = json!({
            "properties": {
                "contact": {
                    "type": "object",
                    "required": ["email"],
                    "properties": {"email": {"type": "string"}}
                },
                "tags": {
                    "type": "array",
                    "items": {"type": "string"}
                }
            }
        });
        let content: Content = serde_json::from_value(json!({
            "contact": {"name": "a"},
            "tags": ["ok", 3]
        }))
        .expect("content");

        let violations = validate_document(&schema, &content);
        let paths: Vec<&str> = violations.iter().map(|v| v.path.as_str()).collect();
        assert!(paths.contains(&"contact.email"));
        assert!(paths.contains(&"tags.1"));
    }

    #[test]
    fn valid_document_has_no_violations() {
        let schema = json!({
            "required": ["title"],
            "properties": {"title": {"type": "string"}}
        });
        let content: Content =
            serde_json::from_value(json!({"title": "ok", "unmodeled": 42})).expect("content");
        assert!(validate_document(&schema, &content).is_empty());
    }

    #[test]
    fn template_synthesis_covers_value_kinds() {
        let schema = json!({
            "properties": {
                "schema_version": {"const": "2.0"},
                "status": {"enum": ["draft", "final"]},
                "title": {"type": "string"},
                "count": {"type": "integer"},
                "ratio": {"type": "number"},
                "public": {"type": "boolean"},
                "tags": {"type": "array"},
                "contact": {
                    "type": "object",
                    "properties": {"email": {"type": "string"}}
                }
            }
        });
        let template = template_from_schema(&schema);
        assert_eq!(template["schema_version"], "2.0");
        assert_eq!(template["status"], "draft");
        assert_eq!(template["title"], PLACEHOLDER);
        assert_eq!(template["count"], 0);
        assert_eq!(template["public"], false);
        assert_eq!(template["tags"], json!([]));
        assert_eq!(template["contact"]["email"], PLACEHOLDER);
        // Order follows the schema.
        let keys: Vec<&str> = template.keys().map(String::as_str).collect();
        assert_eq!(keys[0], "schema_version");
        assert_eq!(keys[keys.len() - 1], "contact");
    }
}
