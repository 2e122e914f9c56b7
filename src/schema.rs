//! JSON Schema validation for tool payloads.
//!
//! Compiling a schema is far more expensive than checking an instance against
//! it, so compiled validators are cached by the schema's canonical
//! serialisation. Entries older than the configured TTL are recompiled on
//! their next use.
//!
//! Redundant concurrent compiles of the same schema are tolerated: both
//! writers insert equivalent validators and the last one wins.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use jsonschema::error::ValidationErrorKind;
use jsonschema::paths::PathChunk;
use jsonschema::{Draft, JSONSchema, ValidationError};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{FieldError, SchemaError};

/// Dialect marker written into upgraded legacy schemas.
pub const SCHEMA_DIALECT: &str = "http://json-schema.org/draft-07/schema#";

/// Outcome of validating one payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    /// Whether the payload satisfied the schema.
    pub valid: bool,
    /// Field-level violations (empty when valid).
    pub errors: Vec<FieldError>,
}

impl ValidationReport {
    fn ok() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
        }
    }
}

struct CacheEntry {
    validator: Arc<JSONSchema>,
    compiled_at: Instant,
}

/// Compiles, caches and applies JSON schemas.
pub struct SchemaValidator {
    cache: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
}

impl SchemaValidator {
    /// Creates a validator whose cache entries live for `ttl`.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Validates tool arguments against the tool's input schema.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::Compile`] if the schema itself is invalid.
    pub fn validate_input(
        &self,
        schema: &Value,
        arguments: &Value,
    ) -> Result<ValidationReport, SchemaError> {
        self.check(schema, arguments)
    }

    /// Validates a tool result against the tool's output schema.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::Compile`] if the schema itself is invalid.
    pub fn validate_output(
        &self,
        schema: &Value,
        result: &Value,
    ) -> Result<ValidationReport, SchemaError> {
        self.check(schema, result)
    }

    /// Accepts a tool's declared input schema.
    ///
    /// Legacy schemas are upgraded first; the result must then carry a
    /// `$schema` marker, `type: "object"`, and an object-valued
    /// `properties` (when present), and must compile.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::MissingMetadata`] or [`SchemaError::Compile`].
    pub fn validate_tool_schema(&self, schema: &Value) -> Result<Value, SchemaError> {
        let schema = upgrade_legacy_schema(schema);
        let Some(obj) = schema.as_object() else {
            return Err(SchemaError::MissingMetadata(
                "schema must be a JSON object".to_string(),
            ));
        };

        if !obj.get("$schema").is_some_and(Value::is_string) {
            return Err(SchemaError::MissingMetadata("$schema".to_string()));
        }
        if obj.get("type").and_then(Value::as_str) != Some("object") {
            return Err(SchemaError::MissingMetadata(
                "type must be \"object\"".to_string(),
            ));
        }
        if obj.get("properties").is_some_and(|p| !p.is_object()) {
            return Err(SchemaError::MissingMetadata(
                "properties must be an object".to_string(),
            ));
        }

        self.compiled(&schema)?;
        Ok(schema)
    }

    /// Drops every cached validator.
    pub fn clear_cache(&self) {
        self.cache.write().clear();
    }

    /// Number of cached validators, stale ones included.
    #[must_use]
    pub fn cache_len(&self) -> usize {
        self.cache.read().len()
    }

    fn check(&self, schema: &Value, instance: &Value) -> Result<ValidationReport, SchemaError> {
        let schema = upgrade_legacy_schema(schema);
        let validator = self.compiled(&schema)?;

        let report = match validator.validate(instance) {
            Ok(()) => ValidationReport::ok(),
            Err(errors) => ValidationReport {
                valid: false,
                errors: errors.map(|e| to_field_error(&e, instance)).collect(),
            },
        };
        Ok(report)
    }

    fn compiled(&self, schema: &Value) -> Result<Arc<JSONSchema>, SchemaError> {
        let key = canonical_json(schema);

        if let Some(entry) = self.cache.read().get(&key) {
            if entry.compiled_at.elapsed() < self.ttl {
                return Ok(Arc::clone(&entry.validator));
            }
        }

        let validator = JSONSchema::options()
            .with_draft(Draft::Draft7)
            .compile(schema)
            .map_err(|e| SchemaError::Compile(e.to_string()))?;
        let validator = Arc::new(validator);

        tracing::trace!(schema_bytes = key.len(), "Compiled schema");
        self.cache.write().insert(
            key,
            CacheEntry {
                validator: Arc::clone(&validator),
                compiled_at: Instant::now(),
            },
        );
        Ok(validator)
    }
}

impl Default for SchemaValidator {
    fn default() -> Self {
        Self::new(Duration::from_secs(3600))
    }
}

/// Upgrades a schema that lacks a `$schema` dialect marker.
///
/// Fills `type: "object"`, `required: []` and `additionalProperties: false`
/// unless already set. Modern schemas are returned unchanged.
#[must_use]
pub fn upgrade_legacy_schema(schema: &Value) -> Value {
    let Some(obj) = schema.as_object() else {
        return schema.clone();
    };
    if obj.contains_key("$schema") {
        return schema.clone();
    }

    let mut upgraded = obj.clone();
    upgraded.insert("$schema".to_string(), Value::from(SCHEMA_DIALECT));
    upgraded
        .entry("type")
        .or_insert_with(|| Value::from("object"));
    upgraded
        .entry("required")
        .or_insert_with(|| Value::Array(Vec::new()));
    upgraded
        .entry("additionalProperties")
        .or_insert(Value::Bool(false));
    Value::Object(upgraded)
}

/// Serialises a value with object keys sorted at every level.
#[must_use]
pub fn canonical_json(value: &Value) -> String {
    fn sorted(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                let mut out = Map::new();
                for key in keys {
                    out.insert(key.clone(), sorted(&map[key]));
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
            other => other.clone(),
        }
    }
    sorted(value).to_string()
}

fn to_field_error(error: &ValidationError<'_>, instance: &Value) -> FieldError {
    let path = error.instance_path.to_string();
    let path = if path.is_empty() {
        "(root)".to_string()
    } else {
        path
    };

    let message = match &error.kind {
        ValidationErrorKind::Required { property } => format!(
            "Missing required property: {}",
            property.as_str().map_or_else(|| property.to_string(), str::to_string)
        ),
        ValidationErrorKind::Type { .. } => format!("Wrong type: {error}"),
        ValidationErrorKind::Minimum { limit } => format!("Value must be >= {limit}"),
        ValidationErrorKind::Maximum { limit } => format!("Value must be <= {limit}"),
        ValidationErrorKind::ExclusiveMinimum { limit } => format!("Value must be > {limit}"),
        ValidationErrorKind::ExclusiveMaximum { limit } => format!("Value must be < {limit}"),
        ValidationErrorKind::MinLength { limit } => {
            format!("Value must be at least {limit} characters long")
        }
        ValidationErrorKind::MaxLength { limit } => {
            format!("Value must be at most {limit} characters long")
        }
        ValidationErrorKind::Pattern { pattern } => {
            format!("Value does not match pattern: {pattern}")
        }
        ValidationErrorKind::Enum { options } => format!("Value must be one of: {options}"),
        ValidationErrorKind::AdditionalProperties { unexpected } => {
            format!("Unexpected properties: {}", unexpected.join(", "))
        }
        ValidationErrorKind::FalseSchema => false_schema_message(error, instance),
        _ => error.to_string(),
    };

    FieldError { path, message }
}

/// `additionalProperties: false` without `properties` reports only the first
/// offending value; every key of the object at the error path is unexpected.
fn false_schema_message(error: &ValidationError<'_>, instance: &Value) -> String {
    let closed_object = matches!(
        error.schema_path.last(),
        Some(PathChunk::Keyword(keyword)) if *keyword == "additionalProperties"
    );
    if closed_object {
        if let Some(Value::Object(obj)) = instance.pointer(&error.instance_path.to_string()) {
            let keys: Vec<&str> = obj.keys().map(String::as_str).collect();
            return format!("Unexpected properties: {}", keys.join(", "));
        }
    }
    "Value is not allowed here".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn person_schema() -> Value {
        json!({
            "$schema": SCHEMA_DIALECT,
            "type": "object",
            "properties": {
                "name": { "type": "string", "pattern": "^[a-z]+$" },
                "age": { "type": "integer", "minimum": 0, "maximum": 150 },
                "role": { "enum": ["admin", "user"] }
            },
            "required": ["name"]
        })
    }

    #[test]
    fn valid_input_passes() {
        let validator = SchemaValidator::default();
        let report = validator
            .validate_input(&person_schema(), &json!({"name": "ada", "age": 36}))
            .unwrap();
        assert!(report.valid);
        assert!(report.errors.is_empty());
    }

    #[test]
    fn missing_required_property_is_reported() {
        let validator = SchemaValidator::default();
        let report = validator
            .validate_input(&person_schema(), &json!({"age": 3}))
            .unwrap();
        assert!(!report.valid);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].message, "Missing required property: name");
        assert_eq!(report.errors[0].path, "(root)");
    }

    #[test]
    fn common_failures_have_readable_messages() {
        let validator = SchemaValidator::default();
        let report = validator
            .validate_input(
                &person_schema(),
                &json!({"name": "Ada!", "age": 200, "role": "root"}),
            )
            .unwrap();
        assert!(!report.valid);

        let by_path = |p: &str| {
            report
                .errors
                .iter()
                .find(|e| e.path == p)
                .map(|e| e.message.clone())
                .unwrap()
        };
        assert!(by_path("/name").starts_with("Value does not match pattern"));
        assert_eq!(by_path("/age"), "Value must be <= 150");
        assert!(by_path("/role").starts_with("Value must be one of"));
    }

    #[test]
    fn wrong_type_is_reported() {
        let validator = SchemaValidator::default();
        let report = validator
            .validate_input(&person_schema(), &json!({"name": 5}))
            .unwrap();
        assert!(report.errors[0].message.starts_with("Wrong type"));
        assert_eq!(report.errors[0].path, "/name");
    }

    #[test]
    fn compiled_validators_are_cached_by_canonical_form() {
        let validator = SchemaValidator::default();
        let a = json!({"$schema": SCHEMA_DIALECT, "type": "object", "properties": {}});
        let b: Value = serde_json::from_str(
            r#"{"properties": {}, "type": "object", "$schema": "http://json-schema.org/draft-07/schema#"}"#,
        )
        .unwrap();
        validator.validate_input(&a, &json!({})).unwrap();
        validator.validate_output(&b, &json!({})).unwrap();
        assert_eq!(validator.cache_len(), 1);

        validator.clear_cache();
        assert_eq!(validator.cache_len(), 0);
    }

    #[test]
    fn fresh_entries_are_reused() {
        let validator = SchemaValidator::new(Duration::from_secs(3600));
        let schema = person_schema();
        let first = validator.compiled(&schema).unwrap();
        let second = validator.compiled(&schema).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn expired_entries_are_recompiled() {
        let validator = SchemaValidator::new(Duration::ZERO);
        let schema = person_schema();
        let first = validator.compiled(&schema).unwrap();
        let second = validator.compiled(&schema).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(validator.cache_len(), 1);
    }

    #[test]
    fn legacy_schema_is_upgraded() {
        let legacy = json!({"properties": {"q": {"type": "string"}}});
        let upgraded = upgrade_legacy_schema(&legacy);
        assert_eq!(upgraded["$schema"], SCHEMA_DIALECT);
        assert_eq!(upgraded["type"], "object");
        assert_eq!(upgraded["required"], json!([]));
        assert_eq!(upgraded["additionalProperties"], false);

        let validator = SchemaValidator::default();
        let report = validator
            .validate_input(&legacy, &json!({"q": "x", "extra": 1}))
            .unwrap();
        assert!(!report.valid);
    }

    #[test]
    fn legacy_schema_without_properties_names_unexpected_keys() {
        let validator = SchemaValidator::default();
        let report = validator
            .validate_input(&json!({"type": "object"}), &json!({"n": 1, "m": 2}))
            .unwrap();
        assert!(!report.valid);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].path, "(root)");
        assert!(report.errors[0].message.starts_with("Unexpected properties: "));
        assert!(report.errors[0].message.contains('n'));
        assert!(report.errors[0].message.contains('m'));

        let nested = json!({
            "$schema": SCHEMA_DIALECT,
            "type": "object",
            "properties": {"opts": {"type": "object", "additionalProperties": false}}
        });
        let report = validator
            .validate_input(&nested, &json!({"opts": {"verbose": true}}))
            .unwrap();
        assert_eq!(report.errors[0].path, "/opts");
        assert_eq!(report.errors[0].message, "Unexpected properties: verbose");
    }

    #[test]
    fn false_subschema_is_reported() {
        let validator = SchemaValidator::default();
        let schema = json!({"$schema": SCHEMA_DIALECT, "type": "object", "properties": {"old": false}});
        let report = validator.validate_input(&schema, &json!({"old": 1})).unwrap();
        assert_eq!(report.errors[0].path, "/old");
        assert_eq!(report.errors[0].message, "Value is not allowed here");
    }

    #[test]
    fn legacy_upgrade_keeps_explicit_additional_properties() {
        let legacy = json!({"type": "object", "additionalProperties": true});
        let upgraded = upgrade_legacy_schema(&legacy);
        assert_eq!(upgraded["additionalProperties"], true);
    }

    #[test]
    fn tool_schema_requires_object_type() {
        let validator = SchemaValidator::default();
        let err = validator
            .validate_tool_schema(&json!({"$schema": SCHEMA_DIALECT, "type": "string"}))
            .unwrap_err();
        assert!(matches!(err, SchemaError::MissingMetadata(_)));

        let err = validator
            .validate_tool_schema(&json!({"$schema": SCHEMA_DIALECT, "type": "object", "properties": []}))
            .unwrap_err();
        assert!(matches!(err, SchemaError::MissingMetadata(_)));

        assert!(validator.validate_tool_schema(&person_schema()).is_ok());
    }

    #[test]
    fn invalid_schema_fails_to_compile() {
        let validator = SchemaValidator::default();
        let bad = json!({"$schema": SCHEMA_DIALECT, "type": "object", "properties": {"a": {"type": 12}}});
        let err = validator.validate_input(&bad, &json!({})).unwrap_err();
        assert!(matches!(err, SchemaError::Compile(_)));
    }

    #[test]
    fn canonical_json_sorts_nested_keys() {
        let v = json!({"b": {"d": 1, "c": 2}, "a": [ {"z": 0, "y": 1} ]});
        assert_eq!(canonical_json(&v), r#"{"a":[{"y":1,"z":0}],"b":{"c":2,"d":1}}"#);
    }
}
