//! Structural parameter schemas.
//!
//! A [`Schema`] is a tree of primitive, array and object nodes. Definitions
//! carry one for their parameters (or properties) and the pipeline checks every
//! incoming payload against it with [`Schema::validate`] before a handler runs.

use std::{
    collections::BTreeMap,
    sync::{Arc, OnceLock},
};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Schema {
    #[default]
    Any,
    Null,
    Boolean,
    #[serde(rename_all = "camelCase")]
    String {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min_length: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_length: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pattern: Option<Pattern>,
        #[serde(default, rename = "enum", skip_serializing_if = "Option::is_none")]
        allowed: Option<Vec<String>>,
    },
    Number {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        minimum: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        maximum: Option<f64>,
    },
    Integer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        minimum: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        maximum: Option<i64>,
    },
    #[serde(rename_all = "camelCase")]
    Array {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        items: Option<Box<Schema>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min_items: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_items: Option<usize>,
    },
    #[serde(rename_all = "camelCase")]
    Object {
        #[serde(default)]
        properties: BTreeMap<String, Schema>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        required: Vec<String>,
        #[serde(default = "default_additional_properties")]
        additional_properties: bool,
    },
}

fn default_additional_properties() -> bool {
    true
}

/// Regex source of a string schema. Compiled on first use; clones share the
/// compiled form.
#[derive(Clone, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Pattern {
    source: String,
    compiled: Arc<OnceLock<Result<Regex, regex::Error>>>,
}

impl Pattern {
    pub fn new(source: &str) -> Self {
        Self::from(source.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn regex(&self) -> Result<&Regex, &regex::Error> {
        self.compiled
            .get_or_init(|| Regex::new(&self.source))
            .as_ref()
    }
}

impl From<String> for Pattern {
    fn from(source: String) -> Self {
        Self {
            source,
            compiled: Arc::new(OnceLock::new()),
        }
    }
}

impl From<Pattern> for String {
    fn from(pattern: Pattern) -> Self {
        pattern.source
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl std::fmt::Debug for Pattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Pattern({:?})", self.source)
    }
}

/// One mismatch between a value and its schema. `path` is `$`-rooted, e.g. `$.items[2].id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaViolation {
    pub path: String,
    pub message: String,
}

impl std::fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

impl Schema {
    pub fn string() -> Self {
        Schema::String {
            min_length: None,
            max_length: None,
            pattern: None,
            allowed: None,
        }
    }

    pub fn number() -> Self {
        Schema::Number {
            minimum: None,
            maximum: None,
        }
    }

    pub fn integer() -> Self {
        Schema::Integer {
            minimum: None,
            maximum: None,
        }
    }

    pub fn boolean() -> Self {
        Schema::Boolean
    }

    pub fn array(items: Schema) -> Self {
        Schema::Array {
            items: Some(Box::new(items)),
            min_items: None,
            max_items: None,
        }
    }

    pub fn object() -> Self {
        Schema::Object {
            properties: BTreeMap::new(),
            required: Vec::new(),
            additional_properties: true,
        }
    }

    /// Adds a property to an object schema. No-op on other node kinds.
    pub fn property(mut self, name: &str, schema: Schema, is_required: bool) -> Self {
        if let Schema::Object {
            properties,
            required,
            ..
        } = &mut self
        {
            properties.insert(name.to_string(), schema);
            if is_required && !required.iter().any(|r| r == name) {
                required.push(name.to_string());
            }
        }
        self
    }

    pub fn deny_additional(mut self) -> Self {
        if let Schema::Object {
            additional_properties,
            ..
        } = &mut self
        {
            *additional_properties = false;
        }
        self
    }

    pub fn validate(&self, value: &Value) -> Result<(), Vec<SchemaViolation>> {
        let mut violations = Vec::new();
        self.check(value, "$", &mut violations);
        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }

    /// Validates a partial object update: every provided key is checked against
    /// its declared schema, `required` is not enforced.
    pub fn validate_partial(&self, patch: &Map<String, Value>) -> Result<(), Vec<SchemaViolation>> {
        let Schema::Object {
            properties,
            additional_properties,
            ..
        } = self
        else {
            return self.validate(&Value::Object(patch.clone()));
        };

        let mut violations = Vec::new();
        for (key, value) in patch {
            let path = format!("$.{}", key);
            match properties.get(key) {
                Some(schema) => schema.check(value, &path, &mut violations),
                None if !additional_properties => {
                    violations.push(violation(&path, "unknown property"))
                }
                None => {}
            }
        }
        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }

    fn check(&self, value: &Value, path: &str, violations: &mut Vec<SchemaViolation>) {
        match self {
            Schema::Any => {}
            Schema::Null => {
                if !value.is_null() {
                    violations.push(type_mismatch(path, "null", value));
                }
            }
            Schema::Boolean => {
                if !value.is_boolean() {
                    violations.push(type_mismatch(path, "boolean", value));
                }
            }
            Schema::String {
                min_length,
                max_length,
                pattern,
                allowed,
            } => {
                let Some(s) = value.as_str() else {
                    violations.push(type_mismatch(path, "string", value));
                    return;
                };
                let len = s.chars().count();
                if let Some(min) = min_length {
                    if len < *min {
                        violations.push(violation(path, &format!("shorter than {}", min)));
                    }
                }
                if let Some(max) = max_length {
                    if len > *max {
                        violations.push(violation(path, &format!("longer than {}", max)));
                    }
                }
                if let Some(pattern) = pattern {
                    match pattern.regex() {
                        Ok(re) if !re.is_match(s) => violations.push(violation(
                            path,
                            &format!("does not match /{}/", pattern.as_str()),
                        )),
                        Ok(_) => {}
                        Err(e) => violations
                            .push(violation(path, &format!("invalid pattern in schema: {}", e))),
                    }
                }
                if let Some(allowed) = allowed {
                    if !allowed.iter().any(|a| a == s) {
                        violations.push(violation(
                            path,
                            &format!("must be one of [{}]", allowed.join(", ")),
                        ));
                    }
                }
            }
            Schema::Number { minimum, maximum } => {
                let Some(n) = value.as_f64() else {
                    violations.push(type_mismatch(path, "number", value));
                    return;
                };
                check_range(path, n, *minimum, *maximum, violations);
            }
            Schema::Integer { minimum, maximum } => {
                let Some(n) = value.as_i64() else {
                    violations.push(type_mismatch(path, "integer", value));
                    return;
                };
                check_range(path, n, *minimum, *maximum, violations);
            }
            Schema::Array {
                items,
                min_items,
                max_items,
            } => {
                let Some(elements) = value.as_array() else {
                    violations.push(type_mismatch(path, "array", value));
                    return;
                };
                if let Some(min) = min_items {
                    if elements.len() < *min {
                        violations.push(violation(path, &format!("fewer than {} items", min)));
                    }
                }
                if let Some(max) = max_items {
                    if elements.len() > *max {
                        violations.push(violation(path, &format!("more than {} items", max)));
                    }
                }
                if let Some(items) = items {
                    for (i, element) in elements.iter().enumerate() {
                        items.check(element, &format!("{}[{}]", path, i), violations);
                    }
                }
            }
            Schema::Object {
                properties,
                required,
                additional_properties,
            } => {
                let Some(object) = value.as_object() else {
                    violations.push(type_mismatch(path, "object", value));
                    return;
                };
                for name in required {
                    if !object.contains_key(name) {
                        violations.push(violation(
                            &format!("{}.{}", path, name),
                            "required property missing",
                        ));
                    }
                }
                for (key, element) in object {
                    let child = format!("{}.{}", path, key);
                    match properties.get(key) {
                        Some(schema) => schema.check(element, &child, violations),
                        None if !additional_properties => {
                            violations.push(violation(&child, "unknown property"))
                        }
                        None => {}
                    }
                }
            }
        }
    }
}

fn check_range<T: PartialOrd + std::fmt::Display + Copy>(
    path: &str,
    n: T,
    minimum: Option<T>,
    maximum: Option<T>,
    violations: &mut Vec<SchemaViolation>,
) {
    if let Some(min) = minimum {
        if n < min {
            violations.push(violation(path, &format!("less than minimum {}", min)));
        }
    }
    if let Some(max) = maximum {
        if n > max {
            violations.push(violation(path, &format!("greater than maximum {}", max)));
        }
    }
}

fn violation(path: &str, message: &str) -> SchemaViolation {
    SchemaViolation {
        path: path.to_string(),
        message: message.to_string(),
    }
}

fn type_mismatch(path: &str, expected: &str, got: &Value) -> SchemaViolation {
    let got = match got {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    };
    violation(path, &format!("expected {}, got {}", expected, got))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn add_schema() -> Schema {
        Schema::object()
            .property("a", Schema::number(), true)
            .property("b", Schema::number(), true)
    }

    #[test]
    fn test_accepts_matching_object() {
        assert!(add_schema().validate(&json!({"a": 2, "b": 3.5})).is_ok());
    }

    #[test]
    fn test_reports_every_violation_with_path() {
        let violations = add_schema()
            .validate(&json!({"a": "two"}))
            .unwrap_err();
        assert_eq!(
            violations,
            vec![
                SchemaViolation {
                    path: "$.b".to_string(),
                    message: "required property missing".to_string()
                },
                SchemaViolation {
                    path: "$.a".to_string(),
                    message: "expected number, got string".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_nested_array_paths() {
        let schema = Schema::object().property(
            "items",
            Schema::array(Schema::object().property("id", Schema::integer(), true)),
            true,
        );
        let violations = schema
            .validate(&json!({"items": [{"id": 1}, {"id": "x"}, {}]}))
            .unwrap_err();
        let paths: Vec<_> = violations.iter().map(|v| v.path.as_str()).collect();
        assert_eq!(paths, vec!["$.items[1].id", "$.items[2].id"]);
    }

    #[test]
    fn test_string_constraints() {
        let schema = Schema::String {
            min_length: Some(2),
            max_length: Some(5),
            pattern: Some(Pattern::new("^[a-z]+$")),
            allowed: None,
        };
        assert!(schema.validate(&json!("abc")).is_ok());
        assert_eq!(schema.validate(&json!("a")).unwrap_err().len(), 1);
        assert_eq!(schema.validate(&json!("ABCDEFG")).unwrap_err().len(), 2);
    }

    #[test]
    fn test_pattern_compiled_once_and_shared() {
        let pattern = Pattern::new("^[a-z]+$");
        let schema = Schema::String {
            min_length: None,
            max_length: None,
            pattern: Some(pattern.clone()),
            allowed: None,
        };
        assert!(pattern.compiled.get().is_none());

        assert!(schema.validate(&json!("abc")).is_ok());
        let first = pattern.compiled.get().unwrap().as_ref().unwrap() as *const Regex;
        assert!(schema.validate(&json!("ABC")).is_err());
        let second = pattern.regex().unwrap() as *const Regex;
        assert_eq!(first, second);

        assert_eq!(serde_json::to_value(&pattern).unwrap(), json!("^[a-z]+$"));
    }

    #[test]
    fn test_invalid_pattern_reported() {
        let schema: Schema =
            serde_json::from_value(json!({"type": "string", "pattern": "("})).unwrap();
        let violations = schema.validate(&json!("x")).unwrap_err();
        assert!(violations[0].message.starts_with("invalid pattern in schema"));
        // Still reported on later validations.
        assert_eq!(schema.validate(&json!("y")).unwrap_err().len(), 1);
    }

    #[test]
    fn test_integer_and_range() {
        let schema = Schema::Integer {
            minimum: Some(0),
            maximum: Some(10),
        };
        assert!(schema.validate(&json!(10)).is_ok());
        assert!(schema.validate(&json!(11)).is_err());
        assert!(schema.validate(&json!(1.5)).is_err());
    }

    #[test]
    fn test_additional_properties_denied() {
        let schema = add_schema().deny_additional();
        let violations = schema
            .validate(&json!({"a": 1, "b": 2, "c": 3}))
            .unwrap_err();
        assert_eq!(violations[0].path, "$.c");
    }

    #[test]
    fn test_partial_validation_skips_required() {
        let schema = add_schema();
        let mut patch = Map::new();
        patch.insert("a".to_string(), json!(4));
        assert!(schema.validate_partial(&patch).is_ok());
        patch.insert("b".to_string(), json!(false));
        assert_eq!(schema.validate_partial(&patch).unwrap_err()[0].path, "$.b");
    }

    #[test]
    fn test_wire_form() {
        let schema: Schema = serde_json::from_value(json!({
            "type": "object",
            "properties": {
                "label": {"type": "string", "maxLength": 20, "enum": ["ok", "cancel"]},
                "count": {"type": "integer", "minimum": 0}
            },
            "required": ["label"],
            "additionalProperties": false
        }))
        .unwrap();
        assert!(schema.validate(&json!({"label": "ok", "count": 1})).is_ok());
        assert!(schema.validate(&json!({"label": "maybe"})).is_err());
        assert_eq!(serde_json::to_value(Schema::Any).unwrap(), json!({"type": "any"}));
    }
}
