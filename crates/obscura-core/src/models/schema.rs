//! User-declared model schemas and the runtime validator.

use std::collections::BTreeMap;
use std::time::Duration;

use base64::Engine as _;
use serde_json::Value;

use crate::error::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Timestamp,
    Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub ty: FieldType,
    pub nullable: bool,
}

impl FieldSpec {
    /// Parse a declared type like `"string"` or `"number?"`.
    pub fn parse(spec: &str) -> Result<Self, CoreError> {
        let (name, nullable) = match spec.strip_suffix('?') {
            Some(name) => (name, true),
            None => (spec, false),
        };
        let ty = match name {
            "string" => FieldType::String,
            "number" => FieldType::Number,
            "boolean" => FieldType::Boolean,
            "timestamp" => FieldType::Timestamp,
            "bytes" => FieldType::Bytes,
            other => {
                return Err(CoreError::Validation(format!("unknown field type {other:?}")))
            }
        };
        Ok(Self { ty, nullable })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncKind {
    /// Append-only: entries are immutable, merge is union by id.
    GSet,
    /// Last-writer-wins by strictly newer timestamp; deletes are
    /// tombstones.
    Lww,
}

/// One declared model.
#[derive(Debug, Clone)]
pub struct ModelSchema {
    pub name: String,
    pub fields: BTreeMap<String, FieldSpec>,
    pub sync: SyncKind,
    pub collectable: bool,
    pub ephemeral: bool,
    pub ttl: Option<Duration>,
    pub private: bool,
    pub belongs_to: Vec<String>,
}

impl ModelSchema {
    pub fn new(name: &str, sync: SyncKind) -> Self {
        Self {
            name: name.to_string(),
            fields: BTreeMap::new(),
            sync,
            collectable: true,
            ephemeral: false,
            ttl: None,
            private: false,
            belongs_to: Vec::new(),
        }
    }

    pub fn field(mut self, name: &str, spec: &str) -> Result<Self, CoreError> {
        self.fields.insert(name.to_string(), FieldSpec::parse(spec)?);
        Ok(self)
    }

    /// Make the model ephemeral with the given TTL, e.g. `"30s"`, `"24h"`.
    pub fn ttl(mut self, spec: &str) -> Result<Self, CoreError> {
        self.ttl = Some(parse_ttl(spec)?);
        self.ephemeral = true;
        Ok(self)
    }

    /// Replicate to own devices only.
    pub fn private(mut self) -> Self {
        self.private = true;
        self
    }

    pub fn belongs_to(mut self, parent: &str) -> Self {
        self.belongs_to.push(parent.to_string());
        self
    }

    pub fn collectable(mut self, collectable: bool) -> Self {
        self.collectable = collectable;
        self
    }

    /// Check a payload against the declared fields: no undeclared keys,
    /// required fields present, every value of the declared type.
    pub fn validate(&self, data: &serde_json::Map<String, Value>) -> Result<(), CoreError> {
        for key in data.keys() {
            if !self.fields.contains_key(key) {
                return Err(CoreError::Validation(format!(
                    "undeclared field {key:?} on model {:?}",
                    self.name
                )));
            }
        }
        for (name, spec) in &self.fields {
            match data.get(name) {
                None | Some(Value::Null) => {
                    if !spec.nullable {
                        return Err(CoreError::Validation(format!(
                            "missing required field {name:?} on model {:?}",
                            self.name
                        )));
                    }
                }
                Some(value) => check_type(&self.name, name, spec.ty, value)?,
            }
        }
        Ok(())
    }
}

fn check_type(model: &str, field: &str, ty: FieldType, value: &Value) -> Result<(), CoreError> {
    let ok = match ty {
        FieldType::String => value.is_string(),
        FieldType::Number => value.is_number(),
        FieldType::Boolean => value.is_boolean(),
        FieldType::Timestamp => value.as_u64().is_some(),
        FieldType::Bytes => value
            .as_str()
            .is_some_and(|s| base64::engine::general_purpose::STANDARD.decode(s).is_ok()),
    };
    if ok {
        Ok(())
    } else {
        Err(CoreError::Validation(format!(
            "field {field:?} on model {model:?} has the wrong type"
        )))
    }
}

/// Parse a TTL of the form `Ns`, `Nm`, `Nh`, or `Nd`.
pub fn parse_ttl(spec: &str) -> Result<Duration, CoreError> {
    let spec = spec.trim();
    let (digits, unit) = spec.split_at(spec.len().saturating_sub(1));
    let n: u64 = digits
        .parse()
        .map_err(|_| CoreError::Validation(format!("invalid ttl {spec:?}")))?;
    let seconds = match unit {
        "s" => n,
        "m" => n * 60,
        "h" => n * 60 * 60,
        "d" => n * 60 * 60 * 24,
        _ => return Err(CoreError::Validation(format!("invalid ttl unit {spec:?}"))),
    };
    Ok(Duration::from_secs(seconds))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn story() -> ModelSchema {
        ModelSchema::new("story", SyncKind::GSet)
            .field("content", "string")
            .unwrap()
            .field("views", "number?")
            .unwrap()
            .field("thumbnail", "bytes?")
            .unwrap()
    }

    #[test]
    fn ttl_parsing() {
        assert_eq!(parse_ttl("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_ttl("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_ttl("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_ttl("1d").unwrap(), Duration::from_secs(86_400));
        assert!(parse_ttl("10x").is_err());
        assert!(parse_ttl("s").is_err());
    }

    #[test]
    fn validates_required_and_types() {
        let schema = story();
        let ok = json!({"content": "hi", "views": 3});
        schema.validate(ok.as_object().unwrap()).unwrap();

        let missing = json!({"views": 3});
        assert!(schema.validate(missing.as_object().unwrap()).is_err());

        let wrong_type = json!({"content": 42});
        assert!(schema.validate(wrong_type.as_object().unwrap()).is_err());

        let undeclared = json!({"content": "hi", "extra": true});
        assert!(schema.validate(undeclared.as_object().unwrap()).is_err());
    }

    #[test]
    fn nullable_fields_accept_null() {
        let schema = story();
        let data = json!({"content": "hi", "views": null});
        schema.validate(data.as_object().unwrap()).unwrap();
    }

    #[test]
    fn bytes_fields_are_base64() {
        let schema = story();
        let good = json!({"content": "hi", "thumbnail": "aGVsbG8="});
        schema.validate(good.as_object().unwrap()).unwrap();

        let bad = json!({"content": "hi", "thumbnail": "!!not base64!!"});
        assert!(schema.validate(bad.as_object().unwrap()).is_err());
    }
}
