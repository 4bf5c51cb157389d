//! Query evaluation over model entries.
//!
//! Conditions address entry metadata (`id`, `timestamp`, `authorDeviceId`)
//! or dot-pathed data fields. Ordering, limits, and association includes
//! compose on top.

use std::cmp::Ordering;

use serde_json::Value;

use crate::error::CoreError;
use crate::models::entry::ModelEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDir {
    Asc,
    Desc,
}

#[derive(Debug, Clone)]
pub enum Condition {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Contains(Value),
    StartsWith(String),
    EndsWith(String),
}

/// A filter with optional ordering, limit, and association includes.
#[derive(Debug, Clone, Default)]
pub struct Query {
    conditions: Vec<(String, Condition)>,
    order: Option<(String, SortDir)>,
    limit: Option<usize>,
    includes: Vec<String>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shorthand equality on a field.
    pub fn where_eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.conditions
            .push((field.to_string(), Condition::Eq(value.into())));
        self
    }

    pub fn where_cond(mut self, field: &str, condition: Condition) -> Self {
        self.conditions.push((field.to_string(), condition));
        self
    }

    /// Build from a JSON condition object: `{field: value}` for equality
    /// or `{field: {op: value}}` for operators.
    pub fn from_json(conditions: &Value) -> Result<Self, CoreError> {
        let object = conditions
            .as_object()
            .ok_or_else(|| CoreError::Validation("query conditions must be an object".into()))?;
        let mut query = Self::new();
        for (field, value) in object {
            match value {
                Value::Object(ops) => {
                    for (op, operand) in ops {
                        query
                            .conditions
                            .push((field.clone(), parse_condition(op, operand)?));
                    }
                }
                other => query
                    .conditions
                    .push((field.clone(), Condition::Eq(other.clone()))),
            }
        }
        Ok(query)
    }

    pub fn order_by(mut self, field: &str, dir: SortDir) -> Self {
        self.order = Some((field.to_string(), dir));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Load children of the named associated model onto each result.
    pub fn include(mut self, assoc: &str) -> Self {
        self.includes.push(assoc.to_string());
        self
    }

    pub fn includes(&self) -> &[String] {
        &self.includes
    }

    /// Filter, order, and truncate a snapshot of entries.
    pub fn apply(&self, entries: Vec<ModelEntry>) -> Vec<ModelEntry> {
        let mut hits: Vec<ModelEntry> = entries
            .into_iter()
            .filter(|e| self.matches(e))
            .collect();

        if let Some((field, dir)) = &self.order {
            hits.sort_by(|a, b| {
                let av = field_value(a, field);
                let bv = field_value(b, field);
                let ord = compare_values(av.as_ref(), bv.as_ref());
                match dir {
                    SortDir::Asc => ord,
                    SortDir::Desc => ord.reverse(),
                }
            });
        }
        if let Some(limit) = self.limit {
            hits.truncate(limit);
        }
        hits
    }

    pub fn matches(&self, entry: &ModelEntry) -> bool {
        self.conditions
            .iter()
            .all(|(field, condition)| condition_matches(entry, field, condition))
    }
}

fn parse_condition(op: &str, operand: &Value) -> Result<Condition, CoreError> {
    let as_list = |v: &Value| -> Result<Vec<Value>, CoreError> {
        v.as_array()
            .cloned()
            .ok_or_else(|| CoreError::Validation(format!("{op:?} needs an array operand")))
    };
    let as_string = |v: &Value| -> Result<String, CoreError> {
        v.as_str()
            .map(str::to_string)
            .ok_or_else(|| CoreError::Validation(format!("{op:?} needs a string operand")))
    };
    Ok(match op {
        "eq" => Condition::Eq(operand.clone()),
        "ne" => Condition::Ne(operand.clone()),
        "gt" => Condition::Gt(operand.clone()),
        "gte" => Condition::Gte(operand.clone()),
        "lt" => Condition::Lt(operand.clone()),
        "lte" => Condition::Lte(operand.clone()),
        "in" => Condition::In(as_list(operand)?),
        "nin" => Condition::Nin(as_list(operand)?),
        "contains" => Condition::Contains(operand.clone()),
        "startsWith" => Condition::StartsWith(as_string(operand)?),
        "endsWith" => Condition::EndsWith(as_string(operand)?),
        other => return Err(CoreError::Validation(format!("unknown operator {other:?}"))),
    })
}

fn condition_matches(entry: &ModelEntry, field: &str, condition: &Condition) -> bool {
    let value = field_value(entry, field);
    match condition {
        Condition::Eq(expected) => value.as_ref() == Some(expected),
        Condition::Ne(expected) => value.as_ref() != Some(expected),
        Condition::Gt(bound) => ordered(value.as_ref(), bound, Ordering::Greater, false),
        Condition::Gte(bound) => ordered(value.as_ref(), bound, Ordering::Greater, true),
        Condition::Lt(bound) => ordered(value.as_ref(), bound, Ordering::Less, false),
        Condition::Lte(bound) => ordered(value.as_ref(), bound, Ordering::Less, true),
        Condition::In(set) => value.is_some_and(|v| set.contains(&v)),
        Condition::Nin(set) => value.map_or(true, |v| !set.contains(&v)),
        Condition::Contains(needle) => match (&value, needle) {
            (Some(Value::String(s)), Value::String(n)) => s.contains(n.as_str()),
            (Some(Value::Array(items)), n) => items.contains(n),
            _ => false,
        },
        Condition::StartsWith(prefix) => {
            matches!(&value, Some(Value::String(s)) if s.starts_with(prefix))
        }
        Condition::EndsWith(suffix) => {
            matches!(&value, Some(Value::String(s)) if s.ends_with(suffix))
        }
    }
}

fn ordered(value: Option<&Value>, bound: &Value, want: Ordering, or_equal: bool) -> bool {
    let Some(value) = value else { return false };
    let ord = compare_values(Some(value), Some(bound));
    ord == want || (or_equal && ord == Ordering::Equal)
}

/// Resolve `id` / `timestamp` / `authorDeviceId` metadata or a dot path
/// into the entry data.
pub fn field_value(entry: &ModelEntry, path: &str) -> Option<Value> {
    match path {
        "id" => return Some(Value::String(entry.id.clone())),
        "timestamp" => return Some(Value::from(entry.timestamp)),
        "authorDeviceId" => return Some(Value::String(entry.author_device_id.clone())),
        _ => {}
    }
    let mut current: &Value = &Value::Object(entry.data.clone());
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current.clone())
}

/// Order values: numbers numerically, strings lexicographically. Mixed or
/// unordered types compare equal so sorts stay stable.
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        _ => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(id: &str, timestamp: u64, data: Value) -> ModelEntry {
        ModelEntry {
            id: id.to_string(),
            data: data.as_object().cloned().unwrap_or_default(),
            timestamp,
            author_device_id: format!("author-{id}"),
            signature: vec![],
        }
    }

    fn sample() -> Vec<ModelEntry> {
        vec![
            entry("a", 10, json!({"name": "ada", "score": 3, "tags": ["x"]})),
            entry("b", 20, json!({"name": "bob", "score": 9, "tags": ["x", "y"]})),
            entry("c", 30, json!({"name": "cara", "score": 5, "nested": {"deep": "hit"}})),
        ]
    }

    #[test]
    fn equality_shorthand_and_metadata_fields() {
        let query = Query::new().where_eq("authorDeviceId", "author-b");
        assert_eq!(query.apply(sample()).len(), 1);

        let query = Query::from_json(&json!({"name": "ada"})).unwrap();
        assert_eq!(query.apply(sample())[0].id, "a");
    }

    #[test]
    fn comparison_operators() {
        let query = Query::from_json(&json!({"score": {"gt": 4}})).unwrap();
        let hits = query.apply(sample());
        assert_eq!(hits.len(), 2);

        let query = Query::from_json(&json!({"score": {"lte": 5}})).unwrap();
        assert_eq!(query.apply(sample()).len(), 2);

        let query = Query::from_json(&json!({"timestamp": {"gte": 20}})).unwrap();
        assert_eq!(query.apply(sample()).len(), 2);
    }

    #[test]
    fn set_and_string_operators() {
        let query = Query::from_json(&json!({"name": {"in": ["ada", "cara"]}})).unwrap();
        assert_eq!(query.apply(sample()).len(), 2);

        let query = Query::from_json(&json!({"name": {"nin": ["ada"]}})).unwrap();
        assert_eq!(query.apply(sample()).len(), 2);

        let query = Query::from_json(&json!({"tags": {"contains": "y"}})).unwrap();
        assert_eq!(query.apply(sample())[0].id, "b");

        let query = Query::from_json(&json!({"name": {"startsWith": "c"}})).unwrap();
        assert_eq!(query.apply(sample())[0].id, "c");

        let query = Query::from_json(&json!({"name": {"endsWith": "a"}})).unwrap();
        assert_eq!(query.apply(sample()).len(), 2);
    }

    #[test]
    fn dot_paths_reach_nested_fields() {
        let query = Query::from_json(&json!({"nested.deep": "hit"})).unwrap();
        assert_eq!(query.apply(sample())[0].id, "c");
    }

    #[test]
    fn order_and_limit() {
        let query = Query::new().order_by("score", SortDir::Desc).limit(2);
        let hits = query.apply(sample());
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "b");
        assert_eq!(hits[1].id, "c");
    }

    #[test]
    fn unknown_operator_is_rejected() {
        assert!(Query::from_json(&json!({"name": {"regex": ".*"}})).is_err());
    }
}
