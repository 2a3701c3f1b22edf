//! Parameter context threaded through an execution chain.
//!
//! The context starts with the builder fields and the record attributes and
//! grows as each execution merges its result under a `<key>.` namespace.
//! Cloning is deep: collection elements work on clones and never see each
//! other's parameters.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::extraction::flatten;
use crate::record::AuditRecord;

/// Flat result row of a single execution.
pub type ExecutionResult = IndexMap<String, Value>;

/// Accumulating parameter map for one item or one collection element.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterContext {
    values: IndexMap<String, Value>,
}

impl ParameterContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a context from builder fields plus `audit.id`, `audit.user` and
    /// `audit.time`. Record attributes win over builder fields of the same name.
    ///
    /// # Example
    /// ```
    /// use auditpipe::runtime::ParameterContext;
    /// use auditpipe::AuditRecord;
    /// use chrono::Utc;
    /// use indexmap::IndexMap;
    ///
    /// let record = AuditRecord::new(1, "alice", Utc::now(), IndexMap::new());
    /// let ctx = ParameterContext::seed(record.values(), &record);
    /// assert_eq!(ctx.get("audit.user"), Some(&serde_json::json!("alice")));
    /// ```
    pub fn seed(builder: &IndexMap<String, Value>, record: &AuditRecord) -> Self {
        let mut values = builder.clone();
        for (name, value) in record.audit_attributes() {
            values.insert(name.to_string(), value);
        }
        Self { values }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.values.insert(name.into(), value);
    }

    /// Merge an execution result, prefixing every key with `"<execution_key>."`.
    ///
    /// Only keys under that prefix are written, so results of different
    /// executions never overwrite each other. Returns the number of keys merged.
    pub fn merge_result(&mut self, execution_key: &str, result: ExecutionResult) -> usize {
        let merged = result.len();
        for (column, value) in result {
            self.values.insert(format!("{}.{}", execution_key, column), value);
        }
        merged
    }

    /// Add one collection element.
    ///
    /// Maps are flattened under the collection name (`items.sku`,
    /// `items.tags[0]`); any other value is stored as `collection` itself.
    pub fn add_collection_element(&mut self, collection: &str, element: &Value) {
        match element {
            Value::Object(map) if !map.is_empty() => {
                self.values.extend(flatten(element, collection));
            }
            other => {
                self.values.insert(collection.to_string(), other.clone());
            }
        }
    }

    /// Parameters in insertion order.
    pub fn values(&self) -> &IndexMap<String, Value> {
        &self.values
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    /// Parameters of this context whose name starts with `"<execution_key>."`.
    pub fn results_of(&self, execution_key: &str) -> IndexMap<&str, &Value> {
        let prefix = format!("{}.", execution_key);
        self.values
            .iter()
            .filter_map(|(name, value)| name.strip_prefix(&prefix).map(|column| (column, value)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn to_json(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

impl From<IndexMap<String, Value>> for ParameterContext {
    fn from(values: IndexMap<String, Value>) -> Self {
        Self { values }
    }
}
