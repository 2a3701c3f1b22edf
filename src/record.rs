//! Audit record type consumed by the router and the execution engine.
//!
//! A record is created once at ingestion and never mutated afterwards. All
//! processing works on copies of its values (the normalizer builder, the
//! parameter context).

use chrono::{DateTime, SecondsFormat, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::extraction::FieldPath;

/// Parameter name under which the record id is exposed.
pub const AUDIT_ID: &str = "audit.id";
/// Parameter name under which the record principal is exposed.
pub const AUDIT_USER: &str = "audit.user";
/// Parameter name under which the record timestamp is exposed.
pub const AUDIT_TIME: &str = "audit.time";

/// An immutable audit event: identity, principal, timestamp and field map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    id: i64,
    user: String,
    time: DateTime<Utc>,
    #[serde(default)]
    values: IndexMap<String, Value>,
}

impl AuditRecord {
    pub fn new(
        id: i64,
        user: impl Into<String>,
        time: DateTime<Utc>,
        values: IndexMap<String, Value>,
    ) -> Self {
        Self {
            id,
            user: user.into(),
            time,
            values,
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }

    /// Timestamp in the RFC 3339 form used for the `audit.time` parameter.
    pub fn time_text(&self) -> String {
        self.time.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    pub fn values(&self) -> &IndexMap<String, Value> {
        &self.values
    }

    /// Static record attributes as `(parameter name, value)` pairs.
    pub fn audit_attributes(&self) -> [(&'static str, Value); 3] {
        [
            (AUDIT_ID, Value::from(self.id)),
            (AUDIT_USER, Value::String(self.user.clone())),
            (AUDIT_TIME, Value::String(self.time_text())),
        ]
    }

    /// Resolve a field for rule matching.
    ///
    /// The `audit.*` names resolve to the record attributes. Any other name is
    /// looked up verbatim first and, failing that, as a dotted path into
    /// nested values.
    pub fn field(&self, name: &str) -> Option<Value> {
        match name {
            AUDIT_ID => return Some(Value::from(self.id)),
            AUDIT_USER => return Some(Value::String(self.user.clone())),
            AUDIT_TIME => return Some(Value::String(self.time_text())),
            _ => {}
        }

        if let Some(value) = self.values.get(name) {
            return Some(value.clone());
        }

        FieldPath::from_dotted(name)
            .resolve_in(&self.values)
            .cloned()
    }
}
