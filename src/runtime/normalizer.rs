//! Record normalizer: field converters and formats producing the builder map.
//!
//! The builder starts as a copy of the record values. Each field mapping of
//! the matched handler then reads one record field, runs it through an
//! optional converter and an optional format, and stores the result under
//! its target name.

use std::collections::HashMap;
use std::fmt::Write as _;

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, TimeZone, Utc};
use indexmap::IndexMap;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::record::AuditRecord;
use crate::runtime::config_loader::{ConfigError, FieldMapping, HandlerConfig, HandlerSet};

/// Converter parsing `{k=v, k2=v2}` strings into maps.
pub const STRING_TO_MAP: &str = "string_to_map";
/// Converter parsing `[a, b]` strings into arrays.
pub const STRING_TO_LIST: &str = "string_to_list";

/// Entry separator used by the built-in converters.
pub const DEFAULT_SEPARATOR: char = ',';

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("field '{field}': converter '{converter}' failed: {reason}")]
    Conversion {
        field: String,
        converter: String,
        reason: String,
    },

    #[error("field '{field}': format '{format}' failed: {reason}")]
    Format {
        field: String,
        format: String,
        reason: String,
    },
}

/// Converter applied to a single field value.
pub trait FieldConverter: Send + Sync {
    fn convert(&self, value: &Value) -> Result<Value, String>;
}

impl<F> FieldConverter for F
where
    F: Fn(&Value) -> Result<Value, String> + Send + Sync,
{
    fn convert(&self, value: &Value) -> Result<Value, String> {
        self(value)
    }
}

/// Named field converters.
pub struct ConverterRegistry {
    converters: HashMap<String, Box<dyn FieldConverter>>,
}

impl ConverterRegistry {
    pub fn new() -> Self {
        Self {
            converters: HashMap::new(),
        }
    }

    /// Registry with `string_to_map` and `string_to_list`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(
            STRING_TO_MAP,
            Box::new(|value: &Value| -> Result<Value, String> {
                Ok(match value {
                    Value::String(s) => string_to_map(s, DEFAULT_SEPARATOR),
                    Value::Null => Value::Object(Map::new()),
                    other => other.clone(),
                })
            }),
        );
        registry.register(
            STRING_TO_LIST,
            Box::new(|value: &Value| -> Result<Value, String> {
                Ok(match value {
                    Value::String(s) => string_to_list(s, DEFAULT_SEPARATOR),
                    Value::Null => Value::Array(Vec::new()),
                    other => other.clone(),
                })
            }),
        );
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, converter: Box<dyn FieldConverter>) {
        self.converters.insert(name.into(), converter);
    }

    pub fn get(&self, name: &str) -> Option<&dyn FieldConverter> {
        self.converters.get(name).map(|c| c.as_ref())
    }

    pub fn has_converter(&self, name: &str) -> bool {
        self.converters.contains_key(name)
    }
}

impl Default for ConverterRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// Formatting rule applied after conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldFormat {
    Lowercase,
    Uppercase,
    Trim,
    /// Reformat an RFC 3339 string or epoch-millis number with a strftime pattern
    Date(String),
}

impl FieldFormat {
    pub fn parse(name: &str) -> Result<Self, ConfigError> {
        match name {
            "lowercase" => Ok(Self::Lowercase),
            "uppercase" => Ok(Self::Uppercase),
            "trim" => Ok(Self::Trim),
            _ => match name.strip_prefix("date:") {
                Some(pattern)
                    if !pattern.is_empty()
                        && !StrftimeItems::new(pattern).any(|i| matches!(i, Item::Error)) =>
                {
                    Ok(Self::Date(pattern.to_string()))
                }
                _ => Err(ConfigError::UnknownFormat(name.to_string())),
            },
        }
    }

    pub fn apply(&self, value: &Value) -> Result<Value, String> {
        match (self, value) {
            (_, Value::Array(items)) => items
                .iter()
                .map(|item| self.apply(item))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            (Self::Lowercase, Value::String(s)) => Ok(Value::String(s.to_lowercase())),
            (Self::Uppercase, Value::String(s)) => Ok(Value::String(s.to_uppercase())),
            (Self::Trim, Value::String(s)) => Ok(Value::String(s.trim().to_string())),
            (Self::Date(pattern), Value::String(s)) => {
                let parsed = DateTime::parse_from_rfc3339(s.trim())
                    .map_err(|e| format!("'{}' is not an RFC 3339 timestamp: {}", s, e))?;
                format_date(&parsed.with_timezone(&Utc), pattern)
            }
            (Self::Date(pattern), Value::Number(n)) => {
                let millis = n
                    .as_i64()
                    .ok_or_else(|| format!("'{}' is not an epoch-millis value", n))?;
                let time = Utc
                    .timestamp_millis_opt(millis)
                    .single()
                    .ok_or_else(|| format!("{} is out of range", millis))?;
                format_date(&time, pattern)
            }
            (_, other) => Ok(other.clone()),
        }
    }
}

fn format_date(time: &DateTime<Utc>, pattern: &str) -> Result<Value, String> {
    let mut out = String::new();
    write!(out, "{}", time.format(pattern)).map_err(|_| format!("invalid pattern '{}'", pattern))?;
    Ok(Value::String(out))
}

/// Builds the normalized builder map for a record and its handler.
pub struct Normalizer {
    converters: ConverterRegistry,
}

impl Normalizer {
    pub fn new(converters: ConverterRegistry) -> Self {
        Self { converters }
    }

    pub fn converters(&self) -> &ConverterRegistry {
        &self.converters
    }

    /// Verify converter names and formats of every handler at startup.
    pub fn check_handlers(&self, handlers: &HandlerSet) -> Result<(), ConfigError> {
        for mapping in handlers.handlers().iter().flat_map(|h| h.fields.iter()) {
            if let Some(name) = mapping.converter.as_deref() {
                if !self.converters.has_converter(name) {
                    return Err(ConfigError::UnknownConverter(name.to_string()));
                }
            }
            if let Some(format) = mapping.format.as_deref() {
                FieldFormat::parse(format)?;
            }
        }
        Ok(())
    }

    /// Produce the builder map for `record` under `handler`.
    ///
    /// # Errors
    /// Fails on an unknown converter/format or when a converter or format
    /// rejects its input.
    pub fn normalize(
        &self,
        record: &AuditRecord,
        handler: &HandlerConfig,
    ) -> Result<IndexMap<String, Value>, NormalizeError> {
        let mut builder = record.values().clone();

        for mapping in &handler.fields {
            let Some(value) = record.field(&mapping.source) else {
                tracing::trace!(
                    "record {}: field '{}' absent, mapping skipped",
                    record.id(),
                    mapping.source
                );
                continue;
            };

            let value = self.convert(mapping, value)?;

            if mapping.target() != mapping.source {
                builder.shift_remove(&mapping.source);
            }
            builder.insert(mapping.target().to_string(), value);
        }

        Ok(builder)
    }

    fn convert(&self, mapping: &FieldMapping, value: Value) -> Result<Value, NormalizeError> {
        let value = match mapping.converter.as_deref() {
            Some(name) => {
                let converter = self
                    .converters
                    .get(name)
                    .ok_or_else(|| ConfigError::UnknownConverter(name.to_string()))?;
                converter
                    .convert(&value)
                    .map_err(|reason| NormalizeError::Conversion {
                        field: mapping.source.clone(),
                        converter: name.to_string(),
                        reason,
                    })?
            }
            None => value,
        };

        match mapping.format.as_deref() {
            Some(name) => FieldFormat::parse(name)?
                .apply(&value)
                .map_err(|reason| NormalizeError::Format {
                    field: mapping.source.clone(),
                    format: name.to_string(),
                    reason,
                }),
            None => Ok(value),
        }
    }
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(ConverterRegistry::with_builtins())
    }
}

/// Parse `{k=v, k2={a=1}, k3=[x, y]}` into a map.
///
/// The outer braces are optional. Keys may contain bracketed namespaces
/// (`{http://ns}name=v`). Entries without `=` map to null, as does the
/// literal value `null`.
pub fn string_to_map(source: &str, separator: char) -> Value {
    let inner = strip_wrapping(source.trim(), '{', '}').unwrap_or(source.trim());
    let mut map = Map::new();

    for entry in split_top_level(inner, separator) {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        match find_top_level(entry, '=') {
            Some(pos) => {
                let key = entry[..pos].trim().to_string();
                map.insert(key, parse_scalar_or_nested(&entry[pos + 1..], separator));
            }
            None => {
                map.insert(entry.to_string(), Value::Null);
            }
        }
    }

    Value::Object(map)
}

/// Parse `[a, b, {k=v}]` into an array. The outer brackets are optional.
pub fn string_to_list(source: &str, separator: char) -> Value {
    let inner = strip_wrapping(source.trim(), '[', ']').unwrap_or(source.trim());

    Value::Array(
        split_top_level(inner, separator)
            .into_iter()
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(|item| parse_scalar_or_nested(item, separator))
            .collect(),
    )
}

fn parse_scalar_or_nested(raw: &str, separator: char) -> Value {
    let raw = raw.trim();

    if raw == "null" {
        return Value::Null;
    }
    if let Some(inner) = strip_wrapping(raw, '{', '}') {
        if find_top_level(inner, '=').is_some() || inner.trim().is_empty() {
            return string_to_map(raw, separator);
        }
    }
    if strip_wrapping(raw, '[', ']').is_some() {
        return string_to_list(raw, separator);
    }

    Value::String(raw.to_string())
}

/// Inner text when `s` is fully enclosed by one matching `open`/`close` pair.
fn strip_wrapping(s: &str, open: char, close: char) -> Option<&str> {
    if !s.starts_with(open) || !s.ends_with(close) || s.len() < 2 {
        return None;
    }

    let mut depth = 0usize;
    for (pos, c) in s.char_indices() {
        if c == open {
            depth += 1;
        } else if c == close {
            depth = depth.saturating_sub(1);
            if depth == 0 && pos != s.len() - close.len_utf8() {
                return None;
            }
        }
    }

    Some(&s[open.len_utf8()..s.len() - close.len_utf8()])
}

fn is_open(c: char) -> bool {
    c == '{' || c == '['
}

fn is_close(c: char) -> bool {
    c == '}' || c == ']'
}

fn split_top_level(s: &str, separator: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;

    for (pos, c) in s.char_indices() {
        if is_open(c) {
            depth += 1;
        } else if is_close(c) {
            depth = depth.saturating_sub(1);
        } else if c == separator && depth == 0 {
            parts.push(&s[start..pos]);
            start = pos + c.len_utf8();
        }
    }
    parts.push(&s[start..]);
    parts
}

fn find_top_level(s: &str, needle: char) -> Option<usize> {
    let mut depth = 0usize;
    for (pos, c) in s.char_indices() {
        if is_open(c) {
            depth += 1;
        } else if is_close(c) {
            depth = depth.saturating_sub(1);
        } else if c == needle && depth == 0 {
            return Some(pos);
        }
    }
    None
}
