//! Field path addressing and flattening for nested record values.
//!
//! Rules address record fields with dotted paths (`props.cm:name`,
//! `items[0].sku`), and collection elements are flattened into the same
//! notation before they are merged into a parameter context.

use std::fmt;

use indexmap::IndexMap;
use serde_json::Value;

/// Delimiter between nested keys, both when resolving and when flattening.
pub const PATH_DELIMITER: char = '.';

/// A parsed path to a value inside nested record data.
///
/// # Examples
///
/// - `dept` - top-level field
/// - `props.size` - key inside a nested map
/// - `items[1].sku` or `items.[1].sku` - key inside the second array element
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    /// The raw path string
    pub raw: String,
    /// Parsed path segments
    pub segments: Vec<PathSegment>,
}

/// A segment in a field path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    /// A named key
    Field(String),
    /// An array index
    Index(usize),
}

impl FieldPath {
    /// Parse a dotted path; `[n]` suffixes and `[n]` segments become indexes.
    pub fn from_dotted(path: &str) -> Self {
        let mut segments = Vec::new();

        for part in path.split(PATH_DELIMITER).filter(|s| !s.is_empty()) {
            let (name, mut rest) = match part.find('[') {
                Some(pos) => (&part[..pos], &part[pos..]),
                None => (part, ""),
            };

            if !name.is_empty() {
                segments.push(PathSegment::Field(name.to_string()));
            }

            while let Some(stripped) = rest.strip_prefix('[') {
                let Some(end) = stripped.find(']') else {
                    break;
                };
                match stripped[..end].parse::<usize>() {
                    Ok(index) => segments.push(PathSegment::Index(index)),
                    // Not an index: keep the bracketed text as part of a key.
                    Err(_) => segments.push(PathSegment::Field(format!("[{}]", &stripped[..end]))),
                }
                rest = &stripped[end + 1..];
            }
        }

        Self {
            raw: path.to_string(),
            segments,
        }
    }

    /// Resolve this path against a JSON value.
    pub fn resolve<'a>(&self, root: &'a Value) -> Option<&'a Value> {
        self.segments
            .iter()
            .try_fold(root, |current, segment| match (segment, current) {
                (PathSegment::Field(key), Value::Object(map)) => map.get(key),
                (PathSegment::Index(index), Value::Array(items)) => items.get(*index),
                _ => None,
            })
    }

    /// Resolve this path against a top-level field map.
    pub fn resolve_in<'a>(&self, fields: &'a IndexMap<String, Value>) -> Option<&'a Value> {
        let (first, rest) = self.segments.split_first()?;
        let PathSegment::Field(key) = first else {
            return None;
        };

        let head = fields.get(key)?;
        let tail = FieldPath {
            raw: self.raw.clone(),
            segments: rest.to_vec(),
        };
        tail.resolve(head)
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

/// Flatten a value into `prefix`-rooted dotted keys.
///
/// Maps contribute `prefix.key`, arrays contribute `prefix[i]`, scalars are
/// stored under `prefix` itself. Empty maps and arrays are kept as values so
/// the key is still present after flattening.
pub fn flatten(value: &Value, prefix: &str) -> IndexMap<String, Value> {
    let mut flat = IndexMap::new();
    flatten_into(value, prefix, &mut flat);
    flat
}

fn flatten_into(value: &Value, prefix: &str, out: &mut IndexMap<String, Value>) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (key, nested) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{}{}{}", prefix, PATH_DELIMITER, key)
                };
                flatten_into(nested, &path, out);
            }
        }
        Value::Array(items) if !items.is_empty() => {
            for (index, nested) in items.iter().enumerate() {
                flatten_into(nested, &format!("{}[{}]", prefix, index), out);
            }
        }
        other => {
            out.insert(prefix.to_string(), other.clone());
        }
    }
}
