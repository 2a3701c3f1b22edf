//! Template operation executor boundary and template store.
//!
//! The engine only knows execution keys. A [`TemplateExecutor`] maps a key to
//! a concrete operation, runs it against a parameter context and hands back
//! at most one flat result row. Templates are loaded from a directory, one
//! file per key, the key being the file name without its `.sql` extension.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::Value;
use thiserror::Error;

use crate::runtime::config_loader::ConfigError;
use crate::runtime::context::{ExecutionResult, ParameterContext};

/// File extension of template files.
pub const TEMPLATE_EXTENSION: &str = "sql";

/// Quoted literals, quoted identifiers, line comments and block comments.
const LITERAL_OR_COMMENT: &str = r#"'(?:[^']|'')*'|"[^"]*"|--[^\n]*|(?s:/\*.*?\*/)"#;

static LITERAL_OR_COMMENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(LITERAL_OR_COMMENT).expect("valid literal or comment regex")
});

// Quoted literals and comments are matched first so that colons inside them
// are never read as parameters; `::` casts are matched before `:name`.
static NAMED_PARAMETER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"{}|::|:([A-Za-z_][A-Za-z0-9_.]*)", LITERAL_OR_COMMENT))
        .expect("valid named parameter regex")
});

/// `sql` with every literal and comment replaced by a single space.
pub(crate) fn strip_literals_and_comments(sql: &str) -> String {
    LITERAL_OR_COMMENT_RE.replace_all(sql, " ").into_owned()
}

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("no template defined for execution '{0}'")]
    UndefinedTemplate(String),

    #[error("execution '{template}': no value supplied for parameter '{parameter}'")]
    MissingParameter { template: String, parameter: String },

    #[error("execution '{template}' returned more than one row")]
    MultipleRows { template: String },

    #[error("execution '{template}' returned an unreadable row: {reason}")]
    InvalidRow { template: String, reason: String },

    #[error("execution '{template}' failed: {reason}")]
    Failed { template: String, reason: String },
}

/// Runs named, parameterized operations for the engine.
pub trait TemplateExecutor: Send + Sync {
    /// Whether `key` names a known template.
    fn has_template(&self, key: &str) -> bool;

    /// Execute template `key` against `params`.
    ///
    /// Returns the single result row as a flat map; an empty map when the
    /// operation produced no row.
    fn execute(
        &self,
        key: &str,
        params: &ParameterContext,
    ) -> Result<ExecutionResult, ExecutionError>;
}

/// SQL text with `:name` parameters rewritten to positional `$n` placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedQuery {
    /// Rewritten SQL
    pub sql: String,
    /// Parameter name for each placeholder, `$1` first
    pub parameters: Vec<String>,
}

impl NamedQuery {
    /// Rewrite named parameters. A name used twice reuses its placeholder.
    ///
    /// # Example
    /// ```
    /// use auditpipe::runtime::NamedQuery;
    ///
    /// let q = NamedQuery::parse("SELECT name FROM t WHERE id = :audit.id::bigint AND dept = :dept");
    /// assert_eq!(q.sql, "SELECT name FROM t WHERE id = $1::bigint AND dept = $2");
    /// assert_eq!(q.parameters, vec!["audit.id", "dept"]);
    /// ```
    pub fn parse(sql: &str) -> Self {
        let mut parameters: Vec<String> = Vec::new();

        let rewritten = NAMED_PARAMETER_RE.replace_all(sql, |caps: &Captures| {
            let Some(name) = caps.get(1) else {
                return caps[0].to_string();
            };

            // A sentence-ending dot is not part of the name.
            let full = name.as_str();
            let trimmed = full.trim_end_matches('.');
            let trailing = &full[trimmed.len()..];

            let position = match parameters.iter().position(|p| p == trimmed) {
                Some(existing) => existing,
                None => {
                    parameters.push(trimmed.to_string());
                    parameters.len() - 1
                }
            };
            format!("${}{}", position + 1, trailing)
        });

        Self {
            sql: rewritten.into_owned(),
            parameters,
        }
    }

    /// Text values for each placeholder, in order.
    ///
    /// Null binds as SQL NULL, strings as-is, other scalars in their JSON
    /// text form and nested values as JSON documents.
    pub fn bind_values(
        &self,
        template: &str,
        params: &ParameterContext,
    ) -> Result<Vec<Option<String>>, ExecutionError> {
        self.parameters
            .iter()
            .map(|name| {
                params
                    .get(name)
                    .map(bind_text)
                    .ok_or_else(|| ExecutionError::MissingParameter {
                        template: template.to_string(),
                        parameter: name.clone(),
                    })
            })
            .collect()
    }
}

fn bind_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// A loaded template.
#[derive(Debug, Clone)]
pub struct Template {
    pub key: String,
    pub source: String,
    pub query: NamedQuery,
}

/// Templates keyed by execution key.
#[derive(Debug, Clone, Default)]
pub struct TemplateStore {
    templates: HashMap<String, Template>,
}

impl TemplateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every `*.sql` file of `dir`; the key is the file stem.
    ///
    /// Other files and subdirectories are ignored.
    pub fn load_from_dir<P: AsRef<Path>>(dir: P) -> Result<Self, ConfigError> {
        let dir = dir.as_ref();
        let io_error = |source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        };

        let mut store = Self::new();
        for entry in fs::read_dir(dir).map_err(io_error)? {
            let path = entry.map_err(io_error)?.path();

            let extension = path.extension().and_then(|e| e.to_str());
            if !path.is_file() || extension != Some(TEMPLATE_EXTENSION) {
                continue;
            }
            let Some(key) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };

            let source = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
                path: path.clone(),
                source,
            })?;
            tracing::debug!("loaded template '{}' from {}", key, path.display());
            store.insert(key, source);
        }

        Ok(store)
    }

    /// Add or replace a template.
    pub fn insert(&mut self, key: impl Into<String>, source: impl Into<String>) {
        let key = key.into();
        let source = source.into();
        let query = NamedQuery::parse(&source);
        self.templates.insert(key.clone(), Template { key, source, query });
    }

    pub fn get(&self, key: &str) -> Option<&Template> {
        self.templates.get(key)
    }

    pub fn has_template(&self, key: &str) -> bool {
        self.templates.contains_key(key)
    }

    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.templates.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

/// An in-process operation usable as a template.
pub trait Operation: Send + Sync {
    fn run(&self, params: &ParameterContext) -> Result<ExecutionResult, String>;
}

impl<F> Operation for F
where
    F: Fn(&ParameterContext) -> Result<ExecutionResult, String> + Send + Sync,
{
    fn run(&self, params: &ParameterContext) -> Result<ExecutionResult, String> {
        self(params)
    }
}

/// Executor backed by registered in-process operations.
///
/// Useful for embedding lookups that need no database, and for tests.
///
/// # Example
/// ```
/// use auditpipe::runtime::{ExecutionResult, OperationRegistry, ParameterContext, TemplateExecutor};
/// use serde_json::json;
///
/// let mut ops = OperationRegistry::new();
/// ops.register("echoUser", Box::new(|params: &ParameterContext| -> Result<ExecutionResult, String> {
///     let mut row = ExecutionResult::new();
///     row.insert("user".to_string(), params.get("audit.user").cloned().unwrap_or_default());
///     Ok(row)
/// }));
///
/// let mut params = ParameterContext::new();
/// params.insert("audit.user", json!("alice"));
/// assert_eq!(ops.execute("echoUser", &params).unwrap()["user"], json!("alice"));
/// ```
#[derive(Default)]
pub struct OperationRegistry {
    operations: HashMap<String, Box<dyn Operation>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an operation; an existing one under `key` is replaced.
    pub fn register(&mut self, key: impl Into<String>, operation: Box<dyn Operation>) {
        self.operations.insert(key.into(), operation);
    }

    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.operations.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }
}

impl TemplateExecutor for OperationRegistry {
    fn has_template(&self, key: &str) -> bool {
        self.operations.contains_key(key)
    }

    fn execute(
        &self,
        key: &str,
        params: &ParameterContext,
    ) -> Result<ExecutionResult, ExecutionError> {
        let operation = self
            .operations
            .get(key)
            .ok_or_else(|| ExecutionError::UndefinedTemplate(key.to_string()))?;

        operation.run(params).map_err(|reason| ExecutionError::Failed {
            template: key.to_string(),
            reason,
        })
    }
}

impl std::fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationRegistry")
            .field("keys", &self.keys())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_operation_registry() {
        let mut ops = OperationRegistry::new();
        ops.register(
            "fails",
            Box::new(|_: &ParameterContext| -> Result<ExecutionResult, String> {
                Err("boom".to_string())
            }),
        );

        assert!(ops.has_template("fails"));
        assert!(!ops.has_template("other"));

        let err = ops.execute("fails", &ParameterContext::new()).unwrap_err();
        assert_eq!(err.to_string(), "execution 'fails' failed: boom");

        let err = ops.execute("other", &ParameterContext::new()).unwrap_err();
        assert!(matches!(err, ExecutionError::UndefinedTemplate(ref k) if k == "other"));
    }

    #[test]
    fn test_parse_rewrites_parameters() {
        let q = NamedQuery::parse(
            "INSERT INTO audit (id, who, manager) VALUES (:audit.id, :audit.user, :lookupManager.name) RETURNING id",
        );

        assert_eq!(
            q.sql,
            "INSERT INTO audit (id, who, manager) VALUES ($1, $2, $3) RETURNING id"
        );
        assert_eq!(q.parameters, vec!["audit.id", "audit.user", "lookupManager.name"]);
    }

    #[test]
    fn test_parse_reuses_placeholders_and_keeps_casts() {
        let q = NamedQuery::parse("SELECT :a::int + :a::int, now()::date WHERE x = :b.");

        assert_eq!(q.sql, "SELECT $1::int + $1::int, now()::date WHERE x = $2.");
        assert_eq!(q.parameters, vec!["a", "b"]);
    }

    #[test]
    fn test_parse_ignores_literals_and_comments() {
        let q = NamedQuery::parse(
            "SELECT ':not_a_param', \"weird:col\" -- :comment\nFROM t WHERE t.a = :real",
        );

        assert_eq!(
            q.sql,
            "SELECT ':not_a_param', \"weird:col\" -- :comment\nFROM t WHERE t.a = $1"
        );
        assert_eq!(q.parameters, vec!["real"]);
    }

    #[test]
    fn test_parse_ignores_block_comments() {
        let q = NamedQuery::parse("/* :audit.id is\n bound below */ SELECT name WHERE id = :id");

        assert_eq!(q.sql, "/* :audit.id is\n bound below */ SELECT name WHERE id = $1");
        assert_eq!(q.parameters, vec!["id"]);
    }

    #[test]
    fn test_strip_literals_and_comments() {
        let stripped = strip_literals_and_comments(
            "/* lead */ INSERT INTO log (msg) VALUES ('it''s returning') -- tail\n",
        );

        assert_eq!(stripped, "  INSERT INTO log (msg) VALUES ( )  \n");
    }

    #[test]
    fn test_bind_values() {
        let q = NamedQuery::parse("SELECT :s, :n, :nil, :obj");
        let mut params = ParameterContext::new();
        params.insert("s", json!("text"));
        params.insert("n", json!(4));
        params.insert("nil", Value::Null);
        params.insert("obj", json!({"a": [1]}));

        let binds = q.bind_values("t", &params).unwrap();

        assert_eq!(
            binds,
            vec![
                Some("text".to_string()),
                Some("4".to_string()),
                None,
                Some(r#"{"a":[1]}"#.to_string())
            ]
        );
    }

    #[test]
    fn test_bind_values_missing_parameter() {
        let q = NamedQuery::parse("SELECT :absent");
        let err = q.bind_values("lookup", &ParameterContext::new()).unwrap_err();

        assert_eq!(
            err.to_string(),
            "execution 'lookup': no value supplied for parameter 'absent'"
        );
    }

    #[test]
    fn test_load_from_dir_uses_sql_stems() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("lookupManager.sql"), "SELECT :dept").unwrap();
        fs::write(temp_dir.path().join("priceLookup.sql"), "SELECT 1").unwrap();
        fs::write(temp_dir.path().join("README.md"), "not a template").unwrap();
        fs::create_dir(temp_dir.path().join("nested.sql")).unwrap();

        let store = TemplateStore::load_from_dir(temp_dir.path()).unwrap();

        assert_eq!(store.keys(), vec!["lookupManager", "priceLookup"]);
        assert_eq!(store.get("lookupManager").unwrap().query.sql, "SELECT $1");
        assert!(!store.has_template("README"));
    }

    #[test]
    fn test_load_from_missing_dir() {
        let err = TemplateStore::load_from_dir("/nonexistent/templates").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
