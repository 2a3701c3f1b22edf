//! Handler configuration loader and startup validation.
//!
//! Loads the ordered handler list (match rules, field mappings, pipelines)
//! from YAML and validates it once before any record is processed. A
//! validated [`HandlerSet`] is immutable for the lifetime of the process.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::evaluator::{scalar_text, EvaluatorRegistry, EQUALS};

/// Handler name used for records no rule set matches.
pub const DEFAULT_NO_MATCH_HANDLER: &str = "donotprocess";

/// Configuration errors. All of them are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Yaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("invalid handler configuration:\n  - {}", .0.join("\n  - "))]
    Invalid(Vec<String>),

    #[error("handler '{handler}' references undefined execution '{key}'")]
    UndefinedExecution { handler: String, key: String },

    #[error("unknown converter '{0}'")]
    UnknownConverter(String),

    #[error("unknown field format '{0}'")]
    UnknownFormat(String),
}

/// One `(field, kind, value)` match rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchRule {
    /// Record field (dotted paths and `audit.*` names allowed)
    pub field: String,

    /// Evaluator kind; `None` means the registry default
    #[serde(default)]
    pub kind: Option<String>,

    /// Expected value handed to the evaluator
    pub value: Value,
}

impl MatchRule {
    pub fn new(field: impl Into<String>, kind: Option<&str>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            kind: kind.map(str::to_string),
            value: value.into(),
        }
    }

    fn kind_or_default(&self) -> &str {
        self.kind.as_deref().unwrap_or(EQUALS)
    }

    /// Canonical text used to compare rule sets irrespective of order.
    /// Scalars compare by their text, as the evaluators do.
    fn canonical(&self) -> String {
        let value = scalar_text(&self.value).unwrap_or_else(|| self.value.to_string());
        format!("{}\u{1f}{}\u{1f}{}", self.field, self.kind_or_default(), value)
    }
}

/// Normalizer instruction for one record field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    /// Record field to read
    pub source: String,

    /// Builder key to write; defaults to `source`
    #[serde(default)]
    pub target: Option<String>,

    /// Converter name from the converter registry
    #[serde(default)]
    pub converter: Option<String>,

    /// Field format (`lowercase`, `uppercase`, `trim`, `date:<pattern>`)
    #[serde(default)]
    pub format: Option<String>,
}

impl FieldMapping {
    pub fn target(&self) -> &str {
        self.target.as_deref().unwrap_or(&self.source)
    }
}

/// Ordered execution chain plus per-collection sub-chains.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    #[serde(default)]
    pub executions: Vec<String>,

    /// Collection name -> sub-chain, in declaration order
    #[serde(default)]
    pub collections: IndexMap<String, CollectionPipeline>,
}

impl Pipeline {
    pub fn is_empty(&self) -> bool {
        self.executions.is_empty() && self.collections.values().all(|c| c.executions.is_empty())
    }

    /// Every execution key named by the item chain and all collection chains.
    pub fn execution_keys(&self) -> impl Iterator<Item = &str> {
        self.executions.iter().map(String::as_str).chain(
            self.collections
                .values()
                .flat_map(|c| c.executions.iter().map(String::as_str)),
        )
    }
}

/// Sub-chain run once per element of a list-valued builder field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectionPipeline {
    /// Builder field to fan out over; defaults to the collection name
    #[serde(default)]
    pub field: Option<String>,

    #[serde(default)]
    pub executions: Vec<String>,
}

impl CollectionPipeline {
    pub fn source_field<'a>(&'a self, collection: &'a str) -> &'a str {
        self.field.as_deref().unwrap_or(collection)
    }
}

/// A named rule set with its normalizer mappings and pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerConfig {
    pub name: String,

    #[serde(default)]
    pub rules: Vec<MatchRule>,

    #[serde(default)]
    pub fields: Vec<FieldMapping>,

    #[serde(default)]
    pub pipeline: Pipeline,
}

impl HandlerConfig {
    pub fn new(name: impl Into<String>, rules: Vec<MatchRule>, pipeline: Pipeline) -> Self {
        Self {
            name: name.into(),
            rules,
            fields: Vec::new(),
            pipeline,
        }
    }

    /// The no-op handler unmatched records are routed to.
    pub fn fallback(name: impl Into<String>) -> Self {
        Self::new(name, Vec::new(), Pipeline::default())
    }

    fn rule_set_key(&self) -> Vec<String> {
        let mut key: Vec<String> = self.rules.iter().map(MatchRule::canonical).collect();
        key.sort();
        key.dedup();
        key
    }
}

/// Database pool settings for the SQL template executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseSettings {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_idle")]
    pub min_idle: u32,
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_max_lifetime")]
    pub max_lifetime_secs: u64,
}

fn default_max_connections() -> u32 {
    15
}

fn default_min_idle() -> u32 {
    1
}

fn default_connection_timeout() -> u64 {
    30
}

fn default_idle_timeout() -> u64 {
    600
}

fn default_max_lifetime() -> u64 {
    1800
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
            min_idle: default_min_idle(),
            connection_timeout_secs: default_connection_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            max_lifetime_secs: default_max_lifetime(),
        }
    }
}

/// Top-level settings file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Application name, used in log output
    #[serde(default = "default_application")]
    pub application: String,

    /// Name of the fallback handler for unmatched records
    #[serde(default = "default_no_match_handler")]
    pub no_match_handler: String,

    /// Template directory; relative paths resolve against the settings file
    #[serde(default)]
    pub templates: Option<PathBuf>,

    #[serde(default)]
    pub database: DatabaseSettings,

    /// Handlers in match priority order
    #[serde(default)]
    pub handlers: Vec<HandlerConfig>,
}

fn default_application() -> String {
    "auditpipe".to_string()
}

fn default_no_match_handler() -> String {
    DEFAULT_NO_MATCH_HANDLER.to_string()
}

impl Settings {
    /// Load settings from a YAML file.
    ///
    /// A relative `templates` directory is resolved against the directory
    /// holding the file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut settings: Settings =
            serde_yaml::from_str(&contents).map_err(|source| ConfigError::Yaml {
                path: path.to_path_buf(),
                source,
            })?;

        if let (Some(templates), Some(base)) = (settings.templates.as_ref(), path.parent()) {
            if templates.is_relative() {
                settings.templates = Some(base.join(templates));
            }
        }

        Ok(settings)
    }

    /// Parse settings from a YAML string (no path resolution).
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(yaml).map_err(|source| ConfigError::Yaml {
            path: PathBuf::from("<inline>"),
            source,
        })
    }

    /// Apply `AUDITPIPE_TEMPLATES` and `DATABASE_URL` from the environment.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("AUDITPIPE_TEMPLATES") {
            self.templates = Some(PathBuf::from(dir));
        }
        if let Ok(url) = std::env::var("DATABASE_URL") {
            self.database.url = Some(url);
        }
    }

    /// Validate the handler list and build the immutable handler set.
    pub fn handler_set(&self, registry: &EvaluatorRegistry) -> Result<HandlerSet, ConfigError> {
        HandlerSet::new(self.handlers.clone(), &self.no_match_handler, registry)
    }
}

/// Validated, ordered handler configurations plus the fallback handler.
#[derive(Debug, Clone)]
pub struct HandlerSet {
    handlers: Vec<HandlerConfig>,
    fallback: HandlerConfig,
}

impl HandlerSet {
    /// Validate `handlers` and build the set.
    ///
    /// # Errors
    /// Returns [`ConfigError::Invalid`] listing every violation found.
    pub fn new(
        handlers: Vec<HandlerConfig>,
        no_match_handler: &str,
        registry: &EvaluatorRegistry,
    ) -> Result<Self, ConfigError> {
        validate_handlers(&handlers, no_match_handler, registry)?;

        Ok(Self {
            handlers,
            fallback: HandlerConfig::fallback(no_match_handler),
        })
    }

    /// Handlers in declaration order.
    pub fn handlers(&self) -> &[HandlerConfig] {
        &self.handlers
    }

    pub fn fallback(&self) -> &HandlerConfig {
        &self.fallback
    }

    pub fn get(&self, name: &str) -> Option<&HandlerConfig> {
        self.handlers.iter().find(|h| h.name == name)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Check every execution key against `is_defined`.
    ///
    /// # Errors
    /// Returns the first `(handler, key)` pair with no definition.
    pub fn check_executions(&self, is_defined: impl Fn(&str) -> bool) -> Result<(), ConfigError> {
        for handler in &self.handlers {
            if let Some(key) = handler.pipeline.execution_keys().find(|k| !is_defined(k)) {
                return Err(ConfigError::UndefinedExecution {
                    handler: handler.name.clone(),
                    key: key.to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Startup validation of an ordered handler list.
///
/// Rejects empty or duplicate names, a handler shadowing the fallback name,
/// identical rule sets and `equals` rules that can never hold together.
/// Unknown evaluator kinds only warn: they resolve to the default evaluator.
pub fn validate_handlers(
    handlers: &[HandlerConfig],
    no_match_handler: &str,
    registry: &EvaluatorRegistry,
) -> Result<(), ConfigError> {
    let mut errors = Vec::new();
    let mut names: HashMap<&str, usize> = HashMap::new();
    let mut rule_sets: HashMap<Vec<String>, &str> = HashMap::new();

    if no_match_handler.trim().is_empty() {
        errors.push("no_match_handler must not be empty".to_string());
    }

    for (index, handler) in handlers.iter().enumerate() {
        let context = format!("handlers[{}] '{}'", index, handler.name);

        if handler.name.trim().is_empty() {
            errors.push(format!("handlers[{}]: name must not be empty", index));
        } else if let Some(previous) = names.insert(&handler.name, index) {
            errors.push(format!(
                "{}: duplicate handler name (also handlers[{}])",
                context, previous
            ));
        }

        if handler.name == no_match_handler {
            errors.push(format!(
                "{}: name collides with the no-match handler",
                context
            ));
        }

        if let Some(other) = rule_sets.insert(handler.rule_set_key(), &handler.name) {
            errors.push(format!(
                "{}: rule set is identical to handler '{}'",
                context, other
            ));
        }

        if handler.rules.is_empty() {
            tracing::warn!("{} has no rules and matches every record", context);
        }

        let mut equals_by_field: HashMap<&str, &Value> = HashMap::new();
        for rule in &handler.rules {
            if let Some(kind) = rule.kind.as_deref() {
                if !registry.has_evaluator(kind) {
                    tracing::warn!(
                        "{}: unknown evaluator kind '{}' on field '{}', using the default",
                        context,
                        kind,
                        rule.field
                    );
                }
            }

            if rule.kind_or_default() != EQUALS {
                continue;
            }
            if let Some(existing) = equals_by_field.insert(&rule.field, &rule.value) {
                if !same_expected_value(existing, &rule.value) {
                    errors.push(format!(
                        "{}: field '{}' must equal both {} and {}, rule set can never match",
                        context, rule.field, existing, rule.value
                    ));
                }
            }
        }

        for (collection, sub) in &handler.pipeline.collections {
            if sub.source_field(collection).trim().is_empty() {
                errors.push(format!(
                    "{}: collection '{}' has an empty field",
                    context, collection
                ));
            }
        }

        if let Some(key) = handler.pipeline.execution_keys().find(|k| k.trim().is_empty()) {
            errors.push(format!("{}: empty execution key '{}'", context, key));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::Invalid(errors))
    }
}

fn same_expected_value(a: &Value, b: &Value) -> bool {
    a == b || matches!((scalar_text(a), scalar_text(b)), (Some(x), Some(y)) if x == y)
}
