//! Pipeline execution engine.
//!
//! For each record: route to a handler, normalize the record into builder
//! fields, run the handler's execution chain against a fresh parameter
//! context, then fan out over each configured collection. The item-level
//! chain always completes before any collection element runs.

use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::extraction::FieldPath;
use crate::record::AuditRecord;
use crate::runtime::config_loader::{CollectionPipeline, ConfigError, HandlerConfig};
use crate::runtime::context::ParameterContext;
use crate::runtime::executor::{ExecutionError, TemplateExecutor};
use crate::runtime::normalizer::{NormalizeError, Normalizer};
use crate::runtime::router::RouteSelector;

/// Errors aborting the processing of one record.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("record {record_id}: {source}")]
    Config {
        record_id: i64,
        #[source]
        source: ConfigError,
    },

    #[error("record {record_id}: normalization failed: {source}")]
    Normalize {
        record_id: i64,
        #[source]
        source: NormalizeError,
    },

    #[error("record {record_id}: execution '{key}' failed: {source}")]
    Execution {
        record_id: i64,
        key: String,
        #[source]
        source: ExecutionError,
    },
}

impl PipelineError {
    pub fn record_id(&self) -> i64 {
        match self {
            PipelineError::Config { record_id, .. }
            | PipelineError::Normalize { record_id, .. }
            | PipelineError::Execution { record_id, .. } => *record_id,
        }
    }
}

/// Unit of work: a record, its handler and its normalized builder fields.
#[derive(Debug, Clone)]
pub struct ProcessingItem<'a> {
    pub record: AuditRecord,
    pub handler: &'a HandlerConfig,
    pub builder: IndexMap<String, Value>,
}

/// Final contexts of one collection, one per element in order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectionOutcome {
    pub name: String,
    pub contexts: Vec<ParameterContext>,
}

/// Observable result of processing one record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemOutcome {
    pub record_id: i64,
    pub handler: String,
    /// Item-level context after the whole chain ran
    pub context: ParameterContext,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub collections: Vec<CollectionOutcome>,
    /// Number of executor calls made for the record
    pub executions: usize,
}

/// Drives routing, normalization and execution for records.
///
/// Holds no per-record state, so one engine can serve records from several
/// threads when the executor allows it.
pub struct Engine<E: TemplateExecutor> {
    router: RouteSelector,
    normalizer: Normalizer,
    executor: E,
}

impl<E: TemplateExecutor> Engine<E> {
    /// Build an engine without cross-checking execution keys.
    ///
    /// An undefined key then surfaces as a [`PipelineError::Config`] when the
    /// first record reaches it.
    pub fn new(router: RouteSelector, normalizer: Normalizer, executor: E) -> Self {
        Self {
            router,
            normalizer,
            executor,
        }
    }

    /// Build an engine and verify at startup that every execution key has a
    /// template and every field mapping a known converter and format.
    pub fn validated(
        router: RouteSelector,
        normalizer: Normalizer,
        executor: E,
    ) -> Result<Self, ConfigError> {
        let engine = Self::new(router, normalizer, executor);
        engine.check()?;
        Ok(engine)
    }

    /// Startup checks; see [`Engine::validated`].
    pub fn check(&self) -> Result<(), ConfigError> {
        let handlers = self.router.handlers();
        handlers.check_executions(|key| self.executor.has_template(key))?;
        self.normalizer.check_handlers(handlers)
    }

    pub fn router(&self) -> &RouteSelector {
        &self.router
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// Route and normalize a record.
    pub fn prepare(&self, record: AuditRecord) -> Result<ProcessingItem<'_>, PipelineError> {
        let handler = self.router.select(&record);
        let builder = self
            .normalizer
            .normalize(&record, handler)
            .map_err(|source| PipelineError::Normalize {
                record_id: record.id(),
                source,
            })?;

        Ok(ProcessingItem {
            record,
            handler,
            builder,
        })
    }

    /// Route, normalize and process a record.
    pub fn handle(&self, record: AuditRecord) -> Result<ItemOutcome, PipelineError> {
        let item = self.prepare(record)?;
        self.process(&item)
    }

    /// Run the item chain, then every collection sub-chain.
    ///
    /// # Errors
    /// The first undefined execution key or failing execution aborts the
    /// item; nothing of the partial outcome is returned.
    pub fn process(&self, item: &ProcessingItem<'_>) -> Result<ItemOutcome, PipelineError> {
        let record_id = item.record.id();
        let pipeline = &item.handler.pipeline;

        let mut context = ParameterContext::seed(&item.builder, &item.record);
        let mut executions = self.run_chain(item, &mut context, &pipeline.executions)?;

        let mut collections = Vec::with_capacity(pipeline.collections.len());
        for (name, sub) in &pipeline.collections {
            let (contexts, count) = self.fan_out(item, name, sub, &context)?;
            executions += count;
            if !contexts.is_empty() {
                collections.push(CollectionOutcome {
                    name: name.clone(),
                    contexts,
                });
            }
        }

        tracing::debug!(
            "record {} processed by '{}' with {} executions",
            record_id,
            item.handler.name,
            executions
        );

        Ok(ItemOutcome {
            record_id,
            handler: item.handler.name.clone(),
            context,
            collections,
            executions,
        })
    }

    /// Run `keys` in order against `context`, merging each result under its
    /// key. Returns the number of executions run.
    pub fn run_chain(
        &self,
        item: &ProcessingItem<'_>,
        context: &mut ParameterContext,
        keys: &[String],
    ) -> Result<usize, PipelineError> {
        let record_id = item.record.id();
        for key in keys {
            if !self.executor.has_template(key) {
                return Err(PipelineError::Config {
                    record_id,
                    source: ConfigError::UndefinedExecution {
                        handler: item.handler.name.clone(),
                        key: key.clone(),
                    },
                });
            }

            tracing::trace!(
                "record {}: executing '{}' with {:?}",
                record_id,
                key,
                context.values()
            );

            let result = self
                .executor
                .execute(key, context)
                .map_err(|source| PipelineError::Execution {
                    record_id,
                    key: key.clone(),
                    source,
                })?;

            let merged = context.merge_result(key, result);
            tracing::trace!("record {}: '{}' returned {} values", record_id, key, merged);
        }

        Ok(keys.len())
    }

    fn fan_out(
        &self,
        item: &ProcessingItem<'_>,
        name: &str,
        sub: &CollectionPipeline,
        parent: &ParameterContext,
    ) -> Result<(Vec<ParameterContext>, usize), PipelineError> {
        let field = sub.source_field(name);
        let elements = match collection_elements(&item.builder, field) {
            Some(elements) => elements,
            None => {
                tracing::debug!(
                    "record {}: collection '{}' skipped, field '{}' absent or empty",
                    item.record.id(),
                    name,
                    field
                );
                return Ok((Vec::new(), 0));
            }
        };

        let mut contexts = Vec::with_capacity(elements.len());
        let mut executions = 0;
        for element in elements {
            let mut element_context = parent.clone();
            element_context.add_collection_element(name, element);
            executions += self.run_chain(item, &mut element_context, &sub.executions)?;
            contexts.push(element_context);
        }

        Ok((contexts, executions))
    }
}

/// Elements to fan out over, or `None` when the field is absent, null or an
/// empty array. Any other non-array value is a single element.
fn collection_elements<'a>(
    builder: &'a IndexMap<String, Value>,
    field: &str,
) -> Option<Vec<&'a Value>> {
    let value = builder
        .get(field)
        .or_else(|| FieldPath::from_dotted(field).resolve_in(builder))?;

    match value {
        Value::Null => None,
        Value::Array(items) if items.is_empty() => None,
        Value::Array(items) => Some(items.iter().collect()),
        other => Some(vec![other]),
    }
}

impl<E: TemplateExecutor + std::fmt::Debug> std::fmt::Debug for Engine<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("router", &self.router)
            .field("executor", &self.executor)
            .finish()
    }
}
