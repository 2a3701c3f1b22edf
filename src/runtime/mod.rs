//! Record processing runtime.
//!
//! Configuration loading and validation, routing, normalization, the
//! parameter context and the chain-and-fan-out execution engine.

pub mod config_loader;
pub mod context;
pub mod engine;
pub mod executor;
pub mod normalizer;
pub mod router;

// Re-export key types
pub use config_loader::{
    validate_handlers, CollectionPipeline, ConfigError, DatabaseSettings, FieldMapping,
    HandlerConfig, HandlerSet, MatchRule, Pipeline, Settings, DEFAULT_NO_MATCH_HANDLER,
};
pub use context::{ExecutionResult, ParameterContext};
pub use engine::{CollectionOutcome, Engine, ItemOutcome, PipelineError, ProcessingItem};
pub use executor::{
    ExecutionError, NamedQuery, Operation, OperationRegistry, Template, TemplateExecutor,
    TemplateStore,
};
pub use normalizer::{ConverterRegistry, FieldConverter, FieldFormat, NormalizeError, Normalizer};
pub use router::RouteSelector;
