//! # auditpipe: rule-routed template pipelines for audit records
//!
//! Each incoming audit record is matched against an ordered list of handler
//! rule sets. The first handler whose rules all hold selects the record's
//! pipeline: an ordered chain of named template executions, each seeing the
//! results of the ones before it, followed by an isolated sub-chain per
//! element of each configured collection field.
//!
//! ## Example configuration
//!
//! ```yaml
//! application: audit-access
//! templates: sql
//! handlers:
//!   - name: sales
//!     rules:
//!       - { field: dept, kind: equals, value: sales }
//!     pipeline:
//!       executions: [lookupManager, auditInsert]
//!       collections:
//!         items:
//!           executions: [priceLookup]
//! ```
//!
//! With `sql/lookupManager.sql` returning `name`, `auditInsert.sql` can bind
//! `:lookupManager.name`; `priceLookup.sql` runs once per element of `items`
//! and binds `:items.sku`.
//!
//! ## Features
//!
//! - `postgres` (default): diesel-backed SQL template executor

// Core modules
pub mod evaluator;
pub mod extraction;
pub mod record;
pub mod serialization;

// Routing, normalization and the execution engine
pub mod runtime;

// Diesel runtime infrastructure
#[cfg(feature = "postgres")]
pub mod diesel_runtime;

// Re-export key types
pub use evaluator::{ContainsEvaluator, EqualsEvaluator, Evaluator, EvaluatorRegistry};
pub use extraction::{flatten, FieldPath};
pub use record::AuditRecord;

// Re-export runtime types
pub use runtime::{
    ConfigError, Engine, ExecutionError, HandlerConfig, HandlerSet, ItemOutcome, ParameterContext,
    PipelineError, RouteSelector, Settings, TemplateExecutor,
};

#[cfg(feature = "postgres")]
pub use diesel_runtime::{Database, SqlTemplateExecutor};
