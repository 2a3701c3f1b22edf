//! Diesel runtime: PostgreSQL connection pooling and the SQL template
//! executor.
//!
//! Compiled with the `postgres` feature (on by default).

pub mod database;
pub mod sql_executor;

// Re-export key types
pub use database::{Database, DatabaseError, Pool, PooledConnection};
pub use sql_executor::SqlTemplateExecutor;
