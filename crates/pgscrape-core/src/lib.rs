//! pgscrape-core: shared types for the pgscrape exporter.
//!
//! Holds the immutable query definitions that every backend runs, the
//! TOML loader that produces them, and the connection-string helpers used
//! when spawning peripheral backends.

pub mod config;
pub mod dsn;
pub mod query;

pub use config::{ConfigError, load_queries};
pub use query::{ColumnSpec, ColumnUsage, MetricKind, QuerySpec};
