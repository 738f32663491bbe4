//! pgscrape-collector: cached query execution and scrape aggregation.
//!
//! The engine is layered the same way a scrape flows through it:
//!
//! - [`QueryCollector`]: one query on one backend, with a TTL-bound cache.
//! - [`Backend`]: one connection target, its health state and its planned
//!   collectors; the primary also drives database discovery.
//! - [`Exporter`]: the primary plus discovered peripherals, scraped as one
//!   unit, and the exporter's own introspection instruments.
//! - [`render`]: a request-scoped scrape encoded for exposition.

pub mod backend;
pub mod cast;
pub mod collector;
pub mod conn;
pub mod discovery;
pub mod error;
pub mod exporter;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;
pub mod sample;
pub mod scrape;
pub mod tls;

pub use backend::{Backend, BackendOptions, BackendStatus};
pub use collector::{Collected, QueryCollector, QueryStats};
pub use conn::{Connection, Connector, PgConnector, ResultSet};
pub use discovery::{DatabaseChangeHandler, DiscoveryFilter};
pub use error::{BackendError, ConnError, ExporterError, ExporterResult, QueryError};
pub use exporter::{Exporter, ExporterOptions};
pub use sample::{Descriptor, Sample};
pub use scrape::{ScrapeContext, render};
