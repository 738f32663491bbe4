//! Error types for the collection engine.

use std::time::Duration;

use thiserror::Error;

/// Failures reported by a [`Connection`](crate::conn::Connection).
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConnError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("row {row} scan failed: {reason}")]
    Scan { row: usize, reason: String },

    #[error("tls setup failed: {0}")]
    Tls(String),
}

/// Classified failure of one query execution.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum QueryError {
    /// The query outlived its configured deadline.
    #[error("query [{query}] timeout because duration {elapsed:?} exceed limit {limit:?}")]
    Timeout {
        query: String,
        elapsed: Duration,
        limit: Duration,
    },

    #[error("query [{query}] failed: {reason}")]
    Execution { query: String, reason: String },

    #[error("query [{query}] fail retrieving rows meta: {reason}")]
    Metadata { query: String, reason: String },

    #[error("query [{query}] fail scanning row {row}: {reason}")]
    Scan {
        query: String,
        row: usize,
        reason: String,
    },
}

impl QueryError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, QueryError::Timeout { .. })
    }
}

/// Connectivity or health-probe failure of a backend.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BackendError {
    #[error("fail connecting to {database}: {source}")]
    Connect { database: String, source: ConnError },

    #[error("health probe on {database} failed: {reason}")]
    Probe { database: String, reason: String },
}

/// Errors raised while building or starting the exporter.
#[derive(Debug, Error)]
pub enum ExporterError {
    #[error("query config: {0}")]
    Config(#[from] pgscrape_core::ConfigError),

    #[error("invalid exporter metric: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("primary server unavailable: {0}")]
    Startup(#[from] BackendError),

    #[error("no query config path to reload from")]
    NoQueryPath,
}

pub type ExporterResult<T> = Result<T, ExporterError>;
