//! Cache-and-execute engine for one query on one backend.
//!
//! A [`QueryCollector`] serves its cached samples while the cache is fresh
//! and re-runs the query once it has expired. The cache timestamp is the
//! caller's scrape window start, so every query of one scrape shares the
//! same notion of "now" regardless of how long its siblings took.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};

use pgscrape_core::QuerySpec;

use crate::cast::cast_string;
use crate::conn::{Connection, ResultSet};
use crate::error::{ConnError, QueryError};
use crate::sample::{Descriptor, Sample};

/// Outcome of one [`QueryCollector::collect`] call.
#[derive(Debug, Clone)]
pub struct Collected {
    pub samples: Vec<Sample>,
    pub cache_hit: bool,
    pub error: Option<QueryError>,
}

/// Point-in-time statistics of a collector.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryStats {
    pub name: String,
    /// Seconds until the cache expires; zero once stale.
    pub cache_ttl: f64,
    pub scrape_count: u64,
    pub hit_count: u64,
    pub error_count: u64,
    /// Samples produced by the last execution.
    pub metric_count: u64,
    pub warning_count: u64,
    /// Duration of the last execution.
    pub duration: Duration,
    pub cache_hit: bool,
    pub last_error: Option<String>,
}

#[derive(Default)]
struct CollectorState {
    result: Vec<Sample>,
    cache_hit: bool,
    err: Option<QueryError>,
    last_scrape: Option<Instant>,
    exec_begin: Option<Instant>,
    exec_done: Option<Instant>,
    scrape_count: u64,
    hit_count: u64,
    error_count: u64,
    metric_count: u64,
    warning_count: u64,
}

impl CollectorState {
    fn expired(&self, window_start: Instant, ttl: Duration) -> bool {
        match self.last_scrape {
            None => true,
            Some(last) => window_start.saturating_duration_since(last) > ttl,
        }
    }
}

pub struct QueryCollector {
    query: Arc<QuerySpec>,
    database: String,
    /// Keyed by original column name.
    descriptors: HashMap<String, Arc<Descriptor>>,
    state: RwLock<CollectorState>,
}

impl QueryCollector {
    /// Bind `query` to the backend serving `database`.
    ///
    /// Descriptors are built once here. Unmapped or invalid metric columns
    /// are logged and counted as warnings; they never fail construction.
    pub fn new(
        query: Arc<QuerySpec>,
        database: &str,
        const_labels: &HashMap<String, String>,
    ) -> Self {
        let mut warnings = 0;

        let label_names: Vec<String> = query
            .label_names
            .iter()
            .map(|name| match query.columns.get(name) {
                Some(column) => column.emitted_name().to_string(),
                None => {
                    warnings += 1;
                    warn!(query = %query.name, column = %name, "label column has no mapping");
                    name.clone()
                }
            })
            .collect();

        let mut descriptors = HashMap::new();
        for name in &query.metric_names {
            let Some(column) = query.columns.get(name) else {
                warnings += 1;
                warn!(query = %query.name, column = %name, "metric column has no mapping");
                continue;
            };
            let Some(kind) = column.metric_kind() else {
                warnings += 1;
                warn!(query = %query.name, column = %name, usage = column.usage.as_str(), "column is not a metric");
                continue;
            };
            match Descriptor::new(&query, column, kind, &label_names, const_labels) {
                Ok(descriptor) => {
                    descriptors.insert(name.clone(), Arc::new(descriptor));
                }
                Err(e) => {
                    warnings += 1;
                    warn!(query = %query.name, column = %name, error = %e, "invalid metric descriptor");
                }
            }
        }

        Self {
            query,
            database: database.to_string(),
            descriptors,
            state: RwLock::new(CollectorState {
                warning_count: warnings,
                ..CollectorState::default()
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.query.name
    }

    pub fn query(&self) -> &QuerySpec {
        &self.query
    }

    pub fn explain(&self) -> String {
        self.query.explain()
    }

    /// Serve the cache, or execute the query when the cache is disabled,
    /// never filled, or older than the query's TTL relative to `window_start`.
    ///
    /// A cached empty or failed result is served like any other until it
    /// expires.
    ///
    /// The state lock is held exclusively for the whole call, so concurrent
    /// callers of the same collector execute the query at most once per
    /// window.
    pub async fn collect(
        &self,
        conn: &dyn Connection,
        window_start: Instant,
        disable_cache: bool,
    ) -> Collected {
        let mut state = self.state.write().await;
        state.scrape_count += 1;

        if disable_cache || state.expired(window_start, self.query.ttl_duration()) {
            state.cache_hit = false;
            self.execute(&mut state, conn, window_start).await;
        } else {
            state.cache_hit = true;
            state.hit_count += 1;
            debug!(query = %self.query.name, database = %self.database, "cache hit");
        }

        Collected {
            samples: state.result.clone(),
            cache_hit: state.cache_hit,
            error: state.err.clone(),
        }
    }

    async fn execute(&self, state: &mut CollectorState, conn: &dyn Connection, window_start: Instant) {
        state.result.clear();
        state.err = None;
        state.exec_begin = Some(Instant::now());

        let mut warnings = 0;
        let outcome = self.run(conn, &mut warnings).await;

        state.exec_done = Some(Instant::now());
        state.last_scrape = Some(window_start);
        state.warning_count += warnings;

        match outcome {
            Ok(samples) => {
                state.metric_count = samples.len() as u64;
                state.result = samples;
            }
            Err(err) => {
                warn!(query = %self.query.name, database = %self.database, error = %err, "query failed");
                state.metric_count = 0;
                state.error_count += 1;
                state.err = Some(err);
            }
        }
    }

    async fn run(&self, conn: &dyn Connection, warnings: &mut u64) -> Result<Vec<Sample>, QueryError> {
        let started = Instant::now();
        let result = match self.query.timeout_duration() {
            Some(limit) => match tokio::time::timeout(limit, conn.query(&self.query.sql)).await {
                Ok(result) => result,
                Err(_) => {
                    // The abandoned statement would otherwise keep the session busy.
                    conn.cancel().await;
                    return Err(QueryError::Timeout {
                        query: self.query.name.clone(),
                        elapsed: started.elapsed(),
                        limit,
                    });
                }
            },
            None => conn.query(&self.query.sql).await,
        };
        let result = result.map_err(|e| self.classify(e))?;
        self.build_samples(&result, warnings)
    }

    fn classify(&self, err: ConnError) -> QueryError {
        let query = self.query.name.clone();
        match err {
            ConnError::Scan { row, reason } => QueryError::Scan { query, row, reason },
            other => QueryError::Execution {
                query,
                reason: other.to_string(),
            },
        }
    }

    fn build_samples(&self, result: &ResultSet, warnings: &mut u64) -> Result<Vec<Sample>, QueryError> {
        if result.columns.is_empty() && !result.rows.is_empty() {
            return Err(QueryError::Metadata {
                query: self.query.name.clone(),
                reason: "result rows carry no column metadata".to_string(),
            });
        }

        if result.columns.len() != self.query.columns.len() {
            *warnings += 1;
            warn!(
                query = %self.query.name,
                database = %self.database,
                expected = self.query.columns.len(),
                actual = result.columns.len(),
                "column count mismatch"
            );
        }

        let index: HashMap<&str, usize> = result
            .columns
            .iter()
            .enumerate()
            .map(|(i, name)| (name.as_str(), i))
            .collect();

        let labels: Vec<Option<usize>> = self
            .query
            .label_names
            .iter()
            .map(|name| {
                let slot = index.get(name.as_str()).copied();
                if slot.is_none() {
                    *warnings += 1;
                    warn!(query = %self.query.name, column = %name, "label column missing from result");
                }
                slot
            })
            .collect();

        let mut metrics: Vec<(&Arc<Descriptor>, usize)> = Vec::new();
        for name in &self.query.metric_names {
            let Some(descriptor) = self.descriptors.get(name) else {
                continue;
            };
            match index.get(name.as_str()) {
                Some(&slot) => metrics.push((descriptor, slot)),
                None => {
                    *warnings += 1;
                    warn!(query = %self.query.name, column = %name, "metric column missing from result");
                }
            }
        }

        let mut samples = Vec::with_capacity(result.rows.len() * metrics.len());
        for (row_idx, row) in result.rows.iter().enumerate() {
            if row.len() != result.columns.len() {
                return Err(QueryError::Scan {
                    query: self.query.name.clone(),
                    row: row_idx,
                    reason: format!("expected {} values, got {}", result.columns.len(), row.len()),
                });
            }
            let label_values: Vec<String> = labels
                .iter()
                .map(|slot| slot.map(|i| cast_string(row[i].as_deref())).unwrap_or_default())
                .collect();
            for (descriptor, slot) in &metrics {
                let value = descriptor.value_of(row[*slot].as_deref());
                samples.push(Sample::new(Arc::clone(descriptor), label_values.clone(), value));
            }
        }
        Ok(samples)
    }

    /// Seconds left before the cache expires, relative to `now`.
    pub async fn cache_ttl(&self, now: Instant) -> f64 {
        let state = self.state.read().await;
        self.remaining(&state, now)
    }

    fn remaining(&self, state: &CollectorState, now: Instant) -> f64 {
        match state.last_scrape {
            Some(last) => self
                .query
                .ttl_duration()
                .saturating_sub(now.saturating_duration_since(last))
                .as_secs_f64(),
            None => 0.0,
        }
    }

    pub async fn stats(&self, now: Instant) -> QueryStats {
        let state = self.state.read().await;
        let duration = match (state.exec_begin, state.exec_done) {
            (Some(begin), Some(done)) => done.saturating_duration_since(begin),
            _ => Duration::ZERO,
        };
        QueryStats {
            name: self.query.name.clone(),
            cache_ttl: self.remaining(&state, now),
            scrape_count: state.scrape_count,
            hit_count: state.hit_count,
            error_count: state.error_count,
            metric_count: state.metric_count,
            warning_count: state.warning_count,
            duration,
            cache_hit: state.cache_hit,
            last_error: state.err.as_ref().map(ToString::to_string),
        }
    }
}
