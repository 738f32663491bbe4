//! Scrape aggregation across the primary and discovered backends.
//!
//! The [`Exporter`] owns the primary backend for the lifetime of the
//! process and a lock-guarded map of peripheral backends created by
//! discovery. One scrape at a time fans out over all of them, then refreshes
//! the exporter's own introspection instruments.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use prometheus::core::Collector;
use prometheus::proto::MetricFamily;
use prometheus::{Counter, Gauge, GaugeVec, Opts};
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use pgscrape_core::QuerySpec;
use pgscrape_core::dsn::{database_name, replace_database, shadow_dsn};

use crate::backend::{Backend, BackendOptions, BackendStatus, PGBOUNCER_DATABASE};
use crate::conn::{BoxFuture, Connector};
use crate::discovery::{DatabaseChangeHandler, DiscoveryFilter};
use crate::error::{BackendError, ExporterError, ExporterResult};
use crate::sample::to_families;
use crate::scrape::ScrapeContext;

/// Delay between primary connection attempts at startup.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ExporterOptions {
    /// Connection string of the primary backend.
    pub dsn: String,
    pub queries: HashMap<String, QuerySpec>,
    /// Where `queries` came from; required by [`Exporter::reload`].
    pub query_path: Option<PathBuf>,
    pub const_labels: HashMap<String, String>,
    /// Prefix of introspection metrics; derived from the primary when empty.
    pub namespace: String,
    pub tags: Vec<String>,
    pub disable_cache: bool,
    /// Suppress per-query introspection metrics.
    pub disable_intro: bool,
    pub auto_discovery: bool,
    pub exclude_databases: Vec<String>,
    pub include_databases: Vec<String>,
    /// Fail startup instead of retrying when the primary is unreachable.
    pub fail_fast: bool,
    pub retry_interval: Duration,
}

impl Default for ExporterOptions {
    fn default() -> Self {
        Self {
            dsn: String::new(),
            queries: HashMap::new(),
            query_path: None,
            const_labels: HashMap::new(),
            namespace: String::new(),
            tags: Vec::new(),
            disable_cache: false,
            disable_intro: false,
            auto_discovery: false,
            exclude_databases: Vec::new(),
            include_databases: Vec::new(),
            fail_fast: false,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }
}

impl ExporterOptions {
    pub fn new(dsn: &str) -> Self {
        Self {
            dsn: dsn.to_string(),
            ..Self::default()
        }
    }

    /// Load query definitions from a file or directory.
    pub fn with_query_path(mut self, path: &Path) -> ExporterResult<Self> {
        self.queries = pgscrape_core::load_queries(path)?;
        self.query_path = Some(path.to_path_buf());
        Ok(self)
    }
}

fn opts(namespace: &str, subsystem: &str, name: &str, help: &str, labels: &HashMap<String, String>) -> Opts {
    Opts::new(name, help)
        .namespace(namespace)
        .subsystem(subsystem)
        .const_labels(labels.clone())
}

/// The exporter's own instruments.
struct ExporterMetrics {
    up: Gauge,
    version: Gauge,
    in_recovery: Gauge,
    exporter_up: Gauge,
    exporter_uptime: Gauge,
    last_scrape_time: Gauge,
    scrape_duration: Gauge,
    scrape_total_count: Counter,
    scrape_error_count: Counter,

    server_scrape_duration: GaugeVec,
    server_scrape_total_seconds: GaugeVec,
    server_scrape_total_count: GaugeVec,
    server_scrape_error_count: GaugeVec,

    query_cache_ttl: GaugeVec,
    query_scrape_total_count: GaugeVec,
    query_scrape_error_count: GaugeVec,
    query_scrape_duration: GaugeVec,
    query_scrape_metric_count: GaugeVec,
    query_scrape_hit_count: GaugeVec,
}

impl ExporterMetrics {
    fn new(ns: &str, labels: &HashMap<String, String>) -> prometheus::Result<Self> {
        let server = |name: &str, help: &str| {
            GaugeVec::new(opts(ns, "exporter_server", name, help, labels), &["datname"])
        };
        let query = |name: &str, help: &str| {
            GaugeVec::new(opts(ns, "exporter_query", name, help, labels), &["datname", "query"])
        };

        let metrics = Self {
            up: Gauge::with_opts(opts(ns, "", "up", "last scrape was able to connect to the server: 1 for yes, 0 for no", labels))?,
            version: Gauge::with_opts(opts(ns, "", "version", "server version number", labels))?,
            in_recovery: Gauge::with_opts(opts(ns, "", "in_recovery", "server is in recovery mode? 1 for yes 0 for no", labels))?,
            exporter_up: Gauge::with_opts(opts(ns, "exporter", "up", "always be 1 if you could retrieve metrics", labels))?,
            exporter_uptime: Gauge::with_opts(opts(ns, "exporter", "uptime", "seconds since exporter primary server inited", labels))?,
            last_scrape_time: Gauge::with_opts(opts(ns, "exporter", "last_scrape_time", "unix timestamp of the last scrape", labels))?,
            scrape_duration: Gauge::with_opts(opts(ns, "exporter", "scrape_duration", "seconds exporter spending on scraping", labels))?,
            scrape_total_count: Counter::with_opts(opts(ns, "exporter", "scrape_total_count", "times exporter was scraped for metrics", labels))?,
            scrape_error_count: Counter::with_opts(opts(ns, "exporter", "scrape_error_count", "times exporter was scraped for metrics and failed", labels))?,

            server_scrape_duration: server("scrape_duration", "seconds exporter server spending on scraping")?,
            server_scrape_total_seconds: server("scrape_total_seconds", "total seconds exporter server spending on scraping")?,
            server_scrape_total_count: server("scrape_total_count", "times exporter server was scraped for metrics")?,
            server_scrape_error_count: server("scrape_error_count", "1 if the server failed its check on the last scrape")?,

            query_cache_ttl: query("cache_ttl", "seconds to live of query cache")?,
            query_scrape_total_count: query("scrape_total_count", "times the query was scraped")?,
            query_scrape_error_count: query("scrape_error_count", "times the query failed")?,
            query_scrape_duration: query("scrape_duration", "seconds the query spent on its last execution")?,
            query_scrape_metric_count: query("scrape_metric_count", "number of metrics produced by the last execution")?,
            query_scrape_hit_count: query("scrape_hit_count", "times the query was served from cache")?,
        };
        metrics.exporter_up.set(1.0);
        Ok(metrics)
    }

    /// Replace per-backend and per-query series with the current statuses.
    fn refresh(&self, statuses: &[BackendStatus]) {
        for vec in self.server_vecs().into_iter().chain(self.query_vecs()) {
            vec.reset();
        }
        for status in statuses {
            let db = [status.database.as_str()];
            self.server_scrape_duration.with_label_values(&db).set(status.scrape_duration);
            self.server_scrape_total_seconds.with_label_values(&db).set(status.total_time);
            self.server_scrape_total_count.with_label_values(&db).set(status.total_count as f64);
            if status.error.is_some() {
                self.server_scrape_error_count.with_label_values(&db).set(1.0);
            }

            for (name, stats) in &status.queries {
                let key = [status.database.as_str(), name.as_str()];
                self.query_cache_ttl.with_label_values(&key).set(stats.cache_ttl);
                self.query_scrape_total_count.with_label_values(&key).set(stats.scrape_count as f64);
                self.query_scrape_error_count.with_label_values(&key).set(stats.error_count as f64);
                self.query_scrape_duration.with_label_values(&key).set(stats.duration.as_secs_f64());
                self.query_scrape_metric_count.with_label_values(&key).set(stats.metric_count as f64);
                self.query_scrape_hit_count.with_label_values(&key).set(stats.hit_count as f64);
            }
        }
    }

    fn server_vecs(&self) -> [&GaugeVec; 4] {
        [
            &self.server_scrape_duration,
            &self.server_scrape_total_seconds,
            &self.server_scrape_total_count,
            &self.server_scrape_error_count,
        ]
    }

    fn query_vecs(&self) -> [&GaugeVec; 6] {
        [
            &self.query_cache_ttl,
            &self.query_scrape_total_count,
            &self.query_scrape_error_count,
            &self.query_scrape_duration,
            &self.query_scrape_metric_count,
            &self.query_scrape_hit_count,
        ]
    }

    fn families(&self, intro: bool) -> Vec<MetricFamily> {
        let mut families = Vec::new();
        for gauge in [
            &self.up,
            &self.version,
            &self.in_recovery,
            &self.exporter_up,
            &self.exporter_uptime,
            &self.last_scrape_time,
            &self.scrape_duration,
        ] {
            families.extend(gauge.collect());
        }
        families.extend(self.scrape_total_count.collect());
        families.extend(self.scrape_error_count.collect());
        for vec in self.server_vecs() {
            families.extend(vec.collect());
        }
        if intro {
            for vec in self.query_vecs() {
                families.extend(vec.collect());
            }
        }
        families
    }
}

pub struct Exporter {
    opts: ExporterOptions,
    namespace: String,
    queries: HashMap<String, Arc<QuerySpec>>,
    filter: DiscoveryFilter,
    connector: Arc<dyn Connector>,
    primary: Arc<Backend>,
    servers: RwLock<HashMap<String, Arc<Backend>>>,
    scrape_lock: Mutex<()>,
    metrics: ExporterMetrics,
}

impl Exporter {
    /// Build the exporter and wait for the primary to become reachable.
    ///
    /// With `fail_fast` a failed first check is returned as an error;
    /// otherwise the check is retried every `retry_interval` until it passes.
    pub async fn new(opts: ExporterOptions, connector: Arc<dyn Connector>) -> ExporterResult<Arc<Self>> {
        let fail_fast = opts.fail_fast;
        Self::start(opts, connector, fail_fast).await
    }

    async fn start(opts: ExporterOptions, connector: Arc<dyn Connector>, fail_fast: bool) -> ExporterResult<Arc<Self>> {
        let database = database_name(&opts.dsn);
        let namespace = match opts.namespace.as_str() {
            "" if database == PGBOUNCER_DATABASE => "pgbouncer".to_string(),
            "" => "pg".to_string(),
            ns => ns.to_string(),
        };
        let metrics = ExporterMetrics::new(&namespace, &opts.const_labels)?;
        let queries: HashMap<String, Arc<QuerySpec>> = opts
            .queries
            .iter()
            .map(|(name, q)| (name.clone(), Arc::new(q.clone())))
            .collect();
        let filter = DiscoveryFilter::new(&database, &opts.exclude_databases, &opts.include_databases);
        debug!(queries = queries.len(), namespace = %namespace, "exporter init");

        if opts.auto_discovery {
            info!(
                exclude = ?filter.exclude,
                include = ?filter.include,
                "auto discovery is enabled"
            );
        }

        let exporter = Arc::new_cyclic(|this: &Weak<Exporter>| {
            let discovery: Option<Weak<dyn DatabaseChangeHandler>> = if opts.auto_discovery {
                let handler: Weak<dyn DatabaseChangeHandler> = this.clone();
                Some(handler)
            } else {
                None
            };
            let primary = Backend::new(
                &opts.dsn,
                BackendOptions {
                    queries: queries.clone(),
                    const_labels: opts.const_labels.clone(),
                    disable_cache: opts.disable_cache,
                    tags: opts.tags.clone(),
                    forked: false,
                    discovery,
                },
                Arc::clone(&connector),
            );
            Exporter {
                namespace,
                queries,
                filter,
                connector,
                primary: Arc::new(primary),
                servers: RwLock::new(HashMap::new()),
                scrape_lock: Mutex::new(()),
                metrics,
                opts,
            }
        });

        if let Err(mut err) = exporter.primary.check().await {
            if fail_fast {
                error!(error = %err, "fail connecting to primary server, exit");
                return Err(err.into());
            }
            loop {
                error!(error = %err, retry_in = ?exporter.opts.retry_interval, "fail connecting to primary server");
                tokio::time::sleep(exporter.opts.retry_interval).await;
                match exporter.primary.check().await {
                    Ok(()) => break,
                    Err(e) => err = e,
                }
            }
        }
        info!(dsn = %shadow_dsn(&exporter.opts.dsn), "primary server is reachable");
        Ok(exporter)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn options(&self) -> &ExporterOptions {
        &self.opts
    }

    pub fn primary(&self) -> &Arc<Backend> {
        &self.primary
    }

    /// Re-read the query definitions and build a replacement exporter
    /// against the same primary. `self` is left untouched; the caller swaps
    /// the result in and closes the old one.
    ///
    /// The replacement must reach the primary on its first check.
    pub async fn reload(&self) -> ExporterResult<Arc<Exporter>> {
        let path = self.opts.query_path.clone().ok_or(ExporterError::NoQueryPath)?;
        let opts = self.opts.clone().with_query_path(&path)?;
        let fresh = Self::start(opts, Arc::clone(&self.connector), true).await?;
        info!(path = %path.display(), queries = fresh.queries.len(), "query config reloaded");
        Ok(fresh)
    }

    /// Run one scrape over the primary and every peripheral backend.
    ///
    /// Scrapes are serialized; the returned families hold query samples
    /// followed by the exporter's introspection metrics.
    pub async fn collect(&self, ctx: &ScrapeContext) -> Vec<MetricFamily> {
        let _scrape = self.scrape_lock.lock().await;
        let m = &self.metrics;
        m.scrape_total_count.inc();

        let begin = Instant::now();
        let mut samples = self.primary.collect(ctx).await;
        let peripherals = self.iterate_servers().await;
        for backend in &peripherals {
            samples.extend(backend.collect(ctx).await);
        }
        let done = Instant::now();

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        m.last_scrape_time.set(now);
        m.scrape_duration.set(done.saturating_duration_since(begin).as_secs_f64());

        let primary = self.primary.status().await;
        m.version.set(f64::from(primary.version));
        if primary.up {
            m.up.set(1.0);
            m.in_recovery.set(if primary.recovery { 1.0 } else { 0.0 });
        } else {
            m.up.set(0.0);
            m.scrape_error_count.inc();
        }
        m.exporter_uptime.set(self.primary.uptime());

        let mut statuses = Vec::with_capacity(peripherals.len() + 1);
        for backend in &peripherals {
            statuses.push(backend.status().await);
        }
        statuses.push(primary);
        m.refresh(&statuses);

        let mut families = to_families(&samples);
        families.extend(m.families(!self.opts.disable_intro));
        families
    }

    /// Create the peripheral backend for `database` unless it already exists.
    pub async fn create_backend(&self, database: &str) -> Arc<Backend> {
        if let Some(existing) = self.servers.read().await.get(database) {
            return Arc::clone(existing);
        }

        let dsn = replace_database(&self.opts.dsn, database);
        info!(database, dsn = %shadow_dsn(&dsn), "spawn new backend");
        let backend = Arc::new(Backend::new(
            &dsn,
            BackendOptions {
                queries: self.queries.clone(),
                const_labels: self.opts.const_labels.clone(),
                disable_cache: self.opts.disable_cache,
                tags: self.opts.tags.clone(),
                forked: true,
                discovery: None,
            },
            Arc::clone(&self.connector),
        ));

        let mut servers = self.servers.write().await;
        let entry = servers.entry(database.to_string()).or_insert(backend);
        info!(database, "database is installed due to auto-discovery");
        Arc::clone(entry)
    }

    /// Forget the peripheral backend for `database`. Its connection is left
    /// to close when the last handle drops.
    pub async fn remove_backend(&self, database: &str) -> Option<Arc<Backend>> {
        let removed = self.servers.write().await.remove(database);
        if removed.is_some() {
            warn!(database, "database is removed due to auto-discovery");
        }
        removed
    }

    /// Snapshot of peripheral backends, ordered by database name.
    pub async fn iterate_servers(&self) -> Vec<Arc<Backend>> {
        let servers = self.servers.read().await;
        let mut snapshot: Vec<Arc<Backend>> = servers.values().cloned().collect();
        snapshot.sort_by(|a, b| a.database().cmp(b.database()));
        snapshot
    }

    /// Immediate health check of the primary.
    pub async fn check(&self) -> Result<(), BackendError> {
        let result = self.primary.check().await;
        match &result {
            Ok(()) => debug!("exporter check ok"),
            Err(e) => error!(error = %e, "exporter check failure"),
        }
        result
    }

    pub async fn up(&self) -> bool {
        self.primary.status().await.up
    }

    pub async fn recovery(&self) -> bool {
        self.primary.status().await.recovery
    }

    /// One of `primary`, `replica` or `down`.
    pub async fn status(&self) -> &'static str {
        let status = self.primary.status().await;
        match (status.up, status.recovery) {
            (false, _) => "down",
            (true, true) => "replica",
            (true, false) => "primary",
        }
    }

    pub async fn explain(&self) -> String {
        self.primary.explain().await
    }

    pub async fn stat(&self) -> String {
        let mut out = self.primary.stat().await;
        for backend in self.iterate_servers().await {
            out.push('\n');
            out.push_str(&backend.stat().await);
        }
        out
    }

    /// Close the primary and every peripheral backend.
    pub async fn close(&self) {
        self.primary.close().await;
        for backend in self.iterate_servers().await {
            backend.close().await;
        }
        info!("exporter closed");
    }
}

impl DatabaseChangeHandler for Exporter {
    fn on_database_change<'a>(&'a self, change: &'a BTreeMap<String, bool>) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            for (database, &added) in change {
                if database == self.primary.database() {
                    continue;
                }
                let verb = if added { "add" } else { "del" };
                if !self.filter.admits(database) {
                    info!(database = %database, verb, "skip database change by discovery filter");
                    continue;
                }
                if added {
                    self.create_backend(database).await;
                } else {
                    self.remove_backend(database).await;
                }
            }
        })
    }
}
