//! pgscraped: the pgscrape daemon.
//!
//! Loads query definitions, connects to the primary PostgreSQL or pgbouncer
//! endpoint and serves its metrics over HTTP.
//!
//! # Usage
//!
//! ```text
//! pgscraped --url postgres://monitor@localhost:5432/postgres --config pgscrape.toml
//! pgscraped --config conf.d/ --dry-run
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use pgscrape_api::{ApiState, build_router};
use pgscrape_collector::{Exporter, ExporterOptions, PgConnector};
use pgscrape_core::dsn::{parse_const_labels, parse_csv, shadow_dsn};

#[derive(Debug, Parser)]
#[command(name = "pgscraped", about = "PostgreSQL / pgbouncer metrics exporter", version)]
struct Cli {
    /// Connection string of the primary target.
    #[arg(
        long,
        env = "PG_EXPORTER_URL",
        default_value = "postgres://postgres@localhost:5432/postgres?sslmode=disable"
    )]
    url: String,

    /// Query definition file, or a directory of `*.toml` files.
    #[arg(long, env = "PG_EXPORTER_CONFIG", default_value = "pgscrape.toml")]
    config: PathBuf,

    /// Constant labels, `k1=v1,k2=v2`.
    #[arg(long, env = "PG_EXPORTER_LABEL", default_value = "")]
    label: String,

    /// Server tags, comma separated.
    #[arg(long, env = "PG_EXPORTER_TAG", default_value = "")]
    tag: String,

    /// Execute every query on every scrape.
    #[arg(long, env = "PG_EXPORTER_DISABLE_CACHE")]
    disable_cache: bool,

    /// Omit per-query introspection metrics.
    #[arg(long, env = "PG_EXPORTER_DISABLE_INTRO")]
    disable_intro: bool,

    /// Scrape every database of the primary's cluster.
    #[arg(long, env = "PG_EXPORTER_AUTO_DISCOVERY")]
    auto_discovery: bool,

    /// Databases never scraped by auto discovery.
    #[arg(
        long,
        env = "PG_EXPORTER_EXCLUDE_DATABASE",
        default_value = "template0,template1,postgres"
    )]
    exclude_database: String,

    /// When set, only these databases are scraped by auto discovery.
    #[arg(long, env = "PG_EXPORTER_INCLUDE_DATABASE", default_value = "")]
    include_database: String,

    /// Prefix of introspection metrics (`pg` or `pgbouncer` when empty).
    #[arg(long, env = "PG_EXPORTER_NAMESPACE", default_value = "")]
    namespace: String,

    /// Exit when the primary is unreachable at startup instead of retrying.
    #[arg(long, env = "PG_EXPORTER_FAIL_FAST")]
    fail_fast: bool,

    #[arg(long = "web.listen-address", env = "PG_EXPORTER_LISTEN_ADDRESS", default_value = "0.0.0.0:9630")]
    listen_address: SocketAddr,

    #[arg(long = "web.telemetry-path", env = "PG_EXPORTER_TELEMETRY_PATH", default_value = "/metrics")]
    telemetry_path: String,

    /// Print the queries planned on the primary and exit.
    #[arg(long)]
    explain: bool,

    /// Print the loaded query definitions and exit without connecting.
    #[arg(long)]
    dry_run: bool,

    /// Log filter, overridden by `RUST_LOG`.
    #[arg(long = "log.level", default_value = "info")]
    log_level: String,

    #[arg(long = "log.format", value_enum, default_value = "text")]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

impl Cli {
    fn exporter_options(&self) -> anyhow::Result<ExporterOptions> {
        let mut opts = ExporterOptions::new(&self.url)
            .with_query_path(&self.config)
            .with_context(|| format!("fail loading queries from {}", self.config.display()))?;
        opts.const_labels = parse_const_labels(&self.label);
        opts.tags = parse_csv(&self.tag);
        opts.namespace = self.namespace.clone();
        opts.disable_cache = self.disable_cache;
        opts.disable_intro = self.disable_intro;
        opts.auto_discovery = self.auto_discovery;
        opts.exclude_databases = parse_csv(&self.exclude_database);
        opts.include_databases = parse_csv(&self.include_database);
        opts.fail_fast = self.fail_fast;
        Ok(opts)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if !self.telemetry_path.starts_with('/') || self.telemetry_path == "/" {
            bail!("invalid telemetry path {:?}", self.telemetry_path);
        }
        Ok(())
    }
}

fn init_tracing(level: &str, format: LogFormat) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.log_format);
    cli.validate()?;

    let opts = cli.exporter_options()?;

    if cli.dry_run {
        let mut names: Vec<&String> = opts.queries.keys().collect();
        names.sort();
        for name in names {
            println!("{}", opts.queries[name].explain());
        }
        return Ok(());
    }

    info!(
        dsn = %shadow_dsn(&opts.dsn),
        queries = opts.queries.len(),
        "pgscraped starting"
    );
    let exporter = Exporter::new(opts, Arc::new(PgConnector))
        .await
        .context("fail creating exporter")?;

    if cli.explain {
        println!("{}", exporter.explain().await);
        exporter.close().await;
        return Ok(());
    }

    let state = ApiState::new(exporter, &cli.telemetry_path).context("fail creating handler metrics")?;
    let router = build_router(state.clone());
    let listener = tokio::net::TcpListener::bind(cli.listen_address)
        .await
        .with_context(|| format!("fail binding {}", cli.listen_address))?;
    info!(addr = %cli.listen_address, path = %cli.telemetry_path, "serving metrics");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // `/reload` may have replaced the exporter built above.
    state.exporter().await.close().await;
    info!("pgscraped stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to install ctrl-c handler");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cli = Cli::try_parse_from(["pgscraped"]).unwrap();
        assert_eq!(cli.telemetry_path, "/metrics");
        assert_eq!(cli.listen_address.port(), 9630);
        assert_eq!(
            parse_csv(&cli.exclude_database),
            vec!["template0", "template1", "postgres"]
        );
        assert!(!cli.auto_discovery);
        cli.validate().unwrap();
    }

    #[test]
    fn dotted_flags() {
        let cli = Cli::try_parse_from([
            "pgscraped",
            "--web.listen-address",
            "127.0.0.1:9187",
            "--web.telemetry-path",
            "/pg",
            "--log.level",
            "debug",
            "--auto-discovery",
            "--log.format",
            "json",
        ])
        .unwrap();
        assert_eq!(cli.listen_address.port(), 9187);
        assert_eq!(cli.telemetry_path, "/pg");
        assert_eq!(cli.log_level, "debug");
        assert_eq!(cli.log_format, LogFormat::Json);
        assert!(cli.auto_discovery);
    }

    #[test]
    fn root_telemetry_path_rejected() {
        let cli = Cli::try_parse_from(["pgscraped", "--web.telemetry-path", "/"]).unwrap();
        assert!(cli.validate().is_err());
    }
}
