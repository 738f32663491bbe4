//! Request-scoped scraping.
//!
//! Every scrape request gets its own [`ScrapeContext`] and its own throwaway
//! [`Registry`], so concurrent requests with different group filters never
//! see each other's selection.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use prometheus::{Encoder, Registry, TextEncoder};
use tracing::debug;

use pgscrape_core::QuerySpec;
use pgscrape_core::dsn::parse_csv;

use crate::exporter::Exporter;

/// Per-request scrape parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScrapeContext {
    /// Query names or tags to run; all queries when unset.
    groups: Option<BTreeSet<String>>,
    /// Advisory deadline announced by the scraper.
    timeout: Option<Duration>,
}

impl ScrapeContext {
    /// Restrict the scrape to a comma-separated list of query names or tags.
    /// A blank list selects everything.
    pub fn with_groups(mut self, groups: &str) -> Self {
        let groups: BTreeSet<String> = parse_csv(groups).into_iter().collect();
        self.groups = (!groups.is_empty()).then_some(groups);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn groups(&self) -> Option<&BTreeSet<String>> {
        self.groups.as_ref()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn selects(&self, query: &QuerySpec) -> bool {
        match &self.groups {
            None => true,
            Some(groups) => groups.contains(&query.name) || query.tags.iter().any(|t| groups.contains(t)),
        }
    }
}

/// Hands pre-gathered families to a registry.
struct Gathered {
    families: Vec<MetricFamily>,
}

impl Collector for Gathered {
    fn desc(&self) -> Vec<&Desc> {
        Vec::new()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        self.families.clone()
    }
}

/// Run one scrape and encode it, together with `extra` families, in the
/// text exposition format.
///
/// Collection runs in its own task: a client that disconnects mid-scrape
/// does not cancel queries already in flight.
pub async fn render(
    exporter: Arc<Exporter>,
    ctx: ScrapeContext,
    extra: Vec<MetricFamily>,
) -> prometheus::Result<Vec<u8>> {
    debug!(groups = ?ctx.groups(), timeout = ?ctx.timeout(), "scrape");
    let mut families = tokio::spawn(async move { exporter.collect(&ctx).await })
        .await
        .map_err(|e| prometheus::Error::Msg(format!("scrape task failed: {e}")))?;
    families.extend(extra);

    let registry = Registry::new();
    registry.register(Box::new(Gathered { families }))?;

    let mut buffer = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::ResultSet;
    use crate::exporter::ExporterOptions;
    use crate::mock::MockServer;
    use pgscrape_core::ColumnSpec;

    fn query(name: &str, tags: &[&str]) -> QuerySpec {
        QuerySpec::new(name, &format!("SELECT v FROM {name}"))
            .with_ttl(10.0)
            .with_tags(tags)
            .with_column(ColumnSpec::gauge("v"))
    }

    #[test]
    fn groups_select_by_name_or_tag() {
        let ctx = ScrapeContext::default().with_groups("pg_lock, slow");
        assert!(ctx.selects(&query("pg_lock", &[])));
        assert!(ctx.selects(&query("pg_table", &["slow"])));
        assert!(!ctx.selects(&query("pg_db", &["fast"])));
    }

    #[test]
    fn blank_groups_select_everything() {
        let ctx = ScrapeContext::default().with_groups(" , ");
        assert!(ctx.groups().is_none());
        assert!(ctx.selects(&query("anything", &[])));
    }

    async fn exporter() -> Arc<Exporter> {
        let server = MockServer::new();
        server.rows("SELECT v FROM alpha", ResultSet::new(&["v"]).row(&["1"]));
        server.rows("SELECT v FROM beta", ResultSet::new(&["v"]).row(&["2"]));
        let mut opts = ExporterOptions::new("postgres://localhost/postgres");
        opts.queries.insert("alpha".to_string(), query("alpha", &["fast"]));
        opts.queries.insert("beta".to_string(), query("beta", &[]));
        Exporter::new(opts, Arc::new(server)).await.unwrap()
    }

    #[tokio::test]
    async fn render_encodes_text_exposition() {
        let body = render(exporter().await, ScrapeContext::default(), Vec::new()).await.unwrap();
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("# TYPE alpha_v gauge"));
        assert!(text.contains("beta_v 2"));
        assert!(text.contains("pg_up 1"));
    }

    #[tokio::test]
    async fn concurrent_renders_keep_their_groups() {
        let exporter = exporter().await;
        let (fast, all) = tokio::join!(
            render(Arc::clone(&exporter), ScrapeContext::default().with_groups("fast"), Vec::new()),
            render(Arc::clone(&exporter), ScrapeContext::default(), Vec::new())
        );
        let fast = String::from_utf8(fast.unwrap()).unwrap();
        let all = String::from_utf8(all.unwrap()).unwrap();
        assert!(fast.contains("alpha_v 1"));
        assert!(!fast.contains("beta_v"));
        assert!(all.contains("alpha_v 1"));
        assert!(all.contains("beta_v 2"));
    }
}
