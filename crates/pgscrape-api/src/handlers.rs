//! HTTP handlers.
//!
//! The metrics handler always answers 200 with whatever was collected;
//! only the health endpoints and `/reload` report failure through status
//! codes.

use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse};
use prometheus::{Encoder, TextEncoder};
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use pgscrape_collector::{ScrapeContext, render};

use crate::ApiState;

/// Header through which Prometheus announces its scrape timeout.
pub const SCRAPE_TIMEOUT_HEADER: &str = "X-Prometheus-Scrape-Timeout-Seconds";

const TEXT: &str = "text/plain; charset=utf-8";

#[derive(Debug, Default, Deserialize)]
pub struct MetricsParams {
    #[serde(default)]
    pub groups: Option<String>,
}

fn scrape_context(params: &MetricsParams, headers: &HeaderMap) -> ScrapeContext {
    let mut ctx = ScrapeContext::default();
    if let Some(groups) = params.groups.as_deref() {
        ctx = ctx.with_groups(groups);
    }
    if let Some(raw) = headers.get(SCRAPE_TIMEOUT_HEADER) {
        match raw.to_str().ok().and_then(|v| v.trim().parse::<f64>().ok()) {
            Some(secs) if secs.is_finite() && secs > 0.0 => {
                ctx = ctx.with_timeout(Duration::from_secs_f64(secs));
            }
            _ => warn!(value = ?raw, "failed to parse scrape timeout header"),
        }
    }
    ctx
}

// ── Metrics ────────────────────────────────────────────────────

/// GET <telemetry path>
pub async fn metrics(
    State(state): State<ApiState>,
    Query(params): Query<MetricsParams>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let ctx = scrape_context(&params, &headers);
    debug!(groups = ?ctx.groups(), timeout = ?ctx.timeout(), "scrape request");

    let instruments = &state.handler_metrics;
    let _in_flight = instruments.start();
    let response = match render(state.exporter().await, ctx, instruments.gather()).await {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", TextEncoder::new().format_type().to_string())],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    };
    instruments.observe(response.status());
    response
}

// ── Health ─────────────────────────────────────────────────────

/// GET /up, /health, /liveness, /readiness
pub async fn up(State(state): State<ApiState>) -> impl IntoResponse {
    let exporter = state.exporter().await;
    let _ = exporter.check().await;
    let status = exporter.status().await;
    let code = if exporter.up().await {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, status)
}

/// GET /primary, /leader, /master
pub async fn primary(State(state): State<ApiState>) -> impl IntoResponse {
    role(&state, false).await
}

/// GET /replica, /standby, /slave
pub async fn replica(State(state): State<ApiState>) -> impl IntoResponse {
    role(&state, true).await
}

async fn role(state: &ApiState, want_recovery: bool) -> (StatusCode, &'static str) {
    let exporter = state.exporter().await;
    let _ = exporter.check().await;
    let status = exporter.status().await;
    let code = match status {
        "down" => StatusCode::SERVICE_UNAVAILABLE,
        "replica" if want_recovery => StatusCode::OK,
        "primary" if !want_recovery => StatusCode::OK,
        _ => StatusCode::NOT_FOUND,
    };
    (code, status)
}

// ── Introspection ──────────────────────────────────────────────

/// GET /explain
pub async fn explain(State(state): State<ApiState>) -> impl IntoResponse {
    ([("content-type", TEXT)], state.exporter().await.explain().await)
}

/// GET /stat
pub async fn stat(State(state): State<ApiState>) -> impl IntoResponse {
    ([("content-type", TEXT)], state.exporter().await.stat().await)
}

// ── Reload ─────────────────────────────────────────────────────

/// GET|POST /reload
pub async fn reload(State(state): State<ApiState>) -> impl IntoResponse {
    let current = state.exporter().await;
    match current.reload().await {
        Ok(fresh) => {
            let previous = state.replace(fresh).await;
            previous.close().await;
            info!("server reloaded");
            (StatusCode::OK, "server reloaded".to_string())
        }
        Err(e) => {
            error!(error = %e, "fail to reload");
            (StatusCode::INTERNAL_SERVER_ERROR, format!("fail to reload: {e}"))
        }
    }
}

/// GET /version
pub async fn version() -> impl IntoResponse {
    ([("content-type", TEXT)], format!("pgscrape {}\n", env!("CARGO_PKG_VERSION")))
}

/// GET /
pub async fn title(State(state): State<ApiState>) -> impl IntoResponse {
    Html(format!(
        "<html><head><title>pgscrape</title></head><body>\
         <h1>pgscrape</h1>\
         <p><a href=\"{path}\">Metrics</a></p>\
         <p><a href=\"/explain\">Explain</a> | <a href=\"/stat\">Stat</a> | <a href=\"/up\">Status</a></p>\
         </body></html>",
        path = state.metrics_path
    ))
}
