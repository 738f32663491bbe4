//! pgscrape-api: HTTP surface of the exporter.
//!
//! # Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `<telemetry path>` (`/metrics`) | Text exposition; `?groups=a,b` selects queries |
//! | GET | `/up` `/health` `/liveness` `/readiness` | 200 when the primary is up, 503 otherwise |
//! | GET | `/primary` `/leader` `/master` | 200 on a primary, 404 on a replica, 503 when down |
//! | GET | `/replica` `/standby` `/slave` | 200 on a replica, 404 on a primary, 503 when down |
//! | GET | `/explain` | Definitions of the planned queries |
//! | GET | `/stat` | Per-query statistics |
//! | GET | `/version` | Exporter version |
//! | GET, POST | `/reload` | Re-read query definitions and swap in a new exporter; 500 on failure |
//! | GET | `/` | Title page |

pub mod handlers;
pub mod instrument;

use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use pgscrape_collector::Exporter;
use tokio::sync::RwLock;

use crate::instrument::HandlerMetrics;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    /// Replaced wholesale by `/reload`.
    exporter: Arc<RwLock<Arc<Exporter>>>,
    pub metrics_path: String,
    pub handler_metrics: Arc<HandlerMetrics>,
}

impl ApiState {
    pub fn new(exporter: Arc<Exporter>, metrics_path: &str) -> prometheus::Result<Self> {
        Ok(Self {
            exporter: Arc::new(RwLock::new(exporter)),
            metrics_path: metrics_path.to_string(),
            handler_metrics: Arc::new(HandlerMetrics::new()?),
        })
    }

    /// The exporter currently serving requests.
    pub async fn exporter(&self) -> Arc<Exporter> {
        Arc::clone(&*self.exporter.read().await)
    }

    /// Install `fresh` and hand back the exporter it replaces.
    pub async fn replace(&self, fresh: Arc<Exporter>) -> Arc<Exporter> {
        std::mem::replace(&mut *self.exporter.write().await, fresh)
    }
}

/// Build the complete router.
pub fn build_router(state: ApiState) -> Router {
    let metrics_path = state.metrics_path.clone();
    let mut router = Router::new()
        .route("/", get(handlers::title))
        .route(&metrics_path, get(handlers::metrics))
        .route("/explain", get(handlers::explain))
        .route("/stat", get(handlers::stat))
        .route("/version", get(handlers::version))
        .route("/reload", get(handlers::reload).post(handlers::reload));

    for path in ["/up", "/health", "/liveness", "/readiness"] {
        router = router.route(path, get(handlers::up));
    }
    for path in ["/primary", "/leader", "/master"] {
        router = router.route(path, get(handlers::primary));
    }
    for path in ["/replica", "/standby", "/slave"] {
        router = router.route(path, get(handlers::replica));
    }

    router.with_state(state)
}
