//! Self-instrumentation of the metrics handler.
//!
//! Mirrors Prometheus' `promhttp` handler metrics: a request counter by
//! status code and an in-flight gauge. The families are appended to every
//! exposition, so the request being served counts itself as in flight but
//! is only added to the counter once it completes.

use axum::http::StatusCode;
use prometheus::proto::MetricFamily;
use prometheus::{IntCounterVec, IntGauge, Opts, Registry};

pub struct HandlerMetrics {
    registry: Registry,
    requests: IntCounterVec,
    in_flight: IntGauge,
}

impl HandlerMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let requests = IntCounterVec::new(
            Opts::new(
                "promhttp_metric_handler_requests_total",
                "Total number of scrapes by HTTP status code.",
            ),
            &["code"],
        )?;
        let in_flight = IntGauge::new(
            "promhttp_metric_handler_requests_in_flight",
            "Current number of scrapes being served.",
        )?;
        for code in ["200", "500", "503"] {
            requests.with_label_values(&[code]);
        }

        let registry = Registry::new();
        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(in_flight.clone()))?;
        Ok(Self {
            registry,
            requests,
            in_flight,
        })
    }

    /// Mark a request as in flight until the guard drops.
    pub fn start(&self) -> InFlight<'_> {
        self.in_flight.inc();
        InFlight(&self.in_flight)
    }

    pub fn observe(&self, code: StatusCode) {
        self.requests.with_label_values(&[code.as_str()]).inc();
    }

    pub fn gather(&self) -> Vec<MetricFamily> {
        self.registry.gather()
    }
}

pub struct InFlight<'a>(&'a IntGauge);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.dec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(families: &[MetricFamily], name: &str, code: Option<&str>) -> f64 {
        let family = families.iter().find(|f| f.get_name() == name).unwrap();
        let metric = family
            .get_metric()
            .iter()
            .find(|m| match code {
                None => true,
                Some(code) => m.get_label().iter().any(|l| l.get_value() == code),
            })
            .unwrap();
        if metric.has_counter() {
            metric.get_counter().get_value()
        } else {
            metric.get_gauge().get_value()
        }
    }

    #[test]
    fn counts_by_code_and_tracks_in_flight() {
        let metrics = HandlerMetrics::new().unwrap();
        let families = metrics.gather();
        assert_eq!(value(&families, "promhttp_metric_handler_requests_total", Some("503")), 0.0);

        {
            let _a = metrics.start();
            let _b = metrics.start();
            let families = metrics.gather();
            assert_eq!(value(&families, "promhttp_metric_handler_requests_in_flight", None), 2.0);
        }
        metrics.observe(StatusCode::OK);
        metrics.observe(StatusCode::OK);
        metrics.observe(StatusCode::INTERNAL_SERVER_ERROR);

        let families = metrics.gather();
        assert_eq!(value(&families, "promhttp_metric_handler_requests_in_flight", None), 0.0);
        assert_eq!(value(&families, "promhttp_metric_handler_requests_total", Some("200")), 2.0);
        assert_eq!(value(&families, "promhttp_metric_handler_requests_total", Some("500")), 1.0);
    }
}
