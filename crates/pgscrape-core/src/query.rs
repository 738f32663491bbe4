//! Query definitions.
//!
//! A `QuerySpec` describes one SQL statement and how each of its result
//! columns maps onto metric labels and values. Specs are loaded once at
//! startup and shared read-only by every backend.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How a result column is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ColumnUsage {
    /// Ignored.
    Discard,
    /// Label value attached to every sample of the row.
    Label,
    /// Monotonic counter value.
    Counter,
    /// Gauge value.
    Gauge,
}

impl ColumnUsage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnUsage::Discard => "DISCARD",
            ColumnUsage::Label => "LABEL",
            ColumnUsage::Counter => "COUNTER",
            ColumnUsage::Gauge => "GAUGE",
        }
    }
}

/// Exposition type of a metric column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetricKind::Counter => write!(f, "counter"),
            MetricKind::Gauge => write!(f, "gauge"),
        }
    }
}

/// Mapping of a single result column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    /// Emitted name, used instead of `name` when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rename: Option<String>,
    pub usage: ColumnUsage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<f64>,
    /// Substituted when the raw value is null or not numeric.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<f64>,
    #[serde(default)]
    pub description: String,
}

impl ColumnSpec {
    fn with_usage(name: &str, usage: ColumnUsage) -> Self {
        Self {
            name: name.to_string(),
            rename: None,
            usage,
            scale: None,
            default: None,
            description: String::new(),
        }
    }

    pub fn label(name: &str) -> Self {
        Self::with_usage(name, ColumnUsage::Label)
    }

    pub fn gauge(name: &str) -> Self {
        Self::with_usage(name, ColumnUsage::Gauge)
    }

    pub fn counter(name: &str) -> Self {
        Self::with_usage(name, ColumnUsage::Counter)
    }

    pub fn discard(name: &str) -> Self {
        Self::with_usage(name, ColumnUsage::Discard)
    }

    pub fn renamed(mut self, rename: &str) -> Self {
        self.rename = Some(rename.to_string());
        self
    }

    pub fn scaled(mut self, scale: f64) -> Self {
        self.scale = Some(scale);
        self
    }

    pub fn defaulting(mut self, default: f64) -> Self {
        self.default = Some(default);
        self
    }

    pub fn described(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    /// The name this column is emitted under (rename wins when non-empty).
    pub fn emitted_name(&self) -> &str {
        match self.rename.as_deref() {
            Some(rename) if !rename.is_empty() => rename,
            _ => &self.name,
        }
    }

    pub fn is_label(&self) -> bool {
        self.usage == ColumnUsage::Label
    }

    pub fn metric_kind(&self) -> Option<MetricKind> {
        match self.usage {
            ColumnUsage::Counter => Some(MetricKind::Counter),
            ColumnUsage::Gauge => Some(MetricKind::Gauge),
            ColumnUsage::Label | ColumnUsage::Discard => None,
        }
    }

    pub fn scale_factor(&self) -> f64 {
        self.scale.unwrap_or(1.0)
    }
}

fn saturating_secs(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(Duration::MAX)
}

/// One query and its column mapping.
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySpec {
    pub name: String,
    pub sql: String,
    /// Cache validity window, in seconds.
    pub ttl: f64,
    /// Execution limit in seconds; `0` disables the limit.
    pub timeout: f64,
    pub priority: u32,
    pub tags: Vec<String>,
    /// Inclusive lower bound on the server version; `0` for none.
    pub min_version: u32,
    /// Exclusive upper bound on the server version; `0` for none.
    pub max_version: u32,
    pub skip: bool,
    pub description: String,
    /// Label columns, in emission order.
    pub label_names: Vec<String>,
    pub metric_names: Vec<String>,
    pub columns: HashMap<String, ColumnSpec>,
}

impl QuerySpec {
    pub fn new(name: &str, sql: &str) -> Self {
        Self {
            name: name.to_string(),
            sql: sql.to_string(),
            ttl: 0.0,
            timeout: 0.0,
            priority: 0,
            tags: Vec::new(),
            min_version: 0,
            max_version: 0,
            skip: false,
            description: String::new(),
            label_names: Vec::new(),
            metric_names: Vec::new(),
            columns: HashMap::new(),
        }
    }

    pub fn with_ttl(mut self, ttl: f64) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_timeout(mut self, timeout: f64) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_versions(mut self, min_version: u32, max_version: u32) -> Self {
        self.min_version = min_version;
        self.max_version = max_version;
        self
    }

    /// Append a column, registering it as a label or metric by its usage.
    pub fn with_column(mut self, column: ColumnSpec) -> Self {
        if column.is_label() {
            self.label_names.push(column.name.clone());
        } else if column.metric_kind().is_some() {
            self.metric_names.push(column.name.clone());
        }
        self.columns.insert(column.name.clone(), column);
        self
    }

    /// Saturates at `Duration::MAX`; negative and NaN values count as zero.
    pub fn ttl_duration(&self) -> Duration {
        saturating_secs(self.ttl)
    }

    /// `None` when the query runs without a deadline.
    pub fn timeout_duration(&self) -> Option<Duration> {
        (self.timeout > 0.0).then(|| saturating_secs(self.timeout))
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// Label and metric names that have no column mapping.
    pub fn unmapped_columns(&self) -> Vec<&str> {
        self.label_names
            .iter()
            .chain(self.metric_names.iter())
            .filter(|name| !self.columns.contains_key(name.as_str()))
            .map(String::as_str)
            .collect()
    }

    /// Plain-text summary used by the explain endpoint.
    pub fn explain(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# {}", self.name);
        if !self.description.is_empty() {
            let _ = writeln!(out, "# {}", self.description);
        }
        let _ = writeln!(
            out,
            "ttl={} timeout={} priority={} version=[{}, {}) tags=[{}]",
            self.ttl,
            self.timeout,
            self.priority,
            self.min_version,
            self.max_version,
            self.tags.join(",")
        );
        let _ = writeln!(out, "{}", self.sql.trim());
        for name in self.label_names.iter().chain(self.metric_names.iter()) {
            match self.columns.get(name) {
                Some(column) => {
                    let _ = writeln!(
                        out,
                        "  {:<24} {:<8} {}",
                        column.emitted_name(),
                        column.usage.as_str(),
                        column.description
                    );
                }
                None => {
                    let _ = writeln!(out, "  {name:<24} (unmapped)");
                }
            }
        }
        out
    }
}
