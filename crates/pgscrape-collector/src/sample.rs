//! Metric descriptors and samples.
//!
//! A [`Descriptor`] is built once per metric column of a query on a given
//! backend. Each scrape produces [`Sample`]s that point back at their
//! descriptor; they are turned into exposition metric families only at the
//! very end of a scrape.

use std::collections::HashMap;
use std::sync::Arc;

use prometheus::core::Desc;
use prometheus::proto::{self, LabelPair, MetricFamily, MetricType};

use pgscrape_core::{ColumnSpec, MetricKind, QuerySpec};

use crate::cast::cast_f64;

/// Immutable name/label/help metadata of one metric column.
#[derive(Debug, Clone)]
pub struct Descriptor {
    desc: Desc,
    kind: MetricKind,
    /// Original column name, the lookup key into result rows.
    column: String,
    scale: f64,
    default: Option<f64>,
}

impl Descriptor {
    /// Build the descriptor for `column` of `query`.
    ///
    /// The metric is named `<query>_<column>` (or the column's rename), and
    /// carries `label_names` as variable labels plus the backend's const labels.
    pub fn new(
        query: &QuerySpec,
        column: &ColumnSpec,
        kind: MetricKind,
        label_names: &[String],
        const_labels: &HashMap<String, String>,
    ) -> prometheus::Result<Self> {
        let fq_name = format!("{}_{}", query.name, column.emitted_name());
        let help = if column.description.is_empty() {
            format!("{}.{}", query.name, column.name)
        } else {
            column.description.clone()
        };
        let desc = Desc::new(fq_name, help, label_names.to_vec(), const_labels.clone())?;
        Ok(Self {
            desc,
            kind,
            column: column.name.clone(),
            scale: column.scale_factor(),
            default: column.default,
        })
    }

    pub fn fq_name(&self) -> &str {
        &self.desc.fq_name
    }

    pub fn help(&self) -> &str {
        &self.desc.help
    }

    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    pub fn column(&self) -> &str {
        &self.column
    }

    pub fn label_names(&self) -> &[String] {
        &self.desc.variable_labels
    }

    pub fn const_labels(&self) -> &[LabelPair] {
        &self.desc.const_label_pairs
    }

    /// Sample value for a raw column value.
    pub fn value_of(&self, raw: Option<&str>) -> f64 {
        cast_f64(raw, self.scale, self.default)
    }
}

/// One labeled value produced by a query execution.
#[derive(Debug, Clone)]
pub struct Sample {
    descriptor: Arc<Descriptor>,
    label_values: Vec<String>,
    value: f64,
}

impl Sample {
    pub fn new(descriptor: Arc<Descriptor>, label_values: Vec<String>, value: f64) -> Self {
        Self {
            descriptor,
            label_values,
            value,
        }
    }

    pub fn name(&self) -> &str {
        self.descriptor.fq_name()
    }

    pub fn kind(&self) -> MetricKind {
        self.descriptor.kind()
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    /// Value of a variable or const label.
    pub fn label(&self, name: &str) -> Option<&str> {
        self.descriptor
            .label_names()
            .iter()
            .position(|n| n == name)
            .and_then(|i| self.label_values.get(i))
            .map(String::as_str)
            .or_else(|| {
                self.descriptor
                    .const_labels()
                    .iter()
                    .find(|lp| lp.get_name() == name)
                    .map(|lp| lp.get_value())
            })
    }

    fn to_metric(&self) -> proto::Metric {
        let mut labels: Vec<LabelPair> = self.descriptor.const_labels().to_vec();
        for (name, value) in self.descriptor.label_names().iter().zip(&self.label_values) {
            labels.push(label_pair(name, value));
        }
        labels.sort_by(|a, b| a.get_name().cmp(b.get_name()));

        let mut metric = proto::Metric::default();
        metric.set_label(labels.into());
        match self.kind() {
            MetricKind::Counter => {
                let mut counter = proto::Counter::default();
                counter.set_value(self.value);
                metric.set_counter(counter);
            }
            MetricKind::Gauge => {
                let mut gauge = proto::Gauge::default();
                gauge.set_value(self.value);
                metric.set_gauge(gauge);
            }
        }
        metric
    }
}

fn label_pair(name: &str, value: &str) -> LabelPair {
    let mut pair = LabelPair::default();
    pair.set_name(name.to_string());
    pair.set_value(value.to_string());
    pair
}

/// Group samples into metric families, in first-seen order.
pub fn to_families(samples: &[Sample]) -> Vec<MetricFamily> {
    let mut index: HashMap<&str, usize> = HashMap::new();
    let mut grouped: Vec<(&Descriptor, Vec<proto::Metric>)> = Vec::new();

    for sample in samples {
        let slot = *index.entry(sample.name()).or_insert_with(|| {
            grouped.push((sample.descriptor(), Vec::new()));
            grouped.len() - 1
        });
        grouped[slot].1.push(sample.to_metric());
    }

    grouped
        .into_iter()
        .map(|(descriptor, metrics)| {
            let mut family = MetricFamily::default();
            family.set_name(descriptor.fq_name().to_string());
            family.set_help(descriptor.help().to_string());
            family.set_field_type(match descriptor.kind() {
                MetricKind::Counter => MetricType::COUNTER,
                MetricKind::Gauge => MetricType::GAUGE,
            });
            family.set_metric(metrics.into());
            family
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query() -> QuerySpec {
        QuerySpec::new("pg_lock", "SELECT mode, count FROM locks")
            .with_column(pgscrape_core::ColumnSpec::label("mode").renamed("lock_mode"))
            .with_column(pgscrape_core::ColumnSpec::counter("count").renamed("total"))
    }

    fn descriptor(const_labels: &HashMap<String, String>) -> Arc<Descriptor> {
        let q = query();
        let column = &q.columns["count"];
        Arc::new(
            Descriptor::new(&q, column, MetricKind::Counter, &["lock_mode".to_string()], const_labels)
                .unwrap(),
        )
    }

    #[test]
    fn descriptor_uses_rename_but_keeps_lookup_key() {
        let d = descriptor(&HashMap::new());
        assert_eq!(d.fq_name(), "pg_lock_total");
        assert_eq!(d.column(), "count");
        assert_eq!(d.label_names(), ["lock_mode".to_string()]);
        // No description configured: help falls back to query.column.
        assert_eq!(d.help(), "pg_lock.count");
    }

    #[test]
    fn descriptor_rejects_invalid_name() {
        let q = QuerySpec::new("bad-name", "SELECT 1").with_column(pgscrape_core::ColumnSpec::gauge("v"));
        let err = Descriptor::new(&q, &q.columns["v"], MetricKind::Gauge, &[], &HashMap::new());
        assert!(err.is_err());
    }

    #[test]
    fn sample_labels_include_const_labels() {
        let mut consts = HashMap::new();
        consts.insert("ins".to_string(), "pg-1".to_string());
        let s = Sample::new(descriptor(&consts), vec!["AccessShareLock".to_string()], 3.0);
        assert_eq!(s.label("lock_mode"), Some("AccessShareLock"));
        assert_eq!(s.label("ins"), Some("pg-1"));
        assert_eq!(s.label("nope"), None);
    }

    #[test]
    fn families_group_by_name() {
        let d = descriptor(&HashMap::new());
        let samples = vec![
            Sample::new(d.clone(), vec!["a".to_string()], 1.0),
            Sample::new(d, vec!["b".to_string()], 2.0),
        ];
        let families = to_families(&samples);
        assert_eq!(families.len(), 1);
        assert_eq!(families[0].get_name(), "pg_lock_total");
        assert_eq!(families[0].get_field_type(), MetricType::COUNTER);
        assert_eq!(families[0].get_metric().len(), 2);
        assert_eq!(families[0].get_metric()[1].get_counter().get_value(), 2.0);
    }

    #[test]
    fn no_samples_no_families() {
        assert!(to_families(&[]).is_empty());
    }
}
