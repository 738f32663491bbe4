//! Query definition loading.
//!
//! Query files are TOML documents with one table per query. A config
//! path may name a single file or a directory, in which case every
//! `*.toml` file directly inside it is loaded in lexical order.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::query::{ColumnSpec, QuerySpec};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid query [{query}]: {reason}")]
    Invalid { query: String, reason: String },

    #[error("no queries found in {0}")]
    Empty(PathBuf),
}

/// On-disk shape of one query table.
#[derive(Debug, Deserialize)]
struct RawQuery {
    /// Overrides the table key as the query name.
    name: Option<String>,
    sql: String,
    #[serde(default)]
    ttl: f64,
    #[serde(default)]
    timeout: f64,
    #[serde(default)]
    priority: u32,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    min_version: u32,
    #[serde(default)]
    max_version: u32,
    #[serde(default)]
    skip: bool,
    #[serde(default)]
    description: String,
    #[serde(default)]
    columns: Vec<ColumnSpec>,
}

impl RawQuery {
    fn into_spec(self, key: &str) -> Result<QuerySpec, ConfigError> {
        let name = self.name.unwrap_or_else(|| key.to_string());
        let invalid = |reason: String| ConfigError::Invalid {
            query: name.clone(),
            reason,
        };

        if self.sql.trim().is_empty() {
            return Err(invalid("empty sql".to_string()));
        }
        check_seconds("ttl", self.ttl).map_err(&invalid)?;
        check_seconds("timeout", self.timeout).map_err(&invalid)?;
        if self.max_version != 0 && self.max_version <= self.min_version {
            return Err(invalid(format!(
                "max_version {} must exceed min_version {}",
                self.max_version, self.min_version
            )));
        }

        let mut seen = HashSet::new();
        for column in &self.columns {
            if !seen.insert(column.name.as_str()) {
                return Err(invalid(format!("duplicate column {}", column.name)));
            }
        }

        let mut spec = QuerySpec::new(&name, &self.sql);
        spec.ttl = self.ttl;
        spec.timeout = self.timeout;
        spec.priority = self.priority;
        spec.tags = self.tags;
        spec.min_version = self.min_version;
        spec.max_version = self.max_version;
        spec.skip = self.skip;
        spec.description = self.description;
        for column in self.columns {
            spec = spec.with_column(column);
        }
        if spec.metric_names.is_empty() {
            warn!(query = %spec.name, "query defines no metric columns");
        }
        Ok(spec)
    }
}

/// A non-negative number of seconds that fits in a `Duration`.
fn check_seconds(field: &str, secs: f64) -> Result<(), String> {
    if secs < 0.0 || Duration::try_from_secs_f64(secs).is_err() {
        return Err(format!("{field} must be a non-negative number of seconds, got {secs}"));
    }
    Ok(())
}

/// Parse one TOML document into query specs, keyed by query name.
pub fn parse_queries(content: &str, path: &Path) -> Result<BTreeMap<String, QuerySpec>, ConfigError> {
    let raw: BTreeMap<String, RawQuery> =
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

    let mut queries = BTreeMap::new();
    for (key, raw) in raw {
        let spec = raw.into_spec(&key)?;
        queries.insert(spec.name.clone(), spec);
    }
    Ok(queries)
}

fn read_file(path: &Path) -> Result<BTreeMap<String, QuerySpec>, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_queries(&content, path)
}

/// Load every query under `path` (a file or a directory of `*.toml` files).
pub fn load_queries(path: &Path) -> Result<HashMap<String, QuerySpec>, ConfigError> {
    let metadata = std::fs::metadata(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let files: Vec<PathBuf> = if metadata.is_dir() {
        let mut files: Vec<PathBuf> = WalkDir::new(path)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "toml"))
            .collect();
        files.sort();
        files
    } else {
        vec![path.to_path_buf()]
    };

    let mut queries = HashMap::new();
    for file in &files {
        let loaded = read_file(file)?;
        debug!(path = ?file, count = loaded.len(), "query file loaded");
        for (name, spec) in loaded {
            if queries.insert(name.clone(), spec).is_some() {
                warn!(query = %name, path = ?file, "query redefined, later definition wins");
            }
        }
    }

    if queries.is_empty() {
        return Err(ConfigError::Empty(path.to_path_buf()));
    }
    Ok(queries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::ColumnUsage;

    const SAMPLE: &str = r#"
[db_size]
sql = "SELECT datname, size FROM x"
ttl = 10
timeout = 1
tags = ["cluster"]
columns = [
  { name = "datname", usage = "LABEL", description = "database name" },
  { name = "size", usage = "GAUGE", scale = 1.0, default = 0, description = "bytes" },
  { name = "oid", usage = "DISCARD" },
]

[pg_locks]
name = "pg_lock"
sql = "SELECT mode, count FROM locks"
columns = [
  { name = "mode", usage = "LABEL", rename = "lock_mode" },
  { name = "count", usage = "COUNTER" },
]
"#;

    #[test]
    fn parse_sample() {
        let queries = parse_queries(SAMPLE, Path::new("sample.toml")).unwrap();
        assert_eq!(queries.len(), 2);

        let db = &queries["db_size"];
        assert_eq!(db.ttl, 10.0);
        assert_eq!(db.timeout, 1.0);
        assert_eq!(db.label_names, vec!["datname"]);
        assert_eq!(db.metric_names, vec!["size"]);
        assert_eq!(db.columns["size"].default, Some(0.0));
        assert_eq!(db.columns["oid"].usage, ColumnUsage::Discard);

        let lock = &queries["pg_lock"];
        assert_eq!(lock.columns["mode"].emitted_name(), "lock_mode");
        assert_eq!(lock.metric_names, vec!["count"]);
    }

    #[test]
    fn reject_duplicate_columns() {
        let doc = r#"
[q]
sql = "SELECT 1"
columns = [
  { name = "a", usage = "GAUGE" },
  { name = "a", usage = "LABEL" },
]
"#;
        let err = parse_queries(doc, Path::new("dup.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn reject_negative_ttl() {
        let doc = r#"
[q]
sql = "SELECT 1"
ttl = -1
"#;
        assert!(parse_queries(doc, Path::new("ttl.toml")).is_err());
    }

    #[test]
    fn reject_durations_beyond_range() {
        for field in ["ttl = 1e20", "timeout = 1e20", "ttl = inf", "timeout = nan"] {
            let doc = format!("[q]\nsql = \"SELECT 1\"\n{field}\n");
            let err = parse_queries(&doc, Path::new("range.toml")).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid { .. }), "{field}");
        }
    }

    #[test]
    fn reject_bad_toml() {
        let err = parse_queries("[q\nsql=", Path::new("bad.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn load_directory_in_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("0100-first.toml"),
            "[q]\nsql = \"SELECT 1 AS v\"\nttl = 1\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("0200-second.toml"),
            "[q]\nsql = \"SELECT 2 AS v\"\nttl = 2\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("README.md"), "ignored").unwrap();

        let queries = load_queries(dir.path()).unwrap();
        assert_eq!(queries.len(), 1);
        assert_eq!(queries["q"].sql, "SELECT 2 AS v");
    }

    #[test]
    fn load_empty_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_queries(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Empty(_)));
    }

    #[test]
    fn bundled_config_parses() {
        let doc = include_str!("../../../pgscrape.toml");
        let queries = parse_queries(doc, Path::new("pgscrape.toml")).unwrap();
        assert!(queries.contains_key("pg_database"));
        assert!(queries["pgbouncer_pool"].has_tag("pgbouncer"));
        assert!(queries.values().all(|q| q.unmapped_columns().is_empty()));
    }

    #[test]
    fn load_missing_path_fails() {
        let err = load_queries(Path::new("/nonexistent/pgscrape.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
