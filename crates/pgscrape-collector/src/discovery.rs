//! Database discovery.
//!
//! The primary backend lists the databases of its cluster on every check and
//! diffs them against the previous observation. Changes are handed to a
//! [`DatabaseChangeHandler`], which decides which peripherals to create or
//! remove.

use std::collections::{BTreeMap, BTreeSet};

use crate::conn::BoxFuture;

/// Receives discovery diffs: `name -> true` for added databases, `false`
/// for removed ones.
pub trait DatabaseChangeHandler: Send + Sync {
    fn on_database_change<'a>(&'a self, change: &'a BTreeMap<String, bool>) -> BoxFuture<'a, ()>;
}

/// Diff two database sets. With no previous observation every database in
/// `new` is reported as added.
pub fn diff_databases(old: Option<&BTreeSet<String>>, new: &BTreeSet<String>) -> BTreeMap<String, bool> {
    let empty = BTreeSet::new();
    let old = old.unwrap_or(&empty);
    let mut change = BTreeMap::new();
    for name in new.difference(old) {
        change.insert(name.clone(), true);
    }
    for name in old.difference(new) {
        change.insert(name.clone(), false);
    }
    change
}

/// Which discovered databases get a peripheral backend.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryFilter {
    /// The primary's own database, never duplicated as a peripheral.
    pub primary: String,
    pub exclude: BTreeSet<String>,
    /// When non-empty, only these databases are admitted.
    pub include: BTreeSet<String>,
}

impl DiscoveryFilter {
    pub fn new(primary: &str, exclude: &[String], include: &[String]) -> Self {
        Self {
            primary: primary.to_string(),
            exclude: exclude.iter().cloned().collect(),
            include: include.iter().cloned().collect(),
        }
    }

    pub fn admits(&self, database: &str) -> bool {
        if database == self.primary || self.exclude.contains(database) {
            return false;
        }
        self.include.is_empty() || self.include.contains(database)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn first_observation_reports_everything_added() {
        let change = diff_databases(None, &set(&["a", "b"]));
        assert_eq!(change.len(), 2);
        assert!(change.values().all(|added| *added));
    }

    #[test]
    fn diff_reports_additions_and_removals() {
        let change = diff_databases(Some(&set(&["a", "b"])), &set(&["b", "c"]));
        assert_eq!(change.get("a"), Some(&false));
        assert_eq!(change.get("c"), Some(&true));
        assert!(!change.contains_key("b"));
    }

    #[test]
    fn unchanged_set_yields_empty_diff() {
        let s = set(&["a"]);
        assert!(diff_databases(Some(&s), &s).is_empty());
    }

    #[test]
    fn filter_skips_primary_and_excluded() {
        let filter = DiscoveryFilter::new("postgres", &["dbA".to_string()], &[]);
        assert!(!filter.admits("postgres"));
        assert!(!filter.admits("dbA"));
        assert!(filter.admits("dbB"));
    }

    #[test]
    fn include_list_restricts() {
        let filter = DiscoveryFilter::new("postgres", &[], &["app".to_string()]);
        assert!(filter.admits("app"));
        assert!(!filter.admits("other"));
    }
}
