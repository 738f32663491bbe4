//! In-memory connector for tests.
//!
//! A [`MockServer`] answers the health probe and the database listing on its
//! own, and replies to any other statement with whatever was registered for
//! that exact SQL text. Clones share state, so a test can keep a handle and
//! reconfigure the server while backends hold connections to it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use pgscrape_core::dsn::database_name;

use crate::backend::{DATABASES_SQL, PGBOUNCER_PROBE_SQL, PROBE_SQL};
use crate::conn::{BoxFuture, Connection, Connector, ResultSet};
use crate::error::ConnError;

/// Registered reply for one SQL statement.
#[derive(Debug, Clone)]
pub enum MockReply {
    Rows(ResultSet),
    Fail(ConnError),
    /// Sleep, then return the rows.
    Delay(Duration, ResultSet),
}

#[derive(Debug)]
struct MockState {
    replies: HashMap<String, MockReply>,
    executions: HashMap<String, u64>,
    refuse: bool,
    version: u32,
    recovery: bool,
    pgbouncer_version: String,
    databases: Vec<String>,
    connects: Vec<String>,
    cancels: u64,
}

#[derive(Debug, Clone)]
pub struct MockServer {
    state: Arc<Mutex<MockState>>,
}

impl Default for MockServer {
    fn default() -> Self {
        Self::new()
    }
}

impl MockServer {
    /// A reachable postgres 16 primary with a single `postgres` database.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                replies: HashMap::new(),
                executions: HashMap::new(),
                refuse: false,
                version: 160000,
                recovery: false,
                pgbouncer_version: "PgBouncer 1.21.0".to_string(),
                databases: vec!["postgres".to_string()],
                connects: Vec::new(),
                cancels: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn reply(&self, sql: &str, reply: MockReply) {
        self.lock().replies.insert(sql.to_string(), reply);
    }

    pub fn rows(&self, sql: &str, rows: ResultSet) {
        self.reply(sql, MockReply::Rows(rows));
    }

    /// Refuse new connections and report existing ones as closed.
    pub fn set_refuse(&self, refuse: bool) {
        self.lock().refuse = refuse;
    }

    pub fn set_version(&self, version: u32) {
        self.lock().version = version;
    }

    pub fn set_recovery(&self, recovery: bool) {
        self.lock().recovery = recovery;
    }

    pub fn set_databases(&self, databases: &[&str]) {
        self.lock().databases = databases.iter().map(|d| d.to_string()).collect();
    }

    /// Times `sql` was executed across all connections.
    pub fn executions(&self, sql: &str) -> u64 {
        self.lock().executions.get(sql).copied().unwrap_or(0)
    }

    /// Connection strings of every successful connect, in order.
    pub fn connects(&self) -> Vec<String> {
        self.lock().connects.clone()
    }

    /// Cancel requests received across all connections.
    pub fn cancels(&self) -> u64 {
        self.lock().cancels
    }

    /// A connection to `database`, bypassing the connector.
    pub fn connection(&self, database: &str) -> Arc<dyn Connection> {
        Arc::new(MockConnection {
            server: self.clone(),
            database: database.to_string(),
            cancelled: AtomicBool::new(false),
        })
    }

    fn answer(&self, database: &str, sql: &str) -> Result<MockReply, ConnError> {
        let mut state = self.lock();
        *state.executions.entry(sql.to_string()).or_insert(0) += 1;
        if state.refuse {
            return Err(ConnError::Query("server closed the connection unexpectedly".to_string()));
        }

        let reply = match sql {
            PROBE_SQL => {
                let version = state.version.to_string();
                let recovery = if state.recovery { "t" } else { "f" };
                MockReply::Rows(
                    ResultSet::new(&["version", "recovery", "datname"]).row(&[version.as_str(), recovery, database]),
                )
            }
            PGBOUNCER_PROBE_SQL => {
                MockReply::Rows(ResultSet::new(&["version"]).row(&[state.pgbouncer_version.as_str()]))
            }
            DATABASES_SQL => {
                let mut rows = ResultSet::new(&["datname"]);
                for name in &state.databases {
                    rows = rows.row(&[name.as_str()]);
                }
                MockReply::Rows(rows)
            }
            other => state.replies.get(other).cloned().ok_or_else(|| {
                ConnError::Query(format!("no reply registered for: {other}"))
            })?,
        };
        Ok(reply)
    }
}

impl Connector for MockServer {
    fn connect<'a>(&'a self, dsn: &'a str) -> BoxFuture<'a, Result<Arc<dyn Connection>, ConnError>> {
        Box::pin(async move {
            let mut state = self.lock();
            if state.refuse {
                return Err(ConnError::Connect("connection refused".to_string()));
            }
            state.connects.push(dsn.to_string());
            drop(state);
            Ok(self.connection(&database_name(dsn)))
        })
    }
}

struct MockConnection {
    server: MockServer,
    database: String,
    cancelled: AtomicBool,
}

impl Connection for MockConnection {
    fn query<'a>(&'a self, sql: &'a str) -> BoxFuture<'a, Result<ResultSet, ConnError>> {
        Box::pin(async move {
            match self.server.answer(&self.database, sql)? {
                MockReply::Rows(rows) => Ok(rows),
                MockReply::Fail(err) => Err(err),
                MockReply::Delay(delay, rows) => {
                    tokio::time::sleep(delay).await;
                    Ok(rows)
                }
            }
        })
    }

    fn is_closed(&self) -> bool {
        self.cancelled.load(Ordering::Acquire) || self.server.lock().refuse
    }

    fn cancel<'a>(&'a self) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.cancelled.store(true, Ordering::Release);
            self.server.lock().cancels += 1;
        })
    }
}
