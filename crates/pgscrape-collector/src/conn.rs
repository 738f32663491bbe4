//! Backend connections.
//!
//! Collectors talk to a database only through the [`Connection`] trait and
//! receive every value in its text form, which keeps column handling
//! dynamic: the result shape is only known once a query has run.
//! [`PgConnector`] is the production implementation on top of
//! `tokio-postgres`' simple query protocol, with TLS picked by `sslmode`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio_postgres::tls::MakeTlsConnect;
use tokio_postgres::{CancelToken, NoTls, SimpleQueryMessage, Socket};
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{debug, warn};

use pgscrape_core::dsn::{driver_dsn, shadow_dsn};

use crate::error::ConnError;
use crate::tls::make_tls;

/// Upper bound on delivering a cancel request to the server.
const CANCEL_TIMEOUT: Duration = Duration::from_secs(5);

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Text-form result of one query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl ResultSet {
    pub fn new(columns: &[&str]) -> Self {
        Self {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows: Vec::new(),
        }
    }

    /// Append a row of non-null values.
    pub fn row(mut self, values: &[&str]) -> Self {
        self.rows.push(values.iter().map(|v| Some(v.to_string())).collect());
        self
    }

    /// Append a row that may contain nulls.
    pub fn nullable_row(mut self, values: Vec<Option<&str>>) -> Self {
        self.rows
            .push(values.into_iter().map(|v| v.map(str::to_string)).collect());
        self
    }

    /// First value of the named column in the first row.
    pub fn first(&self, column: &str) -> Option<&str> {
        let idx = self.columns.iter().position(|c| c == column)?;
        self.rows.first()?.get(idx)?.as_deref()
    }
}

/// An open connection to one database.
pub trait Connection: Send + Sync {
    fn query<'a>(&'a self, sql: &'a str) -> BoxFuture<'a, Result<ResultSet, ConnError>>;

    /// Whether the underlying session is gone and must be re-established.
    fn is_closed(&self) -> bool;

    /// Ask the server to abort the statement in flight and retire this
    /// session. Afterwards [`is_closed`](Connection::is_closed) reports true.
    fn cancel<'a>(&'a self) -> BoxFuture<'a, ()>;
}

/// Opens connections from connection strings.
pub trait Connector: Send + Sync {
    fn connect<'a>(&'a self, dsn: &'a str) -> BoxFuture<'a, Result<Arc<dyn Connection>, ConnError>>;
}

/// Connector backed by `tokio-postgres`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PgConnector;

impl Connector for PgConnector {
    fn connect<'a>(&'a self, dsn: &'a str) -> BoxFuture<'a, Result<Arc<dyn Connection>, ConnError>> {
        Box::pin(async move {
            let (driver, params) = driver_dsn(dsn);
            let tls = make_tls(&params)?;
            let target = shadow_dsn(dsn);
            let client = match &tls {
                Some(tls) => open(&driver, tls.clone(), target.clone()).await?,
                None => open(&driver, NoTls, target.clone()).await?,
            };

            debug!(dsn = %target, sslmode = ?params.mode, "postgres connection established");
            Ok(Arc::new(PgConnection {
                cancel: client.cancel_token(),
                client,
                tls,
                closed: AtomicBool::new(false),
            }) as Arc<dyn Connection>)
        })
    }
}

async fn open<T>(dsn: &str, tls: T, target: String) -> Result<tokio_postgres::Client, ConnError>
where
    T: MakeTlsConnect<Socket>,
    T::Stream: Send + 'static,
{
    let (client, connection) = tokio_postgres::connect(dsn, tls)
        .await
        .map_err(|e| ConnError::Connect(e.to_string()))?;

    // Drive the connection until the client is dropped.
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            warn!(dsn = %target, error = %e, "postgres connection terminated");
        }
    });
    Ok(client)
}

struct PgConnection {
    client: tokio_postgres::Client,
    cancel: CancelToken,
    tls: Option<MakeRustlsConnect>,
    closed: AtomicBool,
}

impl Connection for PgConnection {
    fn query<'a>(&'a self, sql: &'a str) -> BoxFuture<'a, Result<ResultSet, ConnError>> {
        Box::pin(async move {
            let messages = self
                .client
                .simple_query(sql)
                .await
                .map_err(|e| ConnError::Query(e.to_string()))?;

            let mut result = ResultSet::default();
            for message in messages {
                match message {
                    SimpleQueryMessage::RowDescription(columns) => {
                        result.columns = columns.iter().map(|c| c.name().to_string()).collect();
                        result.rows.clear();
                    }
                    SimpleQueryMessage::Row(row) => {
                        if result.columns.is_empty() {
                            result.columns =
                                row.columns().iter().map(|c| c.name().to_string()).collect();
                        }
                        let mut values = Vec::with_capacity(row.len());
                        for idx in 0..row.len() {
                            let value = row
                                .try_get(idx)
                                .map_err(|e| ConnError::Scan {
                                    row: result.rows.len(),
                                    reason: e.to_string(),
                                })?;
                            values.push(value.map(str::to_string));
                        }
                        result.rows.push(values);
                    }
                    _ => {}
                }
            }
            Ok(result)
        })
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.client.is_closed()
    }

    fn cancel<'a>(&'a self) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.closed.store(true, Ordering::Release);
            let request = async {
                match &self.tls {
                    Some(tls) => self.cancel.cancel_query(tls.clone()).await,
                    None => self.cancel.cancel_query(NoTls).await,
                }
            };
            match tokio::time::timeout(CANCEL_TIMEOUT, request).await {
                Ok(Ok(())) => debug!("statement cancelled"),
                Ok(Err(e)) => warn!(error = %e, "fail cancelling statement"),
                Err(_) => warn!(limit = ?CANCEL_TIMEOUT, "cancel request timed out"),
            }
        })
    }
}
