//! PostgreSQL backend for replmon-pool
//!
//! Opens sessions with tokio-postgres. TLS goes through rustls when the
//! `postgres-tls` feature is enabled.
//!
//! Only the column types the monitoring catalog views produce are decoded
//! natively. Queries cast everything else (`pg_lsn`, `interval`, `numeric`,
//! `inet`) to text or a float so the row mapping stays small.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_postgres::types::{ToSql, Type};
use tracing::{debug, warn};

use crate::connection::{Connection, ConnectionConfig, ConnectionFactory};
use crate::error::{Error, Result};
use crate::tls::SslMode;
use crate::types::{Row, Value};

/// Convert a [`Value`] to a tokio-postgres compatible parameter
fn value_to_sql(value: &Value) -> Box<dyn ToSql + Sync + Send> {
    match value {
        Value::Null => Box::new(Option::<String>::None),
        Value::Bool(b) => Box::new(*b),
        Value::Int16(n) => Box::new(*n),
        Value::Int32(n) => Box::new(*n),
        Value::Int64(n) => Box::new(*n),
        Value::Float64(n) => Box::new(*n),
        Value::String(s) => Box::new(s.clone()),
        Value::Bytes(b) => Box::new(b.clone()),
        Value::DateTimeTz(dt) => Box::new(*dt),
        Value::Json(j) => Box::new(j.clone()),
    }
}

/// Convert a tokio-postgres row to a [`Row`]
fn pg_row_to_row(pg_row: &tokio_postgres::Row) -> Row {
    let columns: Vec<String> = pg_row
        .columns()
        .iter()
        .map(|c| c.name().to_string())
        .collect();

    let values: Vec<Value> = pg_row
        .columns()
        .iter()
        .enumerate()
        .map(|(i, col)| pg_value_to_value(pg_row, i, col.type_()))
        .collect();

    Row::new(columns, values)
}

fn decode<'a, T, F>(row: &'a tokio_postgres::Row, idx: usize, wrap: F) -> Value
where
    T: tokio_postgres::types::FromSql<'a>,
    F: FnOnce(T) -> Value,
{
    row.try_get::<_, Option<T>>(idx)
        .ok()
        .flatten()
        .map(wrap)
        .unwrap_or(Value::Null)
}

/// Convert a PostgreSQL value to a [`Value`]
fn pg_value_to_value(row: &tokio_postgres::Row, idx: usize, pg_type: &Type) -> Value {
    match *pg_type {
        Type::BOOL => decode(row, idx, Value::Bool),
        Type::INT2 => decode(row, idx, Value::Int16),
        Type::INT4 => decode(row, idx, Value::Int32),
        Type::INT8 => decode(row, idx, Value::Int64),
        Type::OID => decode::<u32, _>(row, idx, |n| Value::Int64(i64::from(n))),
        Type::FLOAT4 => decode::<f32, _>(row, idx, |n| Value::Float64(f64::from(n))),
        Type::FLOAT8 => decode(row, idx, Value::Float64),
        Type::BYTEA => decode(row, idx, Value::Bytes),
        Type::TIMESTAMPTZ => decode(row, idx, Value::DateTimeTz),
        Type::TIMESTAMP => decode::<chrono::NaiveDateTime, _>(row, idx, |dt| {
            Value::DateTimeTz(dt.and_utc())
        }),
        Type::JSON | Type::JSONB => decode(row, idx, Value::Json),
        // TEXT, VARCHAR, NAME and anything else tokio-postgres can read as a string
        _ => decode(row, idx, Value::String),
    }
}

/// PostgreSQL connection implementation
pub struct PgConnection {
    client: tokio_postgres::Client,
    closed: AtomicBool,
}

impl PgConnection {
    /// Create a new connection from a tokio-postgres client
    pub fn new(client: tokio_postgres::Client) -> Self {
        Self {
            client,
            closed: AtomicBool::new(false),
        }
    }

    /// Get the underlying client
    pub fn client(&self) -> &tokio_postgres::Client {
        &self.client
    }
}

#[async_trait]
impl Connection for PgConnection {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        if self.closed.load(Ordering::Relaxed) || self.client.is_closed() {
            return Err(Error::connection("connection is closed"));
        }

        let boxed_params: Vec<Box<dyn ToSql + Sync + Send>> =
            params.iter().map(value_to_sql).collect();

        let param_refs: Vec<&(dyn ToSql + Sync)> = boxed_params
            .iter()
            .map(|b| b.as_ref() as &(dyn ToSql + Sync))
            .collect();

        let pg_rows = self.client.query(sql, &param_refs).await.map_err(|e| {
            if e.is_closed() {
                Error::connection_with_source("connection lost during query", e)
            } else {
                Error::query_with_sql(pg_error_message(&e), sql)
            }
        })?;

        Ok(pg_rows.iter().map(pg_row_to_row).collect())
    }

    async fn is_valid(&self) -> bool {
        if self.closed.load(Ordering::Relaxed) || self.client.is_closed() {
            return false;
        }
        self.client.simple_query("SELECT 1").await.is_ok()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed) || self.client.is_closed()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

/// Server error text when available, otherwise the driver's rendering
fn pg_error_message(e: &tokio_postgres::Error) -> String {
    match e.as_db_error() {
        Some(db) => format!("{} ({})", db.message(), db.code().code()),
        None => e.to_string(),
    }
}

fn pg_config(config: &ConnectionConfig) -> tokio_postgres::Config {
    let mut pg = tokio_postgres::Config::new();
    pg.host(&config.host)
        .port(config.port)
        .dbname(&config.database)
        .user(&config.user)
        .connect_timeout(config.connect_timeout);
    if let Some(password) = &config.password {
        pg.password(password);
    }
    if let Some(name) = &config.application_name {
        pg.application_name(name);
    }
    pg.ssl_mode(match config.tls.mode {
        SslMode::Disable => tokio_postgres::config::SslMode::Disable,
        SslMode::Prefer => tokio_postgres::config::SslMode::Prefer,
        SslMode::Require | SslMode::VerifyCa | SslMode::VerifyFull => {
            tokio_postgres::config::SslMode::Require
        }
    });
    pg
}

/// Factory opening [`PgConnection`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct PgConnectionFactory;

#[async_trait]
impl ConnectionFactory for PgConnectionFactory {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
        config.tls.validate().map_err(Error::config)?;
        let pg = pg_config(config);
        let endpoint = config.endpoint();

        #[cfg(feature = "postgres-tls")]
        let client = if config.tls.is_enabled() {
            let tls = crate::tls::make_tls_connector(&config.tls)
                .map_err(|e| Error::config(format!("TLS setup failed: {e}")))?;
            let (client, connection) = pg.connect(tls).await.map_err(|e| {
                Error::connection_with_source(format!("failed to connect to {endpoint}"), e)
            })?;
            spawn_connection_task(endpoint, connection);
            client
        } else {
            connect_plain(&pg, endpoint).await?
        };

        #[cfg(not(feature = "postgres-tls"))]
        let client = {
            if config.tls.is_required() {
                return Err(Error::config(format!(
                    "SSL mode '{}' requires the postgres-tls feature",
                    config.tls.mode
                )));
            }
            connect_plain(&pg, endpoint).await?
        };

        Ok(Box::new(PgConnection::new(client)))
    }
}

async fn connect_plain(
    pg: &tokio_postgres::Config,
    endpoint: String,
) -> Result<tokio_postgres::Client> {
    let (client, connection) = pg.connect(tokio_postgres::NoTls).await.map_err(|e| {
        Error::connection_with_source(format!("failed to connect to {endpoint}"), e)
    })?;
    spawn_connection_task(endpoint, connection);
    Ok(client)
}

fn spawn_connection_task<F>(endpoint: String, connection: F)
where
    F: std::future::Future<Output = std::result::Result<(), tokio_postgres::Error>>
        + Send
        + 'static,
{
    tokio::spawn(async move {
        match connection.await {
            Ok(()) => debug!(endpoint = %endpoint, "connection closed"),
            Err(e) => warn!(endpoint = %endpoint, error = %e, "connection error"),
        }
    });
}
