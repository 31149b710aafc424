//! Connection traits for replmon-pool
//!
//! - [`Connection`]: a live session able to run parameterized statements
//! - [`ConnectionFactory`]: opens sessions from a [`ConnectionConfig`]
//!
//! The pool only ever talks to these traits, so tests drive the whole node
//! pool with an in-memory factory and production uses the tokio-postgres
//! backend in [`crate::postgres`].

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;
use crate::tls::TlsConfig;
use crate::types::{Row, Value};

/// A connection to a database
#[async_trait]
pub trait Connection: Send + Sync {
    /// Execute a query that returns rows
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;

    /// Execute a query and return the first row (convenience method)
    async fn query_one(&self, sql: &str, params: &[Value]) -> Result<Option<Row>> {
        let rows = self.query(sql, params).await?;
        Ok(rows.into_iter().next())
    }

    /// Check if connection is valid/alive
    async fn is_valid(&self) -> bool;

    /// Whether the session is known to be gone without a round trip
    fn is_closed(&self) -> bool {
        false
    }

    /// Close the connection
    async fn close(&self) -> Result<()>;
}

/// Factory for creating connections
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Create a new connection
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Connection>>;
}

/// Configuration for creating connections to one node
#[derive(Clone)]
pub struct ConnectionConfig {
    /// Server host name or address
    pub host: String,
    /// Server port
    pub port: u16,
    /// Database name
    pub database: String,
    /// Login role
    pub user: String,
    /// Password, if the server asks for one
    pub password: Option<String>,
    /// TLS settings
    pub tls: TlsConfig,
    /// Connection establishment timeout
    pub connect_timeout: Duration,
    /// Application name (shown in pg_stat_activity)
    pub application_name: Option<String>,
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never let the password reach a log line.
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("tls", &self.tls)
            .field("connect_timeout", &self.connect_timeout)
            .field("application_name", &self.application_name)
            .finish()
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 5432,
            database: "postgres".into(),
            user: "postgres".into(),
            password: None,
            tls: TlsConfig::default(),
            connect_timeout: Duration::from_secs(10),
            application_name: Some("replmon".into()),
        }
    }
}

impl ConnectionConfig {
    /// Create configuration for a host/database pair
    pub fn new(host: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            database: database.into(),
            ..Default::default()
        }
    }

    /// Set port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set credentials
    pub fn with_credentials(mut self, user: impl Into<String>, password: Option<String>) -> Self {
        self.user = user.into();
        self.password = password;
        self
    }

    /// Set TLS settings
    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = tls;
        self
    }

    /// Set connection timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set application name
    pub fn with_application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = Some(name.into());
        self
    }

    /// `host:port/database`, safe to log
    pub fn endpoint(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.database)
    }
}
