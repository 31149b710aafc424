//! Node configuration and identity

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use std::time::Duration;

use crate::connection::ConnectionConfig;
use crate::error::{Error, Result};
use crate::health::NodeHealth;
use crate::pool::{ConnectionPool, PoolConfig};
use crate::tls::TlsConfig;

/// Node ids must start with a letter and contain only letters, digits, `_` or `-`
static NODE_ID_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"^[A-Za-z][A-Za-z0-9_-]*$").expect("valid node id regex")
});

/// Validate a node id
pub fn validate_node_id(id: &str) -> Result<()> {
    if NODE_ID_REGEX.is_match(id) {
        Ok(())
    } else {
        Err(Error::invalid_node_id(id))
    }
}

fn default_port() -> u16 {
    5432
}

fn default_min_size() -> usize {
    0
}

fn default_max_size() -> usize {
    5
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_acquire_timeout_ms() -> u64 {
    10_000
}

fn default_idle_timeout_ms() -> u64 {
    30_000
}

fn default_max_lifetime_ms() -> u64 {
    1_800_000
}

/// Pool sizing for one node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSizing {
    /// Idle connections kept open
    #[serde(default = "default_min_size")]
    pub min_size: usize,
    /// Maximum open connections
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    /// Connection establishment timeout
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Time to wait for a free connection
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    /// Idle connections older than this are closed
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Connections older than this are recycled
    #[serde(default = "default_max_lifetime_ms")]
    pub max_lifetime_ms: u64,
}

impl Default for PoolSizing {
    fn default() -> Self {
        Self {
            min_size: default_min_size(),
            max_size: default_max_size(),
            connect_timeout_ms: default_connect_timeout_ms(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            max_lifetime_ms: default_max_lifetime_ms(),
        }
    }
}

impl PoolSizing {
    /// Pool configuration derived from these settings
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig::default()
            .with_min_size(self.min_size)
            .with_max_size(self.max_size)
            .with_acquire_timeout(Duration::from_millis(self.acquire_timeout_ms))
            .with_idle_timeout(Duration::from_millis(self.idle_timeout_ms))
            .with_max_lifetime(Duration::from_millis(self.max_lifetime_ms))
    }

    /// Validate sizes and timeouts
    pub fn validate(&self) -> Result<()> {
        self.pool_config().validate()?;
        if self.connect_timeout_ms == 0 || self.acquire_timeout_ms == 0 {
            return Err(Error::config("pool timeouts must be greater than zero"));
        }
        Ok(())
    }
}

/// Connection settings for one node
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Display name (defaults to the node id)
    #[serde(default)]
    pub name: Option<String>,
    /// Server host
    pub host: String,
    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Database to connect to
    pub database: String,
    /// Login role
    pub user: String,
    /// Password
    #[serde(default)]
    pub password: Option<String>,
    /// TLS settings
    #[serde(default)]
    pub tls: TlsConfig,
    /// Per-node pool sizing, overriding the pool-wide default
    #[serde(default)]
    pub pool: Option<PoolSizing>,
}

impl std::fmt::Debug for NodeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeConfig")
            .field("name", &self.name)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("tls", &self.tls)
            .field("pool", &self.pool)
            .finish()
    }
}

impl NodeConfig {
    /// Create a node config with the default port and no password
    pub fn new(
        host: impl Into<String>,
        database: impl Into<String>,
        user: impl Into<String>,
    ) -> Self {
        Self {
            name: None,
            host: host.into(),
            port: default_port(),
            database: database.into(),
            user: user.into(),
            password: None,
            tls: TlsConfig::default(),
            pool: None,
        }
    }

    /// Set display name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set password
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set TLS settings
    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = tls;
        self
    }

    /// Set per-node pool sizing
    pub fn with_pool(mut self, pool: PoolSizing) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Display name, falling back to the node id
    pub fn display_name<'a>(&'a self, id: &'a str) -> &'a str {
        self.name.as_deref().unwrap_or(id)
    }

    /// Validate host, database, TLS and pool settings
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::config("node host must not be empty"));
        }
        if self.database.trim().is_empty() {
            return Err(Error::config("node database must not be empty"));
        }
        if self.user.trim().is_empty() {
            return Err(Error::config("node user must not be empty"));
        }
        self.tls.validate().map_err(Error::config)?;
        if let Some(pool) = &self.pool {
            pool.validate()?;
        }
        Ok(())
    }

    /// Connection settings for the pool
    pub fn connection_config(&self, sizing: &PoolSizing) -> ConnectionConfig {
        ConnectionConfig::new(&self.host, &self.database)
            .with_port(self.port)
            .with_credentials(&self.user, self.password.clone())
            .with_tls(self.tls.clone())
            .with_connect_timeout(Duration::from_millis(sizing.connect_timeout_ms))
    }
}

/// A registered node: identity, config, pool and current health
pub(crate) struct Node {
    pub(crate) id: String,
    pub(crate) config: NodeConfig,
    pub(crate) pool: ConnectionPool,
    /// Written only by the health monitor
    pub(crate) health: RwLock<NodeHealth>,
}

impl Node {
    pub(crate) fn new(id: String, config: NodeConfig, pool: ConnectionPool) -> Self {
        Self {
            id,
            config,
            pool,
            health: RwLock::new(NodeHealth::default()),
        }
    }

    pub(crate) fn name(&self) -> &str {
        self.config.display_name(&self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_validation() {
        for id in ["a", "node1", "Node_2", "east-1", "x_y-z9"] {
            assert!(validate_node_id(id).is_ok(), "{id} should be valid");
        }
        for id in ["", "1node", "-a", "_a", "a b", "a.b", "nöde"] {
            assert!(
                matches!(validate_node_id(id), Err(Error::InvalidNodeId { .. })),
                "{id} should be invalid"
            );
        }
    }

    #[test]
    fn test_node_config_defaults_port() {
        let config: NodeConfig = serde_json::from_str(
            r#"{"host":"db1","database":"app","user":"monitor"}"#,
        )
        .unwrap();
        assert_eq!(config.port, 5432);
        assert_eq!(config.pool, None);
        assert_eq!(config, NodeConfig::new("db1", "app", "monitor"));
    }

    #[test]
    fn test_debug_redacts_password() {
        let config = NodeConfig::new("db1", "app", "monitor").with_password("hunter2");
        let debug = format!("{config:?}");
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_display_name_falls_back_to_id() {
        let config = NodeConfig::new("db1", "app", "monitor");
        assert_eq!(config.display_name("n1"), "n1");
        assert_eq!(config.with_name("Primary").display_name("n1"), "Primary");
    }

    #[test]
    fn test_pool_sizing_partial_deserialize() {
        let sizing: PoolSizing = serde_json::from_str(r#"{"max_size":2}"#).unwrap();
        assert_eq!(sizing.max_size, 2);
        assert_eq!(sizing.connect_timeout_ms, 10_000);
        assert_eq!(sizing.pool_config().max_size, 2);
    }

    #[test]
    fn test_node_config_validation() {
        assert!(NodeConfig::new("db1", "app", "monitor").validate().is_ok());
        assert!(NodeConfig::new("", "app", "monitor").validate().is_err());

        let bad_pool = PoolSizing {
            min_size: 4,
            max_size: 2,
            ..Default::default()
        };
        assert!(NodeConfig::new("db1", "app", "monitor")
            .with_pool(bad_pool)
            .validate()
            .is_err());
    }
}
