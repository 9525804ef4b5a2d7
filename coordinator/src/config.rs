//! Relational connection settings loaded via OrthoConfig.

use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;

use crate::outbound::persistence::PoolConfig;

/// Settings for the PostgreSQL pool behind the relational transactor.
#[derive(Debug, Clone, Deserialize, OrthoConfig)]
#[ortho_config(prefix = "COORDINATOR_DB")]
pub struct PersistenceSettings {
    /// Connection URL; the relational adapter is disabled when unset.
    pub database_url: Option<String>,
    /// Upper bound on pooled connections.
    #[ortho_config(default = 10)]
    pub max_connections: u32,
    /// Idle connections the pool keeps warm.
    pub min_idle: Option<u32>,
    /// Seconds to wait for a pooled connection.
    pub connection_timeout_secs: Option<u64>,
}

impl PersistenceSettings {
    /// Build the pool configuration, or `None` without a database URL.
    #[must_use]
    pub fn pool_config(&self) -> Option<PoolConfig> {
        let url = self.database_url.as_deref()?;
        let config = PoolConfig::new(url)
            .with_max_size(self.max_connections)
            .with_min_idle(self.min_idle.or(Some(PoolConfig::DEFAULT_MIN_IDLE)))
            .with_connection_timeout(
                self.connection_timeout_secs
                    .map_or(PoolConfig::DEFAULT_CONNECTION_TIMEOUT, Duration::from_secs),
            );
        Some(config)
    }
}
