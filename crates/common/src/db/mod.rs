//! Database layer for Nizam
//!
//! Provides:
//! - SeaORM entity models
//! - The registry store (tenants and accounts)
//! - Engine seams for creating databases and opening tenant connections
//! - Connection pool construction from the shared configuration

pub mod models;
mod engine;
mod registry;

pub use engine::{DatabaseAdmin, PostgresEngine, TenantConnector};
pub use registry::{NewAccount, Registry, TenantDirectory};

use crate::config::DatabaseConfig;
use sea_orm::{DatabaseConnection, DbErr, RuntimeErr, SqlErr, SqlxPostgresConnector};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use tracing::{debug, info};

/// Pool sizing for one database connection
#[derive(Debug, Clone, Copy)]
pub struct PoolSize {
    pub max_connections: u32,
    pub min_connections: u32,
}

impl PoolSize {
    /// Sizing for the shared registry pool
    pub fn registry(config: &DatabaseConfig) -> Self {
        Self {
            max_connections: config.max_connections,
            min_connections: config.min_connections,
        }
    }

    /// Sizing for one tenant pool
    pub fn tenant(config: &DatabaseConfig) -> Self {
        Self {
            max_connections: config.tenant_max_connections,
            min_connections: 0,
        }
    }
}

/// Open a Postgres pool to `database` using the shared server parameters.
///
/// Credentials go through `PgConnectOptions` rather than a URL so passwords
/// need no escaping.
pub async fn connect_postgres(
    config: &DatabaseConfig,
    database: &str,
    size: PoolSize,
) -> Result<DatabaseConnection, DbErr> {
    debug!(host = %config.host, database = %database, "Opening Postgres pool");

    let mut options = PgConnectOptions::new()
        .host(&config.host)
        .port(config.port)
        .username(&config.username)
        .database(database);

    if let Some(ref password) = config.password {
        options = options.password(password);
    }

    let pool = PgPoolOptions::new()
        .max_connections(size.max_connections)
        .min_connections(size.min_connections)
        .acquire_timeout(config.connect_timeout())
        .idle_timeout(config.idle_timeout())
        .connect_with(options)
        .await
        .map_err(|e| DbErr::Conn(RuntimeErr::Internal(format!(
            "Failed to connect to {}: {}",
            database, e
        ))))?;

    Ok(SqlxPostgresConnector::from_sqlx_postgres_pool(pool))
}

/// Connect to the registry database
pub async fn connect_registry(config: &DatabaseConfig) -> Result<DatabaseConnection, DbErr> {
    info!(database = %config.registry_database, "Connecting to registry database...");
    let conn = connect_postgres(config, &config.registry_database, PoolSize::registry(config)).await?;
    info!("Registry connection established");
    Ok(conn)
}

/// Whether the error is a unique-constraint violation on any backend
pub fn is_unique_violation(err: &DbErr) -> bool {
    matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_)))
}
