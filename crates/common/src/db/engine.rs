//! Database engine seams
//!
//! The provisioning workflow and the connection router talk to the database
//! server through two small traits so the engine can be swapped in tests.

use super::{connect_postgres, PoolSize};
use crate::config::DatabaseConfig;
use async_trait::async_trait;
use sea_orm::{ConnectionTrait, DatabaseConnection, DbBackend, DbErr, Statement};
use tracing::info;

/// Data-definition commands against the database server
#[async_trait]
pub trait DatabaseAdmin: Send + Sync {
    /// Create an empty database
    async fn create_database(&self, name: &str) -> Result<(), DbErr>;

    /// Drop a database, succeeding if it is already gone
    async fn drop_database(&self, name: &str) -> Result<(), DbErr>;

    /// Check whether a database exists
    async fn database_exists(&self, name: &str) -> Result<bool, DbErr>;
}

/// Opens connections to a named database with the shared server parameters
#[async_trait]
pub trait TenantConnector: Send + Sync {
    async fn connect(&self, database_name: &str) -> Result<DatabaseConnection, DbErr>;
}

/// Postgres implementation of both seams.
///
/// DDL runs over an administrative connection to the registry database;
/// tenant connections are new pools sized by `tenant_max_connections`.
#[derive(Clone)]
pub struct PostgresEngine {
    config: DatabaseConfig,
    admin: DatabaseConnection,
}

impl PostgresEngine {
    pub fn new(config: DatabaseConfig, admin: DatabaseConnection) -> Self {
        Self { config, admin }
    }
}

/// Quote an identifier for use in DDL
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[async_trait]
impl DatabaseAdmin for PostgresEngine {
    async fn create_database(&self, name: &str) -> Result<(), DbErr> {
        info!(database = %name, "Creating database");
        self.admin
            .execute_unprepared(&format!("CREATE DATABASE {}", quote_ident(name)))
            .await?;
        Ok(())
    }

    async fn drop_database(&self, name: &str) -> Result<(), DbErr> {
        info!(database = %name, "Dropping database");
        // FORCE terminates sessions left behind by an abandoned step
        self.admin
            .execute_unprepared(&format!(
                "DROP DATABASE IF EXISTS {} WITH (FORCE)",
                quote_ident(name)
            ))
            .await?;
        Ok(())
    }

    async fn database_exists(&self, name: &str) -> Result<bool, DbErr> {
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            "SELECT 1 FROM pg_database WHERE datname = $1",
            vec![name.into()],
        );
        Ok(self.admin.query_one(stmt).await?.is_some())
    }
}

#[async_trait]
impl TenantConnector for PostgresEngine {
    async fn connect(&self, database_name: &str) -> Result<DatabaseConnection, DbErr> {
        connect_postgres(&self.config, database_name, PoolSize::tenant(&self.config)).await
    }
}
