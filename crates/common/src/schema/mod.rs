//! Schema provisioner
//!
//! Applies an ordered [`MigrationSet`] to a database handle. Every step runs
//! in its own transaction together with the insert of its row in
//! `schema_migrations`, so a step is either fully applied and recorded or
//! not at all, and re-running a set skips what is already recorded.

mod registry;
mod tenant;

pub use registry::registry_migrations;
pub use tenant::tenant_migrations;

use crate::db::models::*;
use crate::errors::MigrationError;
use sea_orm::{
    ActiveModelTrait, ConnectionTrait, DatabaseConnection, DbBackend, DbErr, EntityTrait,
    QueryOrder, Set, Statement, TransactionTrait,
};
use std::collections::BTreeSet;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// DDL for the version marker table
const MARKER_TABLE_DDL: &str = "CREATE TABLE IF NOT EXISTS schema_migrations (
    version BIGINT PRIMARY KEY,
    name VARCHAR(255) NOT NULL,
    applied_at TIMESTAMPTZ NOT NULL
)";

/// One versioned schema step
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub statements: &'static [&'static str],
}

/// Ordered list of migrations with strictly increasing versions
#[derive(Debug, Clone)]
pub struct MigrationSet {
    name: &'static str,
    migrations: Vec<Migration>,
}

impl MigrationSet {
    /// Build a set; panics if versions are not strictly increasing, which is
    /// a programming error in the built-in sets.
    pub fn new(name: &'static str, migrations: Vec<Migration>) -> Self {
        assert!(
            migrations.windows(2).all(|w| w[0].version < w[1].version),
            "migration versions in set {} must be strictly increasing",
            name
        );
        Self { name, migrations }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn migrations(&self) -> &[Migration] {
        &self.migrations
    }

    /// Highest version in the set
    pub fn latest_version(&self) -> Option<i64> {
        self.migrations.last().map(|m| m.version)
    }

    fn contains(&self, version: i64) -> bool {
        self.migrations.iter().any(|m| m.version == version)
    }
}

/// Outcome of [`SchemaProvisioner::apply`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedVersion {
    /// Version the database is at after the run
    pub version: Option<i64>,
    /// Versions applied by this run, in order
    pub newly_applied: Vec<i64>,
}

impl AppliedVersion {
    /// Whether the run was a no-op
    pub fn is_unchanged(&self) -> bool {
        self.newly_applied.is_empty()
    }
}

/// Applies migration sets to database handles
#[derive(Debug, Clone, Copy, Default)]
pub struct SchemaProvisioner;

impl SchemaProvisioner {
    pub fn new() -> Self {
        Self
    }

    /// Apply every pending step of `set`, in order.
    ///
    /// Stops at the first failing step; the error carries the last version
    /// that was successfully applied.
    #[instrument(skip(self, conn, set), fields(migration_set = set.name()))]
    pub async fn apply(
        &self,
        conn: &DatabaseConnection,
        set: &MigrationSet,
    ) -> Result<AppliedVersion, MigrationError> {
        conn.execute_unprepared(MARKER_TABLE_DDL).await?;

        let applied = applied_versions(conn).await?;
        check_known_versions(set, &applied)?;

        let mut last_applied = applied.iter().next_back().copied();
        let mut newly_applied = Vec::new();

        for migration in set.migrations() {
            if applied.contains(&migration.version) {
                debug!(version = migration.version, name = migration.name, "Already applied, skipping");
                continue;
            }

            let start = Instant::now();
            if let Err(cause) = apply_step(conn, migration).await {
                warn!(
                    version = migration.version,
                    name = migration.name,
                    error = %cause,
                    "Migration step failed"
                );
                crate::metrics::record_migration(set.name(), false);
                return Err(MigrationError::StepFailed {
                    version: migration.version,
                    name: migration.name,
                    last_applied,
                    cause,
                });
            }

            info!(
                version = migration.version,
                name = migration.name,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Migration applied"
            );
            crate::metrics::record_migration(set.name(), true);
            last_applied = Some(migration.version);
            newly_applied.push(migration.version);
        }

        Ok(AppliedVersion {
            version: last_applied,
            newly_applied,
        })
    }

    /// Migrations of `set` not yet applied. Read-only: a database without
    /// the marker table reports every step as pending.
    pub async fn pending<'a>(
        &self,
        conn: &DatabaseConnection,
        set: &'a MigrationSet,
    ) -> Result<Vec<&'a Migration>, MigrationError> {
        let applied = if marker_table_exists(conn).await? {
            applied_versions(conn).await?
        } else {
            BTreeSet::new()
        };
        check_known_versions(set, &applied)?;

        Ok(set
            .migrations()
            .iter()
            .filter(|m| !applied.contains(&m.version))
            .collect())
    }

    /// Highest applied version, if any
    pub async fn current_version(&self, conn: &DatabaseConnection) -> Result<Option<i64>, MigrationError> {
        if !marker_table_exists(conn).await? {
            return Ok(None);
        }
        Ok(applied_versions(conn).await?.iter().next_back().copied())
    }
}

/// Run one migration and record it, inside a single transaction
async fn apply_step(conn: &DatabaseConnection, migration: &Migration) -> Result<(), DbErr> {
    let txn = conn.begin().await?;

    for statement in migration.statements {
        txn.execute_unprepared(statement).await?;
    }

    SchemaMigrationActiveModel {
        version: Set(migration.version),
        name: Set(migration.name.to_string()),
        applied_at: Set(chrono::Utc::now().into()),
    }
    .insert(&txn)
    .await?;

    txn.commit().await
}

async fn applied_versions(conn: &DatabaseConnection) -> Result<BTreeSet<i64>, DbErr> {
    let rows = SchemaMigrationEntity::find()
        .order_by_asc(SchemaMigrationColumn::Version)
        .all(conn)
        .await?;
    Ok(rows.into_iter().map(|m| m.version).collect())
}

fn check_known_versions(set: &MigrationSet, applied: &BTreeSet<i64>) -> Result<(), MigrationError> {
    match applied.iter().find(|v| !set.contains(**v)) {
        Some(found) => Err(MigrationError::UnknownVersion {
            found: *found,
            latest: set.latest_version().unwrap_or(0),
        }),
        None => Ok(()),
    }
}

async fn marker_table_exists(conn: &DatabaseConnection) -> Result<bool, DbErr> {
    let backend = conn.get_database_backend();
    let sql = match backend {
        DbBackend::Postgres => {
            "SELECT 1 FROM information_schema.tables \
             WHERE table_schema = current_schema() AND table_name = 'schema_migrations'"
        }
        DbBackend::Sqlite => {
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'schema_migrations'"
        }
        DbBackend::MySql => {
            "SELECT 1 FROM information_schema.tables \
             WHERE table_schema = DATABASE() AND table_name = 'schema_migrations'"
        }
    };
    let row = conn
        .query_one(Statement::from_string(backend, sql.to_string()))
        .await?;
    Ok(row.is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::memory_db;

    fn failing_set() -> MigrationSet {
        MigrationSet::new(
            "failing",
            vec![
                Migration {
                    version: 1,
                    name: "widgets",
                    statements: &["CREATE TABLE widgets (id BIGINT PRIMARY KEY)"],
                },
                Migration {
                    version: 2,
                    name: "broken",
                    statements: &[
                        "CREATE TABLE gadgets (id BIGINT PRIMARY KEY)",
                        "CREATE TABLE nonsense (",
                    ],
                },
                Migration {
                    version: 3,
                    name: "never_reached",
                    statements: &["CREATE TABLE gizmos (id BIGINT PRIMARY KEY)"],
                },
            ],
        )
    }

    #[tokio::test]
    async fn test_apply_tenant_set_from_scratch() {
        let conn = memory_db().await;
        let set = tenant_migrations();

        let result = SchemaProvisioner::new().apply(&conn, &set).await.unwrap();

        assert_eq!(result.version, set.latest_version());
        assert_eq!(result.newly_applied, vec![1, 2]);
        assert_eq!(SchemaProvisioner::new().current_version(&conn).await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_reapply_is_a_no_op() {
        let conn = memory_db().await;
        let set = registry_migrations();
        let provisioner = SchemaProvisioner::new();

        let first = provisioner.apply(&conn, &set).await.unwrap();
        let second = provisioner.apply(&conn, &set).await.unwrap();

        assert_eq!(first.version, second.version);
        assert!(second.is_unchanged());
        assert!(provisioner.pending(&conn, &set).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failing_step_rolls_back_and_reports_last_applied() {
        let conn = memory_db().await;
        let provisioner = SchemaProvisioner::new();

        let err = provisioner.apply(&conn, &failing_set()).await.unwrap_err();

        match err {
            MigrationError::StepFailed { version, name, last_applied, .. } => {
                assert_eq!(version, 2);
                assert_eq!(name, "broken");
                assert_eq!(last_applied, Some(1));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(provisioner.current_version(&conn).await.unwrap(), Some(1));

        // The partial step left nothing behind
        let gadgets = conn
            .query_one(Statement::from_string(
                DbBackend::Sqlite,
                "SELECT 1 FROM sqlite_master WHERE name = 'gadgets'".to_string(),
            ))
            .await
            .unwrap();
        assert!(gadgets.is_none());
    }

    #[tokio::test]
    async fn test_pending_is_read_only() {
        let conn = memory_db().await;
        let set = tenant_migrations();
        let provisioner = SchemaProvisioner::new();

        let pending = provisioner.pending(&conn, &set).await.unwrap();
        assert_eq!(pending.iter().map(|m| m.version).collect::<Vec<_>>(), vec![1, 2]);

        assert!(!marker_table_exists(&conn).await.unwrap());
        assert_eq!(provisioner.current_version(&conn).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unknown_applied_version_is_rejected() {
        let conn = memory_db().await;
        let provisioner = SchemaProvisioner::new();
        provisioner.apply(&conn, &tenant_migrations()).await.unwrap();

        let older = MigrationSet::new("tenant", tenant_migrations().migrations()[..1].to_vec());
        let err = provisioner.apply(&conn, &older).await.unwrap_err();

        assert!(matches!(err, MigrationError::UnknownVersion { found: 2, latest: 1 }));
    }

    #[test]
    #[should_panic(expected = "strictly increasing")]
    fn test_out_of_order_set_is_rejected() {
        MigrationSet::new(
            "bad",
            vec![
                Migration { version: 2, name: "b", statements: &[] },
                Migration { version: 1, name: "a", statements: &[] },
            ],
        );
    }
}
