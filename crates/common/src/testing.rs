//! Test fixtures backed by SQLite
//!
//! `FakeEngine` plays the database server: each "database" is a SQLite file
//! in a temporary directory, so provisioning and routing run against real
//! SeaORM connections without a Postgres instance.

use crate::db::{DatabaseAdmin, Registry, TenantConnector};
use crate::schema::{registry_migrations, tenant_migrations, SchemaProvisioner};
use async_trait::async_trait;
use sea_orm::{ConnectOptions, Database, DatabaseConnection, DbErr, RuntimeErr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;

/// Single-connection in-memory database
pub async fn memory_db() -> DatabaseConnection {
    let mut opts = ConnectOptions::new("sqlite::memory:");
    opts.max_connections(1).min_connections(1).sqlx_logging(false);
    Database::connect(opts).await.expect("in-memory sqlite")
}

/// Registry store with its schema applied
pub async fn registry_store() -> Registry {
    let conn = memory_db().await;
    SchemaProvisioner::new()
        .apply(&conn, &registry_migrations())
        .await
        .expect("registry schema");
    Registry::new(conn)
}

/// Tenant database with its schema applied
pub async fn tenant_db() -> DatabaseConnection {
    let conn = memory_db().await;
    SchemaProvisioner::new()
        .apply(&conn, &tenant_migrations())
        .await
        .expect("tenant schema");
    conn
}

/// File-backed tenant database whose pool holds `connections` connections,
/// so transactions really run side by side
pub async fn pooled_tenant_db(dir: &TempDir, connections: u32) -> DatabaseConnection {
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("tenant.db").display());
    let mut opts = ConnectOptions::new(url);
    opts.max_connections(connections)
        .min_connections(connections)
        .sqlx_logging(false);

    let conn = Database::connect(opts).await.expect("file sqlite");
    SchemaProvisioner::new()
        .apply(&conn, &tenant_migrations())
        .await
        .expect("tenant schema");
    conn
}

fn injected(what: &str) -> DbErr {
    DbErr::Conn(RuntimeErr::Internal(format!("injected {} failure", what)))
}

/// Database server stand-in with failure and latency injection
pub struct FakeEngine {
    dir: TempDir,
    connects: AtomicUsize,
    connect_delay_ms: AtomicU64,
    fail_create: AtomicBool,
    fail_drop: AtomicBool,
    fail_connect: AtomicBool,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("temp dir"),
            connects: AtomicUsize::new(0),
            connect_delay_ms: AtomicU64::new(0),
            fail_create: AtomicBool::new(false),
            fail_drop: AtomicBool::new(false),
            fail_connect: AtomicBool::new(false),
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(format!("{}.db", name))
    }

    /// Number of `connect` calls so far
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.connect_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn fail_drop(&self, fail: bool) {
        self.fail_drop.store(fail, Ordering::SeqCst);
    }

    pub fn fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Whether the database file exists
    pub fn exists(&self, name: &str) -> bool {
        self.path(name).exists()
    }
}

#[async_trait]
impl DatabaseAdmin for FakeEngine {
    async fn create_database(&self, name: &str) -> Result<(), DbErr> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(injected("create"));
        }
        // An empty file is a valid, empty SQLite database
        std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.path(name))
            .map(|_| ())
            .map_err(|e| DbErr::Custom(format!("database {} already exists: {}", name, e)))
    }

    async fn drop_database(&self, name: &str) -> Result<(), DbErr> {
        if self.fail_drop.load(Ordering::SeqCst) {
            return Err(injected("drop"));
        }
        let base = self.path(name);
        for suffix in ["", "-wal", "-shm"] {
            let path = PathBuf::from(format!("{}{}", base.display(), suffix));
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(DbErr::Custom(e.to_string())),
            }
        }
        Ok(())
    }

    async fn database_exists(&self, name: &str) -> Result<bool, DbErr> {
        Ok(self.exists(name))
    }
}

#[async_trait]
impl TenantConnector for FakeEngine {
    async fn connect(&self, database_name: &str) -> Result<DatabaseConnection, DbErr> {
        self.connects.fetch_add(1, Ordering::SeqCst);

        let delay = self.connect_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(injected("connect"));
        }

        let path = self.path(database_name);
        if !path.exists() {
            return Err(DbErr::Conn(RuntimeErr::Internal(format!(
                "database {} does not exist",
                database_name
            ))));
        }

        let mut opts = ConnectOptions::new(format!("sqlite://{}?mode=rw", path.display()));
        opts.max_connections(1).sqlx_logging(false);
        Database::connect(opts).await
    }
}
