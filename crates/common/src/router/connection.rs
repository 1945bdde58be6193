//! Cached tenant connection handle

use sea_orm::{DatabaseConnection, DbErr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Shared handle returned by the router
pub type TenantHandle = Arc<TenantConnection>;

/// A live connection to one tenant's database.
///
/// Owned by the router's cache. Callers use it for the duration of one
/// logical request and drop it; the router decides when it is closed.
#[derive(Debug)]
pub struct TenantConnection {
    tenant_id: Uuid,
    database_name: String,
    conn: DatabaseConnection,
    epoch: Instant,
    /// Milliseconds since `epoch` at the last resolve
    last_used: AtomicU64,
    closed: AtomicBool,
}

impl TenantConnection {
    pub(crate) fn new(tenant_id: Uuid, database_name: String, conn: DatabaseConnection, epoch: Instant) -> Self {
        let handle = Self {
            tenant_id,
            database_name,
            conn,
            epoch,
            last_used: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        };
        handle.touch();
        handle
    }

    pub fn tenant_id(&self) -> Uuid {
        self.tenant_id
    }

    pub fn database_name(&self) -> &str {
        &self.database_name
    }

    /// The pooled connection to run queries on
    pub fn connection(&self) -> &DatabaseConnection {
        &self.conn
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn touch(&self) {
        self.last_used
            .store(self.epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    /// Time since the handle was last resolved
    pub fn idle_for(&self) -> Duration {
        let now = self.epoch.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.last_used.load(Ordering::Relaxed)))
    }

    /// Close the underlying pool. Only the first call does anything.
    pub(crate) async fn close(&self) -> Result<(), DbErr> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // Clones share the pool, so this closes it for every holder
        self.conn.clone().close().await
    }
}
