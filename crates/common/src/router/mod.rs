//! Connection router
//!
//! Resolves a tenant id to a live handle on that tenant's database. Handles
//! are opened lazily, cached, and reused for every later request.
//!
//! Concurrent misses for the same tenant share one initialization: the first
//! caller installs a `Pending` slot holding a shared future, and everyone
//! arriving before it settles awaits that same future. The initialization
//! itself runs in a spawned task, so a caller giving up does not cancel it
//! for the others. A failed attempt removes its slot and the next caller
//! starts over.

mod connection;

pub use connection::{TenantConnection, TenantHandle};

use crate::config::AppConfig;
use crate::db::{TenantConnector, TenantDirectory};
use crate::errors::RouterError;
use crate::metrics;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

type InitFuture = Shared<BoxFuture<'static, Result<TenantHandle, RouterError>>>;

enum Slot {
    Ready(TenantHandle),
    Pending { attempt: u64, init: InitFuture },
}

struct RouterInner {
    directory: Arc<dyn TenantDirectory>,
    connector: Arc<dyn TenantConnector>,
    resolve_timeout: Duration,
    epoch: Instant,
    slots: Mutex<HashMap<Uuid, Slot>>,
    closed: AtomicBool,
    attempts: AtomicU64,
}

/// Per-tenant connection cache with single-flight initialization
#[derive(Clone)]
pub struct ConnectionRouter {
    inner: Arc<RouterInner>,
}

impl ConnectionRouter {
    /// Create a router from the shared configuration.
    ///
    /// When `router.idle_evict_secs` is set, this also starts the idle
    /// sweeper, so it must be called from within a Tokio runtime.
    pub fn new(
        config: &AppConfig,
        directory: Arc<dyn TenantDirectory>,
        connector: Arc<dyn TenantConnector>,
    ) -> Self {
        let router = Self::with_timeout(directory, connector, config.resolve_timeout());

        if let Some(max_idle) = config.idle_evict() {
            info!(
                max_idle_secs = max_idle.as_secs(),
                sweep_interval_secs = config.sweep_interval().as_secs(),
                "Idle handle eviction enabled"
            );
            router.spawn_idle_sweeper(config.sweep_interval(), max_idle);
        }
        router
    }

    /// Create a router with an explicit initialization timeout
    pub fn with_timeout(
        directory: Arc<dyn TenantDirectory>,
        connector: Arc<dyn TenantConnector>,
        resolve_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                directory,
                connector,
                resolve_timeout,
                epoch: Instant::now(),
                slots: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
                attempts: AtomicU64::new(0),
            }),
        }
    }

    /// Return the handle for `tenant_id`, opening it on first use.
    ///
    /// Only `active` tenants resolve; unknown and `pending` ones are
    /// `TenantNotFound`. Failures are not retried here.
    #[instrument(skip(self))]
    pub async fn resolve(&self, tenant_id: Uuid) -> Result<TenantHandle, RouterError> {
        let init = {
            let mut slots = self.inner.slots.lock().await;

            if self.inner.closed.load(Ordering::SeqCst) {
                return Err(RouterError::ShutDown);
            }

            match slots.get(&tenant_id) {
                Some(Slot::Ready(handle)) => {
                    metrics::record_router_cache(true);
                    handle.touch();
                    return Ok(handle.clone());
                }
                Some(Slot::Pending { init, .. }) => {
                    metrics::record_router_cache(false);
                    debug!("Joining in-flight initialization");
                    init.clone()
                }
                None => {
                    metrics::record_router_cache(false);
                    let attempt = self.inner.attempts.fetch_add(1, Ordering::Relaxed);
                    let init = self.start_init(tenant_id, attempt);
                    slots.insert(tenant_id, Slot::Pending { attempt, init: init.clone() });
                    init
                }
            }
        };

        let handle = init.await?;
        handle.touch();
        Ok(handle)
    }

    fn start_init(&self, tenant_id: Uuid, attempt: u64) -> InitFuture {
        let inner = self.inner.clone();
        let task = tokio::spawn(async move { inner.initialize(tenant_id, attempt).await });

        async move {
            match task.await {
                Ok(result) => result,
                Err(e) => Err(RouterError::InitFailed {
                    tenant_id,
                    message: format!("initialization task aborted: {}", e),
                }),
            }
        }
        .boxed()
        .shared()
    }

    /// Close and remove one cached handle. In-flight initializations are
    /// left alone.
    pub async fn evict(&self, tenant_id: Uuid) -> bool {
        let removed = {
            let mut slots = self.inner.slots.lock().await;
            match slots.get(&tenant_id) {
                Some(Slot::Ready(_)) => slots.remove(&tenant_id),
                _ => None,
            }
        };

        match removed {
            Some(Slot::Ready(handle)) => {
                close_handle(&handle).await;
                metrics::record_router_evictions("explicit", 1);
                self.publish_size().await;
                true
            }
            _ => false,
        }
    }

    /// Close and remove every handle unused for at least `max_idle`.
    ///
    /// A handle still held by a caller is never idle, however long ago it
    /// was resolved.
    pub async fn evict_idle(&self, max_idle: Duration) -> usize {
        let idle: Vec<TenantHandle> = {
            let mut slots = self.inner.slots.lock().await;
            let ids: Vec<Uuid> = slots
                .iter()
                .filter_map(|(id, slot)| match slot {
                    Slot::Ready(handle) if !handle_in_use(handle) && handle.idle_for() >= max_idle => {
                        Some(*id)
                    }
                    _ => None,
                })
                .collect();

            ids.iter()
                .filter_map(|id| match slots.remove(id) {
                    Some(Slot::Ready(handle)) => Some(handle),
                    _ => None,
                })
                .collect()
        };

        for handle in &idle {
            debug!(tenant_id = %handle.tenant_id(), idle_ms = handle.idle_for().as_millis() as u64, "Evicting idle handle");
            close_handle(handle).await;
        }

        if !idle.is_empty() {
            metrics::record_router_evictions("idle", idle.len());
            self.publish_size().await;
        }
        idle.len()
    }

    /// Run `evict_idle` every `interval` until the router shuts down
    pub fn spawn_idle_sweeper(&self, interval: Duration, max_idle: Duration) -> JoinHandle<()> {
        let router = self.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                if router.is_shut_down() {
                    break;
                }
                let evicted = router.evict_idle(max_idle).await;
                if evicted > 0 {
                    info!(evicted, "Idle tenant handles closed");
                }
            }
        })
    }

    /// Close every cached handle and refuse further resolves.
    ///
    /// Returns the number of handles closed; calling it again closes nothing.
    pub async fn shutdown(&self) -> usize {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return 0;
        }

        let drained: Vec<Slot> = {
            let mut slots = self.inner.slots.lock().await;
            slots.drain().map(|(_, slot)| slot).collect()
        };

        let mut closed = 0;
        for slot in drained {
            // Pending initializations close their own connection on settle
            if let Slot::Ready(handle) = slot {
                close_handle(&handle).await;
                closed += 1;
            }
        }

        metrics::set_router_cached(0);
        info!(closed, "Connection router shut down");
        closed
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Tenants with a ready handle
    pub async fn cached_tenants(&self) -> Vec<Uuid> {
        let slots = self.inner.slots.lock().await;
        slots
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Ready(_)))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Number of ready handles
    pub async fn len(&self) -> usize {
        let slots = self.inner.slots.lock().await;
        slots.values().filter(|slot| matches!(slot, Slot::Ready(_))).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn publish_size(&self) {
        metrics::set_router_cached(self.len().await);
    }
}

impl RouterInner {
    async fn initialize(&self, tenant_id: Uuid, attempt: u64) -> Result<TenantHandle, RouterError> {
        let start = Instant::now();

        let result = match tokio::time::timeout(self.resolve_timeout, self.open(tenant_id)).await {
            Ok(result) => result,
            Err(_) => Err(RouterError::Timeout {
                tenant_id,
                timeout_ms: self.resolve_timeout.as_millis() as u64,
            }),
        };

        metrics::record_router_init(start.elapsed().as_secs_f64(), result.is_ok());
        if let Err(ref e) = result {
            warn!(tenant_id = %tenant_id, error = %e, "Tenant handle initialization failed");
        }

        self.settle(tenant_id, attempt, result).await
    }

    async fn open(&self, tenant_id: Uuid) -> Result<TenantHandle, RouterError> {
        let tenant = self
            .directory
            .find_tenant(tenant_id)
            .await
            .map_err(|e| RouterError::Registry { message: e.to_string() })?
            .ok_or(RouterError::TenantNotFound { tenant_id })?;

        if !tenant.is_active() {
            debug!(tenant_id = %tenant_id, status = %tenant.status, "Tenant not active");
            return Err(RouterError::TenantNotFound { tenant_id });
        }

        let conn = self
            .connector
            .connect(&tenant.database_name)
            .await
            .map_err(|e| RouterError::InitFailed {
                tenant_id,
                message: e.to_string(),
            })?;

        if let Err(e) = conn.ping().await {
            let _ = conn.close().await;
            return Err(RouterError::InitFailed {
                tenant_id,
                message: e.to_string(),
            });
        }

        info!(tenant_id = %tenant_id, database = %tenant.database_name, "Tenant handle opened");
        Ok(Arc::new(TenantConnection::new(
            tenant_id,
            tenant.database_name,
            conn,
            self.epoch,
        )))
    }

    /// Replace this attempt's pending slot with the outcome
    async fn settle(
        &self,
        tenant_id: Uuid,
        attempt: u64,
        result: Result<TenantHandle, RouterError>,
    ) -> Result<TenantHandle, RouterError> {
        let mut slots = self.slots.lock().await;

        let current = matches!(
            slots.get(&tenant_id),
            Some(Slot::Pending { attempt: a, .. }) if *a == attempt
        );

        match result {
            Ok(handle) => {
                if self.closed.load(Ordering::SeqCst) {
                    drop(slots);
                    close_handle(&handle).await;
                    return Err(RouterError::ShutDown);
                }
                if current {
                    slots.insert(tenant_id, Slot::Ready(handle.clone()));
                    metrics::set_router_cached(
                        slots.values().filter(|s| matches!(s, Slot::Ready(_))).count(),
                    );
                }
                Ok(handle)
            }
            Err(e) => {
                if current {
                    slots.remove(&tenant_id);
                }
                Err(e)
            }
        }
    }
}

/// The cache owns one reference; any other belongs to a caller. Checked
/// under the slot lock, so no resolve can clone it concurrently.
fn handle_in_use(handle: &TenantHandle) -> bool {
    Arc::strong_count(handle) > 1
}

async fn close_handle(handle: &TenantConnection) {
    if let Err(e) = handle.close().await {
        warn!(
            tenant_id = %handle.tenant_id(),
            database = %handle.database_name(),
            error = %e,
            "Failed to close tenant handle"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{DatabaseAdmin, Registry};
    use crate::provisioning::TenantProvisioner;
    use crate::schema::{tenant_migrations, SchemaProvisioner};
    use crate::testing::{registry_store, FakeEngine};

    struct Fixture {
        registry: Registry,
        engine: Arc<FakeEngine>,
        router: ConnectionRouter,
    }

    async fn fixture(resolve_timeout: Duration) -> Fixture {
        let registry = registry_store().await;
        let engine = Arc::new(FakeEngine::new());
        let router = ConnectionRouter::with_timeout(
            Arc::new(registry.clone()),
            engine.clone(),
            resolve_timeout,
        );
        Fixture { registry, engine, router }
    }

    async fn active_tenant(f: &Fixture, slug: &str) -> Uuid {
        let database = format!("tenant_{}", slug);
        let tenant = f.registry.insert_pending_tenant(slug, slug, &database).await.unwrap();
        f.engine.create_database(&database).await.unwrap();
        f.registry.mark_tenant_active(tenant.id).await.unwrap();
        tenant.id
    }

    #[tokio::test]
    async fn test_concurrent_resolves_share_one_initialization() {
        let f = fixture(Duration::from_secs(5)).await;
        let id = active_tenant(&f, "acme").await;
        f.engine.set_connect_delay(Duration::from_millis(100));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let router = f.router.clone();
                tokio::spawn(async move { router.resolve(id).await })
            })
            .collect();

        let handles: Vec<TenantHandle> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap())
            .collect();

        assert_eq!(f.engine.connect_count(), 1);
        assert!(handles.iter().all(|h| Arc::ptr_eq(h, &handles[0])));
        assert_eq!(handles[0].database_name(), "tenant_acme");

        // Later resolves hit the cache
        let again = f.router.resolve(id).await.unwrap();
        assert!(Arc::ptr_eq(&again, &handles[0]));
        assert_eq!(f.engine.connect_count(), 1);
        assert_eq!(f.router.cached_tenants().await, vec![id]);
    }

    #[tokio::test]
    async fn test_unknown_tenant_is_not_found_and_not_cached() {
        let f = fixture(Duration::from_secs(5)).await;
        let id = Uuid::new_v4();

        let err = f.router.resolve(id).await.unwrap_err();

        assert!(matches!(err, RouterError::TenantNotFound { tenant_id } if tenant_id == id));
        assert!(f.router.is_empty().await);
        assert_eq!(f.engine.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_pending_tenant_is_not_served() {
        let f = fixture(Duration::from_secs(5)).await;
        let tenant = f
            .registry
            .insert_pending_tenant("Halfway", "halfway", "tenant_halfway")
            .await
            .unwrap();

        let err = f.router.resolve(tenant.id).await.unwrap_err();

        assert!(matches!(err, RouterError::TenantNotFound { .. }));
    }

    #[tokio::test]
    async fn test_timeout_does_not_poison_the_slot() {
        let f = fixture(Duration::from_millis(100)).await;
        let id = active_tenant(&f, "slowpoke").await;
        f.engine.set_connect_delay(Duration::from_secs(30));

        let (first, second) = tokio::join!(f.router.resolve(id), f.router.resolve(id));
        assert!(matches!(first, Err(RouterError::Timeout { timeout_ms: 100, .. })));
        assert!(matches!(second, Err(RouterError::Timeout { .. })));
        assert_eq!(f.engine.connect_count(), 1);
        assert!(f.router.is_empty().await);

        f.engine.set_connect_delay(Duration::ZERO);
        let handle = f.router.resolve(id).await.unwrap();
        assert_eq!(handle.tenant_id(), id);
        assert_eq!(f.engine.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_connect_failure_is_retried_by_next_caller() {
        let f = fixture(Duration::from_secs(5)).await;
        let id = active_tenant(&f, "flaky").await;
        f.engine.fail_connect(true);

        let err = f.router.resolve(id).await.unwrap_err();
        assert!(matches!(err, RouterError::InitFailed { .. }));

        f.engine.fail_connect(false);
        assert!(f.router.resolve(id).await.is_ok());
        assert_eq!(f.router.len().await, 1);
    }

    #[tokio::test]
    async fn test_shutdown_closes_each_handle_once() {
        let f = fixture(Duration::from_secs(5)).await;
        let a = active_tenant(&f, "alpha").await;
        let b = active_tenant(&f, "beta").await;

        let handle_a = f.router.resolve(a).await.unwrap();
        let handle_b = f.router.resolve(b).await.unwrap();

        assert_eq!(f.router.shutdown().await, 2);
        assert!(handle_a.is_closed());
        assert!(handle_b.is_closed());
        assert!(f.router.is_empty().await);

        assert!(matches!(f.router.resolve(a).await, Err(RouterError::ShutDown)));
        assert_eq!(f.router.shutdown().await, 0);
    }

    #[tokio::test]
    async fn test_initialization_finishing_after_shutdown_is_closed() {
        let f = fixture(Duration::from_secs(5)).await;
        let id = active_tenant(&f, "latecomer").await;
        f.engine.set_connect_delay(Duration::from_millis(200));

        let router = f.router.clone();
        let pending = tokio::spawn(async move { router.resolve(id).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(f.router.shutdown().await, 0);
        let result = pending.await.unwrap();

        assert!(matches!(result, Err(RouterError::ShutDown)));
        assert!(f.router.is_empty().await);
    }

    #[tokio::test]
    async fn test_evict_opens_a_fresh_handle_next_time() {
        let f = fixture(Duration::from_secs(5)).await;
        let id = active_tenant(&f, "evicted").await;

        let first = f.router.resolve(id).await.unwrap();
        assert!(f.router.evict(id).await);
        assert!(first.is_closed());
        assert!(!f.router.evict(id).await);

        let second = f.router.resolve(id).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(f.engine.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_evict_idle_only_removes_stale_handles() {
        let f = fixture(Duration::from_secs(5)).await;
        let stale = active_tenant(&f, "stale").await;
        let fresh = active_tenant(&f, "fresh").await;

        f.router.resolve(stale).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        f.router.resolve(fresh).await.unwrap();

        assert_eq!(f.router.evict_idle(Duration::from_millis(100)).await, 1);
        assert_eq!(f.router.cached_tenants().await, vec![fresh]);
        assert_eq!(f.router.evict_idle(Duration::from_secs(60)).await, 0);
    }

    #[tokio::test]
    async fn test_evict_idle_keeps_handles_still_held() {
        let f = fixture(Duration::from_secs(5)).await;
        let id = active_tenant(&f, "busy").await;

        let held = f.router.resolve(id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(f.router.evict_idle(Duration::from_millis(100)).await, 0);
        assert!(!held.is_closed());
        assert!(held.connection().ping().await.is_ok());
        assert_eq!(f.router.cached_tenants().await, vec![id]);

        // Once released it is fair game
        drop(held);
        assert_eq!(f.router.evict_idle(Duration::from_millis(100)).await, 1);
        assert!(f.router.is_empty().await);
    }

    #[tokio::test]
    async fn test_configured_router_sweeps_idle_handles() {
        let registry = registry_store().await;
        let engine = Arc::new(FakeEngine::new());
        let mut config = AppConfig::default();
        config.router.idle_evict_secs = 1;
        config.router.sweep_interval_secs = 1;

        let router = ConnectionRouter::new(&config, Arc::new(registry.clone()), engine.clone());
        let f = Fixture { registry, engine, router };
        let id = active_tenant(&f, "dormant").await;

        f.router.resolve(id).await.unwrap();
        assert_eq!(f.router.len().await, 1);

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(f.router.is_empty().await);
        f.router.shutdown().await;
    }

    #[tokio::test]
    async fn test_default_config_keeps_handles_until_shutdown() {
        let registry = registry_store().await;
        let engine = Arc::new(FakeEngine::new());
        let router = ConnectionRouter::new(&AppConfig::default(), Arc::new(registry.clone()), engine.clone());
        let f = Fixture { registry, engine, router };
        let id = active_tenant(&f, "resident").await;

        f.router.resolve(id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(f.router.len().await, 1);
        assert_eq!(f.router.shutdown().await, 1);
    }

    #[tokio::test]
    async fn test_idle_sweeper_stops_after_shutdown() {
        let f = fixture(Duration::from_secs(5)).await;
        let id = active_tenant(&f, "swept").await;
        f.router.resolve(id).await.unwrap();

        let sweeper = f.router.spawn_idle_sweeper(Duration::from_millis(20), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(f.router.is_empty().await);

        f.router.shutdown().await;
        tokio::time::timeout(Duration::from_secs(1), sweeper)
            .await
            .expect("sweeper exits")
            .unwrap();
    }

    #[tokio::test]
    async fn test_provision_resolve_and_remigrate_round_trip() {
        let f = fixture(Duration::from_secs(5)).await;
        let provisioner = TenantProvisioner::new(
            &AppConfig::default(),
            f.registry.clone(),
            f.engine.clone(),
            f.engine.clone(),
        );

        let tenant = provisioner.provision("Round Trip Ltd").await.unwrap();
        let handle = f.router.resolve(tenant.id).await.unwrap();

        let schema = SchemaProvisioner::new();
        let rerun = schema.apply(handle.connection(), &tenant_migrations()).await.unwrap();

        assert!(rerun.is_unchanged());
        assert_eq!(rerun.version, tenant_migrations().latest_version());
        assert_eq!(
            schema.current_version(handle.connection()).await.unwrap(),
            tenant_migrations().latest_version()
        );
    }
}
