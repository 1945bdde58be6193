//! Nizam Common Library
//!
//! Shared code for the Nizam multi-tenant services including:
//! - Tenant registry models and store
//! - Schema provisioning for the registry and tenant databases
//! - Tenant provisioning workflow with compensation
//! - Per-tenant connection routing
//! - Sequential SKU allocation
//! - Error types, configuration, password hashing, and metrics

pub mod auth;
pub mod config;
pub mod db;
pub mod errors;
pub mod metrics;
pub mod provisioning;
pub mod router;
pub mod schema;
pub mod sku;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use config::AppConfig;
pub use db::{PostgresEngine, Registry};
pub use errors::{AppError, Result};
pub use provisioning::TenantProvisioner;
pub use router::ConnectionRouter;
pub use schema::SchemaProvisioner;
pub use sku::SkuAllocator;

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
