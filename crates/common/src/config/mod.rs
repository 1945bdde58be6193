//! Configuration management for Nizam services
//!
//! Supports loading configuration from:
//! - Environment variables (prefixed with APP__)
//! - Configuration files (config.toml, config.yaml)
//! - Default values
//!
//! The loaded [`AppConfig`] is built once at startup and handed to the
//! engine, router, and provisioner constructors.

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    /// Shared database server parameters
    pub database: DatabaseConfig,

    /// Connection router configuration
    #[serde(default)]
    pub router: RouterConfig,

    /// Tenant provisioning configuration
    #[serde(default)]
    pub provisioning: ProvisioningConfig,

    /// SKU allocator configuration
    #[serde(default)]
    pub allocator: AllocatorConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Process-wide database server parameters.
///
/// Host and credentials are shared by the registry and every tenant
/// database; only the database name differs per connection.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Database server host
    #[serde(default = "default_db_host")]
    pub host: String,

    /// Database server port
    #[serde(default = "default_db_port")]
    pub port: u16,

    /// Login role
    pub username: String,

    /// Login password
    #[serde(default)]
    pub password: Option<String>,

    /// Name of the shared registry database
    #[serde(default = "default_registry_database")]
    pub registry_database: String,

    /// Maximum number of registry connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of registry connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Maximum connections in each tenant pool
    #[serde(default = "default_tenant_max_connections")]
    pub tenant_max_connections: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Idle timeout in seconds for pooled connections
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouterConfig {
    /// Upper bound on a single tenant handle initialization
    #[serde(default = "default_resolve_timeout")]
    pub resolve_timeout_secs: u64,

    /// Close handles unused for this long (0 keeps them until shutdown)
    #[serde(default)]
    pub idle_evict_secs: u64,

    /// How often the idle sweeper runs
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProvisioningConfig {
    /// Upper bound on each provisioning step (database creation, schema, ...)
    #[serde(default = "default_step_timeout")]
    pub step_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AllocatorConfig {
    /// Attempts before a conflicting SKU insert gives up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level (debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_json_logging")]
    pub json_logging: bool,

    /// Service name for tracing
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

// Default value functions
fn default_db_host() -> String { "localhost".to_string() }
fn default_db_port() -> u16 { 5432 }
fn default_registry_database() -> String { "nizam_main".to_string() }
fn default_max_connections() -> u32 { 20 }
fn default_min_connections() -> u32 { 2 }
fn default_tenant_max_connections() -> u32 { 5 }
fn default_connect_timeout() -> u64 { 10 }
fn default_idle_timeout() -> u64 { 300 }
fn default_resolve_timeout() -> u64 { 10 }
fn default_sweep_interval() -> u64 { 60 }
fn default_step_timeout() -> u64 { 60 }
fn default_max_attempts() -> u32 { 5 }
fn default_log_level() -> String { "info".to_string() }
fn default_json_logging() -> bool { true }
fn default_service_name() -> String { "nizam".to_string() }

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            resolve_timeout_secs: default_resolve_timeout(),
            idle_evict_secs: 0,
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self { step_timeout_secs: default_step_timeout() }
    }
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self { max_attempts: default_max_attempts() }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logging: default_json_logging(),
            service_name: default_service_name(),
        }
    }
}

impl DatabaseConfig {
    /// Pool acquire timeout
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Lifetime of an unused pooled connection
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl AppConfig {
    /// Load configuration from environment and files
    pub fn load() -> Result<Self, ConfigError> {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            // Load base config file
            .add_source(File::with_name("config/default").required(false))

            // Load environment-specific config
            .add_source(File::with_name(&format!("config/{}", env)).required(false))

            // Load local overrides
            .add_source(File::with_name("config/local").required(false))

            // Load from environment variables with APP__ prefix
            // e.g., APP__DATABASE__HOST=db.internal
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true)
            )

            .build()?;

        config.try_deserialize()
    }

    /// Load from a specific TOML file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true)
            )
            .build()?;

        config.try_deserialize()
    }

    /// Get tenant handle initialization timeout as Duration
    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_secs(self.router.resolve_timeout_secs)
    }

    /// Get provisioning step timeout as Duration
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.provisioning.step_timeout_secs)
    }

    /// Idle eviction threshold, if eviction is enabled
    pub fn idle_evict(&self) -> Option<Duration> {
        match self.router.idle_evict_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Get idle sweeper interval as Duration
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.router.sweep_interval_secs.max(1))
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                host: default_db_host(),
                port: default_db_port(),
                username: "postgres".to_string(),
                password: None,
                registry_database: default_registry_database(),
                max_connections: default_max_connections(),
                min_connections: default_min_connections(),
                tenant_max_connections: default_tenant_max_connections(),
                connect_timeout_secs: default_connect_timeout(),
                idle_timeout_secs: default_idle_timeout(),
            },
            router: RouterConfig::default(),
            provisioning: ProvisioningConfig::default(),
            allocator: AllocatorConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}
