//! Nizam migration runner
//!
//! Brings the registry database and tenant databases up to the latest
//! schema. By default it migrates the registry and then every registered
//! tenant, stopping at the first tenant that fails.

use anyhow::{anyhow, Context};
use clap::Parser;
use nizam_common::{
    config::{AppConfig, ObservabilityConfig},
    db::{connect_registry, PostgresEngine, Registry, TenantConnector},
    metrics::register_metrics,
    schema::{registry_migrations, tenant_migrations, MigrationSet, SchemaProvisioner},
};
use sea_orm::DatabaseConnection;
use std::future::Future;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Migration runner arguments
#[derive(Debug, Parser)]
#[command(name = "migrate", version, about = "Apply registry and tenant schema migrations.")]
struct Cli {
    /// Only migrate the registry database
    #[arg(long, conflicts_with_all = ["skip_registry", "tenant", "tenant_id"])]
    registry_only: bool,

    /// Leave the registry database untouched
    #[arg(long)]
    skip_registry: bool,

    /// Migrate a single registered tenant database by name
    #[arg(long, value_name = "DB_NAME", conflicts_with = "tenant_id")]
    tenant: Option<String>,

    /// Migrate a single tenant by registry id
    #[arg(long, value_name = "UUID")]
    tenant_id: Option<Uuid>,

    /// List pending migrations without applying them
    #[arg(long)]
    dry_run: bool,

    /// Configuration file (defaults to config/ and APP__ variables)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

/// Which tenant databases a run covers
#[derive(Debug, PartialEq, Eq)]
enum TenantScope {
    None,
    Database(String),
    Id(Uuid),
    All,
}

impl Cli {
    fn includes_registry(&self) -> bool {
        !self.skip_registry
    }

    fn tenant_scope(&self) -> TenantScope {
        if self.registry_only {
            TenantScope::None
        } else if let Some(ref name) = self.tenant {
            TenantScope::Database(name.clone())
        } else if let Some(id) = self.tenant_id {
            TenantScope::Id(id)
        } else {
            TenantScope::All
        }
    }

    fn load_config(&self) -> anyhow::Result<AppConfig> {
        let config = match self.config {
            Some(ref path) => AppConfig::from_file(&path.to_string_lossy()),
            None => AppConfig::load(),
        };
        config.context("Failed to load configuration")
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = match cli.load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{:#}", e);
            return ExitCode::FAILURE;
        }
    };

    init_tracing(&config.observability);
    register_metrics();
    info!(
        service = %config.observability.service_name,
        "Starting Nizam migration runner v{}",
        nizam_common::VERSION
    );

    match run(&cli, &config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = ?e, "Migration run failed");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(config: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    if config.json_logging {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn run(cli: &Cli, config: &AppConfig) -> anyhow::Result<()> {
    let registry_conn = connect_registry(&config.database)
        .await
        .context("Failed to connect to registry database")?;
    let schema = SchemaProvisioner::new();
    let limit = config.step_timeout();

    if cli.includes_registry() {
        migrate_database(
            &schema,
            &registry_conn,
            &registry_migrations(),
            &config.database.registry_database,
            cli.dry_run,
            limit,
        )
        .await?;
    }

    let registry = Registry::new(registry_conn.clone());
    let targets: Vec<String> = match cli.tenant_scope() {
        TenantScope::None => {
            info!("Registry only; skipping tenant migrations");
            Vec::new()
        }
        TenantScope::Database(name) => {
            let tenant = registry
                .find_tenant_by_database(&name)
                .await?
                .ok_or_else(|| anyhow!("{} is not a registered tenant database", name))?;
            vec![tenant.database_name]
        }
        TenantScope::Id(id) => {
            let tenant = registry
                .find_tenant(id)
                .await?
                .ok_or_else(|| anyhow!("Tenant with id {} not found", id))?;
            vec![tenant.database_name]
        }
        TenantScope::All => {
            let tenants = registry.list_tenants().await?;
            if tenants.is_empty() {
                info!("No tenants registered; skipping tenant migrations");
            }
            tenants.into_iter().map(|t| t.database_name).collect()
        }
    };

    let engine = PostgresEngine::new(config.database.clone(), registry_conn.clone());
    let set = tenant_migrations();

    for database in &targets {
        let conn = engine
            .connect(database)
            .await
            .with_context(|| format!("Failed to connect to {}", database))?;

        let result = migrate_database(&schema, &conn, &set, database, cli.dry_run, limit).await;

        if let Err(e) = conn.close().await {
            warn!(database = %database, error = %e, "Failed to close tenant connection");
        }
        // One failing tenant aborts the batch
        result?;
    }

    info!(tenants = targets.len(), dry_run = cli.dry_run, "Migration run complete");
    registry_conn.close().await?;
    Ok(())
}

async fn migrate_database(
    schema: &SchemaProvisioner,
    conn: &DatabaseConnection,
    set: &MigrationSet,
    database: &str,
    dry_run: bool,
    limit: Duration,
) -> anyhow::Result<()> {
    if dry_run {
        let pending = bounded(limit, database, schema.pending(conn, set))
            .await?
            .with_context(|| format!("Failed to read migration state of {}", database))?;

        if pending.is_empty() {
            info!(database = %database, "Up to date");
        }
        for migration in pending {
            info!(database = %database, version = migration.version, name = migration.name, "Pending migration");
        }
        return Ok(());
    }

    let applied = bounded(limit, database, schema.apply(conn, set))
        .await?
        .with_context(|| format!("Failed to migrate {}", database))?;

    info!(
        database = %database,
        version = ?applied.version,
        applied = applied.newly_applied.len(),
        "Database migrated"
    );
    Ok(())
}

/// Fail the run when one database takes longer than `limit`
async fn bounded<T>(limit: Duration, database: &str, work: impl Future<Output = T>) -> anyhow::Result<T> {
    tokio::time::timeout(limit, work)
        .await
        .map_err(|_| anyhow!("Migrating {} timed out after {}s", database, limit.as_secs_f64()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("migrate").chain(args.iter().copied()))
    }

    #[test]
    fn test_default_runs_everything() {
        let cli = parse(&[]).unwrap();
        assert!(cli.includes_registry());
        assert_eq!(cli.tenant_scope(), TenantScope::All);
        assert!(!cli.dry_run);
    }

    #[test]
    fn test_single_tenant_by_name() {
        let cli = parse(&["--tenant", "tenant_acme_corp_", "--skip-registry", "--dry-run"]).unwrap();
        assert!(!cli.includes_registry());
        assert_eq!(cli.tenant_scope(), TenantScope::Database("tenant_acme_corp_".into()));
        assert!(cli.dry_run);
    }

    #[test]
    fn test_single_tenant_by_id() {
        let id = Uuid::new_v4();
        let cli = parse(&["--tenant-id", &id.to_string()]).unwrap();
        assert_eq!(cli.tenant_scope(), TenantScope::Id(id));
    }

    #[test]
    fn test_registry_only() {
        let cli = parse(&["--registry-only"]).unwrap();
        assert!(cli.includes_registry());
        assert_eq!(cli.tenant_scope(), TenantScope::None);
    }

    #[tokio::test]
    async fn test_slow_database_times_out() {
        let err = bounded(Duration::from_millis(20), "tenant_stuck", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
        })
        .await
        .unwrap_err();

        assert!(err.to_string().contains("tenant_stuck"));
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_fast_database_passes_through() {
        let value = bounded(Duration::from_secs(1), "tenant_quick", async { 7 }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn test_conflicting_flags_are_rejected() {
        assert!(parse(&["--registry-only", "--skip-registry"]).is_err());
        assert!(parse(&["--registry-only", "--tenant", "tenant_x"]).is_err());
        assert!(parse(&["--tenant", "tenant_x", "--tenant-id", &Uuid::new_v4().to_string()]).is_err());
        assert!(parse(&["--tenant-id", "not-a-uuid"]).is_err());
    }
}
