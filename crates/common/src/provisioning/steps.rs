//! Provisioning saga steps

use super::naming::TenantNames;
use super::saga::{SagaStep, StepTimeout};
use crate::db::models::{Account, Tenant};
use crate::db::{is_unique_violation, DatabaseAdmin, NewAccount, Registry, TenantConnector};
use crate::errors::MigrationError;
use crate::schema::{MigrationSet, SchemaProvisioner};
use async_trait::async_trait;
use sea_orm::DbErr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Failure of a single provisioning step
#[derive(Debug, Error)]
pub enum StepError {
    #[error("slug or database name already registered")]
    DuplicateTenant,

    #[error("account email already registered")]
    DuplicateAccount,

    #[error("tenant row missing from provisioning context")]
    MissingTenant,

    #[error(transparent)]
    Database(#[from] DbErr),

    #[error(transparent)]
    Migration(#[from] MigrationError),

    #[error(transparent)]
    Timeout(#[from] StepTimeout),
}

/// State threaded through the saga
#[derive(Debug)]
pub struct ProvisionContext {
    /// Id the tenant row is inserted under, fixed before the insert runs
    pub reserved_tenant_id: Uuid,
    pub company_name: String,
    pub names: TenantNames,
    pub owner: Option<NewAccount>,
    pub tenant: Option<Tenant>,
    pub account: Option<Account>,
}

impl ProvisionContext {
    pub fn new(company_name: &str, names: TenantNames, owner: Option<NewAccount>) -> Self {
        Self {
            reserved_tenant_id: Uuid::new_v4(),
            company_name: company_name.to_string(),
            names,
            owner,
            tenant: None,
            account: None,
        }
    }

    fn tenant_id(&self) -> Result<Uuid, StepError> {
        self.tenant.as_ref().map(|t| t.id).ok_or(StepError::MissingTenant)
    }
}

/// Insert the registry row in `pending` status
pub struct RegisterTenant {
    pub registry: Registry,
}

#[async_trait]
impl SagaStep<ProvisionContext, StepError> for RegisterTenant {
    fn name(&self) -> &'static str {
        "register_tenant"
    }

    async fn execute(&self, ctx: &mut ProvisionContext) -> Result<(), StepError> {
        let tenant = self
            .registry
            .insert_pending_tenant_with_id(
                ctx.reserved_tenant_id,
                &ctx.company_name,
                &ctx.names.slug,
                &ctx.names.database_name,
            )
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StepError::DuplicateTenant
                } else {
                    StepError::Database(e)
                }
            })?;

        debug!(tenant_id = %tenant.id, "Tenant row registered");
        ctx.tenant = Some(tenant);
        Ok(())
    }

    /// Deletes by the reserved id, never by slug, so a duplicate-slug
    /// failure cannot remove the tenant that already owns it.
    async fn compensate(&self, ctx: &mut ProvisionContext) -> Result<(), StepError> {
        let id = ctx.reserved_tenant_id;
        let deleted = self.registry.delete_tenant(id).await?;

        if !deleted && ctx.tenant.is_some() {
            warn!(tenant_id = %id, "Tenant row already gone");
        }
        ctx.tenant = None;
        Ok(())
    }

    // A timed-out insert may have committed without the step seeing its row
    fn compensate_on_failure(&self) -> bool {
        true
    }
}

/// Create the physical database
pub struct CreateDatabase {
    pub admin: Arc<dyn DatabaseAdmin>,
}

#[async_trait]
impl SagaStep<ProvisionContext, StepError> for CreateDatabase {
    fn name(&self) -> &'static str {
        "create_database"
    }

    async fn execute(&self, ctx: &mut ProvisionContext) -> Result<(), StepError> {
        self.admin.create_database(&ctx.names.database_name).await?;
        Ok(())
    }

    async fn compensate(&self, ctx: &mut ProvisionContext) -> Result<(), StepError> {
        self.admin.drop_database(&ctx.names.database_name).await?;
        Ok(())
    }

    // A timed-out CREATE DATABASE may still have completed on the server
    fn compensate_on_failure(&self) -> bool {
        true
    }
}

/// Apply the tenant migration set over a short-lived connection
pub struct ApplySchema {
    pub connector: Arc<dyn TenantConnector>,
    pub migrations: MigrationSet,
}

#[async_trait]
impl SagaStep<ProvisionContext, StepError> for ApplySchema {
    fn name(&self) -> &'static str {
        "apply_schema"
    }

    async fn execute(&self, ctx: &mut ProvisionContext) -> Result<(), StepError> {
        let conn = self.connector.connect(&ctx.names.database_name).await?;

        let result = SchemaProvisioner::new().apply(&conn, &self.migrations).await;

        // Routing owns long-lived handles; this one is closed either way
        if let Err(e) = conn.close().await {
            warn!(database = %ctx.names.database_name, error = %e, "Failed to close provisioning connection");
        }

        let applied = result?;
        info!(
            database = %ctx.names.database_name,
            version = ?applied.version,
            "Tenant schema applied"
        );
        Ok(())
    }
}

/// Create the signup owner's account in the registry
pub struct CreateOwnerAccount {
    pub registry: Registry,
}

#[async_trait]
impl SagaStep<ProvisionContext, StepError> for CreateOwnerAccount {
    fn name(&self) -> &'static str {
        "create_owner_account"
    }

    async fn execute(&self, ctx: &mut ProvisionContext) -> Result<(), StepError> {
        let tenant_id = ctx.tenant_id()?;
        let Some(owner) = ctx.owner.clone() else {
            return Ok(());
        };

        let account = self
            .registry
            .create_account(tenant_id, owner)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StepError::DuplicateAccount
                } else {
                    StepError::Database(e)
                }
            })?;

        ctx.account = Some(account);
        Ok(())
    }

    async fn compensate(&self, ctx: &mut ProvisionContext) -> Result<(), StepError> {
        if let Some(account) = ctx.account.take() {
            self.registry.delete_account(account.id).await?;
        }
        Ok(())
    }
}

/// Flip the registry row to `active`
pub struct ActivateTenant {
    pub registry: Registry,
}

#[async_trait]
impl SagaStep<ProvisionContext, StepError> for ActivateTenant {
    fn name(&self) -> &'static str {
        "activate_tenant"
    }

    async fn execute(&self, ctx: &mut ProvisionContext) -> Result<(), StepError> {
        let tenant = self.registry.mark_tenant_active(ctx.tenant_id()?).await?;
        ctx.tenant = Some(tenant);
        Ok(())
    }
}
