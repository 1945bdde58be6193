//! Tenant provisioning workflow
//!
//! Signup creates three things across two systems: a registry row, a
//! physical database, and that database's schema. There is no distributed
//! transaction, so the workflow runs as a compensating [`Saga`]: each step
//! has an undo action, and any failure after the registry insert rolls back
//! what was done before the error reaches the caller.
//!
//! The registry row is written first. A crash mid-way therefore leaves an
//! orphaned `pending` row that a reconciliation sweep can find, rather than
//! an unregistered database with no owner record.

mod naming;
mod saga;
mod steps;

pub use naming::TenantNames;
pub use saga::{CompensationFailure, Saga, SagaFailure, SagaStep, StepTimeout};

use crate::auth::{hash_password, normalize_email};
use crate::config::AppConfig;
use crate::db::models::{Account, Tenant};
use crate::db::{DatabaseAdmin, NewAccount, Registry, TenantConnector};
use crate::errors::ProvisionError;
use crate::metrics::{record_compensation_failures, ProvisioningMetrics};
use crate::schema::{tenant_migrations, MigrationSet};
use std::sync::Arc;
use std::time::Duration;
use steps::{
    ActivateTenant, ApplySchema, CreateDatabase, CreateOwnerAccount, ProvisionContext,
    RegisterTenant, StepError,
};
use tracing::{error, info, instrument, warn};

/// Owner account requested at signup
#[derive(Debug, Clone)]
pub struct NewOwner {
    pub email: String,
    pub password: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

/// Provisions new tenants
#[derive(Clone)]
pub struct TenantProvisioner {
    registry: Registry,
    admin: Arc<dyn DatabaseAdmin>,
    connector: Arc<dyn TenantConnector>,
    migrations: MigrationSet,
    step_timeout: Duration,
}

impl TenantProvisioner {
    pub fn new(
        config: &AppConfig,
        registry: Registry,
        admin: Arc<dyn DatabaseAdmin>,
        connector: Arc<dyn TenantConnector>,
    ) -> Self {
        Self {
            registry,
            admin,
            connector,
            migrations: tenant_migrations(),
            step_timeout: config.step_timeout(),
        }
    }

    /// Replace the tenant migration set
    pub fn with_migrations(mut self, migrations: MigrationSet) -> Self {
        self.migrations = migrations;
        self
    }

    pub fn with_step_timeout(mut self, step_timeout: Duration) -> Self {
        self.step_timeout = step_timeout;
        self
    }

    /// Provision a tenant for `company_name`
    #[instrument(skip(self))]
    pub async fn provision(&self, company_name: &str) -> Result<Tenant, ProvisionError> {
        let ctx = self.run(company_name, None).await?;
        ctx.tenant.ok_or_else(missing_tenant)
    }

    /// Provision a tenant together with its owner account
    #[instrument(skip(self, owner), fields(email = %owner.email))]
    pub async fn provision_with_owner(
        &self,
        company_name: &str,
        owner: NewOwner,
    ) -> Result<(Tenant, Account), ProvisionError> {
        let email = normalize_email(&owner.email);

        match self.registry.find_account_by_email(&email).await {
            Ok(Some(_)) => return Err(ProvisionError::DuplicateAccount { email }),
            Ok(None) => {}
            Err(e) => {
                return Err(ProvisionError::ProvisioningFailed {
                    step: "check_account",
                    cause: e.to_string(),
                })
            }
        }

        let password_hash = hash_password(&owner.password).map_err(|e| {
            ProvisionError::ProvisioningFailed {
                step: "hash_password",
                cause: e.to_string(),
            }
        })?;

        let account = NewAccount {
            email,
            password_hash,
            first_name: owner.first_name,
            last_name: owner.last_name,
        };

        let ctx = self.run(company_name, Some(account)).await?;
        match (ctx.tenant, ctx.account) {
            (Some(tenant), Some(account)) => Ok((tenant, account)),
            _ => Err(missing_tenant()),
        }
    }

    fn saga(&self, with_owner: bool) -> Saga<ProvisionContext, StepError> {
        let saga = Saga::new("provision_tenant", self.step_timeout)
            .step(RegisterTenant { registry: self.registry.clone() })
            .step(CreateDatabase { admin: self.admin.clone() })
            .step(ApplySchema {
                connector: self.connector.clone(),
                migrations: self.migrations.clone(),
            });

        let saga = if with_owner {
            saga.step(CreateOwnerAccount { registry: self.registry.clone() })
        } else {
            saga
        };

        saga.step(ActivateTenant { registry: self.registry.clone() })
    }

    async fn run(
        &self,
        company_name: &str,
        owner: Option<NewAccount>,
    ) -> Result<ProvisionContext, ProvisionError> {
        let metrics = ProvisioningMetrics::start();

        let names = match TenantNames::derive(company_name) {
            Ok(names) => names,
            Err(e) => {
                metrics.finish("invalid_name");
                return Err(e);
            }
        };

        let saga = self.saga(owner.is_some());
        let mut ctx = ProvisionContext::new(company_name, names, owner);

        match saga.run(&mut ctx).await {
            Ok(()) => {
                metrics.finish("success");
                info!(
                    slug = %ctx.names.slug,
                    database = %ctx.names.database_name,
                    "Tenant provisioned"
                );
                Ok(ctx)
            }
            Err(failure) => {
                let err = into_provision_error(failure, &ctx);
                metrics.finish(outcome(&err));
                Err(err)
            }
        }
    }
}

fn into_provision_error(failure: SagaFailure<StepError>, ctx: &ProvisionContext) -> ProvisionError {
    let SagaFailure {
        step,
        error,
        compensation_failures,
    } = failure;

    if !compensation_failures.is_empty() {
        record_compensation_failures(compensation_failures.len());
        error!(
            step,
            slug = %ctx.names.slug,
            database = %ctx.names.database_name,
            error = %error,
            manual_intervention_required = true,
            "Provisioning rollback incomplete"
        );
        return ProvisionError::CompensationFailed {
            step,
            cause: error.to_string(),
            failures: compensation_failures.iter().map(ToString::to_string).collect(),
        };
    }

    match error {
        StepError::DuplicateTenant => ProvisionError::DuplicateTenant {
            slug: ctx.names.slug.clone(),
        },
        StepError::DuplicateAccount => ProvisionError::DuplicateAccount {
            email: ctx.owner.as_ref().map(|o| o.email.clone()).unwrap_or_default(),
        },
        other => {
            warn!(step, slug = %ctx.names.slug, error = %other, "Provisioning failed and was rolled back");
            ProvisionError::ProvisioningFailed {
                step,
                cause: other.to_string(),
            }
        }
    }
}

fn outcome(err: &ProvisionError) -> &'static str {
    match err {
        ProvisionError::InvalidName { .. } => "invalid_name",
        ProvisionError::DuplicateTenant { .. } | ProvisionError::DuplicateAccount { .. } => "duplicate",
        ProvisionError::ProvisioningFailed { .. } => "failed",
        ProvisionError::CompensationFailed { .. } => "compensation_failed",
    }
}

fn missing_tenant() -> ProvisionError {
    ProvisionError::ProvisioningFailed {
        step: "activate_tenant",
        cause: "saga finished without a tenant row".to_string(),
    }
}
