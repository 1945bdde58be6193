//! Registry store
//!
//! The shared database holding tenant records and cross-tenant accounts.

use crate::db::models::*;
use async_trait::async_trait;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter,
    QueryOrder, Set,
};
use uuid::Uuid;

/// Tenant lookup used by the connection router
#[async_trait]
pub trait TenantDirectory: Send + Sync {
    async fn find_tenant(&self, id: Uuid) -> Result<Option<Tenant>, DbErr>;
}

/// Account fields supplied at signup; `password_hash` is already hashed
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub email: String,
    pub password_hash: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

/// Data access for the registry database
#[derive(Clone)]
pub struct Registry {
    conn: DatabaseConnection,
}

impl Registry {
    /// Create a new registry over the given connection
    pub fn new(conn: DatabaseConnection) -> Self {
        Self { conn }
    }

    /// Underlying connection, for migrations
    pub fn connection(&self) -> &DatabaseConnection {
        &self.conn
    }

    // ========================================================================
    // Tenant Operations
    // ========================================================================

    /// Insert a tenant row in `pending` status.
    ///
    /// Slug and database name are unique; a collision surfaces as a
    /// unique-constraint violation.
    pub async fn insert_pending_tenant(
        &self,
        name: &str,
        slug: &str,
        database_name: &str,
    ) -> Result<Tenant, DbErr> {
        self.insert_pending_tenant_with_id(Uuid::new_v4(), name, slug, database_name)
            .await
    }

    /// Insert a `pending` tenant row under a caller-chosen id
    pub async fn insert_pending_tenant_with_id(
        &self,
        id: Uuid,
        name: &str,
        slug: &str,
        database_name: &str,
    ) -> Result<Tenant, DbErr> {
        let now = chrono::Utc::now();

        let tenant = TenantActiveModel {
            id: Set(id),
            name: Set(name.to_string()),
            slug: Set(slug.to_string()),
            database_name: Set(database_name.to_string()),
            status: Set(TenantStatus::Pending.into()),
            created_at: Set(now.into()),
            updated_at: Set(now.into()),
        };

        tenant.insert(&self.conn).await
    }

    /// Find tenant by ID
    pub async fn find_tenant(&self, id: Uuid) -> Result<Option<Tenant>, DbErr> {
        TenantEntity::find_by_id(id).one(&self.conn).await
    }

    /// Find tenant by slug
    pub async fn find_tenant_by_slug(&self, slug: &str) -> Result<Option<Tenant>, DbErr> {
        TenantEntity::find()
            .filter(TenantColumn::Slug.eq(slug))
            .one(&self.conn)
            .await
    }

    /// Find tenant by physical database name
    pub async fn find_tenant_by_database(&self, database_name: &str) -> Result<Option<Tenant>, DbErr> {
        TenantEntity::find()
            .filter(TenantColumn::DatabaseName.eq(database_name))
            .one(&self.conn)
            .await
    }

    /// List every tenant, oldest first
    pub async fn list_tenants(&self) -> Result<Vec<Tenant>, DbErr> {
        TenantEntity::find()
            .order_by_asc(TenantColumn::CreatedAt)
            .order_by_asc(TenantColumn::Slug)
            .all(&self.conn)
            .await
    }

    /// Mark a tenant as active once its database is ready
    pub async fn mark_tenant_active(&self, id: Uuid) -> Result<Tenant, DbErr> {
        let mut tenant: TenantActiveModel = TenantEntity::find_by_id(id)
            .one(&self.conn)
            .await?
            .ok_or_else(|| DbErr::RecordNotFound(format!("tenant {}", id)))?
            .into();

        tenant.status = Set(TenantStatus::Active.into());
        tenant.updated_at = Set(chrono::Utc::now().into());

        tenant.update(&self.conn).await
    }

    /// Delete tenant by ID; accounts cascade
    pub async fn delete_tenant(&self, id: Uuid) -> Result<bool, DbErr> {
        let result = TenantEntity::delete_by_id(id).exec(&self.conn).await?;
        Ok(result.rows_affected > 0)
    }

    // ========================================================================
    // Account Operations
    // ========================================================================

    /// Create an account owned by `tenant_id`
    pub async fn create_account(&self, tenant_id: Uuid, account: NewAccount) -> Result<Account, DbErr> {
        let model = AccountActiveModel {
            id: Set(Uuid::new_v4()),
            email: Set(account.email),
            password_hash: Set(account.password_hash),
            first_name: Set(account.first_name),
            last_name: Set(account.last_name),
            is_active: Set(true),
            tenant_id: Set(tenant_id),
            created_at: Set(chrono::Utc::now().into()),
        };

        model.insert(&self.conn).await
    }

    /// Find account by email
    pub async fn find_account_by_email(&self, email: &str) -> Result<Option<Account>, DbErr> {
        AccountEntity::find()
            .filter(AccountColumn::Email.eq(email))
            .one(&self.conn)
            .await
    }

    /// Delete account by ID
    pub async fn delete_account(&self, id: Uuid) -> Result<bool, DbErr> {
        let result = AccountEntity::delete_by_id(id).exec(&self.conn).await?;
        Ok(result.rows_affected > 0)
    }
}

#[async_trait]
impl TenantDirectory for Registry {
    async fn find_tenant(&self, id: Uuid) -> Result<Option<Tenant>, DbErr> {
        Registry::find_tenant(self, id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::is_unique_violation;
    use crate::testing::registry_store;

    #[tokio::test]
    async fn test_insert_and_activate_tenant() {
        let registry = registry_store().await;

        let tenant = registry
            .insert_pending_tenant("Acme Corp!", "acme-corp-", "tenant_acme_corp_")
            .await
            .unwrap();
        assert_eq!(tenant.tenant_status(), TenantStatus::Pending);
        assert!(!tenant.is_active());

        let active = registry.mark_tenant_active(tenant.id).await.unwrap();
        assert!(active.is_active());

        let by_slug = registry.find_tenant_by_slug("acme-corp-").await.unwrap().unwrap();
        assert_eq!(by_slug.id, tenant.id);
        assert_eq!(by_slug.database_name, "tenant_acme_corp_");
    }

    #[tokio::test]
    async fn test_duplicate_slug_is_unique_violation() {
        let registry = registry_store().await;

        registry
            .insert_pending_tenant("Acme Corp!", "acme-corp-", "tenant_acme_corp_")
            .await
            .unwrap();
        let err = registry
            .insert_pending_tenant("Acme   Corp!!", "acme-corp-", "tenant_acme_corp_")
            .await
            .unwrap_err();

        assert!(is_unique_violation(&err));
        assert_eq!(registry.list_tenants().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_deleting_tenant_cascades_to_accounts() {
        let registry = registry_store().await;

        let tenant = registry
            .insert_pending_tenant("Globex", "globex", "tenant_globex")
            .await
            .unwrap();
        registry
            .create_account(
                tenant.id,
                NewAccount {
                    email: "owner@globex.test".into(),
                    password_hash: "$argon2id$stub".into(),
                    first_name: Some("Hank".into()),
                    last_name: None,
                },
            )
            .await
            .unwrap();

        assert!(registry.delete_tenant(tenant.id).await.unwrap());
        assert!(registry.find_account_by_email("owner@globex.test").await.unwrap().is_none());
        assert!(!registry.delete_tenant(tenant.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_find_tenant_by_database_name() {
        let registry = registry_store().await;
        let id = Uuid::new_v4();

        registry
            .insert_pending_tenant_with_id(id, "Initech", "initech", "tenant_initech")
            .await
            .unwrap();

        let found = registry.find_tenant_by_database("tenant_initech").await.unwrap().unwrap();
        assert_eq!(found.id, id);
        assert!(registry.find_tenant_by_database("tenant_nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mark_missing_tenant_active_fails() {
        let registry = registry_store().await;
        let err = registry.mark_tenant_active(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, DbErr::RecordNotFound(_)));
    }
}
