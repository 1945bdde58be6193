//! Tenant entity (registry database)

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Tenant lifecycle status
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantStatus {
    /// Registry row exists, database not yet ready
    Pending,
    /// Database created and migrated
    Active,
}

impl From<String> for TenantStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "active" => TenantStatus::Active,
            _ => TenantStatus::Pending,
        }
    }
}

impl From<TenantStatus> for String {
    fn from(status: TenantStatus) -> Self {
        match status {
            TenantStatus::Pending => "pending".to_string(),
            TenantStatus::Active => "active".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "tenants")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Display name as entered at signup
    #[sea_orm(column_type = "Text")]
    pub name: String,

    #[sea_orm(column_type = "Text", unique)]
    pub slug: String,

    /// Physical database owned by this tenant. Never renamed.
    #[sea_orm(column_type = "Text", unique)]
    pub database_name: String,

    #[sea_orm(column_type = "Text")]
    pub status: String,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

impl Model {
    /// Get the tenant status as an enum
    pub fn tenant_status(&self) -> TenantStatus {
        TenantStatus::from(self.status.clone())
    }

    /// Whether the tenant database is ready to serve traffic
    pub fn is_active(&self) -> bool {
        self.tenant_status() == TenantStatus::Active
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::account::Entity")]
    Accounts,
}

impl Related<super::account::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Accounts.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
