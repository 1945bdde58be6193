//! SeaORM entity models
//!
//! Registry entities (`tenants`, `accounts`) and tenant-database entities
//! (`items`, `sku_sequences`), plus the migration marker shared by both.

mod account;
mod item;
mod schema_migration;
mod sku_sequence;
mod tenant;

pub use tenant::{
    Entity as TenantEntity,
    Model as Tenant,
    ActiveModel as TenantActiveModel,
    Column as TenantColumn,
    TenantStatus,
};

pub use account::{
    Entity as AccountEntity,
    Model as Account,
    ActiveModel as AccountActiveModel,
    Column as AccountColumn,
};

pub use item::{
    Entity as ItemEntity,
    Model as Item,
    ActiveModel as ItemActiveModel,
    Column as ItemColumn,
};

pub use sku_sequence::{
    Entity as SkuSequenceEntity,
    Model as SkuSequence,
    ActiveModel as SkuSequenceActiveModel,
    Column as SkuSequenceColumn,
};

pub use schema_migration::{
    Entity as SchemaMigrationEntity,
    Model as SchemaMigration,
    ActiveModel as SchemaMigrationActiveModel,
    Column as SchemaMigrationColumn,
};
