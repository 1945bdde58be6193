//! Registry database schema

use super::{Migration, MigrationSet};

const CREATE_TENANTS: &str = "CREATE TABLE tenants (
    id UUID PRIMARY KEY,
    name VARCHAR(255) NOT NULL,
    slug VARCHAR(255) NOT NULL UNIQUE,
    database_name VARCHAR(63) NOT NULL UNIQUE,
    status VARCHAR(32) NOT NULL DEFAULT 'pending',
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
)";

const CREATE_ACCOUNTS: &str = "CREATE TABLE accounts (
    id UUID PRIMARY KEY,
    email VARCHAR(255) NOT NULL UNIQUE,
    password_hash TEXT NOT NULL,
    first_name VARCHAR(255),
    last_name VARCHAR(255),
    is_active BOOLEAN NOT NULL DEFAULT TRUE,
    tenant_id UUID NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
    created_at TIMESTAMPTZ NOT NULL
)";

const INDEX_ACCOUNTS_TENANT: &str =
    "CREATE INDEX idx_accounts_tenant_id ON accounts (tenant_id)";

/// Schema of the shared registry database
pub fn registry_migrations() -> MigrationSet {
    MigrationSet::new(
        "registry",
        vec![
            Migration {
                version: 1,
                name: "create_tenants",
                statements: &[CREATE_TENANTS],
            },
            Migration {
                version: 2,
                name: "create_accounts",
                statements: &[CREATE_ACCOUNTS, INDEX_ACCOUNTS_TENANT],
            },
        ],
    )
}
