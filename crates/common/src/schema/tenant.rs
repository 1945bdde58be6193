//! Per-tenant database schema
//!
//! Every tenant database carries the same tables; this set is applied at
//! provisioning time and re-applied by the migration runner.

use super::{Migration, MigrationSet};

const CREATE_EMPLOYEES: &str = "CREATE TABLE employees (
    id UUID PRIMARY KEY,
    first_name VARCHAR(255) NOT NULL,
    last_name VARCHAR(255) NOT NULL,
    email VARCHAR(255) UNIQUE,
    job_title VARCHAR(255),
    is_active BOOLEAN NOT NULL DEFAULT TRUE,
    created_at TIMESTAMPTZ NOT NULL
)";

const CREATE_ITEMS: &str = "CREATE TABLE items (
    id UUID PRIMARY KEY,
    name VARCHAR(255) NOT NULL,
    sku VARCHAR(64) NOT NULL UNIQUE,
    description TEXT,
    unit_of_measure VARCHAR(32) NOT NULL,
    quantity_on_hand DOUBLE PRECISION NOT NULL DEFAULT 0,
    low_stock_threshold DOUBLE PRECISION NOT NULL DEFAULT 0
)";

const CREATE_SKU_SEQUENCES: &str = "CREATE TABLE sku_sequences (
    prefix VARCHAR(32) PRIMARY KEY,
    last_value BIGINT NOT NULL
)";

/// Schema of every tenant database
pub fn tenant_migrations() -> MigrationSet {
    MigrationSet::new(
        "tenant",
        vec![
            Migration {
                version: 1,
                name: "create_employees_and_items",
                statements: &[CREATE_EMPLOYEES, CREATE_ITEMS],
            },
            Migration {
                version: 2,
                name: "create_sku_sequences",
                statements: &[CREATE_SKU_SEQUENCES],
            },
        ],
    )
}
