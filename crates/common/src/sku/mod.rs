//! Sequential SKU allocation
//!
//! Codes look like `TOL-MAK-1001`: a category code, a three-letter brand
//! code, and a per-prefix sequence number. Numbers come from a counter row
//! in `sku_sequences` that is advanced inside a transaction, so concurrent
//! allocations for one prefix never see the same value. The unique index on
//! `items.sku` is the final guard; inserts that still collide (rows written
//! outside the allocator) retry with a fresh number.

use crate::config::AppConfig;
use crate::db::is_unique_violation;
use crate::db::models::*;
use crate::errors::AllocError;
use crate::metrics;
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait,
    QueryFilter, QuerySelect, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// First number handed out for a prefix with no existing items
pub const FIRST_SEQUENCE: i64 = 1001;

const BRAND_CODE_LEN: usize = 3;

/// Known catalog categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemCategory {
    Tools,
    Materials,
    Components,
    Hardware,
}

impl ItemCategory {
    /// Three-letter code used in SKUs
    pub fn code(&self) -> &'static str {
        match self {
            ItemCategory::Tools => "TOL",
            ItemCategory::Materials => "MAT",
            ItemCategory::Components => "CMP",
            ItemCategory::Hardware => "HDW",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code.to_ascii_uppercase().as_str() {
            "TOL" => Some(ItemCategory::Tools),
            "MAT" => Some(ItemCategory::Materials),
            "CMP" => Some(ItemCategory::Components),
            "HDW" => Some(ItemCategory::Hardware),
            _ => None,
        }
    }
}

/// `CATEGORY-BRAND` part of a SKU
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SkuPrefix(String);

impl SkuPrefix {
    /// Category uppercased; brand uppercased and cut to three characters
    pub fn new(category: &str, brand: &str) -> Result<Self, AllocError> {
        let category = category.trim().to_ascii_uppercase();
        let brand: String = brand
            .trim()
            .chars()
            .take(BRAND_CODE_LEN)
            .collect::<String>()
            .to_ascii_uppercase();

        validate_part("category", &category)?;
        validate_part("brand", &brand)?;

        Ok(Self(format!("{}-{}", category, brand)))
    }

    pub fn for_category(category: ItemCategory, brand: &str) -> Result<Self, AllocError> {
        Self::new(category.code(), brand)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Full code for a sequence number
    pub fn code(&self, sequence: i64) -> String {
        format!("{}-{}", self.0, sequence)
    }

    /// Sequence number of `sku` if it belongs to this prefix
    fn sequence_of(&self, sku: &str) -> Option<i64> {
        let suffix = sku.strip_prefix(self.0.as_str())?.strip_prefix('-')?;
        if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        suffix.parse().ok()
    }
}

impl fmt::Display for SkuPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn validate_part(what: &str, part: &str) -> Result<(), AllocError> {
    if part.is_empty() {
        return Err(AllocError::InvalidPrefix {
            reason: format!("{} code is empty", what),
        });
    }
    if !part.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return Err(AllocError::InvalidPrefix {
            reason: format!("{} code must be letters and digits", what),
        });
    }
    Ok(())
}

/// Catalog entry to create; the SKU is allocated
#[derive(Debug, Clone)]
pub struct NewItem {
    pub prefix: SkuPrefix,
    pub name: String,
    pub description: Option<String>,
    pub unit_of_measure: String,
    pub quantity_on_hand: f64,
    pub low_stock_threshold: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct SkuAllocator {
    max_attempts: u32,
}

impl SkuAllocator {
    pub fn new(config: &AppConfig) -> Self {
        Self::with_max_attempts(config.allocator.max_attempts)
    }

    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    /// Reserve the next code for `prefix`. Reserved numbers are never
    /// handed out again, even if the caller does not use them.
    pub async fn next_code(&self, conn: &DatabaseConnection, prefix: &SkuPrefix) -> Result<String, AllocError> {
        let txn = conn.begin().await?;
        let value = next_value(&txn, prefix).await?;
        txn.commit().await?;

        debug!(prefix = %prefix, value, "SKU number reserved");
        Ok(prefix.code(value))
    }

    /// Insert `item` under a freshly allocated SKU, retrying on conflict
    #[instrument(skip(self, conn, item), fields(prefix = %item.prefix))]
    pub async fn create_item(&self, conn: &DatabaseConnection, item: NewItem) -> Result<Item, AllocError> {
        let mut conflicts = 0;

        for attempt in 1..=self.max_attempts {
            let sku = self.next_code(conn, &item.prefix).await?;

            let model = ItemActiveModel {
                id: Set(Uuid::new_v4()),
                name: Set(item.name.clone()),
                sku: Set(sku.clone()),
                description: Set(item.description.clone()),
                unit_of_measure: Set(item.unit_of_measure.clone()),
                quantity_on_hand: Set(item.quantity_on_hand),
                low_stock_threshold: Set(item.low_stock_threshold),
            };

            match model.insert(conn).await {
                Ok(created) => {
                    metrics::record_sku_allocation(conflicts, true);
                    return Ok(created);
                }
                Err(e) if is_unique_violation(&e) => {
                    conflicts += 1;
                    debug!(sku = %sku, attempt, "SKU already taken, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }

        metrics::record_sku_allocation(conflicts, false);
        warn!(attempts = self.max_attempts, "SKU allocation exhausted");
        Err(AllocError::AllocationExhausted {
            prefix: item.prefix.to_string(),
            attempts: self.max_attempts,
        })
    }
}

/// Advance the counter for `prefix`, seeding it on first use
async fn next_value<C: ConnectionTrait>(db: &C, prefix: &SkuPrefix) -> Result<i64, DbErr> {
    if let Some(value) = increment(db, prefix).await? {
        return Ok(value);
    }

    let seed = highest_existing(db, prefix)
        .await?
        .map_or(FIRST_SEQUENCE, |highest| highest + 1);

    let inserted = SkuSequenceEntity::insert(SkuSequenceActiveModel {
        prefix: Set(prefix.as_str().to_string()),
        last_value: Set(seed),
    })
    .on_conflict(
        OnConflict::column(SkuSequenceColumn::Prefix)
            .do_nothing()
            .to_owned(),
    )
    .exec_without_returning(db)
    .await?;

    if inserted > 0 {
        return Ok(seed);
    }

    // Another allocator seeded the row first
    increment(db, prefix)
        .await?
        .ok_or_else(|| DbErr::RecordNotFound(format!("sku sequence {}", prefix)))
}

/// Bump the counter row; the row stays locked until the transaction ends
async fn increment<C: ConnectionTrait>(db: &C, prefix: &SkuPrefix) -> Result<Option<i64>, DbErr> {
    let updated = SkuSequenceEntity::update_many()
        .col_expr(
            SkuSequenceColumn::LastValue,
            Expr::col(SkuSequenceColumn::LastValue).add(1),
        )
        .filter(SkuSequenceColumn::Prefix.eq(prefix.as_str()))
        .exec(db)
        .await?;

    if updated.rows_affected == 0 {
        return Ok(None);
    }

    let row = SkuSequenceEntity::find_by_id(prefix.as_str().to_string())
        .one(db)
        .await?;
    Ok(row.map(|r| r.last_value))
}

/// Highest numeric suffix among existing items, compared as numbers
async fn highest_existing<C: ConnectionTrait>(db: &C, prefix: &SkuPrefix) -> Result<Option<i64>, DbErr> {
    let skus: Vec<String> = ItemEntity::find()
        .select_only()
        .column(ItemColumn::Sku)
        .filter(ItemColumn::Sku.starts_with(format!("{}-", prefix)))
        .into_tuple()
        .all(db)
        .await?;

    Ok(skus.iter().filter_map(|sku| prefix.sequence_of(sku)).max())
}
