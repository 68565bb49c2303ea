use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

// Tenant-side rows. These live in a family database, never in the master.

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Category {
    pub id: String,
    pub name: String,
    pub color: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Expense {
    pub id: String,
    pub category_id: Option<String>,
    pub amount: Decimal,
    pub description: String,
    pub spent_at: DateTime<Utc>,
    pub paid_by: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}
