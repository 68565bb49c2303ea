use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use sqlx::{FromRow, SqlitePool};
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;

use super::new_id;
use crate::database::manager::DatabaseError;
use crate::database::models::{Category, Expense};

pub const DEFAULT_EXPENSE_LIMIT: i64 = 50;
pub const MAX_EXPENSE_LIMIT: i64 = 500;

#[derive(Debug, Error)]
pub enum ExpenseError {
    #[error("Amount must be greater than zero")]
    InvalidAmount,

    #[error("Category name is required")]
    InvalidName,

    #[error("User is not a member of this family: {0}")]
    UnknownMember(String),

    #[error("Category already exists: {0}")]
    CategoryExists(String),

    #[error("Category not found: {0}")]
    CategoryNotFound(String),

    #[error("Expense not found: {0}")]
    ExpenseNotFound(String),

    #[error("Stored amount is not a decimal: {0}")]
    CorruptAmount(String),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewExpense {
    pub category_id: Option<String>,
    pub amount: Decimal,
    #[serde(default)]
    pub description: String,
    pub spent_at: Option<DateTime<Utc>>,
    /// Defaults to the caller.
    pub paid_by: Option<String>,
}

// Amounts are TEXT in the tenant schema
#[derive(FromRow)]
struct ExpenseRow {
    id: String,
    category_id: Option<String>,
    amount: String,
    description: String,
    spent_at: DateTime<Utc>,
    paid_by: String,
    created_by: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<ExpenseRow> for Expense {
    type Error = ExpenseError;

    fn try_from(row: ExpenseRow) -> Result<Self, Self::Error> {
        let amount = Decimal::from_str(&row.amount).map_err(|_| ExpenseError::CorruptAmount(row.amount.clone()))?;
        Ok(Expense {
            id: row.id,
            category_id: row.category_id,
            amount,
            description: row.description,
            spent_at: row.spent_at,
            paid_by: row.paid_by,
            created_by: row.created_by,
            created_at: row.created_at,
        })
    }
}

/// Categories and expenses inside one family's tenant database.
///
/// User ids stored here point at the master database. Nothing enforces that
/// across databases, so writes check them against the tenant's
/// `family_members` mirror instead.
pub struct ExpenseService {
    pool: SqlitePool,
}

impl ExpenseService {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create_category(&self, actor: &str, name: &str, color: Option<&str>) -> Result<Category, ExpenseError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ExpenseError::InvalidName);
        }
        self.require_member(actor).await?;

        let category = Category {
            id: new_id(),
            name: name.to_string(),
            color: color.map(str::trim).filter(|c| !c.is_empty()).map(str::to_string),
            created_by: actor.to_string(),
            created_at: Utc::now(),
        };

        let result = sqlx::query("INSERT INTO categories (id, name, color, created_by, created_at) VALUES (?, ?, ?, ?, ?)")
            .bind(&category.id)
            .bind(&category.name)
            .bind(&category.color)
            .bind(&category.created_by)
            .bind(category.created_at)
            .execute(&self.pool)
            .await;

        match result {
            Ok(_) => Ok(category),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(ExpenseError::CategoryExists(category.name)),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn list_categories(&self) -> Result<Vec<Category>, ExpenseError> {
        let categories = sqlx::query_as::<_, Category>(
            "SELECT id, name, color, created_by, created_at FROM categories ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(categories)
    }

    /// Expenses in the category keep their rows with the category cleared.
    pub async fn delete_category(&self, id: &str) -> Result<(), ExpenseError> {
        let result = sqlx::query("DELETE FROM categories WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(ExpenseError::CategoryNotFound(id.to_string()));
        }
        Ok(())
    }

    pub async fn create_expense(&self, actor: &str, input: NewExpense) -> Result<Expense, ExpenseError> {
        if input.amount <= Decimal::ZERO {
            return Err(ExpenseError::InvalidAmount);
        }

        self.require_member(actor).await?;
        let paid_by = input.paid_by.unwrap_or_else(|| actor.to_string());
        if paid_by != actor {
            self.require_member(&paid_by).await?;
        }

        let category_id = input.category_id.filter(|id| !id.is_empty());
        if let Some(category_id) = &category_id {
            let exists: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM categories WHERE id = ?")
                .bind(category_id)
                .fetch_one(&self.pool)
                .await?;
            if exists == 0 {
                return Err(ExpenseError::CategoryNotFound(category_id.clone()));
            }
        }

        let now = Utc::now();
        let expense = Expense {
            id: new_id(),
            category_id,
            amount: input.amount.normalize(),
            description: input.description.trim().to_string(),
            spent_at: input.spent_at.unwrap_or(now),
            paid_by,
            created_by: actor.to_string(),
            created_at: now,
        };

        sqlx::query(
            "INSERT INTO expenses (id, category_id, amount, description, spent_at, paid_by, created_by, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&expense.id)
        .bind(&expense.category_id)
        .bind(expense.amount.to_string())
        .bind(&expense.description)
        .bind(expense.spent_at)
        .bind(&expense.paid_by)
        .bind(&expense.created_by)
        .bind(expense.created_at)
        .execute(&self.pool)
        .await?;

        debug!(expense_id = %expense.id, "Recorded expense");
        Ok(expense)
    }

    /// Most recent first.
    pub async fn list_expenses(&self, limit: Option<i64>) -> Result<Vec<Expense>, ExpenseError> {
        let limit = limit.unwrap_or(DEFAULT_EXPENSE_LIMIT).clamp(1, MAX_EXPENSE_LIMIT);
        let rows = sqlx::query_as::<_, ExpenseRow>(
            "SELECT id, category_id, amount, description, spent_at, paid_by, created_by, created_at
             FROM expenses ORDER BY spent_at DESC, created_at DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Expense::try_from).collect()
    }

    pub async fn delete_expense(&self, id: &str) -> Result<(), ExpenseError> {
        let result = sqlx::query("DELETE FROM expenses WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(ExpenseError::ExpenseNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn require_member(&self, user_id: &str) -> Result<(), ExpenseError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM family_members WHERE user_id = ?")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;
        if count == 0 {
            return Err(ExpenseError::UnknownMember(user_id.to_string()));
        }
        Ok(())
    }
}
