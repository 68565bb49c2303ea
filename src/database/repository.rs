use chrono::{DateTime, Utc};
use sqlx::{Sqlite, SqlitePool, Transaction};

use crate::database::manager::DatabaseError;
use crate::database::models::{Family, FamilyMembership, Role, Session, User};

const USER_COLUMNS: &str = "id, email, name, password_hash, created_at, updated_at";
const FAMILY_COLUMNS: &str =
    "id, name, invite_code, database_name, database_url, manager_id, schema_version, created_at, updated_at";
const SESSION_COLUMNS: &str =
    "id, user_id, family_id, role, created_at, last_active, expires_at, user_agent, ip_address, token_hash";

/// Users table in the master database
#[derive(Clone)]
pub struct UserRepository {
    pool: SqlitePool,
}

impl UserRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, user: &User) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO users (id, email, name, password_hash, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&user.id)
        .bind(&user.email)
        .bind(&user.name)
        .bind(&user.password_hash)
        .bind(user.created_at)
        .bind(user.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn find_by_email(&self, email: &str) -> Result<Option<User>, DatabaseError> {
        let user = sqlx::query_as::<_, User>(&format!("SELECT {} FROM users WHERE email = ?", USER_COLUMNS))
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    pub async fn find_by_id(&self, id: &str) -> Result<Option<User>, DatabaseError> {
        let user = sqlx::query_as::<_, User>(&format!("SELECT {} FROM users WHERE id = ?", USER_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    pub async fn email_exists(&self, email: &str) -> Result<bool, DatabaseError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE email = ?")
            .bind(email)
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }
}

/// Families and memberships in the master database
#[derive(Clone)]
pub struct FamilyRepository {
    pool: SqlitePool,
}

impl FamilyRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>, DatabaseError> {
        Ok(self.pool.begin().await?)
    }

    pub async fn insert_family(tx: &mut Transaction<'static, Sqlite>, family: &Family) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO families (id, name, invite_code, database_name, database_url, manager_id, schema_version, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&family.id)
        .bind(&family.name)
        .bind(&family.invite_code)
        .bind(&family.database_name)
        .bind(&family.database_url)
        .bind(&family.manager_id)
        .bind(family.schema_version)
        .bind(family.created_at)
        .bind(family.updated_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn insert_membership(
        tx: &mut Transaction<'static, Sqlite>,
        family_id: &str,
        user_id: &str,
        role: Role,
        joined_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        sqlx::query("INSERT INTO family_memberships (family_id, user_id, role, joined_at) VALUES (?, ?, ?, ?)")
            .bind(family_id)
            .bind(user_id)
            .bind(role.as_str())
            .bind(joined_at)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    pub async fn find_by_id(&self, id: &str) -> Result<Option<Family>, DatabaseError> {
        let family = sqlx::query_as::<_, Family>(&format!("SELECT {} FROM families WHERE id = ?", FAMILY_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(family)
    }

    pub async fn find_by_invite_code(&self, code: &str) -> Result<Option<Family>, DatabaseError> {
        let family = sqlx::query_as::<_, Family>(&format!(
            "SELECT {} FROM families WHERE invite_code = ?",
            FAMILY_COLUMNS
        ))
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;
        Ok(family)
    }

    pub async fn invite_code_exists(&self, code: &str) -> Result<bool, DatabaseError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM families WHERE invite_code = ?")
            .bind(code)
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }

    /// The user's single active membership, if any.
    pub async fn membership_for_user(&self, user_id: &str) -> Result<Option<FamilyMembership>, DatabaseError> {
        let membership = sqlx::query_as::<_, FamilyMembership>(
            "SELECT family_id, user_id, role, joined_at FROM family_memberships WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(membership)
    }

    pub async fn add_member(&self, family_id: &str, user_id: &str, role: Role) -> Result<(), DatabaseError> {
        let mut tx = self.begin().await?;
        Self::insert_membership(&mut tx, family_id, user_id, role, Utc::now()).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn remove_member(&self, family_id: &str, user_id: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM family_memberships WHERE family_id = ? AND user_id = ?")
            .bind(family_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_members(&self, family_id: &str) -> Result<Vec<(FamilyMembership, User)>, DatabaseError> {
        let memberships = sqlx::query_as::<_, FamilyMembership>(
            "SELECT family_id, user_id, role, joined_at FROM family_memberships
             WHERE family_id = ? ORDER BY joined_at",
        )
        .bind(family_id)
        .fetch_all(&self.pool)
        .await?;

        let users = UserRepository::new(self.pool.clone());
        let mut members = Vec::with_capacity(memberships.len());
        for membership in memberships {
            let user = users
                .find_by_id(&membership.user_id)
                .await?
                .ok_or_else(|| DatabaseError::NotFound(format!("user {}", membership.user_id)))?;
            members.push((membership, user));
        }
        Ok(members)
    }
}

/// Login sessions in the master database
#[derive(Clone)]
pub struct SessionRepository {
    pool: SqlitePool,
}

impl SessionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, session: &Session) -> Result<(), DatabaseError> {
        sqlx::query(&format!(
            "INSERT INTO user_sessions ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            SESSION_COLUMNS
        ))
        .bind(&session.id)
        .bind(&session.user_id)
        .bind(&session.family_id)
        .bind(&session.role)
        .bind(session.created_at)
        .bind(session.last_active)
        .bind(session.expires_at)
        .bind(&session.user_agent)
        .bind(&session.ip_address)
        .bind(&session.token_hash)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn find_by_token_hash(&self, token_hash: &str) -> Result<Option<Session>, DatabaseError> {
        let session = sqlx::query_as::<_, Session>(&format!(
            "SELECT {} FROM user_sessions WHERE token_hash = ?",
            SESSION_COLUMNS
        ))
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(session)
    }

    pub async fn find_by_id(&self, id: &str) -> Result<Option<Session>, DatabaseError> {
        let session = sqlx::query_as::<_, Session>(&format!("SELECT {} FROM user_sessions WHERE id = ?", SESSION_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(session)
    }

    pub async fn touch(&self, id: &str, now: DateTime<Utc>) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE user_sessions SET last_active = ? WHERE id = ?")
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Extend a session that has not expired yet. Returns false when nothing was updated.
    pub async fn extend(&self, id: &str, now: DateTime<Utc>, expires_at: DateTime<Utc>) -> Result<bool, DatabaseError> {
        let result = sqlx::query("UPDATE user_sessions SET expires_at = ?, last_active = ? WHERE id = ? AND expires_at > ?")
            .bind(expires_at)
            .bind(now)
            .bind(id)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete(&self, id: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM user_sessions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Stamp family and role onto every unexpired session of a user.
    pub async fn update_family_for_user(
        &self,
        user_id: &str,
        family_id: Option<&str>,
        role: Option<Role>,
        now: DateTime<Utc>,
    ) -> Result<u64, DatabaseError> {
        let result = sqlx::query("UPDATE user_sessions SET family_id = ?, role = ? WHERE user_id = ? AND expires_at > ?")
            .bind(family_id)
            .bind(role.map(|r| r.as_str()))
            .bind(user_id)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, DatabaseError> {
        let result = sqlx::query("DELETE FROM user_sessions WHERE expires_at <= ?")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
