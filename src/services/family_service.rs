use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use sqlx::SqlitePool;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

use super::auth_service::{AuthError, AuthService};
use super::new_id;
use crate::database::manager::{DatabaseError, TenantHandle, TenantRegistry};
use crate::database::models::{Family, Role, User};
use crate::database::repository::FamilyRepository;

pub const MAX_FAMILY_NAME_LEN: usize = 100;
pub const INVITE_CODE_LEN: usize = 8;

// Uppercase alphanumerics without 0/O and 1/I
const INVITE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const INVITE_CODE_ATTEMPTS: usize = 5;

#[derive(Debug, Error)]
pub enum FamilyError {
    #[error("Invalid family name: {0}")]
    InvalidName(String),

    #[error("Invite code not found")]
    InvalidInviteCode,

    #[error("Family not found")]
    FamilyNotFound,

    #[error("User already belongs to a family")]
    AlreadyInFamily,

    #[error("User does not belong to a family")]
    NotInFamily,

    #[error("The family manager cannot leave the family")]
    ManagerCannotLeave,

    #[error("Only the family manager can do this")]
    NotManager,

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Auth(#[from] AuthError),
}

/// Member listing entry, joined from membership and user rows.
#[derive(Debug, Clone, Serialize)]
pub struct FamilyMember {
    pub user_id: String,
    pub name: String,
    pub email: String,
    pub role: String,
    pub joined_at: DateTime<Utc>,
}

/// Family lifecycle: provisioning, membership and teardown.
#[derive(Clone)]
pub struct FamilyService {
    registry: Arc<TenantRegistry>,
    families: FamilyRepository,
    auth: AuthService,
}

impl FamilyService {
    pub fn new(registry: Arc<TenantRegistry>, auth: AuthService) -> Self {
        let families = FamilyRepository::new(registry.master().clone());
        Self {
            registry,
            families,
            auth,
        }
    }

    /// Provisions and migrates the tenant and mirrors the manager into it before
    /// anything is committed, so a visible family always has a usable database.
    pub async fn create_family(&self, user: &User, name: &str) -> Result<Family, FamilyError> {
        let name = validate_name(name)?;

        if self.families.membership_for_user(&user.id).await?.is_some() {
            return Err(FamilyError::AlreadyInFamily);
        }

        let family_id = new_id();
        let invite_code = self.unused_invite_code().await?;
        let handle = self.registry.provision(&family_id, &name).await?;
        let guard = ProvisionGuard::new(self.registry.clone(), handle.clone());

        let now = Utc::now();
        let prepared = async {
            let (pool, outcome) = self.registry.prepare(&handle).await?;
            if let Err(e) = mirror_member(&pool, user, Role::Manager, now).await {
                pool.close().await;
                return Err(e);
            }
            Ok::<_, DatabaseError>((pool, outcome))
        }
        .await;
        let (pool, outcome) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                guard.release().await;
                return Err(e.into());
            }
        };

        let family = Family {
            id: family_id.clone(),
            name,
            invite_code,
            database_name: handle.database_name.clone(),
            database_url: handle.url.clone(),
            manager_id: user.id.clone(),
            schema_version: outcome.current_version,
            created_at: now,
            updated_at: now,
        };

        if let Err(e) = self.commit_family(&family, &user.id, now).await {
            pool.close().await;
            guard.release().await;
            if e.is_unique_violation() && self.families.membership_for_user(&user.id).await?.is_some() {
                return Err(FamilyError::AlreadyInFamily);
            }
            return Err(e.into());
        }
        guard.disarm();
        pool.close().await;

        self.push_to_sessions(&user.id, Some(&family_id), Some(Role::Manager)).await;
        info!(family_id = %family_id, user_id = %user.id, "Created family");
        Ok(family)
    }

    async fn commit_family(&self, family: &Family, manager_id: &str, now: DateTime<Utc>) -> Result<(), DatabaseError> {
        let mut tx = self.families.begin().await?;
        FamilyRepository::insert_family(&mut tx, family).await?;
        FamilyRepository::insert_membership(&mut tx, &family.id, manager_id, Role::Manager, now).await?;
        tx.commit().await?;
        Ok(())
    }

    /// The member is mirrored into the tenant first; the membership row is the commit point.
    pub async fn join_family(&self, user: &User, invite_code: &str) -> Result<Family, FamilyError> {
        let code = invite_code.trim().to_ascii_uppercase();
        if code.is_empty() {
            return Err(FamilyError::InvalidInviteCode);
        }

        let family = self
            .families
            .find_by_invite_code(&code)
            .await?
            .ok_or(FamilyError::InvalidInviteCode)?;

        if self.families.membership_for_user(&user.id).await?.is_some() {
            return Err(FamilyError::AlreadyInFamily);
        }

        let pool = self.registry.resolve(&family.id).await?;
        mirror_member(&pool, user, Role::Member, Utc::now()).await?;

        if let Err(e) = self.families.add_member(&family.id, &user.id, Role::Member).await {
            let current = self.families.membership_for_user(&user.id).await?;
            if current.as_ref().map(|m| m.family_id.as_str()) != Some(family.id.as_str()) {
                if let Err(cleanup) = unmirror_member(&pool, &user.id).await {
                    warn!(family_id = %family.id, user_id = %user.id, error = %cleanup, "Failed to remove member from tenant");
                }
            }
            if e.is_unique_violation() {
                return Err(FamilyError::AlreadyInFamily);
            }
            return Err(e.into());
        }

        self.push_to_sessions(&user.id, Some(&family.id), Some(Role::Member)).await;
        info!(family_id = %family.id, user_id = %user.id, "User joined family");
        Ok(family)
    }

    /// Sessions re-read membership at login, so a failed push is logged, not returned.
    async fn push_to_sessions(&self, user_id: &str, family_id: Option<&str>, role: Option<Role>) {
        if let Err(e) = self.auth.update_user_family_sessions(user_id, family_id, role).await {
            warn!(user_id, error = %e, "Failed to update active sessions after membership change");
        }
    }

    pub async fn leave_family(&self, user: &User) -> Result<(), FamilyError> {
        let membership = self
            .families
            .membership_for_user(&user.id)
            .await?
            .ok_or(FamilyError::NotInFamily)?;

        if membership.role() == Some(Role::Manager) {
            return Err(FamilyError::ManagerCannotLeave);
        }

        self.families.remove_member(&membership.family_id, &user.id).await?;

        // The mirror only gates new writes, so a stale row is logged rather than fatal
        let unmirrored = match self.registry.resolve(&membership.family_id).await {
            Ok(pool) => unmirror_member(&pool, &user.id).await,
            Err(e) => Err(e),
        };
        if let Err(e) = unmirrored {
            warn!(family_id = %membership.family_id, user_id = %user.id, error = %e, "Failed to remove member from tenant");
        }

        self.push_to_sessions(&user.id, None, None).await;
        info!(family_id = %membership.family_id, user_id = %user.id, "User left family");
        Ok(())
    }

    pub async fn get_family(&self, family_id: &str) -> Result<Family, FamilyError> {
        self.families
            .find_by_id(family_id)
            .await?
            .ok_or(FamilyError::FamilyNotFound)
    }

    pub async fn list_members(&self, family_id: &str) -> Result<Vec<FamilyMember>, FamilyError> {
        let members = self.families.list_members(family_id).await?;
        Ok(members
            .into_iter()
            .map(|(membership, user)| FamilyMember {
                user_id: user.id,
                name: user.name,
                email: user.email,
                role: membership.role,
                joined_at: membership.joined_at,
            })
            .collect())
    }

    /// Manager only. The tenant database goes first; memberships cascade with the family row.
    pub async fn delete_family(&self, user: &User) -> Result<(), FamilyError> {
        let membership = self
            .families
            .membership_for_user(&user.id)
            .await?
            .ok_or(FamilyError::NotInFamily)?;

        if membership.role() != Some(Role::Manager) {
            return Err(FamilyError::NotManager);
        }

        let members = self.families.list_members(&membership.family_id).await?;
        self.registry.delete(&membership.family_id).await?;

        for (member, _) in members {
            self.push_to_sessions(&member.user_id, None, None).await;
        }

        info!(family_id = %membership.family_id, user_id = %user.id, "Deleted family");
        Ok(())
    }

    async fn unused_invite_code(&self) -> Result<String, FamilyError> {
        for _ in 0..INVITE_CODE_ATTEMPTS {
            let code = generate_invite_code();
            if !self.families.invite_code_exists(&code).await? {
                return Ok(code);
            }
        }
        Err(DatabaseError::Conflict("could not allocate an invite code".to_string()).into())
    }
}

/// Releases a provisioned tenant database unless disarmed, including when the
/// owning future is dropped before the family row is committed.
struct ProvisionGuard {
    registry: Arc<TenantRegistry>,
    handle: Option<TenantHandle>,
}

impl ProvisionGuard {
    fn new(registry: Arc<TenantRegistry>, handle: TenantHandle) -> Self {
        Self {
            registry,
            handle: Some(handle),
        }
    }

    fn disarm(mut self) {
        self.handle = None;
    }

    async fn release(mut self) {
        if let Some(handle) = self.handle.take() {
            self.registry.release(&handle).await;
        }
    }
}

impl Drop for ProvisionGuard {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let registry = self.registry.clone();
                runtime.spawn(async move {
                    registry.release(&handle).await;
                });
            }
            Err(_) => {
                error!(family_id = %handle.family_id, database = %handle.database_name, "Abandoned tenant database left behind");
            }
        }
    }
}

async fn mirror_member(pool: &SqlitePool, user: &User, role: Role, joined_at: DateTime<Utc>) -> Result<(), DatabaseError> {
    sqlx::query("INSERT OR REPLACE INTO family_members (user_id, display_name, role, joined_at) VALUES (?, ?, ?, ?)")
        .bind(&user.id)
        .bind(&user.name)
        .bind(role.as_str())
        .bind(joined_at)
        .execute(pool)
        .await?;
    Ok(())
}

async fn unmirror_member(pool: &SqlitePool, user_id: &str) -> Result<(), DatabaseError> {
    sqlx::query("DELETE FROM family_members WHERE user_id = ?")
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(())
}

fn validate_name(name: &str) -> Result<String, FamilyError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(FamilyError::InvalidName("name is required".to_string()));
    }
    if name.chars().count() > MAX_FAMILY_NAME_LEN {
        return Err(FamilyError::InvalidName(format!(
            "name must be at most {} characters",
            MAX_FAMILY_NAME_LEN
        )));
    }
    Ok(name.to_string())
}

pub fn generate_invite_code() -> String {
    let mut rng = rand::thread_rng();
    (0..INVITE_CODE_LEN)
        .map(|_| INVITE_ALPHABET[rng.gen_range(0..INVITE_ALPHABET.len())] as char)
        .collect()
}
