use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::{new_id, random_hex};
use crate::database::manager::DatabaseError;
use crate::database::models::{Role, Session, User};
use crate::database::repository::{FamilyRepository, SessionRepository, UserRepository};

/// Sessions live this long after creation or the latest refresh.
pub const SESSION_TTL_HOURS: i64 = 24;

pub const MIN_PASSWORD_LEN: usize = 8;

const TOKEN_BYTES: usize = 32;

pub fn session_ttl() -> Duration {
    Duration::hours(SESSION_TTL_HOURS)
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Invalid email address")]
    InvalidEmail,

    #[error("Password must be at least 8 characters")]
    WeakPassword,

    #[error("A user with this email already exists")]
    UserExists,

    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error("Session is invalid or has expired")]
    InvalidSession,

    #[error("Missing required field: {0}")]
    MissingFields(String),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error("Password hashing failed: {0}")]
    Hashing(String),
}

impl AuthError {
    /// Stable code returned to clients in the application-level error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::InvalidEmail => "invalid_email",
            AuthError::WeakPassword => "weak_password",
            AuthError::UserExists => "user_exists",
            AuthError::InvalidCredentials => "invalid_credentials",
            AuthError::InvalidSession => "invalid_session",
            AuthError::MissingFields(_) => "missing_fields",
            AuthError::Database(_) | AuthError::Hashing(_) => "internal",
        }
    }

    /// Errors the caller caused, as opposed to infrastructure faults.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, AuthError::Database(_) | AuthError::Hashing(_))
    }
}

/// Credential presented by a client, parsed once at the transport boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCredential {
    /// Opaque session token.
    Token(String),
    /// A bare integer: try it as a token first, then as a pre-token numeric session id.
    TokenOrLegacyId { token: String, id: String },
}

impl SessionCredential {
    /// Parse an `Authorization` header value. The `Bearer ` prefix is optional.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let value = raw
            .strip_prefix("Bearer ")
            .or_else(|| raw.strip_prefix("bearer "))
            .unwrap_or(raw)
            .trim();

        if value.is_empty() {
            return None;
        }

        if value.parse::<u64>().is_ok() {
            Some(SessionCredential::TokenOrLegacyId {
                token: value.to_string(),
                id: value.to_string(),
            })
        } else {
            Some(SessionCredential::Token(value.to_string()))
        }
    }

    pub fn token(&self) -> &str {
        match self {
            SessionCredential::Token(token) => token,
            SessionCredential::TokenOrLegacyId { token, .. } => token,
        }
    }
}

/// A live session together with the user it belongs to.
#[derive(Debug, Clone, Serialize)]
pub struct ValidatedSession {
    pub session: Session,
    pub user: User,
}

impl ValidatedSession {
    pub fn family_id(&self) -> Option<&str> {
        self.session.family_id()
    }

    pub fn role(&self) -> Option<Role> {
        self.session.role()
    }
}

/// Outcome of a successful login. `token` is only ever returned here.
#[derive(Debug, Clone, Serialize)]
pub struct LoginResult {
    pub session: Session,
    pub token: String,
    pub user: User,
}

/// Registration, login and the session lifecycle against the master database.
#[derive(Clone)]
pub struct AuthService {
    users: UserRepository,
    families: FamilyRepository,
    sessions: SessionRepository,
    bcrypt_cost: u32,
    dummy_hash: Arc<OnceCell<String>>,
}

impl AuthService {
    pub fn new(master: SqlitePool, bcrypt_cost: u32) -> Self {
        Self {
            users: UserRepository::new(master.clone()),
            families: FamilyRepository::new(master.clone()),
            sessions: SessionRepository::new(master),
            bcrypt_cost,
            dummy_hash: Arc::new(OnceCell::new()),
        }
    }

    pub async fn register(&self, email: &str, name: &str, password: &str) -> Result<User, AuthError> {
        let email = normalize_email(email);
        let name = name.trim();

        if email.is_empty() {
            return Err(AuthError::MissingFields("email".to_string()));
        }
        if name.is_empty() {
            return Err(AuthError::MissingFields("name".to_string()));
        }
        if !email.contains('@') {
            return Err(AuthError::InvalidEmail);
        }
        if password.chars().count() < MIN_PASSWORD_LEN {
            return Err(AuthError::WeakPassword);
        }
        if self.users.email_exists(&email).await? {
            return Err(AuthError::UserExists);
        }

        let password_hash = hash_password(password.to_string(), self.bcrypt_cost).await?;
        let now = Utc::now();
        let user = User {
            id: new_id(),
            email,
            name: name.to_string(),
            password_hash,
            created_at: now,
            updated_at: now,
        };

        // A concurrent registration can still win the unique index
        match self.users.insert(&user).await {
            Ok(()) => {}
            Err(e) if e.is_unique_violation() => return Err(AuthError::UserExists),
            Err(e) => return Err(e.into()),
        }

        info!(user_id = %user.id, "Registered user");
        Ok(user)
    }

    pub async fn login(
        &self,
        email: &str,
        password: &str,
        user_agent: &str,
        ip_address: &str,
    ) -> Result<LoginResult, AuthError> {
        let email = normalize_email(email);
        if email.is_empty() {
            return Err(AuthError::MissingFields("email".to_string()));
        }
        if password.is_empty() {
            return Err(AuthError::MissingFields("password".to_string()));
        }

        let user = match self.users.find_by_email(&email).await? {
            Some(user) => user,
            None => {
                // Burn the same bcrypt time as a real mismatch
                let dummy = self.dummy_hash().await?;
                verify_password(password.to_string(), dummy).await?;
                return Err(AuthError::InvalidCredentials);
            }
        };

        if !verify_password(password.to_string(), user.password_hash.clone()).await? {
            return Err(AuthError::InvalidCredentials);
        }

        let membership = self.families.membership_for_user(&user.id).await?;
        let (family_id, role) = match membership {
            Some(m) => {
                let role = m.role();
                (Some(m.family_id), role)
            }
            None => (None, None),
        };

        let token = random_hex(TOKEN_BYTES);
        let now = Utc::now();
        let session = Session {
            id: new_id(),
            user_id: user.id.clone(),
            family_id,
            role: role.map(|r| r.as_str().to_string()),
            created_at: now,
            last_active: now,
            expires_at: now + session_ttl(),
            user_agent: user_agent.to_string(),
            ip_address: ip_address.to_string(),
            token_hash: Some(hash_token(&token)),
        };
        self.sessions.insert(&session).await?;

        info!(user_id = %user.id, session_id = %session.id, "Created session");
        Ok(LoginResult { session, token, user })
    }

    /// Validate whatever the client presented. Token lookup always goes first;
    /// the numeric id is only tried when the token is unknown.
    pub async fn validate_credential(&self, credential: &SessionCredential) -> Result<Option<ValidatedSession>, AuthError> {
        match credential {
            SessionCredential::Token(token) => self.validate_session_by_token(token).await,
            SessionCredential::TokenOrLegacyId { token, id } => {
                if let Some(validated) = self.validate_session_by_token(token).await? {
                    return Ok(Some(validated));
                }
                debug!("Token lookup failed, trying legacy session id");
                self.validate_session_by_id(id).await
            }
        }
    }

    pub async fn validate_session_by_token(&self, token: &str) -> Result<Option<ValidatedSession>, AuthError> {
        if token.is_empty() {
            return Ok(None);
        }

        let token_hash = hash_token(token);
        let session = match self.sessions.find_by_token_hash(&token_hash).await? {
            Some(session) => session,
            None => return Ok(None),
        };

        let stored = session.token_hash.as_deref().unwrap_or_default();
        if !bool::from(stored.as_bytes().ct_eq(token_hash.as_bytes())) {
            return Ok(None);
        }

        self.activate(session).await
    }

    pub async fn validate_session_by_id(&self, session_id: &str) -> Result<Option<ValidatedSession>, AuthError> {
        if session_id.is_empty() {
            return Ok(None);
        }

        match self.sessions.find_by_id(session_id).await? {
            Some(session) => self.activate(session).await,
            None => Ok(None),
        }
    }

    /// Shared tail of both lookup paths: purge if expired, otherwise bump activity.
    async fn activate(&self, mut session: Session) -> Result<Option<ValidatedSession>, AuthError> {
        let now = Utc::now();

        if session.is_expired_at(now) {
            self.sessions.delete(&session.id).await?;
            debug!(session_id = %session.id, "Purged expired session");
            return Ok(None);
        }

        match self.sessions.touch(&session.id, now).await {
            Ok(()) => session.last_active = now,
            Err(e) => warn!(session_id = %session.id, error = %e, "Failed to update session activity"),
        }

        let user = match self.users.find_by_id(&session.user_id).await? {
            Some(user) => user,
            None => return Ok(None),
        };

        Ok(Some(ValidatedSession { session, user }))
    }

    pub async fn refresh_session(&self, session_id: &str) -> Result<Session, AuthError> {
        let mut session = self
            .sessions
            .find_by_id(session_id)
            .await?
            .ok_or(AuthError::InvalidSession)?;

        let now = Utc::now();
        if session.is_expired_at(now) {
            return Err(AuthError::InvalidSession);
        }

        let expires_at = now + session_ttl();
        if !self.sessions.extend(session_id, now, expires_at).await? {
            return Err(AuthError::InvalidSession);
        }

        session.expires_at = expires_at;
        session.last_active = now;
        debug!(session_id, "Refreshed session");
        Ok(session)
    }

    /// Delete a session. Unknown ids are not an error.
    pub async fn logout(&self, session_id: &str) -> Result<(), AuthError> {
        if self.sessions.delete(session_id).await? {
            info!(session_id, "Session revoked");
        }
        Ok(())
    }

    /// Push a membership change into every unexpired session of the user.
    pub async fn update_user_family_sessions(
        &self,
        user_id: &str,
        family_id: Option<&str>,
        role: Option<Role>,
    ) -> Result<u64, AuthError> {
        let updated = self
            .sessions
            .update_family_for_user(user_id, family_id, role, Utc::now())
            .await?;
        debug!(user_id, updated, "Updated family on active sessions");
        Ok(updated)
    }

    pub async fn cleanup_expired_sessions(&self) -> Result<u64, AuthError> {
        Ok(self.sessions.delete_expired(Utc::now()).await?)
    }

    async fn dummy_hash(&self) -> Result<String, AuthError> {
        let cost = self.bcrypt_cost;
        let hash = self
            .dummy_hash
            .get_or_try_init(|| async move { hash_password(random_hex(16), cost).await })
            .await?;
        Ok(hash.clone())
    }
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// SHA-256 hex digest of a session token. Only the digest is persisted.
pub fn hash_token(token: &str) -> String {
    format!("{:x}", Sha256::digest(token.as_bytes()))
}

async fn hash_password(password: String, cost: u32) -> Result<String, AuthError> {
    tokio::task::spawn_blocking(move || bcrypt::hash(password, cost))
        .await
        .map_err(|e| AuthError::Hashing(e.to_string()))?
        .map_err(|e| AuthError::Hashing(e.to_string()))
}

async fn verify_password(password: String, hash: String) -> Result<bool, AuthError> {
    tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash))
        .await
        .map_err(|e| AuthError::Hashing(e.to_string()))?
        .map_err(|e| AuthError::Hashing(e.to_string()))
}

/// Session expiry for a given creation time.
pub fn expiry_for(created_at: DateTime<Utc>) -> DateTime<Utc> {
    created_at + session_ttl()
}
