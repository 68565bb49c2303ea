use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::family::Role;

/// Login session. Sessions created before the token column existed carry a
/// numeric `id` and no `token_hash`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub family_id: Option<String>,
    pub role: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub user_agent: String,
    pub ip_address: String,
    #[serde(skip_serializing)]
    pub token_hash: Option<String>,
}

impl Session {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Family id, with an empty string treated as "no family".
    pub fn family_id(&self) -> Option<&str> {
        self.family_id.as_deref().filter(|id| !id.is_empty())
    }

    pub fn role(&self) -> Option<Role> {
        self.role.as_deref().and_then(|r| r.parse().ok())
    }
}
