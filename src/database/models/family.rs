use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;

/// Role a user holds inside a family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Manager,
    Member,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Manager => "manager",
            Role::Member => "member",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manager" => Ok(Role::Manager),
            "member" => Ok(Role::Member),
            other => Err(format!("unknown role '{}'", other)),
        }
    }
}

/// Family row in the master database. `database_url` and `schema_version`
/// are the durable half of the tenant registry.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Family {
    pub id: String,
    pub name: String,
    pub invite_code: String,
    pub database_name: String,
    #[serde(skip_serializing)]
    pub database_url: String,
    pub manager_id: String,
    pub schema_version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct FamilyMembership {
    pub family_id: String,
    pub user_id: String,
    pub role: String,
    pub joined_at: DateTime<Utc>,
}

impl FamilyMembership {
    pub fn role(&self) -> Option<Role> {
        self.role.parse().ok()
    }
}
