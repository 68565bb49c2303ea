pub mod manager;
pub mod migrations;
pub mod models;
pub mod provider;
pub mod repository;

pub use manager::{DatabaseError, TenantHandle, TenantPool, TenantRegistry};
pub use migrations::{MigrationKind, MigrationOutcome, MigrationSet};
pub use provider::{DatabaseProvider, HttpProvider, LocalProvider, ProviderError};
pub use repository::{FamilyRepository, SessionRepository, UserRepository};
