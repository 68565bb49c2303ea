pub mod expense;
pub mod family;
pub mod session;
pub mod user;

pub use expense::{Category, Expense};
pub use family::{Family, FamilyMembership, Role};
pub use session::Session;
pub use user::User;
