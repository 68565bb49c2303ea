pub mod auth_service;
pub mod expense_service;
pub mod family_service;

pub use auth_service::{AuthError, AuthService, LoginResult, SessionCredential, ValidatedSession};
pub use expense_service::{ExpenseError, ExpenseService, NewExpense};
pub use family_service::{FamilyError, FamilyService};

use rand::RngCore;

/// Hex encoding of `len` bytes from the thread-local CSPRNG.
pub(crate) fn random_hex(len: usize) -> String {
    let mut buf = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut buf);
    buf.iter().map(|b| format!("{:02x}", b)).collect()
}

/// 128-bit random identifier used for users, families, sessions and tenant rows.
pub(crate) fn new_id() -> String {
    random_hex(16)
}
