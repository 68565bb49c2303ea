// handlers/public/mod.rs - Procedures on the public allowlist

pub mod auth; // Register, Login
pub mod health; // HealthService/Check
