// handlers/protected/mod.rs - Procedures that require a session

pub mod auth; // Logout, RefreshSession, ValidateSession
pub mod expense; // ExpenseService/*
pub mod family; // FamilyService/*
