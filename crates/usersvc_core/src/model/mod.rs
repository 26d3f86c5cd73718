//! Domain model of the users service.
//!
//! # Invariants
//! - Users are soft-deleted through `is_deleted`, never removed.

pub mod user;
