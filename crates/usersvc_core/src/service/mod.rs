//! Use-case services.
//!
//! # Responsibility
//! - Orchestrate repository calls into use-case level APIs.
//! - Keep entry points decoupled from storage details.

pub mod user_service;
