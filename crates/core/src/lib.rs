//! Shared domain types for document tracking.
//!
//! This crate has zero internal deps so that both the tracker library and
//! the CLI can depend on it.

pub mod error;
pub mod status;
pub mod types;
