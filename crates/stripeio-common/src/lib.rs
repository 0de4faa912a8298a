//! StripeIO Common - Shared types and utilities
//!
//! This crate provides the identifiers, extent and buffer vectors, error
//! definitions and configuration used across all StripeIO components.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use types::*;
