//! crates/freelance_core/src/error.rs
//!
//! Errors returned by the billing services.

use crate::ports::PortError;

#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    /// Malformed input, rejected before anything is persisted.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A domain rule refuses the action, e.g. accepting an offer that was never sent.
    #[error("Action not permitted: {0}")]
    Forbidden(String),

    #[error("Service Port Error: {0}")]
    Port(#[from] PortError),
}

pub type BillingResult<T> = Result<T, BillingError>;
