//! services/billing/src/error.rs
//!
//! Defines the primary error type for the billing worker.

use crate::config::ConfigError;
use freelance_core::{BillingError, PortError};

/// The primary error type for the `billing` service.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Represents an error that occurred during configuration loading.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Represents an error that propagated up from one of the core service ports.
    #[error("Service Port Error: {0}")]
    Port(#[from] PortError),

    #[error("Billing Error: {0}")]
    Billing(#[from] BillingError),

    /// Represents an error from the underlying database library.
    #[error("Database Error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration Error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Scheduler Error: {0}")]
    Scheduler(#[from] tokio_cron_scheduler::JobSchedulerError),

    /// Represents a standard Input/Output error (e.g., creating the documents directory).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A catch-all for any other unexpected errors.
    #[error("An unexpected internal error occurred: {0}")]
    Internal(String),
}
