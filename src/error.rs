//! Error types for repman.
//!
//! A single [`RepmanError`] covers every cluster-level operation, with a
//! [`Result`] alias used throughout the crate. The database access layer has
//! its own taxonomy ([`crate::db::DbError`]) which converts into
//! [`RepmanError::Database`] at the seam.

use std::io;
use thiserror::Error;

use crate::db::DbError;

/// Main error type for repman operations.
#[derive(Error, Debug)]
pub enum RepmanError {
    // Topology errors
    #[error("No master elected in cluster")]
    NoMaster,

    #[error("Multiple masters found in single-master topology: {count}")]
    MultipleMasters { count: usize },

    #[error("Environment already has an existing master/slave setup")]
    AlreadyBootstrapped,

    #[error("Topology error: {0}")]
    Topology(String),

    // Failover gate
    #[error("A failover or exclusive cluster operation is already in progress")]
    FailoverInProgress,

    #[error("No valid candidate slave for promotion")]
    NoCandidate,

    #[error("Preferred master could not be found in declared servers")]
    PreferredMasterNotFound,

    // Server errors
    #[error("Server not found: {0}")]
    ServerNotFound(String),

    #[error("Cannot operate on failed server: {0}")]
    ServerFailed(String),

    #[error("Server has no database connection: {0}")]
    NotConnected(String),

    // Bounded waits
    #[error("Waiting too long {0}")]
    WaitTimeout(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    // Collaborator errors
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Orchestrator error: {0}")]
    Orchestrator(String),

    #[error("Agent check failed: {0}")]
    Agent(String),

    // External errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RepmanError {
    /// Check whether the operation that produced this error may be retried
    /// on a later monitoring tick.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RepmanError::FailoverInProgress
                | RepmanError::WaitTimeout(_)
                | RepmanError::NotConnected(_)
                | RepmanError::Database(DbError::Connection(_))
        )
    }
}

/// Result type alias for repman operations.
pub type Result<T> = std::result::Result<T, RepmanError>;
