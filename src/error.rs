//! Error types for Gatekeeper.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for Gatekeeper operations.
#[derive(Error, Debug)]
pub enum GatekeeperError {
    /// Missing or invalid configuration, raised at construction time.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The script executor could not complete a call.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Unlock attempted by a holder that does not own the lock.
    #[error("Lock '{lock}' is not held by {holder}")]
    NotHeld { lock: String, holder: String },

    /// A blocking lock wait was cancelled before the lock was acquired.
    #[error("Wait for lock '{lock}' was cancelled")]
    Cancelled { lock: String },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Gatekeeper operations.
pub type Result<T> = std::result::Result<T, GatekeeperError>;
