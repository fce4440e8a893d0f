// src/core/errors.rs

//! Defines the primary error type for the entire application.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within a plugin
/// process. Variants that cross the HTTP boundary map onto a small status
/// taxonomy through [`BeskarError::http_status`].
#[derive(Error, Debug)]
pub enum BeskarError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Precondition failed: {0}")]
    FailedPrecondition(String),

    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Waiting timeout for artifact '{0}'")]
    WaitingTimeout(String),

    #[error("Waiting interruption for artifact '{0}'")]
    WaitingInterruption(String),

    #[error("Manifest parse error: {0}")]
    ManifestParse(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Gossip error: {0}")]
    Gossip(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("HTTP client error: {0}")]
    HttpClientError(String),

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BeskarError {
    /// Maps the error taxonomy onto HTTP status codes for the
    /// repository-management API.
    pub fn http_status(&self) -> u16 {
        match self {
            BeskarError::InvalidArgument(_) | BeskarError::FailedPrecondition(_) => 400,
            BeskarError::Unauthorized(_) => 401,
            BeskarError::NotFound(_) => 404,
            BeskarError::AlreadyExists(_) => 409,
            BeskarError::Unavailable(_) | BeskarError::WaitingInterruption(_) => 503,
            BeskarError::WaitingTimeout(_) => 504,
            _ => 500,
        }
    }
}

// Manual implementation of Clone because `std::io::Error` is not cloneable.
// We wrap it in an Arc to allow for cheap, shared cloning; one processing
// outcome fans out to every sync-artifact waiter.
impl Clone for BeskarError {
    fn clone(&self) -> Self {
        match self {
            BeskarError::Io(e) => BeskarError::Io(Arc::clone(e)),
            BeskarError::InvalidArgument(s) => BeskarError::InvalidArgument(s.clone()),
            BeskarError::NotFound(s) => BeskarError::NotFound(s.clone()),
            BeskarError::AlreadyExists(s) => BeskarError::AlreadyExists(s.clone()),
            BeskarError::FailedPrecondition(s) => BeskarError::FailedPrecondition(s.clone()),
            BeskarError::Unavailable(s) => BeskarError::Unavailable(s.clone()),
            BeskarError::Unauthorized(s) => BeskarError::Unauthorized(s.clone()),
            BeskarError::WaitingTimeout(s) => BeskarError::WaitingTimeout(s.clone()),
            BeskarError::WaitingInterruption(s) => BeskarError::WaitingInterruption(s.clone()),
            BeskarError::ManifestParse(s) => BeskarError::ManifestParse(s.clone()),
            BeskarError::Storage(s) => BeskarError::Storage(s.clone()),
            BeskarError::Database(s) => BeskarError::Database(s.clone()),
            BeskarError::Migration(s) => BeskarError::Migration(s.clone()),
            BeskarError::Encoding(s) => BeskarError::Encoding(s.clone()),
            BeskarError::Gossip(s) => BeskarError::Gossip(s.clone()),
            BeskarError::Tls(s) => BeskarError::Tls(s.clone()),
            BeskarError::HttpClientError(s) => BeskarError::HttpClientError(s.clone()),
            BeskarError::Registry(s) => BeskarError::Registry(s.clone()),
            BeskarError::Internal(s) => BeskarError::Internal(s.clone()),
        }
    }
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for BeskarError {
    fn from(e: std::io::Error) -> Self {
        BeskarError::Io(Arc::new(e))
    }
}

impl From<reqwest::Error> for BeskarError {
    fn from(e: reqwest::Error) -> Self {
        BeskarError::HttpClientError(e.to_string())
    }
}

impl From<sqlx::Error> for BeskarError {
    fn from(e: sqlx::Error) -> Self {
        BeskarError::Database(e.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for BeskarError {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        BeskarError::Migration(e.to_string())
    }
}

impl From<serde_json::Error> for BeskarError {
    fn from(e: serde_json::Error) -> Self {
        BeskarError::ManifestParse(e.to_string())
    }
}

impl From<bincode::error::EncodeError> for BeskarError {
    fn from(e: bincode::error::EncodeError) -> Self {
        BeskarError::Encoding(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for BeskarError {
    fn from(e: bincode::error::DecodeError) -> Self {
        BeskarError::Encoding(e.to_string())
    }
}

impl From<rustls::Error> for BeskarError {
    fn from(e: rustls::Error) -> Self {
        BeskarError::Tls(e.to_string())
    }
}

impl From<rcgen::Error> for BeskarError {
    fn from(e: rcgen::Error) -> Self {
        BeskarError::Tls(e.to_string())
    }
}
