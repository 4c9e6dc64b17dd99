//! Error types for the dashboard portal

use std::io;

use thiserror::Error;

use crate::credential::CredentialError;
use crate::data::FetchError;
use crate::oauth::AuthError;

/// Result type alias for the portal
pub type Result<T> = std::result::Result<T, Error>;

/// Portal errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (missing secret, invalid setting). Fatal at startup.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Identity provider rejected or failed an authorization step
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Remote blob metadata or content could not be fetched
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// Cloud credential could not be acquired
    #[error(transparent)]
    Credential(#[from] CredentialError),

    /// Dataset could not be interpreted
    #[error("Data error: {0}")]
    Data(String),

    /// Session store failure
    #[error("Session store error: {0}")]
    Session(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the error means the process must not start
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}
