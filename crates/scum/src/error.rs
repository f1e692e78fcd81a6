//! Error taxonomy shared by the bag, crypt, profile and mount layers

use thiserror::Error;

/// Result alias used throughout the library
pub type Result<T> = std::result::Result<T, Error>;

/// scum errors
#[derive(Error, Debug)]
pub enum Error {
    #[error("Unknown profile type: {0}")]
    UnknownType(String),

    #[error("Credential not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Decryption error: {0}")]
    Decryption(String),

    #[error("Mount error: {0}")]
    Mount(String),

    #[error("Issuer error: {0}")]
    Issuer(#[from] IssuerError),

    #[error("Invalid credential name: {0}")]
    InvalidName(String),

    #[error("Invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Invalid profile: {0}")]
    Profile(String),

    #[error("Prompt failed: {0}")]
    Prompt(String),
}

impl Error {
    /// Whether this error means no further entry of a batch can succeed
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Error::Authentication(_) | Error::InvalidKey(_) | Error::Prompt(_)
        )
    }
}

/// Failures talking to an issuing authority
#[derive(Error, Debug)]
pub enum IssuerError {
    #[error("request to {endpoint} failed: {reason}")]
    Transport { endpoint: String, reason: String },

    #[error("{code}: {message}")]
    Rejected { code: String, message: String },

    #[error("unexpected response from {endpoint}: {reason}")]
    Malformed { endpoint: String, reason: String },
}
