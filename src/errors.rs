use std::io;

use crate::digest::DigestError;
use crate::reference::ParseError;

/// Errors reported by registry, layout and copy operations.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid reference: {0}")]
    Reference(#[from] ParseError),

    #[error(transparent)]
    Digest(#[from] DigestError),

    #[error("authentication failed for {host}")]
    Unauthorized { host: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("digest mismatch: expected {expected}, computed {computed}")]
    DigestMismatch { expected: String, computed: String },

    /// Missing or unusable headers on a manifest HEAD response.
    #[error("{0}")]
    ManifestHeader(String),

    /// Non-success HTTP status that is not mapped to a more specific kind.
    #[error("unexpected status {status} from {url}")]
    Status { status: u16, url: String },

    /// Network-level failure without an HTTP status.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("incompatible image layout version: {0}")]
    IncompatibleLayout(String),

    #[error("registry does not support delete")]
    DeleteNotSupported,

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// HTTP status code carried by this error, when it came from a response.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Error::Status { status, .. } => Some(*status),
            Error::Unauthorized { .. } => Some(401),
            Error::DeleteNotSupported => Some(405),
            _ => None,
        }
    }

    pub(crate) fn manifest_header(message: &str) -> Error {
        Error::ManifestHeader(message.to_owned())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
