//! Error handling module for the image mover

use std::path::PathBuf;

use reqwest::StatusCode;
use thiserror::Error;

use crate::registry::RegistryError;

/// Errors that terminate a move run.
///
/// None of these are retried. Messages carry the offending field, URL, path
/// or underlying error, never a credential.
#[derive(Debug, Error)]
pub enum MoverError {
    #[error("invalid request: {field} {reason}")]
    InvalidRequest { field: &'static str, reason: String },

    #[error("{variable} not set")]
    MissingCredential { variable: &'static str },

    #[error("failed to download image from {url}")]
    DownloadFailed {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("download of {url} rejected with status {status}")]
    DownloadRejected { url: String, status: StatusCode },

    #[error("{}: illegal file path", path.display())]
    UnsafeArchivePath {
        path: PathBuf,
        /// Paths written before the offending entry was reached.
        extracted: Vec<PathBuf>,
    },

    #[error("failed to extract {}", path.display())]
    ArchiveExtraction {
        path: PathBuf,
        extracted: Vec<PathBuf>,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to load trust policy {}: {reason}", display_policy_path(path))]
    PolicyLoadError {
        path: Option<PathBuf>,
        reason: String,
    },

    #[error("{variable} env var not set")]
    MissingConfiguration { variable: &'static str },

    #[error("invalid image reference {reference}: {reason}")]
    InvalidReference { reference: String, reason: String },

    #[error("transfer to {destination} failed")]
    TransferFailed {
        destination: String,
        #[source]
        source: RegistryError,
    },

    #[error("scratch space error during {operation}")]
    Io {
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl MoverError {
    pub(crate) fn io(operation: &'static str, source: std::io::Error) -> Self {
        MoverError::Io { operation, source }
    }

    /// Whether the failure is the caller's fault rather than the system's.
    ///
    /// Front ends map this to a 4xx-style response or exit status.
    pub fn is_client_fault(&self) -> bool {
        matches!(self, MoverError::InvalidRequest { .. })
    }
}

fn display_policy_path(path: &Option<PathBuf>) -> String {
    match path {
        Some(path) => path.display().to_string(),
        None => "<built-in default>".to_string(),
    }
}

pub type Result<T> = std::result::Result<T, MoverError>;
