//! Error taxonomy for registry queries and target file writes.

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Credentials rejected, or the session could not be recovered after one re-login.
    #[error("authentication failed: {reason}")]
    AuthFailure { reason: String },

    /// Connection failure, timeout or server-side unavailability.
    #[error("registry unreachable: {reason}")]
    RegistryUnreachable { reason: String },

    /// The service vanished between listing and the instance query.
    #[error("service not found: {service}")]
    ServiceNotFound { service: String },

    /// The registry answered with something we cannot interpret.
    #[error("invalid registry response: {reason}")]
    InvalidResponse { reason: String },

    #[error("failed to write {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize snapshot: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl Error {
    pub fn auth_failure(reason: impl Into<String>) -> Self {
        Self::AuthFailure {
            reason: reason.into(),
        }
    }

    pub fn unreachable(reason: impl Into<String>) -> Self {
        Self::RegistryUnreachable {
            reason: reason.into(),
        }
    }

    pub fn service_not_found(service: impl Into<String>) -> Self {
        Self::ServiceNotFound {
            service: service.into(),
        }
    }

    pub fn invalid_response(reason: impl Into<String>) -> Self {
        Self::InvalidResponse {
            reason: reason.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Maps a transport-level failure. Body decode errors are the registry's
    /// fault, everything else means we never got a usable answer.
    pub fn from_transport(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::invalid_response(err.to_string())
        } else if err.is_timeout() {
            Self::unreachable(format!("request timed out: {err}"))
        } else {
            Self::unreachable(err.to_string())
        }
    }
}
