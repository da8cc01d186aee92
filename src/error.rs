//! Error types shared by the controller client, state bridge, providers and
//! node agents.

use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Main error type for fog-kubelet operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error that has no more specific mapping
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// The requested object does not exist (remote or in Kubernetes)
    #[error("not found: {0}")]
    NotFound(String),

    /// A Kubernetes object with the same name is already present
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// A write lost an optimistic concurrency race
    #[error("conflict: {0}")]
    Conflict(String),

    /// Malformed input, e.g. an undecodable workload annotation
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The fleet controller could not be reached
    #[error("controller unavailable: {0}")]
    Unavailable(String),

    /// The fleet controller answered with a non-success status
    #[error("controller returned {status}: {message}")]
    Controller { status: u16, message: String },

    /// A persisted state entry could not be decoded
    #[error("state corruption: {0}")]
    Corruption(String),

    /// Encoding or decoding of a payload failed
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn corruption(msg: impl Into<String>) -> Self {
        Self::Corruption(msg.into())
    }

    /// Map a Kubernetes API error about `what`, lifting 404 and 409 into
    /// their own variants.
    pub fn from_kube(err: kube::Error, what: &str) -> Self {
        match &err {
            kube::Error::Api(resp) if resp.code == 404 => Self::NotFound(what.to_string()),
            kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
                Self::AlreadyExists(what.to_string())
            }
            kube::Error::Api(resp) if resp.code == 409 => {
                Self::Conflict(format!("{}: {}", what, resp.message))
            }
            _ => Self::Kube(err),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Only transport failures are worth retrying: any HTTP answer from the
    /// controller is definitive.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    /// HTTP status used when this error is reported by the control server
    pub fn status_code(&self) -> u16 {
        match self {
            Self::NotFound(_) => 404,
            Self::InvalidArgument(_) => 400,
            Self::AlreadyExists(_) | Self::Conflict(_) => 409,
            Self::Unavailable(_) => 503,
            Self::Controller { status, .. } => *status,
            _ => 500,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::error::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: reason.to_string(),
            code,
        })
    }

    #[test]
    fn kube_errors_are_lifted_by_status_code() {
        assert!(Error::from_kube(api_error(404, "NotFound"), "node/a").is_not_found());
        assert!(matches!(
            Error::from_kube(api_error(409, "AlreadyExists"), "node/a"),
            Error::AlreadyExists(_)
        ));
        assert!(matches!(
            Error::from_kube(api_error(409, "Conflict"), "node/a"),
            Error::Conflict(_)
        ));
        assert!(matches!(
            Error::from_kube(api_error(500, "InternalError"), "node/a"),
            Error::Kube(_)
        ));
    }

    #[test]
    fn only_unavailable_is_transient() {
        assert!(Error::unavailable("connection refused").is_transient());
        assert!(!Error::not_found("agents/a").is_transient());
        assert!(!Error::Controller {
            status: 500,
            message: "Internal Server Error".to_string()
        }
        .is_transient());
    }

    #[test]
    fn status_codes_follow_the_error_kind() {
        assert_eq!(Error::not_found("x").status_code(), 404);
        assert_eq!(Error::invalid_argument("x").status_code(), 400);
        assert_eq!(Error::unavailable("x").status_code(), 503);
        assert_eq!(Error::corruption("x").status_code(), 500);
        assert_eq!(
            Error::Controller {
                status: 502,
                message: "Bad Gateway".to_string()
            }
            .status_code(),
            502
        );
    }
}
