//! Backend error types.
//!
//! Every variant maps to one terminal HTTP response.  The enum
//! implements [`axum::response::IntoResponse`] so handlers can simply
//! return `Err(BackendError::AuthorizationDenied { .. })`.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::authz::Action;
use crate::codec::CodecError;
use crate::lock::{LockConflict, LockRecord};

/// A failed call to an external collaborator (identity provider,
/// authorizer or object store).
///
/// When the collaborator answered with a structured status, that status
/// and message are forwarded to the client verbatim.  Transport failures
/// carry no status and surface as 500.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct CollaboratorError {
    pub status: Option<StatusCode>,
    pub message: String,
}

impl CollaboratorError {
    /// An error reported by the collaborator with a status code.
    pub fn with_status(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
        }
    }

    /// An error with no structured status (transport, decoding, local I/O).
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for CollaboratorError {
    fn from(e: reqwest::Error) -> Self {
        CollaboratorError::transport(e.to_string())
    }
}

/// Object store failures. "Not found" is kept apart because callers treat
/// it as control flow.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("state object {namespace}/{name} not found")]
    NotFound { namespace: String, name: String },

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),
}

/// Terminal outcomes of a state request other than success.
#[derive(Debug, Error)]
pub enum BackendError {
    /// No basic-auth credential was presented.
    #[error("authentication required")]
    AuthenticationMissing { realm: String },

    /// The identity provider did not accept the credential.
    #[error("credential rejected")]
    AuthenticationRejected,

    /// The authorizer refused the action.
    #[error("{action} access to {namespace}/{name} denied")]
    AuthorizationDenied {
        action: Action,
        namespace: String,
        name: String,
    },

    /// Bad path shape, unknown method, or unlock of a missing object.
    #[error("not found")]
    NotFound,

    /// A collaborator call failed.
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    /// Someone else holds the lock. A protocol outcome, not a fault.
    #[error("state is locked by {}", .0.id)]
    Locked(LockRecord),

    /// The payload could not be encoded or decoded.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The request body exceeded the configured limit.
    #[error("request body too large")]
    PayloadTooLarge,

    /// The request body could not be read or parsed.
    #[error("failed to read request body: {0}")]
    MalformedBody(String),

    /// Catch-all for unexpected internal errors.
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<LockConflict> for BackendError {
    fn from(conflict: LockConflict) -> Self {
        BackendError::Locked(conflict.0)
    }
}

impl From<StoreError> for BackendError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { .. } => BackendError::NotFound,
            StoreError::Collaborator(c) => BackendError::Collaborator(c),
        }
    }
}

impl BackendError {
    /// Return the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            BackendError::AuthenticationMissing { .. } => StatusCode::UNAUTHORIZED,
            BackendError::AuthenticationRejected => StatusCode::FORBIDDEN,
            BackendError::AuthorizationDenied { .. } => StatusCode::FORBIDDEN,
            BackendError::NotFound => StatusCode::NOT_FOUND,
            BackendError::Collaborator(e) => e.status.unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            BackendError::Locked(_) => StatusCode::LOCKED,
            BackendError::Codec(_) => StatusCode::INTERNAL_SERVER_ERROR,
            BackendError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            BackendError::MalformedBody(_) => StatusCode::INTERNAL_SERVER_ERROR,
            BackendError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short label used for the operation outcome metric.
    pub fn outcome(&self) -> &'static str {
        match self {
            BackendError::AuthenticationMissing { .. } => "unauthenticated",
            BackendError::AuthenticationRejected => "rejected",
            BackendError::AuthorizationDenied { .. } => "denied",
            BackendError::NotFound => "not_found",
            BackendError::Collaborator(_) => "collaborator_error",
            BackendError::Locked(_) => "locked",
            BackendError::Codec(_) => "codec_error",
            BackendError::PayloadTooLarge => "too_large",
            BackendError::MalformedBody(_) => "malformed",
            BackendError::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for BackendError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        match self {
            BackendError::AuthenticationMissing { realm } => {
                let challenge = HeaderValue::from_str(&format!("Basic realm=\"{realm}\""))
                    .unwrap_or_else(|_| HeaderValue::from_static("Basic"));
                (status, [(header::WWW_AUTHENTICATE, challenge)]).into_response()
            }
            BackendError::AuthenticationRejected
            | BackendError::AuthorizationDenied { .. }
            | BackendError::NotFound
            | BackendError::PayloadTooLarge => status.into_response(),
            BackendError::Locked(record) => {
                let body = serde_json::to_vec(&record).unwrap_or_default();
                (
                    status,
                    [(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))],
                    body,
                )
                    .into_response()
            }
            BackendError::Collaborator(e) if e.status.is_none() => status.into_response(),
            other => (status, other.to_string()).into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            BackendError::AuthenticationMissing { realm: "r".into() }.status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(BackendError::AuthenticationRejected.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(
            BackendError::Locked(LockRecord::default()).status_code(),
            StatusCode::LOCKED
        );
        assert_eq!(
            BackendError::PayloadTooLarge.status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            BackendError::MalformedBody("eof".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_collaborator_status_is_forwarded() {
        let err = BackendError::from(CollaboratorError::with_status(
            StatusCode::CONFLICT,
            "the object has been modified",
        ));
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
        assert_eq!(err.to_string(), "the object has been modified");

        let err = BackendError::from(CollaboratorError::transport("connection refused"));
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_store_not_found_maps_to_404() {
        let err = BackendError::from(StoreError::NotFound {
            namespace: "ns".into(),
            name: "n".into(),
        });
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_challenge_header() {
        let response = BackendError::AuthenticationMissing {
            realm: "Terraform".into(),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get(header::WWW_AUTHENTICATE).unwrap(),
            "Basic realm=\"Terraform\""
        );
    }
}
