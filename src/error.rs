// Error handling module
// Defines the transport, storage and coordinator error types

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fallback message shown when the server gave no usable explanation
pub const GENERIC_USER_MESSAGE: &str = "Não foi possível completar a solicitação. Tente novamente mais tarde.";

/// Structured error produced by the remote service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub status_code: u16,
    pub reason_code: String,
    pub message: String,
}

/// Failures raised by a [`Transport`](crate::http_client::Transport)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The exchange never produced a response
    #[error("HTTP request failed: {message} (kind: {kind})")]
    Network { kind: &'static str, message: String },

    /// The service answered with an error status and an unstructured body
    #[error("API error: {status} - {body}")]
    Status { status: u16, body: String },

    /// The service answered with a structured error body
    #[error("API error: {} - {}", .0.status_code, .0.message)]
    Remote(ErrorPayload),

    /// A successful response could not be decoded
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl TransportError {
    /// Structured payload, present only when the remote service produced it
    pub fn payload(&self) -> Option<&ErrorPayload> {
        match self {
            TransportError::Remote(payload) => Some(payload),
            _ => None,
        }
    }

    /// Short label used for logging and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            TransportError::Network { kind, .. } => *kind,
            TransportError::Status { .. } => "status",
            TransportError::Remote(_) => "remote",
            TransportError::InvalidResponse(_) => "invalid_response",
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        TransportError::Network {
            kind: "timeout",
            message: message.into(),
        }
    }
}

/// Failures raised by the key-value stores
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage task failed: {0}")]
    Task(String),
}

/// Outcome of an intercepted request that did not succeed
///
/// Every variant keeps the underlying failure so callers can inspect it and
/// render it. The variants mirror how the coordinator classified the failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// Network or service failure unrelated to credentials, passed through untouched
    #[error(transparent)]
    TransportFailure(TransportError),

    /// Authentication was rejected for a reason a refresh cannot fix
    #[error("Authentication failed: {0}")]
    NonRecoverableAuthFailure(TransportError),

    /// The access credential expired and no renewal credential is stored
    #[error("No renewal credential available: {0}")]
    MissingRenewalCredential(TransportError),

    /// The renewal endpoint rejected the renewal credential
    #[error("Token refresh failed: {0}")]
    RefreshExchangeFailed(TransportError),

    /// The session was signed out while the request was waiting on a refresh
    #[error("Session ended before the request could be recovered")]
    SessionEnded,

    /// Credentials or profile could not be read or written
    #[error("Credential store error: {0}")]
    CredentialStore(String),
}

impl ClientError {
    /// Underlying transport failure, if the error carries one
    pub fn transport_error(&self) -> Option<&TransportError> {
        match self {
            ClientError::TransportFailure(e)
            | ClientError::NonRecoverableAuthFailure(e)
            | ClientError::MissingRenewalCredential(e)
            | ClientError::RefreshExchangeFailed(e) => Some(e),
            ClientError::SessionEnded | ClientError::CredentialStore(_) => None,
        }
    }

    /// Human-readable message for presentation
    pub fn user_message(&self) -> String {
        self.transport_error()
            .and_then(TransportError::payload)
            .map(|payload| payload.message.trim())
            .filter(|message| !message.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| GENERIC_USER_MESSAGE.to_string())
    }
}

impl From<StoreError> for ClientError {
    fn from(err: StoreError) -> Self {
        ClientError::CredentialStore(err.to_string())
    }
}

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(status: u16, reason: &str, message: &str) -> TransportError {
        TransportError::Remote(ErrorPayload {
            status_code: status,
            reason_code: reason.to_string(),
            message: message.to_string(),
        })
    }

    #[test]
    fn test_error_messages() {
        let err = TransportError::Network {
            kind: "timeout",
            message: "operation timed out".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "HTTP request failed: operation timed out (kind: timeout)"
        );

        let err = TransportError::Status {
            status: 502,
            body: "Bad Gateway".to_string(),
        };
        assert_eq!(err.to_string(), "API error: 502 - Bad Gateway");

        let err = remote(401, "token.expired", "token.expired");
        assert_eq!(err.to_string(), "API error: 401 - token.expired");
    }

    #[test]
    fn test_client_error_messages() {
        let err = ClientError::RefreshExchangeFailed(remote(401, "token.invalid", "token.invalid"));
        assert_eq!(
            err.to_string(),
            "Token refresh failed: API error: 401 - token.invalid"
        );

        let err = ClientError::TransportFailure(TransportError::Status {
            status: 500,
            body: "boom".to_string(),
        });
        assert_eq!(err.to_string(), "API error: 500 - boom");
    }

    #[test]
    fn test_payload_only_for_remote_errors() {
        assert!(remote(401, "token.expired", "expired").payload().is_some());
        assert!(TransportError::timeout("slow").payload().is_none());
        assert!(TransportError::Status {
            status: 401,
            body: String::new()
        }
        .payload()
        .is_none());
    }

    #[test]
    fn test_user_message_prefers_server_message() {
        let err = ClientError::NonRecoverableAuthFailure(remote(
            401,
            "permission.denied",
            "Você não tem permissão para acessar este recurso.",
        ));
        assert_eq!(
            err.user_message(),
            "Você não tem permissão para acessar este recurso."
        );
    }

    #[test]
    fn test_user_message_fallback() {
        let err = ClientError::TransportFailure(TransportError::timeout("slow"));
        assert_eq!(err.user_message(), GENERIC_USER_MESSAGE);

        let err = ClientError::TransportFailure(remote(500, "", "   "));
        assert_eq!(err.user_message(), GENERIC_USER_MESSAGE);

        let err = ClientError::CredentialStore("disk full".to_string());
        assert_eq!(err.user_message(), GENERIC_USER_MESSAGE);

        assert_eq!(ClientError::SessionEnded.user_message(), GENERIC_USER_MESSAGE);
        assert!(ClientError::SessionEnded.transport_error().is_none());
    }

    #[test]
    fn test_store_error_conversion() {
        let err: ClientError = StoreError::Task("join failed".to_string()).into();
        assert_eq!(
            err,
            ClientError::CredentialStore("Storage task failed: join failed".to_string())
        );
    }
}
