// Authentication types

use crate::error::TransportError;

/// Reason code sent when the access credential has expired
pub const TOKEN_EXPIRED: &str = "token.expired";

/// Reason code sent when the access credential cannot be parsed or verified
pub const TOKEN_INVALID: &str = "token.invalid";

/// Status the API uses for authentication failures
pub const UNAUTHORIZED: u16 = 401;

/// How an exchange failure is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Not an authentication problem; passed through untouched
    Transport,

    /// Authentication rejected for good (e.g. missing permission)
    NonRecoverableAuth,

    /// Access credential expired or invalid; a refresh may fix it
    RecoverableAuth,
}

/// Refresh lifecycle of a coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefreshState {
    #[default]
    Idle,
    Refreshing,
}

/// Whether a reason code means the access credential can be renewed
pub fn is_recoverable_reason(reason: &str) -> bool {
    reason == TOKEN_EXPIRED || reason == TOKEN_INVALID
}

/// Classify a transport failure
///
/// Only a structured 401 counts as an authentication failure. Network errors,
/// other statuses and unstructured bodies are plain transport failures.
pub fn classify(err: &TransportError) -> FailureClass {
    match err.payload() {
        Some(payload) if payload.status_code == UNAUTHORIZED => {
            if is_recoverable_reason(&payload.reason_code) {
                FailureClass::RecoverableAuth
            } else {
                FailureClass::NonRecoverableAuth
            }
        }
        _ => FailureClass::Transport,
    }
}
