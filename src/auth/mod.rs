// Authentication module
// Credential persistence, failure classification and the refresh coordinator

mod coordinator;
mod credentials;
mod refresh;
mod types;

pub use coordinator::RefreshCoordinator;
pub use credentials::{CredentialStore, StoredCredentials, AUTH_TOKEN_KEY};
pub use types::{classify, is_recoverable_reason, FailureClass, RefreshState, TOKEN_EXPIRED, TOKEN_INVALID};
