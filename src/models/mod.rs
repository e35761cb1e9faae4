// Data models for requests, responses and session payloads

pub mod api;
pub mod session;

pub use api::{ApiRequest, ApiResponse};
pub use session::{CredentialPair, RefreshRequest, RefreshResponse, SignInRequest, SignInResponse, UserProfile};
