use serde::{Deserialize, Serialize};

/// Access credential plus the renewal credential used to obtain the next one
///
/// Persisted as a single record, so a write either stores both tokens or none.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialPair {
    #[serde(rename = "token")]
    pub access_token: String,
    #[serde(rename = "refresh_token")]
    pub renewal_token: String,
}

impl CredentialPair {
    pub fn new(access_token: impl Into<String>, renewal_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            renewal_token: renewal_token.into(),
        }
    }
}

// Tokens are secrets, only a prefix is ever printed
impl std::fmt::Debug for CredentialPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialPair")
            .field("access_token", &token_prefix(&self.access_token))
            .field("renewal_token", &token_prefix(&self.renewal_token))
            .finish()
    }
}

/// First characters of a token, for log lines
pub fn token_prefix(token: &str) -> String {
    let prefix: String = token.chars().take(8).collect();
    format!("{}...", prefix)
}

/// Signed-in user as returned by the API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    pub name: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

/// `POST /sessions` body
#[derive(Debug, Serialize)]
pub struct SignInRequest {
    pub email: String,
    pub password: String,
}

/// `POST /sessions` response
#[derive(Debug, Deserialize)]
pub struct SignInResponse {
    pub user: UserProfile,
    pub token: String,
    pub refresh_token: String,
}

impl SignInResponse {
    pub fn credentials(&self) -> CredentialPair {
        CredentialPair::new(self.token.clone(), self.refresh_token.clone())
    }
}

/// `POST /sessions/refresh-token` body
#[derive(Debug, Serialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

/// `POST /sessions/refresh-token` response
#[derive(Deserialize)]
pub struct RefreshResponse {
    pub token: String,
    pub refresh_token: String,
}

impl From<RefreshResponse> for CredentialPair {
    fn from(data: RefreshResponse) -> Self {
        CredentialPair::new(data.token, data.refresh_token)
    }
}
