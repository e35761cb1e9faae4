// Credential persistence on top of the key-value store

use std::sync::Arc;

use crate::error::StoreError;
use crate::models::CredentialPair;
use crate::storage::KeyValueStore;

/// Storage key of the serialized credential pair
pub const AUTH_TOKEN_KEY: &str = "session:auth-token";

/// Durable storage of the current credential pair
#[async_trait::async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get(&self) -> Result<Option<CredentialPair>, StoreError>;

    async fn set(&self, pair: &CredentialPair) -> Result<(), StoreError>;

    async fn remove(&self) -> Result<(), StoreError>;
}

/// Credential pair kept as one JSON record in a [`KeyValueStore`]
#[derive(Clone)]
pub struct StoredCredentials {
    store: Arc<dyn KeyValueStore>,
}

impl StoredCredentials {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl CredentialStore for StoredCredentials {
    async fn get(&self) -> Result<Option<CredentialPair>, StoreError> {
        let Some(raw) = self.store.get(AUTH_TOKEN_KEY).await? else {
            return Ok(None);
        };

        // A record missing either token counts as no credentials at all
        let pair = match serde_json::from_str::<CredentialPair>(&raw) {
            Ok(pair) if !pair.access_token.is_empty() && !pair.renewal_token.is_empty() => pair,
            Ok(_) => {
                tracing::warn!("Stored credentials are incomplete, ignoring them");
                return Ok(None);
            }
            Err(e) => {
                tracing::warn!("Stored credentials are unreadable, ignoring them: {}", e);
                return Ok(None);
            }
        };

        Ok(Some(pair))
    }

    async fn set(&self, pair: &CredentialPair) -> Result<(), StoreError> {
        let raw = serde_json::to_string(pair)?;
        self.store.set(AUTH_TOKEN_KEY, &raw).await
    }

    async fn remove(&self) -> Result<(), StoreError> {
        self.store.remove(AUTH_TOKEN_KEY).await
    }
}
