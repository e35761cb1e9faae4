// Session owner
// Holds the signed-in user and clears all session state on sign-out

use std::sync::Arc;
use tokio::sync::{watch, RwLock};

use crate::auth::CredentialStore;
use crate::error::StoreError;
use crate::models::UserProfile;
use crate::storage::KeyValueStore;

/// Storage key of the serialized user profile
pub const USER_KEY: &str = "session:user";

/// Receiver of forced sign-outs
#[async_trait::async_trait]
pub trait SessionOwner: Send + Sync {
    /// End the session; must not fail
    async fn sign_out(&self);
}

/// Current user session backed by the key-value store
pub struct Session {
    /// Signed-in user, if any
    user: RwLock<Option<UserProfile>>,

    /// Profile persistence
    store: Arc<dyn KeyValueStore>,

    /// Credential persistence, cleared on sign-out
    credentials: Arc<dyn CredentialStore>,

    /// Publishes signed-in (true) / signed-out (false) transitions
    signed_in: watch::Sender<bool>,
}

impl Session {
    pub fn new(store: Arc<dyn KeyValueStore>, credentials: Arc<dyn CredentialStore>) -> Self {
        let (signed_in, _) = watch::channel(false);
        Self {
            user: RwLock::new(None),
            store,
            credentials,
            signed_in,
        }
    }

    /// Signed-in user
    pub async fn user(&self) -> Option<UserProfile> {
        self.user.read().await.clone()
    }

    pub fn is_signed_in(&self) -> bool {
        *self.signed_in.borrow()
    }

    /// Watch signed-in state changes
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.signed_in.subscribe()
    }

    /// Restore the user persisted by a previous process
    pub async fn load_from_storage(&self) -> Result<Option<UserProfile>, StoreError> {
        let user = match self.store.get(USER_KEY).await? {
            Some(raw) => match serde_json::from_str::<UserProfile>(&raw) {
                Ok(user) => Some(user),
                Err(e) => {
                    tracing::warn!("Stored user profile is unreadable, ignoring it: {}", e);
                    None
                }
            },
            None => None,
        };

        if let Some(ref user) = user {
            tracing::info!(user_id = %user.id, "Restored user session from storage");
        }

        *self.user.write().await = user.clone();
        self.signed_in.send_replace(user.is_some());

        Ok(user)
    }

    /// Persist and activate a signed-in user
    pub async fn set_user(&self, user: UserProfile) -> Result<(), StoreError> {
        let raw = serde_json::to_string(&user)?;
        self.store.set(USER_KEY, &raw).await?;

        tracing::info!(user_id = %user.id, "User signed in");

        *self.user.write().await = Some(user);
        self.signed_in.send_replace(true);
        Ok(())
    }
}

#[async_trait::async_trait]
impl SessionOwner for Session {
    async fn sign_out(&self) {
        let previous = self.user.write().await.take();

        if let Err(e) = self.store.remove(USER_KEY).await {
            tracing::error!("Failed to remove stored user profile: {}", e);
        }

        if let Err(e) = self.credentials.remove().await {
            tracing::error!("Failed to remove stored credentials: {}", e);
        }

        self.signed_in.send_replace(false);

        match previous {
            Some(user) => tracing::info!(user_id = %user.id, "User signed out"),
            None => tracing::info!("Session cleared"),
        }
    }
}
