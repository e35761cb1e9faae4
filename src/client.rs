// Client facade
// Wires transport, stores, session and coordinator together

use reqwest::Method;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::{CredentialStore, RefreshCoordinator, StoredCredentials};
use crate::error::{ClientError, Result};
use crate::http_client::Transport;
use crate::metrics::MetricsSnapshot;
use crate::models::{ApiRequest, ApiResponse, SignInRequest, SignInResponse, UserProfile};
use crate::session::Session;
use crate::storage::KeyValueStore;

/// Path of the sign-in endpoint
pub const SIGN_IN_PATH: &str = "/sessions";

/// Authenticated API client
///
/// Every request goes through the [`RefreshCoordinator`]; sign-in bypasses it
/// because there is no credential to recover yet.
#[derive(Clone)]
pub struct SessionClient {
    transport: Arc<dyn Transport>,
    session: Arc<Session>,
    coordinator: RefreshCoordinator,
}

impl SessionClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<dyn KeyValueStore>,
        refresh_timeout: Option<Duration>,
    ) -> Self {
        let credentials: Arc<dyn CredentialStore> = Arc::new(StoredCredentials::new(store.clone()));
        let session = Arc::new(Session::new(store, credentials.clone()));
        let coordinator =
            RefreshCoordinator::new(transport.clone(), credentials, session.clone(), refresh_timeout);

        Self {
            transport,
            session,
            coordinator,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.coordinator.metrics()
    }

    /// Restore user and default credential persisted by a previous process
    pub async fn restore(&self) -> Result<Option<UserProfile>> {
        let user = self.session.load_from_storage().await?;
        self.coordinator.load_access_token().await?;
        Ok(user)
    }

    /// Sign in with email and password, persisting the user and credential pair
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<UserProfile> {
        let request = ApiRequest::post(SIGN_IN_PATH)
            .json(&SignInRequest {
                email: email.to_string(),
                password: password.to_string(),
            })
            .map_err(ClientError::TransportFailure)?;

        let response = self
            .transport
            .send(&request)
            .await
            .map_err(ClientError::TransportFailure)?;

        let data: SignInResponse = response.json().map_err(ClientError::TransportFailure)?;

        self.coordinator.install_credentials(&data.credentials()).await?;
        self.session.set_user(data.user.clone()).await?;

        Ok(data.user)
    }

    /// Sign out and clear all stored session state
    pub async fn sign_out(&self) {
        self.coordinator.sign_out().await;
    }

    /// Send a request through the refresh coordinator
    pub async fn request(&self, request: ApiRequest) -> Result<ApiResponse> {
        self.coordinator.intercept(request).await
    }

    pub async fn get(&self, path: &str) -> Result<ApiResponse> {
        self.request(ApiRequest::get(path)).await
    }

    pub async fn post_json<T: Serialize>(&self, path: &str, body: &T) -> Result<ApiResponse> {
        self.send_json(Method::POST, path, body).await
    }

    pub async fn put_json<T: Serialize>(&self, path: &str, body: &T) -> Result<ApiResponse> {
        self.send_json(Method::PUT, path, body).await
    }

    async fn send_json<T: Serialize>(&self, method: Method, path: &str, body: &T) -> Result<ApiResponse> {
        let request = ApiRequest::new(method, path)
            .json(body)
            .map_err(ClientError::TransportFailure)?;
        self.request(request).await
    }
}
