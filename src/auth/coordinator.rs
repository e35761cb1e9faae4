use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};

use super::credentials::CredentialStore;
use super::refresh;
use super::types::{classify, FailureClass, RefreshState};
use crate::error::{ClientError, Result, TransportError};
use crate::http_client::Transport;
use crate::metrics::{MetricsSnapshot, RefreshMetrics};
use crate::models::{ApiRequest, ApiResponse, CredentialPair};
use crate::session::SessionOwner;

/// What a queued caller receives when the refresh resolves: the new access token or the failure
type RefreshOutcome = Result<String>;

/// State guarded by the coordinator lock
#[derive(Default)]
struct CoordinatorState {
    /// Default outgoing credential
    access_token: Option<String>,

    /// Bumped on every sign-out; work started under an older value is stale
    generation: u64,

    refresh: RefreshState,

    /// One slot per caller waiting on the in-flight refresh, the triggering caller included
    pending: Vec<oneshot::Sender<RefreshOutcome>>,
}

impl CoordinatorState {
    /// Forget the default credential and start a new session generation
    fn end_session(&mut self) {
        self.generation += 1;
        self.access_token = None;
    }
}

/// Wraps a transport with single-flight credential refresh
///
/// Requests rejected with an expired or invalid access token wait for one shared
/// refresh exchange and are replayed with the credential it produced. Failures a
/// refresh cannot fix end the session through the [`SessionOwner`].
///
/// The refresh exchange runs on its own task, so a caller that stops waiting does
/// not leave the coordinator stuck in `Refreshing`. A sign-out that happens while
/// the exchange is in flight wins: the refreshed pair is discarded.
#[derive(Clone)]
pub struct RefreshCoordinator {
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialStore>,
    session: Arc<dyn SessionOwner>,
    state: Arc<Mutex<CoordinatorState>>,
    refresh_timeout: Option<Duration>,
    metrics: Arc<RefreshMetrics>,
}

impl RefreshCoordinator {
    pub fn new(
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialStore>,
        session: Arc<dyn SessionOwner>,
        refresh_timeout: Option<Duration>,
    ) -> Self {
        Self {
            transport,
            credentials,
            session,
            state: Arc::new(Mutex::new(CoordinatorState::default())),
            refresh_timeout,
            metrics: Arc::new(RefreshMetrics::new()),
        }
    }

    /// Load the default outgoing credential from the store (process start)
    pub async fn load_access_token(&self) -> Result<Option<String>> {
        let token = self.credentials.get().await?.map(|pair| pair.access_token);
        self.state.lock().await.access_token = token.clone();

        match token {
            Some(_) => tracing::debug!("Loaded access token from store"),
            None => tracing::debug!("No stored credentials"),
        }

        Ok(token)
    }

    /// Persist a freshly issued pair and make it the default credential
    pub async fn install_credentials(&self, pair: &CredentialPair) -> Result<()> {
        self.credentials.set(pair).await?;
        self.state.lock().await.access_token = Some(pair.access_token.clone());
        Ok(())
    }

    /// Current default outgoing credential
    pub async fn access_token(&self) -> Option<String> {
        self.state.lock().await.access_token.clone()
    }

    pub async fn refresh_state(&self) -> RefreshState {
        self.state.lock().await.refresh
    }

    /// Callers waiting on the in-flight refresh
    pub async fn pending_len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// End the session: forget the default credential and notify the session owner
    pub async fn sign_out(&self) {
        self.state.lock().await.end_session();
        self.notify_sign_out().await;
    }

    /// Sign out unless the session already ended since `generation`
    async fn sign_out_once(&self, generation: u64) -> bool {
        {
            let mut state = self.state.lock().await;
            if state.generation != generation {
                return false;
            }
            state.end_session();
        }

        self.notify_sign_out().await;
        true
    }

    async fn notify_sign_out(&self) {
        self.metrics.record_sign_out();
        self.session.sign_out().await;
    }

    /// Send a request with the default credential, recovering from expired credentials
    pub async fn intercept(&self, request: ApiRequest) -> Result<ApiResponse> {
        let request_id = uuid::Uuid::new_v4().to_string()[..8].to_string();
        self.metrics.record_request();

        let (sent_with, generation) = {
            let state = self.state.lock().await;
            (state.access_token.clone(), state.generation)
        };
        let outgoing = match sent_with {
            Some(ref token) => request.with_bearer(token),
            None => request.clone(),
        };

        tracing::debug!(
            request_id = %request_id,
            method = %request.method,
            path = %request.path,
            "Intercepting request"
        );

        let err = match self.transport.send(&outgoing).await {
            Ok(response) => return Ok(response),
            Err(e) => e,
        };

        let result = self
            .recover(&request, sent_with, generation, err, &request_id)
            .await;

        if let Err(ref e) = result {
            self.metrics.record_failure(failure_kind(e));
        }

        result
    }

    async fn recover(
        &self,
        request: &ApiRequest,
        sent_with: Option<String>,
        generation: u64,
        err: TransportError,
        request_id: &str,
    ) -> Result<ApiResponse> {
        match classify(&err) {
            FailureClass::Transport => {
                tracing::debug!(request_id = %request_id, error = %err, "Passing through transport failure");
                return Err(ClientError::TransportFailure(err));
            }
            FailureClass::NonRecoverableAuth => {
                tracing::error!(
                    request_id = %request_id,
                    reason = err.payload().map(|p| p.reason_code.as_str()).unwrap_or_default(),
                    "Authentication rejected, signing out"
                );
                self.sign_out_once(generation).await;
                return Err(ClientError::NonRecoverableAuthFailure(err));
            }
            FailureClass::RecoverableAuth => {}
        }

        if self.state.lock().await.generation != generation {
            tracing::info!(request_id = %request_id, "Session ended while request was in flight");
            return Err(ClientError::SessionEnded);
        }

        tracing::warn!(
            request_id = %request_id,
            reason = err.payload().map(|p| p.reason_code.as_str()).unwrap_or_default(),
            path = %request.path,
            "Access token rejected, attempting recovery"
        );

        let renewal_token = match self.credentials.get().await {
            Ok(pair) => pair.map(|p| p.renewal_token),
            Err(e) => {
                tracing::warn!(request_id = %request_id, "Failed to read stored credentials: {}", e);
                None
            }
        };

        let Some(renewal_token) = renewal_token else {
            if !self.sign_out_once(generation).await {
                return Err(ClientError::SessionEnded);
            }
            tracing::error!(request_id = %request_id, "No renewal token stored, signed out");
            return Err(ClientError::MissingRenewalCredential(err));
        };

        let token = self
            .await_refresh(sent_with, generation, renewal_token, request_id)
            .await?;

        self.replay(request, &token, request_id).await
    }

    /// Start or join the refresh and wait for its access token
    async fn await_refresh(
        &self,
        sent_with: Option<String>,
        generation: u64,
        renewal_token: String,
        request_id: &str,
    ) -> RefreshOutcome {
        let rx = {
            let mut state = self.state.lock().await;

            if state.generation != generation {
                return Err(ClientError::SessionEnded);
            }

            if state.refresh == RefreshState::Idle {
                // A refresh finished while this request was in flight
                if let Some(ref current) = state.access_token {
                    if sent_with.as_deref() != Some(current.as_str()) {
                        tracing::debug!(
                            request_id = %request_id,
                            "Access token rotated while request was in flight, replaying"
                        );
                        return Ok(current.clone());
                    }
                }
            }

            let (tx, rx) = oneshot::channel();

            match state.refresh {
                RefreshState::Refreshing => {
                    state.pending.push(tx);
                    self.metrics.record_queued();
                    tracing::info!(
                        request_id = %request_id,
                        queued = state.pending.len(),
                        "Refresh in flight, queueing request"
                    );
                }
                RefreshState::Idle => {
                    state.refresh = RefreshState::Refreshing;
                    state.pending.push(tx);
                    tracing::info!(request_id = %request_id, "Starting token refresh");
                    tokio::spawn(self.clone().run_refresh(renewal_token, generation));
                }
            }

            rx
        };

        match rx.await {
            Ok(outcome) => outcome,
            // Only reachable if the refresh task panicked before draining
            Err(_) => Err(ClientError::RefreshExchangeFailed(TransportError::Network {
                kind: "refresh_aborted",
                message: "refresh ended without a result".to_string(),
            })),
        }
    }

    /// Perform the refresh exchange, then drain the queue and go back to idle
    ///
    /// The new pair is persisted and installed under the lock, and only if no
    /// sign-out happened since the refresh started.
    async fn run_refresh(self, renewal_token: String, generation: u64) {
        self.metrics.record_refresh();

        let exchange = refresh::refresh_credentials(
            self.transport.as_ref(),
            &renewal_token,
            self.refresh_timeout,
        )
        .await;

        let mut state = self.state.lock().await;

        let outcome: RefreshOutcome = if state.generation != generation {
            tracing::warn!("Session ended during token refresh, discarding result");
            Err(ClientError::SessionEnded)
        } else {
            match exchange {
                Ok(pair) => match self.credentials.set(&pair).await {
                    Ok(()) => {
                        state.access_token = Some(pair.access_token.clone());
                        Ok(pair.access_token)
                    }
                    Err(e) => {
                        tracing::error!("Failed to persist refreshed credentials: {}", e);
                        Err(e.into())
                    }
                },
                Err(e) => {
                    tracing::error!(error = %e, "Token refresh failed");
                    Err(ClientError::RefreshExchangeFailed(e))
                }
            }
        };

        // Ending the session here turns latecomers away before the store is cleared
        let ends_session = outcome.is_err() && state.generation == generation;
        if ends_session {
            state.end_session();
        }

        state.refresh = RefreshState::Idle;
        let pending = std::mem::take(&mut state.pending);
        drop(state);

        if outcome.is_err() {
            self.metrics.record_refresh_failure();
        }

        if ends_session {
            self.notify_sign_out().await;
        }

        tracing::info!(
            waiting = pending.len(),
            success = outcome.is_ok(),
            "Refresh complete, releasing queued requests"
        );

        for tx in pending {
            // Receiver gone means the caller stopped waiting
            let _ = tx.send(outcome.clone());
        }
    }

    /// Send the original request once more with the refreshed credential
    async fn replay(&self, request: &ApiRequest, token: &str, request_id: &str) -> Result<ApiResponse> {
        self.metrics.record_replay();
        tracing::debug!(request_id = %request_id, path = %request.path, "Replaying request");

        self.transport
            .send(&request.with_bearer(token))
            .await
            .map_err(|e| {
                tracing::warn!(request_id = %request_id, error = %e, "Replayed request failed");
                ClientError::TransportFailure(e)
            })
    }
}

/// Metrics label of a returned error
fn failure_kind(err: &ClientError) -> &'static str {
    match err {
        ClientError::TransportFailure(e) => e.kind(),
        ClientError::NonRecoverableAuthFailure(_) => "non_recoverable_auth",
        ClientError::MissingRenewalCredential(_) => "missing_renewal_credential",
        ClientError::RefreshExchangeFailed(_) => "refresh_exchange_failed",
        ClientError::SessionEnded => "session_ended",
        ClientError::CredentialStore(_) => "credential_store",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::credentials::StoredCredentials;
    use crate::auth::types::{TOKEN_EXPIRED, TOKEN_INVALID};
    use crate::error::ErrorPayload;
    use crate::models::UserProfile;
    use crate::session::Session;
    use crate::storage::MemoryStore;
    use futures::future::join_all;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::Notify;

    /// Transport that accepts a fixed set of access tokens
    #[derive(Default)]
    struct ScriptedTransport {
        valid_tokens: std::sync::Mutex<HashSet<String>>,
        /// Reason sent with 401s for unknown tokens
        reject_reason: std::sync::Mutex<String>,
        refresh_result: std::sync::Mutex<Option<std::result::Result<CredentialPair, TransportError>>>,
        /// Holds the refresh exchange open until notified
        refresh_gate: Option<Arc<Notify>>,
        refresh_calls: AtomicUsize,
        /// Keep refreshed tokens out of the accepted set
        reject_refreshed: AtomicBool,
        refresh_tokens_seen: std::sync::Mutex<Vec<String>>,
        sent: std::sync::Mutex<Vec<Option<String>>>,
    }

    impl ScriptedTransport {
        fn new(reason: &str) -> Self {
            let transport = Self::default();
            *transport.reject_reason.lock().unwrap() = reason.to_string();
            transport
        }

        fn gated(reason: &str, gate: Arc<Notify>) -> Self {
            Self {
                refresh_gate: Some(gate),
                ..Self::new(reason)
            }
        }

        fn refresh_ok(self, pair: CredentialPair) -> Self {
            *self.refresh_result.lock().unwrap() = Some(Ok(pair));
            self
        }

        fn refresh_err(self, err: TransportError) -> Self {
            *self.refresh_result.lock().unwrap() = Some(Err(err));
            self
        }

        fn refresh_calls(&self) -> usize {
            self.refresh_calls.load(Ordering::SeqCst)
        }

        fn sent_tokens(&self) -> Vec<Option<String>> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl Transport for ScriptedTransport {
        async fn send(
            &self,
            request: &ApiRequest,
        ) -> std::result::Result<ApiResponse, TransportError> {
            let token = request.bearer().map(str::to_string);
            self.sent.lock().unwrap().push(token.clone());

            if request.path == "/offline" {
                return Err(TransportError::Network {
                    kind: "connection_failed",
                    message: "connection refused".to_string(),
                });
            }

            let accepted = token
                .as_ref()
                .map(|t| self.valid_tokens.lock().unwrap().contains(t))
                .unwrap_or(false);

            if accepted {
                Ok(ApiResponse::new(
                    200,
                    format!("{}:{}", request.path, token.unwrap_or_default()),
                ))
            } else {
                Err(unauthorized(&self.reject_reason.lock().unwrap()))
            }
        }

        async fn refresh(
            &self,
            renewal_token: &str,
        ) -> std::result::Result<CredentialPair, TransportError> {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            self.refresh_tokens_seen
                .lock()
                .unwrap()
                .push(renewal_token.to_string());

            if let Some(ref gate) = self.refresh_gate {
                gate.notified().await;
            }

            let result = self
                .refresh_result
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_else(|| Err(unauthorized(TOKEN_INVALID)));

            if let (Ok(pair), false) = (&result, self.reject_refreshed.load(Ordering::SeqCst)) {
                self.valid_tokens
                    .lock()
                    .unwrap()
                    .insert(pair.access_token.clone());
            }
            result
        }
    }

    #[derive(Default)]
    struct CountingSession {
        sign_outs: AtomicUsize,
    }

    impl CountingSession {
        fn count(&self) -> usize {
            self.sign_outs.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl SessionOwner for CountingSession {
        async fn sign_out(&self) {
            self.sign_outs.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn unauthorized(reason: &str) -> TransportError {
        TransportError::Remote(ErrorPayload {
            status_code: 401,
            reason_code: reason.to_string(),
            message: reason.to_string(),
        })
    }

    struct Harness {
        coordinator: RefreshCoordinator,
        transport: Arc<ScriptedTransport>,
        credentials: Arc<StoredCredentials>,
        session: Arc<CountingSession>,
    }

    async fn harness(transport: ScriptedTransport, stored: Option<CredentialPair>) -> Harness {
        let transport = Arc::new(transport);
        let credentials = Arc::new(StoredCredentials::new(Arc::new(MemoryStore::new())));
        let session = Arc::new(CountingSession::default());

        if let Some(pair) = stored {
            credentials.set(&pair).await.unwrap();
        }

        let coordinator = RefreshCoordinator::new(
            transport.clone(),
            credentials.clone(),
            session.clone(),
            Some(Duration::from_secs(30)),
        );
        coordinator.load_access_token().await.unwrap();

        Harness {
            coordinator,
            transport,
            credentials,
            session,
        }
    }

    /// Coordinator wired to a real [`Session`] that clears the store on sign-out
    struct SessionHarness {
        coordinator: RefreshCoordinator,
        transport: Arc<ScriptedTransport>,
        credentials: Arc<StoredCredentials>,
        session: Arc<Session>,
    }

    async fn session_harness(transport: ScriptedTransport, stored: CredentialPair) -> SessionHarness {
        let transport = Arc::new(transport);
        let store = Arc::new(MemoryStore::new());
        let credentials = Arc::new(StoredCredentials::new(store.clone()));
        let session = Arc::new(Session::new(store, credentials.clone()));

        credentials.set(&stored).await.unwrap();
        session
            .set_user(UserProfile {
                id: "u1".to_string(),
                name: "Ana".to_string(),
                email: "ana@example.com".to_string(),
                avatar: None,
            })
            .await
            .unwrap();

        let coordinator = RefreshCoordinator::new(
            transport.clone(),
            credentials.clone(),
            session.clone(),
            Some(Duration::from_secs(30)),
        );
        coordinator.load_access_token().await.unwrap();

        SessionHarness {
            coordinator,
            transport,
            credentials,
            session,
        }
    }

    /// Wait until `n` callers are parked on the in-flight refresh
    async fn wait_for_pending(coordinator: &RefreshCoordinator, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while coordinator.pending_len().await < n {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("callers never queued");
    }

    #[tokio::test]
    async fn test_success_passes_through() {
        let transport = ScriptedTransport::new(TOKEN_EXPIRED);
        transport.valid_tokens.lock().unwrap().insert("a1".to_string());
        let h = harness(transport, Some(CredentialPair::new("a1", "r1"))).await;

        let response = h
            .coordinator
            .intercept(ApiRequest::get("/exercises"))
            .await
            .unwrap();

        assert_eq!(response.text(), "/exercises:a1");
        assert_eq!(h.transport.refresh_calls(), 0);
        assert_eq!(h.session.count(), 0);
    }

    #[tokio::test]
    async fn test_network_failure_passes_through() {
        let h = harness(
            ScriptedTransport::new(TOKEN_EXPIRED),
            Some(CredentialPair::new("a1", "r1")),
        )
        .await;

        let err = h
            .coordinator
            .intercept(ApiRequest::get("/offline"))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ClientError::TransportFailure(TransportError::Network { kind: "connection_failed", .. })
        ));
        assert_eq!(h.transport.refresh_calls(), 0);
        assert_eq!(h.session.count(), 0);
        assert_eq!(h.coordinator.access_token().await.as_deref(), Some("a1"));
    }

    #[tokio::test]
    async fn test_scenario_a_concurrent_expired_single_refresh() {
        let gate = Arc::new(Notify::new());
        let transport = ScriptedTransport::gated(TOKEN_EXPIRED, gate.clone())
            .refresh_ok(CredentialPair::new("a2", "r2"));
        let h = harness(transport, Some(CredentialPair::new("a1", "r1"))).await;

        let paths = ["/exercises", "/history", "/groups"];
        let calls = paths
            .iter()
            .map(|path| h.coordinator.intercept(ApiRequest::get(*path)));

        let release = async {
            wait_for_pending(&h.coordinator, 3).await;
            assert_eq!(
                h.coordinator.refresh_state().await,
                RefreshState::Refreshing
            );
            gate.notify_one();
        };

        let (results, ()) = tokio::join!(join_all(calls), release);

        for (result, path) in results.into_iter().zip(paths) {
            assert_eq!(result.unwrap().text(), format!("{}:a2", path));
        }

        assert_eq!(h.transport.refresh_calls(), 1);
        assert_eq!(
            h.transport.refresh_tokens_seen.lock().unwrap().as_slice(),
            ["r1".to_string()]
        );
        assert_eq!(
            h.credentials.get().await.unwrap(),
            Some(CredentialPair::new("a2", "r2"))
        );
        assert_eq!(h.coordinator.access_token().await.as_deref(), Some("a2"));
        assert_eq!(h.coordinator.refresh_state().await, RefreshState::Idle);
        assert_eq!(h.coordinator.pending_len().await, 0);
        assert_eq!(h.session.count(), 0);

        let metrics = h.coordinator.metrics();
        assert_eq!(metrics.refreshes, 1);
        assert_eq!(metrics.queued, 2);
        assert_eq!(metrics.replays, 3);
    }

    #[tokio::test]
    async fn test_many_concurrent_callers_share_one_refresh() {
        let gate = Arc::new(Notify::new());
        let transport = ScriptedTransport::gated(TOKEN_INVALID, gate.clone())
            .refresh_ok(CredentialPair::new("a2", "r2"));
        let h = harness(transport, Some(CredentialPair::new("a1", "r1"))).await;

        let calls = (0..25).map(|i| h.coordinator.intercept(ApiRequest::get(format!("/item/{}", i))));

        let release = async {
            wait_for_pending(&h.coordinator, 25).await;
            gate.notify_one();
        };

        let (results, ()) = tokio::join!(join_all(calls), release);

        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(h.transport.refresh_calls(), 1);

        // every replay used exactly the refreshed token
        let sent = h.transport.sent_tokens();
        assert_eq!(sent.len(), 50);
        assert_eq!(
            sent.iter().filter(|t| t.as_deref() == Some("a2")).count(),
            25
        );
    }

    #[tokio::test]
    async fn test_scenario_b_missing_renewal_credential() {
        let h = harness(ScriptedTransport::new(TOKEN_INVALID), None).await;

        let err = h
            .coordinator
            .intercept(ApiRequest::get("/exercises"))
            .await
            .unwrap_err();

        assert_eq!(
            err,
            ClientError::MissingRenewalCredential(unauthorized(TOKEN_INVALID))
        );
        assert_eq!(h.session.count(), 1);
        assert_eq!(h.transport.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn test_scenario_c_non_recoverable_auth() {
        let h = harness(
            ScriptedTransport::new("permission.denied"),
            Some(CredentialPair::new("a1", "r1")),
        )
        .await;

        let err = h
            .coordinator
            .intercept(ApiRequest::get("/admin"))
            .await
            .unwrap_err();

        assert_eq!(
            err,
            ClientError::NonRecoverableAuthFailure(unauthorized("permission.denied"))
        );
        assert_eq!(h.session.count(), 1);
        assert_eq!(h.transport.refresh_calls(), 0);
        assert_eq!(h.coordinator.access_token().await, None);
    }

    #[tokio::test]
    async fn test_scenario_d_refresh_failure_reaches_every_caller() {
        let gate = Arc::new(Notify::new());
        let refresh_error = unauthorized(TOKEN_INVALID);
        let transport = ScriptedTransport::gated(TOKEN_EXPIRED, gate.clone())
            .refresh_err(refresh_error.clone());
        let h = harness(transport, Some(CredentialPair::new("a1", "r1"))).await;

        let calls = ["/exercises", "/history", "/groups"]
            .into_iter()
            .map(|path| h.coordinator.intercept(ApiRequest::get(path)));

        let release = async {
            wait_for_pending(&h.coordinator, 3).await;
            gate.notify_one();
        };

        let (results, ()) = tokio::join!(join_all(calls), release);

        for result in results {
            assert_eq!(
                result.unwrap_err(),
                ClientError::RefreshExchangeFailed(refresh_error.clone())
            );
        }

        assert_eq!(h.transport.refresh_calls(), 1);
        assert_eq!(h.session.count(), 1);
        assert_eq!(h.coordinator.access_token().await, None);
        assert_eq!(h.coordinator.refresh_state().await, RefreshState::Idle);
        assert_eq!(h.coordinator.pending_len().await, 0);

        let metrics = h.coordinator.metrics();
        assert_eq!(metrics.refresh_failures, 1);
        assert_eq!(metrics.sign_outs, 1);
        assert_eq!(metrics.failures_by_kind.get("refresh_exchange_failed"), Some(&3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_timeout_releases_queued_callers() {
        // gate is never opened, so the exchange hangs
        let gate = Arc::new(Notify::new());
        let transport = ScriptedTransport::gated(TOKEN_EXPIRED, gate)
            .refresh_ok(CredentialPair::new("a2", "r2"));
        let h = harness(transport, Some(CredentialPair::new("a1", "r1"))).await;

        let results = join_all(
            ["/exercises", "/history"]
                .into_iter()
                .map(|path| h.coordinator.intercept(ApiRequest::get(path))),
        )
        .await;

        for result in results {
            match result.unwrap_err() {
                ClientError::RefreshExchangeFailed(e) => assert_eq!(e.kind(), "timeout"),
                other => panic!("unexpected error: {:?}", other),
            }
        }
        assert_eq!(h.session.count(), 1);
    }

    #[tokio::test]
    async fn test_stale_token_replays_without_refresh() {
        let transport = ScriptedTransport::new(TOKEN_EXPIRED);
        transport.valid_tokens.lock().unwrap().insert("a2".to_string());
        let h = harness(transport, Some(CredentialPair::new("a1", "r1"))).await;

        // A request sent with an older token finds "a1" already installed
        let token = h
            .coordinator
            .await_refresh(Some("a0".to_string()), 0, "r1".to_string(), "test")
            .await;
        assert_eq!(token.unwrap(), "a1");

        h.coordinator
            .install_credentials(&CredentialPair::new("a2", "r2"))
            .await
            .unwrap();
        let response = h
            .coordinator
            .recover(
                &ApiRequest::get("/exercises"),
                Some("a1".to_string()),
                0,
                unauthorized(TOKEN_EXPIRED),
                "test",
            )
            .await
            .unwrap();

        assert_eq!(response.text(), "/exercises:a2");
        assert_eq!(h.transport.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn test_sequential_refreshes_use_latest_renewal_token() {
        let transport = ScriptedTransport::new(TOKEN_EXPIRED)
            .refresh_ok(CredentialPair::new("a2", "r2"));
        let h = harness(transport, Some(CredentialPair::new("a1", "r1"))).await;

        h.coordinator
            .intercept(ApiRequest::get("/exercises"))
            .await
            .unwrap();

        // server revokes a2; next refresh must present r2
        h.transport.valid_tokens.lock().unwrap().clear();
        *h.transport.refresh_result.lock().unwrap() = Some(Ok(CredentialPair::new("a3", "r3")));

        let response = h
            .coordinator
            .intercept(ApiRequest::get("/exercises"))
            .await
            .unwrap();

        assert_eq!(response.text(), "/exercises:a3");
        assert_eq!(
            h.transport.refresh_tokens_seen.lock().unwrap().as_slice(),
            ["r1".to_string(), "r2".to_string()]
        );
        assert_eq!(h.transport.refresh_calls(), 2);
    }

    #[tokio::test]
    async fn test_replay_failure_is_not_reintercepted() {
        // refresh succeeds but the server keeps rejecting the new token
        let transport = ScriptedTransport::new(TOKEN_EXPIRED)
            .refresh_ok(CredentialPair::new("a2", "r2"));
        transport.reject_refreshed.store(true, Ordering::SeqCst);
        let h = harness(transport, Some(CredentialPair::new("a1", "r1"))).await;

        let err = h
            .coordinator
            .intercept(ApiRequest::get("/exercises"))
            .await
            .unwrap_err();

        assert_eq!(err, ClientError::TransportFailure(unauthorized(TOKEN_EXPIRED)));
        assert_eq!(h.transport.refresh_calls(), 1);
        assert_eq!(
            h.transport.sent_tokens(),
            vec![Some("a1".to_string()), Some("a2".to_string())]
        );
        assert_eq!(h.session.count(), 0);
    }

    #[tokio::test]
    async fn test_sign_out_during_refresh_discards_new_credentials() {
        let gate = Arc::new(Notify::new());
        let transport = ScriptedTransport::gated(TOKEN_EXPIRED, gate.clone())
            .refresh_ok(CredentialPair::new("a2", "r2"));
        let h = session_harness(transport, CredentialPair::new("a1", "r1")).await;

        let call = h.coordinator.intercept(ApiRequest::get("/exercises"));
        let sign_out_mid_refresh = async {
            wait_for_pending(&h.coordinator, 1).await;
            h.coordinator.sign_out().await;
            assert_eq!(h.credentials.get().await.unwrap(), None);
            gate.notify_one();
        };

        let (result, ()) = tokio::join!(call, sign_out_mid_refresh);

        assert_eq!(result.unwrap_err(), ClientError::SessionEnded);
        assert_eq!(h.transport.refresh_calls(), 1);
        assert_eq!(h.credentials.get().await.unwrap(), None);
        assert_eq!(h.coordinator.access_token().await, None);
        assert!(!h.session.is_signed_in());
        assert_eq!(h.coordinator.refresh_state().await, RefreshState::Idle);
        assert_eq!(h.coordinator.pending_len().await, 0);
        assert_eq!(h.coordinator.metrics().sign_outs, 1);

        // nothing sent with the discarded token
        assert_eq!(h.transport.sent_tokens(), vec![Some("a1".to_string())]);
    }

    #[tokio::test]
    async fn test_failures_after_failed_refresh_do_not_sign_out_again() {
        let transport = ScriptedTransport::new(TOKEN_EXPIRED).refresh_err(unauthorized(TOKEN_INVALID));
        let h = session_harness(transport, CredentialPair::new("a1", "r1")).await;

        let err = h
            .coordinator
            .intercept(ApiRequest::get("/exercises"))
            .await
            .unwrap_err();
        assert_eq!(err, ClientError::RefreshExchangeFailed(unauthorized(TOKEN_INVALID)));
        assert_eq!(h.credentials.get().await.unwrap(), None);
        assert!(!h.session.is_signed_in());

        // Requests sent with "a1" before the sign-out whose failures arrive after it
        let err = h
            .coordinator
            .recover(
                &ApiRequest::get("/history"),
                Some("a1".to_string()),
                0,
                unauthorized(TOKEN_EXPIRED),
                "test",
            )
            .await
            .unwrap_err();
        assert_eq!(err, ClientError::SessionEnded);

        let err = h
            .coordinator
            .recover(
                &ApiRequest::get("/admin"),
                Some("a1".to_string()),
                0,
                unauthorized("permission.denied"),
                "test",
            )
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ClientError::NonRecoverableAuthFailure(unauthorized("permission.denied"))
        );

        assert_eq!(h.transport.refresh_calls(), 1);
        assert_eq!(h.coordinator.metrics().sign_outs, 1);
    }

    #[tokio::test]
    async fn test_refresh_after_sign_in_again() {
        let transport = ScriptedTransport::new(TOKEN_EXPIRED).refresh_ok(CredentialPair::new("b2", "s2"));
        let h = session_harness(transport, CredentialPair::new("a1", "r1")).await;

        h.coordinator.sign_out().await;
        h.coordinator
            .install_credentials(&CredentialPair::new("b1", "s1"))
            .await
            .unwrap();

        let response = h
            .coordinator
            .intercept(ApiRequest::get("/exercises"))
            .await
            .unwrap();

        assert_eq!(response.text(), "/exercises:b2");
        assert_eq!(
            h.transport.refresh_tokens_seen.lock().unwrap().as_slice(),
            ["s1".to_string()]
        );
        assert_eq!(
            h.credentials.get().await.unwrap(),
            Some(CredentialPair::new("b2", "s2"))
        );
        assert_eq!(h.coordinator.metrics().sign_outs, 1);
    }
}
