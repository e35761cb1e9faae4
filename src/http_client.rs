use anyhow::Context;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use crate::error::{ErrorPayload, TransportError};
use crate::models::{ApiRequest, ApiResponse, CredentialPair, RefreshRequest, RefreshResponse};

/// Path of the credential renewal endpoint
pub const REFRESH_PATH: &str = "/sessions/refresh-token";

/// Network exchange used by the coordinator
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Send a request exactly as given
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError>;

    /// Exchange a renewal credential for a new credential pair
    async fn refresh(&self, renewal_token: &str) -> Result<CredentialPair, TransportError>;
}

/// Error body returned by the API
#[derive(Deserialize)]
struct ApiErrorBody {
    message: String,
    #[serde(default)]
    code: Option<String>,
}

/// HTTP transport with retry logic
pub struct HttpTransport {
    /// Shared HTTP client with connection pooling
    client: Client,

    /// Base URL every request path is appended to
    base_url: String,

    /// Maximum number of retries
    max_retries: u32,

    /// Base delay for exponential backoff (milliseconds)
    base_delay_ms: u64,
}

impl HttpTransport {
    /// Create a new HTTP transport
    pub fn new(
        base_url: &str,
        max_connections: usize,
        connect_timeout: u64,
        request_timeout: u64,
        max_retries: u32,
    ) -> anyhow::Result<Self> {
        let user_agent = format!(
            "session-relay/{}-{}",
            env!("CARGO_PKG_VERSION"),
            get_machine_fingerprint()
        );

        let client = Client::builder()
            .pool_max_idle_per_host(max_connections)
            .connect_timeout(Duration::from_secs(connect_timeout))
            .timeout(Duration::from_secs(request_timeout))
            .user_agent(user_agent)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            max_retries,
            base_delay_ms: 500,
        })
    }

    /// Override the backoff base delay
    pub fn with_base_delay_ms(mut self, base_delay_ms: u64) -> Self {
        self.base_delay_ms = base_delay_ms;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    fn build(&self, request: &ApiRequest) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(request.method.clone(), self.url(&request.path))
            .headers(request.headers.clone());

        if let Some(ref body) = request.body {
            builder = builder.json(body);
        }

        builder
    }

    /// Execute a request, retrying 429, 5xx and network errors
    /// 401 is returned immediately; credential handling belongs to the coordinator
    async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError> {
        let mut attempt = 0;

        tracing::debug!(
            method = %request.method,
            path = %request.path,
            "Sending HTTP request"
        );

        loop {
            match self.build(request).send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        tracing::debug!(status = %status, "Request successful");
                        let headers = response.headers().clone();
                        let body = response.bytes().await.map_err(|e| TransportError::Network {
                            kind: "body_error",
                            message: e.to_string(),
                        })?;
                        return Ok(ApiResponse {
                            status: status.as_u16(),
                            headers,
                            body,
                        });
                    }

                    if matches!(status.as_u16(), 429 | 500..=599) && attempt < self.max_retries {
                        let delay = self.calculate_backoff_delay(attempt);
                        tracing::warn!(
                            "Received {}, retrying after {}ms (attempt {}/{})",
                            status,
                            delay,
                            attempt + 1,
                            self.max_retries
                        );

                        tokio::time::sleep(Duration::from_millis(delay)).await;
                        attempt += 1;
                        continue;
                    }

                    let error_text = response.text().await.unwrap_or_default();

                    tracing::debug!(
                        status = status.as_u16(),
                        path = %request.path,
                        response_body = %error_text,
                        attempt = attempt + 1,
                        "HTTP request failed with error response"
                    );

                    return Err(error_from_body(status.as_u16(), error_text));
                }

                Err(e) => {
                    let error_kind = categorize(&e);

                    tracing::warn!(
                        error_kind = error_kind,
                        error = %e,
                        path = %request.path,
                        attempt = attempt + 1,
                        "HTTP request error"
                    );

                    if attempt < self.max_retries {
                        let delay = self.calculate_backoff_delay(attempt);
                        tracing::warn!(
                            "Request failed: {}, retrying after {}ms (attempt {}/{})",
                            e,
                            delay,
                            attempt + 1,
                            self.max_retries
                        );

                        tokio::time::sleep(Duration::from_millis(delay)).await;
                        attempt += 1;
                        continue;
                    }

                    tracing::error!(
                        error_kind = error_kind,
                        path = %request.path,
                        total_attempts = attempt + 1,
                        "HTTP request failed after all retries"
                    );

                    return Err(TransportError::Network {
                        kind: error_kind,
                        message: e.to_string(),
                    });
                }
            }
        }
    }

    /// Calculate exponential backoff delay
    fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        // base_delay * 2^attempt, plus up to 10% jitter
        let delay = self.base_delay_ms * 2_u64.pow(attempt);
        let jitter = (delay as f64 * 0.1 * rand::random()) as u64;
        delay + jitter
    }
}

#[async_trait::async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError> {
        self.execute(request).await
    }

    async fn refresh(&self, renewal_token: &str) -> Result<CredentialPair, TransportError> {
        let request = ApiRequest::post(REFRESH_PATH).json(&RefreshRequest {
            refresh_token: renewal_token.to_string(),
        })?;

        let response = self.execute(&request).await?;
        let data: RefreshResponse = response.json()?;

        Ok(data.into())
    }
}

/// Turn an error response into a transport error, keeping the structured payload when present
fn error_from_body(status: u16, body: String) -> TransportError {
    match serde_json::from_str::<ApiErrorBody>(&body) {
        Ok(parsed) => TransportError::Remote(ErrorPayload {
            status_code: status,
            reason_code: parsed.code.unwrap_or_else(|| parsed.message.clone()),
            message: parsed.message,
        }),
        Err(_) => TransportError::Status { status, body },
    }
}

/// Categorize a reqwest error for logging
fn categorize(e: &reqwest::Error) -> &'static str {
    if e.is_timeout() {
        "timeout"
    } else if e.is_connect() {
        "connection_failed"
    } else if e.is_request() {
        "request_error"
    } else if e.is_body() {
        "body_error"
    } else if e.is_decode() {
        "decode_error"
    } else {
        "unknown"
    }
}

/// Get machine fingerprint for User-Agent
fn get_machine_fingerprint() -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    let mut hasher = DefaultHasher::new();
    hostname.hash(&mut hasher);
    format!("{:x}", hasher.finish())
}

// Simple random number generation for jitter
mod rand {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hash, Hasher};

    pub fn random() -> f64 {
        let state = RandomState::new();
        let mut hasher = state.build_hasher();
        std::time::SystemTime::now().hash(&mut hasher);
        (hasher.finish() % 1000) as f64 / 1000.0
    }
}
