// Token refresh exchange

use std::time::Duration;

use crate::error::TransportError;
use crate::http_client::Transport;
use crate::models::session::token_prefix;
use crate::models::CredentialPair;

/// Exchange a renewal credential for a new pair
///
/// With a timeout, an exchange that has not answered in time counts as failed.
pub async fn refresh_credentials(
    transport: &dyn Transport,
    renewal_token: &str,
    timeout: Option<Duration>,
) -> Result<CredentialPair, TransportError> {
    tracing::info!(
        renewal_token = %token_prefix(renewal_token),
        "Refreshing access token..."
    );

    let exchange = transport.refresh(renewal_token);
    let result = match timeout {
        Some(limit) => match tokio::time::timeout(limit, exchange).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::timeout(format!(
                "refresh exchange did not complete within {}s",
                limit.as_secs_f64()
            ))),
        },
        None => exchange.await,
    };

    let pair = result?;

    if pair.access_token.is_empty() || pair.renewal_token.is_empty() {
        return Err(TransportError::InvalidResponse(
            "Refresh response does not contain both tokens".to_string(),
        ));
    }

    tracing::info!(
        access_token = %token_prefix(&pair.access_token),
        "Access token refreshed"
    );

    Ok(pair)
}
