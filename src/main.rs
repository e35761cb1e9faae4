use anyhow::{Context, Result};
use dialoguer::Password;
use reqwest::Method;
use std::sync::Arc;

use session_relay::client::SessionClient;
use session_relay::config::{Command, Config, LogFormat};
use session_relay::http_client::HttpTransport;
use session_relay::models::ApiRequest;
use session_relay::storage::SqliteStore;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (for log level)
    let (config, command) = Config::load()?;
    config.validate()?;

    init_logging(&config);

    tracing::debug!(
        base_url = %config.api_base_url,
        store = %config.store_file.display(),
        "Configuration loaded"
    );

    let transport = Arc::new(HttpTransport::new(
        &config.api_base_url,
        config.http_max_connections,
        config.http_connect_timeout,
        config.http_request_timeout,
        config.http_max_retries,
    )?);

    let store = Arc::new(
        SqliteStore::open(&config.store_file).with_context(|| {
            format!(
                "Failed to open session store: {}",
                config.store_file.display()
            )
        })?,
    );

    let client = SessionClient::new(transport, store, config.refresh_timeout);
    let user = client.restore().await?;

    match command {
        Command::SignIn { email, password } => {
            let password = match password {
                Some(password) => password,
                None => Password::new()
                    .with_prompt("Password")
                    .interact()
                    .context("Failed to read password")?,
            };

            match client.sign_in(&email, &password).await {
                Ok(user) => println!("Signed in as {} <{}>", user.name, user.email),
                Err(e) => {
                    tracing::error!("Sign-in failed: {}", e);
                    anyhow::bail!(e.user_message());
                }
            }
        }

        Command::SignOut => {
            client.sign_out().await;
            println!("Signed out");
        }

        Command::Request { method, path, body } => {
            let method: Method = method
                .to_uppercase()
                .parse()
                .with_context(|| format!("Invalid HTTP method: {}", method))?;

            let mut request = ApiRequest::new(method, path);
            if let Some(body) = body {
                let value: serde_json::Value =
                    serde_json::from_str(&body).context("Request body is not valid JSON")?;
                request.body = Some(value);
            }

            match client.request(request).await {
                Ok(response) => {
                    tracing::debug!(status = response.status, "Request succeeded");
                    println!("{}", response.text());
                }
                Err(e) => {
                    tracing::error!("Request failed: {}", e);
                    anyhow::bail!(e.user_message());
                }
            }

            let metrics = client.metrics();
            tracing::debug!(
                refreshes = metrics.refreshes,
                replays = metrics.replays,
                sign_outs = metrics.sign_outs,
                "Coordinator activity"
            );
        }

        Command::Status => match user {
            Some(user) => {
                let has_token = client.coordinator().access_token().await.is_some();
                println!("Signed in as {} <{}>", user.name, user.email);
                println!(
                    "  Credentials: {}",
                    if has_token { "stored" } else { "missing" }
                );
                println!("  Store:       {}", config.store_file.display());
            }
            None => println!("Not signed in"),
        },
    }

    Ok(())
}

/// Initialize logging with the configured level and format
fn init_logging(config: &Config) {
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true);

    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}
