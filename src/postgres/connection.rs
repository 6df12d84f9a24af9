// ABOUTME: Target database connection handling with optional TLS
// ABOUTME: Retries transient connection failures and never logs passwords

use crate::error::{Result, SyncError};
use crate::utils::{retry_with_backoff, strip_password_from_url};
use anyhow::Context;
use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use std::time::Duration;
use tokio_postgres::Client;

/// Connect to PostgreSQL, negotiating TLS when the server offers it.
///
/// `allow_self_signed` accepts invalid certificates and host names, for
/// development servers only. The connection task is spawned onto the
/// current runtime; errors on it are logged.
pub async fn connect(url: &str, allow_self_signed: bool) -> Result<Client> {
    let safe_url = strip_password_from_url(url);
    let config: tokio_postgres::Config = url.parse().map_err(|e| {
        SyncError::configuration(format!("Invalid database URL {}: {}", safe_url, e))
    })?;

    let (config, safe_url) = (&config, &safe_url);
    retry_with_backoff(
        || async move {
            let tls = TlsConnector::builder()
                .danger_accept_invalid_certs(allow_self_signed)
                .danger_accept_invalid_hostnames(allow_self_signed)
                .build()
                .context("Failed to build TLS connector")
                .map_err(SyncError::transport)?;

            tracing::debug!("Connecting to {}", safe_url);
            let (client, connection) = config
                .connect(MakeTlsConnector::new(tls))
                .await
                .with_context(|| format!("Failed to connect to {}", safe_url))
                .map_err(SyncError::transport)?;

            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    tracing::error!("PostgreSQL connection error: {}", e);
                }
            });

            Ok(client)
        },
        3,
        Duration::from_secs(1),
    )
    .await
}
