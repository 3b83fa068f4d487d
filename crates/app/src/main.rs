use std::{net::SocketAddr, sync::Arc};

use tracing::{info, warn};

use paysync_app::{
    app_router, telemetry, AppState, HttpNotifier, LogNotifier, Notifier, Reconciler,
    RetryPolicy,
};
use paysync_mollie::{http_client, MollieClient};
use paysync_storage::Database;
use paysync_util::{load_env_file, AppConfig, WebhookVerification};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;

    if config.webhook == WebhookVerification::Bypassed {
        warn!(
            stage = "app",
            env = %config.environment.as_str(),
            "webhook signature verification is bypassed; never use this outside local development"
        );
    }

    let database = Database::connect(&config.database_url).await?;
    database.run_migrations().await?;

    let http = http_client(config.gateway_timeout)?;
    let gateway = MollieClient::new(
        config.gateway_api_key.expose(),
        config.gateway_base_url.clone(),
        http.clone(),
    );
    let notifier: Arc<dyn Notifier> = match &config.notify_relay_url {
        Some(url) => {
            info!(stage = "app", relay = %url, "notifications relayed over http");
            Arc::new(HttpNotifier::new(url.clone(), http))
        }
        None => Arc::new(LogNotifier),
    };

    let reconciler = Reconciler::new(
        database,
        Arc::new(gateway),
        notifier,
        RetryPolicy::new(config.gateway_max_retries),
    );
    let state = AppState::new(
        metrics,
        config.webhook.clone(),
        reconciler,
        config.admin_token.clone(),
    );

    let addr: SocketAddr = config.bind_addr;
    info!(stage = "app", %addr, env = %config.environment.as_str(), "starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app_router(state))
        .await
        .map_err(|err| err.into())
}
