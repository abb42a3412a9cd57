use anyhow::Result;
use gallery_billing::auth::JwtService;
use gallery_billing::coinbase_client::CoinbaseClient;
use gallery_billing::metrics::start_metrics_server;
use gallery_billing::paypal_client::PayPalClient;
use gallery_billing::plans::PlanCatalog;
use gallery_billing::stripe_client::StripeConfig;
use gallery_billing::web::start_web_server;
use gallery_billing::{AppState, PgBillingStore, PgPool};
use std::sync::Arc;
use tracing::{error, info, warn};

use super::run_migrations;

/// Build a provider from the environment; a provider with missing settings is disabled
fn optional_provider<T>(name: &str, result: Result<T>) -> Option<T> {
    match result {
        Ok(provider) => {
            info!("{} payments enabled", name);
            Some(provider)
        }
        Err(e) => {
            warn!(error = %e, "{} payments disabled", name);
            None
        }
    }
}

pub async fn handle_serve(
    pool: PgPool,
    interface: String,
    port: u16,
    metrics_port: u16,
    base_url: String,
) -> Result<()> {
    run_migrations(&pool).await?;

    tokio::spawn(async move {
        if let Err(e) = start_metrics_server(metrics_port).await {
            error!(error = %e, "Metrics server stopped");
        }
    });

    let app_state = AppState {
        store: Arc::new(PgBillingStore::new(pool)),
        jwt: Arc::new(JwtService::from_env()?),
        stripe: optional_provider("Stripe", StripeConfig::from_env()),
        paypal: optional_provider("PayPal", PayPalClient::from_env()),
        coinbase: optional_provider("Coinbase Commerce", CoinbaseClient::from_env()),
        plans: PlanCatalog::from_env()?,
        base_url: base_url.trim_end_matches('/').to_string(),
    };

    start_web_server(interface, port, app_state).await
}
