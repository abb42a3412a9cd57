use anyhow::Result;
use axum::{
    Router,
    body::Body,
    http::Request,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
};
use diesel::PgConnection;
use diesel::r2d2::{ConnectionManager, Pool};
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use uuid::Uuid;

use crate::actions;
use crate::auth::JwtService;
use crate::billing_store::BillingStore;
use crate::coinbase_client::CoinbaseClient;
use crate::paypal_client::PayPalClient;
use crate::plans::PlanCatalog;
use crate::stripe_client::StripeConfig;

pub type PgPool = Pool<ConnectionManager<PgConnection>>;

/// Shared state for every handler. Providers missing from the environment are None
/// and their endpoints answer 503.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn BillingStore>,
    pub jwt: Arc<JwtService>,
    pub stripe: Option<StripeConfig>,
    pub paypal: Option<PayPalClient>,
    pub coinbase: Option<CoinbaseClient>,
    pub plans: PlanCatalog,
    /// Public origin of the web app, used for provider return URLs
    pub base_url: String,
}

// Middleware for request logging with correlation ID
async fn request_logging_middleware(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let request_id = Uuid::new_v4().to_string()[..8].to_string();
    let start_time = Instant::now();

    info!("Started {} {} [{}]", method, path, request_id);

    let response = next.run(request).await;
    let duration = start_time.elapsed();
    let status = response.status();

    metrics::histogram!(
        "http_request_duration_seconds",
        "method" => method.to_string(),
        "status" => status.as_u16().to_string()
    )
    .record(duration.as_secs_f64());

    info!(
        "Completed {} {} [{}] {} in {:.2}ms",
        method,
        path,
        request_id,
        status.as_u16(),
        duration.as_secs_f64() * 1000.0
    );

    response
}

// Middleware to capture HTTP errors to Sentry
async fn sentry_error_middleware(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();

    let response = next.run(request).await;

    if response.status().is_server_error() {
        let status = response.status();
        error!("HTTP {} error on {} {}", status.as_u16(), method, uri);

        sentry::configure_scope(|scope| {
            scope.set_tag("http.method", method.as_str());
            scope.set_tag("http.url", uri.path());
            scope.set_tag("http.status_code", status.as_u16().to_string());
        });

        sentry::capture_message(
            &format!("HTTP {} error on {} {}", status.as_u16(), method, uri.path()),
            sentry::Level::Error,
        );
    }

    response
}

/// The full application: `/api` routes plus logging, Sentry and CORS layers
pub fn build_router(app_state: AppState) -> Router {
    let api_router = Router::new()
        // Images
        .route(
            "/images",
            get(actions::images::list_images).post(actions::images::create_image),
        )
        .route("/images/{id}", get(actions::images::get_image))
        // Subscriptions and purchases
        .route(
            "/subscriptions/current",
            get(actions::subscriptions::get_current_subscription),
        )
        .route(
            "/subscriptions/cancel",
            post(actions::subscriptions::cancel_subscription),
        )
        .route("/purchases", get(actions::purchases::list_my_purchases))
        // Stripe
        .route(
            "/stripe/checkout",
            post(actions::stripe_payments::create_checkout),
        )
        .route(
            "/stripe/purchase",
            post(actions::stripe_payments::create_purchase_checkout),
        )
        .route("/stripe/activate", post(actions::stripe_payments::activate))
        .route("/stripe/webhook", post(actions::webhooks::stripe_webhook))
        // PayPal
        .route(
            "/paypal/subscriptions",
            post(actions::paypal_payments::create_subscription),
        )
        .route("/paypal/activate", post(actions::paypal_payments::activate))
        .route("/paypal/orders", post(actions::paypal_payments::create_order))
        .route("/paypal/capture", post(actions::paypal_payments::capture))
        .route("/paypal/webhook", post(actions::webhooks::paypal_webhook))
        // Coinbase Commerce
        .route(
            "/crypto/charges",
            post(actions::crypto_payments::create_charge),
        )
        .route("/crypto/activate", post(actions::crypto_payments::activate))
        .route("/crypto/webhook", post(actions::webhooks::coinbase_webhook))
        .with_state(app_state);

    Router::new()
        .nest("/api", api_router)
        .layer(middleware::from_fn(request_logging_middleware))
        .layer(middleware::from_fn(sentry_error_middleware))
        .layer(CorsLayer::permissive())
}

pub async fn start_web_server(interface: String, port: u16, app_state: AppState) -> Result<()> {
    sentry::configure_scope(|scope| {
        scope.set_tag("operation", "web-server");
    });
    info!(
        stripe = app_state.stripe.is_some(),
        paypal = app_state.paypal.is_some(),
        coinbase = app_state.coinbase.is_some(),
        "Starting web server on {}:{}",
        interface,
        port
    );

    let app = build_router(app_state);

    let listener = tokio::net::TcpListener::bind(format!("{}:{}", interface, port)).await?;
    info!("Web server listening on http://{}:{}", interface, port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received, stopping web server");
}
