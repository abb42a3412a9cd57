use anyhow::{Context, Result};
use axum::{Router, http::StatusCode, response::IntoResponse, routing::get};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tracing::info;

use crate::subscriptions::PaymentProvider;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder.
/// Returns a handle that can be used to render metrics for scraping
pub fn init_metrics() -> Result<PrometheusHandle> {
    PrometheusBuilder::new()
        // Buckets: 1ms, 5ms, 10ms, 25ms, 50ms, 100ms, 250ms, 500ms, 1s, 2.5s, 5s, 10s
        .set_buckets_for_metric(
            Matcher::Full("http_request_duration_seconds".to_string()),
            &[
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ],
        )
        .context("failed to set buckets for http_request_duration_seconds")?
        .install_recorder()
        .context("failed to install Prometheus recorder")
}

async fn render_metrics() -> impl IntoResponse {
    match METRICS_HANDLE.get() {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            "Metrics not initialized".to_string(),
        ),
    }
}

/// Background task to update process metrics
/// Updates uptime and memory usage metrics every 5 seconds
pub async fn process_metrics_task() {
    let start_time = Instant::now();

    loop {
        metrics::gauge!("process.uptime.seconds").set(start_time.elapsed().as_secs() as f64);
        metrics::gauge!("process.is_up").set(1.0);

        #[cfg(target_os = "linux")]
        {
            if let Ok(status) = std::fs::read_to_string("/proc/self/status")
                && let Some(line) = status.lines().find(|l| l.starts_with("VmRSS:"))
                && let Some(kb_str) = line.split_whitespace().nth(1)
                && let Ok(kb) = kb_str.parse::<f64>()
            {
                metrics::gauge!("process.memory.bytes").set(kb * 1024.0);
            }
        }

        tokio::time::sleep(Duration::from_secs(5)).await;
    }
}

/// Register billing metrics at zero so dashboards show them before the first event
pub fn initialize_billing_metrics() {
    for provider in [
        PaymentProvider::Stripe,
        PaymentProvider::PayPal,
        PaymentProvider::Crypto,
    ] {
        let provider = provider.as_str();
        metrics::counter!("billing.webhook.received", "provider" => provider).absolute(0);
        metrics::counter!("billing.webhook.duplicate", "provider" => provider).absolute(0);
        metrics::counter!("billing.webhook.signature_invalid", "provider" => provider)
            .absolute(0);
        metrics::counter!("billing.checkout.created", "provider" => provider).absolute(0);
        metrics::counter!("billing.provider.errors", "provider" => provider).absolute(0);
        metrics::counter!("billing.reconcile.rejected", "provider" => provider).absolute(0);
    }
    metrics::counter!("billing.subscriptions.expired").absolute(0);
}

/// Start a standalone metrics server on the specified port
pub async fn start_metrics_server(port: u16) -> Result<()> {
    let handle = init_metrics()?;
    if METRICS_HANDLE.set(handle).is_err() {
        anyhow::bail!("Metrics handle already initialized");
    }
    initialize_billing_metrics();

    tokio::spawn(process_metrics_task());

    let app = Router::new().route("/metrics", get(render_metrics));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting metrics server on http://{}/metrics", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind metrics server")?;
    axum::serve(listener, app)
        .await
        .context("Metrics server failed")
}
