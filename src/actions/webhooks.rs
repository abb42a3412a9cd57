//! Provider webhook receivers.
//!
//! Each handler verifies the delivery, then hands it to [`process_delivery`],
//! which records it in the webhook ledger, skips it if an earlier delivery was
//! processed, and reconciles it. Verified deliveries are always answered 200;
//! failures are kept in the ledger rather than pushed back onto the provider.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use stripe::Webhook;
use tracing::{debug, error, info, warn};

use crate::billing_store::BillingStore;
use crate::coinbase_client::{CoinbaseWebhook, SIGNATURE_HEADER};
use crate::payment_events::PaymentEvent;
use crate::paypal_client::{PayPalWebhookEvent, WebhookHeaders};
use crate::reconciliation::reconcile;
use crate::stripe_client::payment_event_from_webhook;
use crate::subscriptions::PaymentProvider;
use crate::web::AppState;
use crate::webhook_events::NewWebhookEvent;

use super::{not_configured, provider_error_response};

fn signature_invalid(provider: PaymentProvider) -> Response {
    metrics::counter!(
        "billing.webhook.signature_invalid",
        "provider" => provider.as_str()
    )
    .increment(1);
    StatusCode::BAD_REQUEST.into_response()
}

/// A verified delivery, ready for the ledger
pub struct Delivery {
    pub provider: PaymentProvider,
    pub event_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    /// None for event types we do not act on
    pub event: Option<PaymentEvent>,
}

/// Ledger and reconcile one verified delivery
pub async fn process_delivery(store: &dyn BillingStore, delivery: Delivery) -> StatusCode {
    let Delivery {
        provider,
        event_id,
        event_type,
        payload,
        event,
    } = delivery;
    let start = std::time::Instant::now();

    match store.is_webhook_processed(provider, &event_id).await {
        Ok(true) => {
            debug!(provider = %provider, event_id = %event_id, "Webhook already processed");
            metrics::counter!("billing.webhook.duplicate", "provider" => provider.as_str())
                .increment(1);
            return StatusCode::OK;
        }
        Ok(false) => {}
        Err(e) => {
            error!(provider = %provider, error = %e, "Failed to check webhook idempotency");
        }
    }

    let new_event = NewWebhookEvent {
        provider,
        event_id: event_id.clone(),
        event_type: event_type.clone(),
        payload,
    };
    match store.record_webhook_event(new_event).await {
        Ok(true) => {}
        // Redelivery of an event that failed earlier
        Ok(false) => {
            info!(provider = %provider, event_id = %event_id, "Retrying recorded webhook event");
        }
        Err(e) => {
            warn!(provider = %provider, event_id = %event_id, error = %e, "Failed to record webhook event");
        }
    }

    let result = match event {
        Some(event) => reconcile(store, event, Utc::now()).await.map(|_| ()),
        None => {
            debug!(provider = %provider, event_type = %event_type, "Ignoring webhook event type");
            Ok(())
        }
    };

    match result {
        Ok(()) => {
            if let Err(e) = store.mark_webhook_processed(provider, &event_id).await {
                error!(provider = %provider, event_id = %event_id, error = %e, "Failed to mark webhook as processed");
            }
        }
        Err(e) => {
            if e.is_client_error() {
                warn!(provider = %provider, event_type = %event_type, event_id = %event_id, error = %e, "Dropping webhook event");
            } else {
                error!(provider = %provider, event_type = %event_type, event_id = %event_id, error = %e, "Failed to process webhook event");
            }
            if let Err(e2) = store
                .mark_webhook_failed(provider, &event_id, &e.to_string())
                .await
            {
                error!(provider = %provider, error = %e2, "Failed to mark webhook as failed");
            }
        }
    }

    let duration_ms = start.elapsed().as_millis() as f64;
    metrics::histogram!("billing.webhook.processing_ms", "provider" => provider.as_str())
        .record(duration_ms);

    StatusCode::OK
}

/// POST /stripe/webhook
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let provider = PaymentProvider::Stripe;
    let Some(stripe) = &state.stripe else {
        return not_configured(provider);
    };
    metrics::counter!("billing.webhook.received", "provider" => provider.as_str()).increment(1);

    let Some(signature) = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
    else {
        return signature_invalid(provider);
    };
    let Ok(payload) = std::str::from_utf8(&body) else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    let event = match Webhook::construct_event(payload, signature, &stripe.webhook_secret) {
        Ok(event) => event,
        Err(e) => {
            warn!(error = %e, "Invalid Stripe webhook signature");
            return signature_invalid(provider);
        }
    };

    let delivery = Delivery {
        provider,
        event_id: event.id.to_string(),
        event_type: event.type_.to_string(),
        payload: serde_json::from_str(payload).unwrap_or_default(),
        event: payment_event_from_webhook(&event),
    };
    process_delivery(state.store.as_ref(), delivery)
        .await
        .into_response()
}

/// POST /paypal/webhook
/// Authenticity is confirmed by PayPal's verify-webhook-signature API
pub async fn paypal_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let provider = PaymentProvider::PayPal;
    let Some(paypal) = &state.paypal else {
        return not_configured(provider);
    };
    metrics::counter!("billing.webhook.received", "provider" => provider.as_str()).increment(1);

    let Some(transmission) = WebhookHeaders::from_headers(&headers) else {
        return signature_invalid(provider);
    };
    let Ok(payload) = std::str::from_utf8(&body) else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    match paypal.verify_webhook_signature(&transmission, payload).await {
        Ok(true) => {}
        Ok(false) => {
            warn!(transmission_id = %transmission.transmission_id, "Invalid PayPal webhook signature");
            return signature_invalid(provider);
        }
        // Unverifiable for now; a 5xx makes PayPal redeliver
        Err(e) => return provider_error_response(&e),
    }

    let webhook: PayPalWebhookEvent = match serde_json::from_str(payload) {
        Ok(webhook) => webhook,
        Err(e) => {
            warn!(error = %e, "Malformed PayPal webhook body");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    let delivery = Delivery {
        provider,
        event: paypal.webhook_event(&webhook),
        event_id: webhook.id,
        event_type: webhook.event_type,
        payload: serde_json::from_str(payload).unwrap_or_default(),
    };
    process_delivery(state.store.as_ref(), delivery)
        .await
        .into_response()
}

/// POST /crypto/webhook
pub async fn coinbase_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let provider = PaymentProvider::Crypto;
    let Some(coinbase) = &state.coinbase else {
        return not_configured(provider);
    };
    metrics::counter!("billing.webhook.received", "provider" => provider.as_str()).increment(1);

    let Some(signature) = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
    else {
        return signature_invalid(provider);
    };
    if !coinbase.verify_webhook(&body, signature) {
        warn!("Invalid Coinbase Commerce webhook signature");
        return signature_invalid(provider);
    }

    let webhook: CoinbaseWebhook = match serde_json::from_slice(&body) {
        Ok(webhook) => webhook,
        Err(e) => {
            warn!(error = %e, "Malformed Coinbase Commerce webhook body");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    let delivery = Delivery {
        provider,
        event: webhook.payment_event(),
        event_id: webhook.event.id.clone(),
        event_type: webhook.event.event_type.clone(),
        payload: serde_json::from_slice(&body).unwrap_or_default(),
    };
    process_delivery(state.store.as_ref(), delivery)
        .await
        .into_response()
}
