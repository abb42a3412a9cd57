pub mod crypto_payments;
pub mod images;
pub mod paypal_payments;
pub mod purchases;
pub mod stripe_payments;
pub mod subscriptions;
pub mod webhooks;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};
use uuid::Uuid;

use crate::billing_store::BillingStore;
use crate::images::Image;
use crate::payment_events::PaymentEvent;
use crate::provider_error::ProviderError;
use crate::purchases::Purchase;
use crate::reconciliation::{ReconcileError, ReconcileOutcome, reconcile};
use crate::subscriptions::PaymentProvider;

use subscriptions::SubscriptionView;

#[derive(Debug, Serialize)]
pub struct DataResponse<T> {
    pub data: T,
}

#[derive(Debug, Serialize)]
pub struct DataListResponse<T> {
    pub data: Vec<T>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaginationMetadata {
    pub page: i64,
    pub total_pages: i64,
    pub total_count: i64,
}

#[derive(Debug, Serialize)]
pub struct PaginatedDataResponse<T> {
    pub data: Vec<T>,
    pub metadata: PaginationMetadata,
}

#[derive(Debug, Serialize)]
struct ErrorResponse<'a> {
    errors: &'a str,
}

pub fn json_error(status: StatusCode, message: &str) -> Response {
    (status, Json(ErrorResponse { errors: message })).into_response()
}

/// Provider API failure to HTTP: 400 when the provider rejected what we sent,
/// 502 when it could not be reached, 503 when it is not configured
pub fn provider_error_response(e: &ProviderError) -> Response {
    match e {
        ProviderError::Rejected { .. } => {
            warn!(provider = %e.provider(), error = %e, "Provider rejected request");
        }
        _ => {
            error!(provider = %e.provider(), error = %e, "Provider request failed");
            metrics::counter!("billing.provider.errors", "provider" => e.provider().as_str())
                .increment(1);
        }
    }
    json_error(e.status_code(), &e.to_string())
}

/// Reconciliation failure to HTTP for the client-invoked activate endpoints
pub fn reconcile_error_response(e: &ReconcileError) -> Response {
    if e.is_client_error() {
        json_error(StatusCode::BAD_REQUEST, &e.to_string())
    } else {
        error!(error = %e, "Failed to reconcile payment");
        json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to record payment",
        )
    }
}

/// Body returned by every activate/capture endpoint
#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActivationView {
    Subscription {
        subscription: SubscriptionView,
    },
    Purchase {
        purchase: Purchase,
        already_recorded: bool,
    },
}

impl ActivationView {
    /// None for outcomes that did not produce a row
    pub fn from_outcome(outcome: ReconcileOutcome, now: DateTime<Utc>) -> Option<Self> {
        match outcome {
            ReconcileOutcome::SubscriptionActivated(subscription)
            | ReconcileOutcome::SubscriptionUpdated(subscription) => {
                Some(ActivationView::Subscription {
                    subscription: SubscriptionView::new(subscription, now),
                })
            }
            ReconcileOutcome::PurchaseRecorded(record) => Some(ActivationView::Purchase {
                already_recorded: !record.is_new(),
                purchase: record.into_purchase(),
            }),
            ReconcileOutcome::SubscriptionNotFound(_) | ReconcileOutcome::Ignored(_) => None,
        }
    }
}

/// Reconcile a client-reported completion and render the stored row
pub async fn activation_response(
    store: &dyn BillingStore,
    event: PaymentEvent,
) -> Response {
    let now = Utc::now();
    match reconcile(store, event, now).await {
        Ok(outcome) => match ActivationView::from_outcome(outcome, now) {
            Some(view) => Json(DataResponse { data: view }).into_response(),
            None => json_error(StatusCode::BAD_REQUEST, "Payment is not complete"),
        },
        Err(e) => reconcile_error_response(&e),
    }
}

/// Where to send the buyer to complete a payment
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutView {
    pub provider: PaymentProvider,
    pub id: String,
    pub url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ImagePurchaseRequest {
    pub image_id: Uuid,
}

/// Load an image that can be bought, or the error response to send instead
pub async fn purchasable_image(store: &dyn BillingStore, image_id: Uuid) -> Result<Image, Response> {
    match store.image(image_id).await {
        Ok(Some(image)) if image.is_for_sale() => Ok(image),
        Ok(Some(_)) => Err(json_error(
            StatusCode::BAD_REQUEST,
            "Image is not for sale",
        )),
        Ok(None) => Err(json_error(StatusCode::NOT_FOUND, "Image not found")),
        Err(e) => {
            error!(image_id = %image_id, error = %e, "Failed to get image");
            Err(json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to get image",
            ))
        }
    }
}

/// 503 for a provider missing from this deployment's configuration
pub fn not_configured(provider: PaymentProvider) -> Response {
    provider_error_response(&ProviderError::NotConfigured { provider })
}
