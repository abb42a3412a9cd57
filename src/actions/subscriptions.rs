use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info};

use crate::auth::AuthUser;
use crate::plans::{BillingInterval, PlanType};
use crate::subscriptions::{PaymentProvider, Subscription, SubscriptionStatus};
use crate::web::AppState;

use super::{DataResponse, json_error, not_configured, provider_error_response};

/// View model for a user's subscription (API response)
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionView {
    pub id: String,
    pub plan_type: PlanType,
    pub billing_interval: BillingInterval,
    /// Status as of the request; a live row whose period ended reads as expired
    pub status: SubscriptionStatus,
    pub provider: PaymentProvider,
    pub external_id: String,
    pub current_period_start: String,
    pub current_period_end: String,
    pub cancelled_at: Option<String>,
}

impl SubscriptionView {
    pub fn new(subscription: Subscription, now: DateTime<Utc>) -> Self {
        Self {
            id: subscription.id.to_string(),
            plan_type: subscription.plan_type,
            billing_interval: subscription.billing_interval,
            status: subscription.effective_status(now),
            provider: subscription.provider(),
            external_id: subscription.external_id.id().to_string(),
            current_period_start: subscription.current_period_start.to_rfc3339(),
            current_period_end: subscription.current_period_end.to_rfc3339(),
            cancelled_at: subscription.cancelled_at.map(|t| t.to_rfc3339()),
        }
    }
}

/// GET /subscriptions/current
/// Current user's subscription, or null when they never subscribed
pub async fn get_current_subscription(
    auth_user: AuthUser,
    State(state): State<AppState>,
) -> impl IntoResponse {
    match state.store.subscription_for_user(auth_user.id).await {
        Ok(subscription) => {
            let now = Utc::now();
            Json(DataResponse {
                data: subscription.map(|s| SubscriptionView::new(s, now)),
            })
            .into_response()
        }
        Err(e) => {
            error!(user_id = %auth_user.id, error = %e, "Failed to get subscription");
            json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to get subscription",
            )
        }
    }
}

/// POST /subscriptions/cancel
/// Cancel at the provider, then mark the row cancelled. Purchases are kept.
pub async fn cancel_subscription(
    auth_user: AuthUser,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let subscription = match state.store.subscription_for_user(auth_user.id).await {
        Ok(Some(subscription)) => subscription,
        Ok(None) => {
            return json_error(StatusCode::NOT_FOUND, "No subscription found");
        }
        Err(e) => {
            error!(user_id = %auth_user.id, error = %e, "Failed to get subscription");
            return json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to get subscription",
            );
        }
    };

    let now = Utc::now();

    // Nothing left to cancel at the provider
    if matches!(
        subscription.status,
        SubscriptionStatus::Cancelled | SubscriptionStatus::Expired
    ) {
        return Json(DataResponse {
            data: SubscriptionView::new(subscription, now),
        })
        .into_response();
    }

    let remote = match subscription.provider() {
        PaymentProvider::Stripe => match &state.stripe {
            Some(stripe) => {
                stripe
                    .cancel_subscription(subscription.external_id.id())
                    .await
            }
            None => return not_configured(PaymentProvider::Stripe),
        },
        PaymentProvider::PayPal => match &state.paypal {
            Some(paypal) => {
                paypal
                    .cancel_subscription(subscription.external_id.id(), "Cancelled by user")
                    .await
            }
            None => return not_configured(PaymentProvider::PayPal),
        },
        // Crypto charges do not renew
        PaymentProvider::Crypto => Ok(()),
    };
    if let Err(e) = remote {
        return provider_error_response(&e);
    }

    match state.store.cancel_subscription(auth_user.id, now).await {
        Ok(Some(cancelled)) => {
            metrics::counter!(
                "billing.subscriptions.cancelled",
                "provider" => cancelled.provider().as_str()
            )
            .increment(1);
            info!(user_id = %auth_user.id, provider = %cancelled.provider(), "Cancelled subscription");
            Json(DataResponse {
                data: SubscriptionView::new(cancelled, now),
            })
            .into_response()
        }
        Ok(None) => json_error(StatusCode::NOT_FOUND, "No subscription found"),
        Err(e) => {
            error!(user_id = %auth_user.id, error = %e, "Failed to cancel subscription");
            json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to cancel subscription",
            )
        }
    }
}
