use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::Deserialize;
use tracing::warn;
use uuid::Uuid;

use crate::auth::{AuthUser, MaybeAuthUser};
use crate::paypal_client::order_event;
use crate::plans::PlanSelection;
use crate::subscriptions::PaymentProvider;
use crate::web::AppState;

use super::{
    CheckoutView, DataResponse, ImagePurchaseRequest, activation_response, json_error,
    not_configured, provider_error_response, purchasable_image,
};

#[derive(Debug, Deserialize)]
pub struct ActivateSubscriptionRequest {
    pub subscription_id: String,
    pub user_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct CaptureOrderRequest {
    pub order_id: String,
    pub user_id: Option<Uuid>,
}

/// POST /paypal/subscriptions
pub async fn create_subscription(
    auth_user: AuthUser,
    State(state): State<AppState>,
    Json(plan): Json<PlanSelection>,
) -> impl IntoResponse {
    let Some(paypal) = &state.paypal else {
        return not_configured(PaymentProvider::PayPal);
    };

    match paypal
        .create_subscription(plan, auth_user.id, &state.base_url)
        .await
    {
        Ok(subscription) => {
            metrics::counter!("billing.checkout.created", "provider" => "paypal").increment(1);
            Json(DataResponse {
                data: CheckoutView {
                    provider: PaymentProvider::PayPal,
                    url: subscription.approval_url(),
                    id: subscription.id,
                },
            })
            .into_response()
        }
        Err(e) => provider_error_response(&e),
    }
}

/// POST /paypal/activate
pub async fn activate(
    maybe_user: MaybeAuthUser,
    State(state): State<AppState>,
    Json(request): Json<ActivateSubscriptionRequest>,
) -> impl IntoResponse {
    let Some(paypal) = &state.paypal else {
        return not_configured(PaymentProvider::PayPal);
    };

    let subscription = match paypal.get_subscription(&request.subscription_id).await {
        Ok(subscription) => subscription,
        Err(e) => return provider_error_response(&e),
    };
    if !subscription.is_approved() {
        warn!(
            subscription_id = %subscription.id,
            status = %subscription.status,
            "Activation requested for PayPal subscription that is not approved"
        );
        return json_error(StatusCode::BAD_REQUEST, "Subscription is not active");
    }

    let event = paypal
        .subscription_event(&subscription)
        .with_request_user(maybe_user.user_id(), request.user_id);
    activation_response(state.store.as_ref(), event).await
}

/// POST /paypal/orders
pub async fn create_order(
    auth_user: AuthUser,
    State(state): State<AppState>,
    Json(request): Json<ImagePurchaseRequest>,
) -> impl IntoResponse {
    let Some(paypal) = &state.paypal else {
        return not_configured(PaymentProvider::PayPal);
    };
    let image = match purchasable_image(state.store.as_ref(), request.image_id).await {
        Ok(image) => image,
        Err(response) => return response,
    };

    match paypal
        .create_order(&image, auth_user.id, &state.base_url)
        .await
    {
        Ok(order) => {
            metrics::counter!("billing.checkout.created", "provider" => "paypal").increment(1);
            Json(DataResponse {
                data: CheckoutView {
                    provider: PaymentProvider::PayPal,
                    url: order.approval_url(),
                    id: order.id,
                },
            })
            .into_response()
        }
        Err(e) => provider_error_response(&e),
    }
}

/// POST /paypal/capture
/// Capture an approved order and record the purchase under the order id
pub async fn capture(
    maybe_user: MaybeAuthUser,
    State(state): State<AppState>,
    Json(request): Json<CaptureOrderRequest>,
) -> impl IntoResponse {
    let Some(paypal) = &state.paypal else {
        return not_configured(PaymentProvider::PayPal);
    };

    let order = match paypal.capture_order(&request.order_id).await {
        Ok(order) => order,
        Err(e) => return provider_error_response(&e),
    };
    if !order.is_completed() {
        warn!(order_id = %order.id, status = %order.status, "PayPal order did not complete");
        return json_error(StatusCode::BAD_REQUEST, "Payment is not complete");
    }

    let event = match order_event(&order) {
        Ok(event) => event.with_request_user(maybe_user.user_id(), request.user_id),
        Err(e) => return provider_error_response(&e),
    };
    activation_response(state.store.as_ref(), event).await
}
