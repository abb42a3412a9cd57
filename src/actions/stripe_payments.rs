use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::Deserialize;
use tracing::warn;
use uuid::Uuid;

use crate::auth::{AuthUser, MaybeAuthUser};
use crate::payment_events::{PaymentEvent, StripeEvent};
use crate::plans::PlanSelection;
use crate::stripe_client::{checkout_from_session, session_is_paid};
use crate::subscriptions::PaymentProvider;
use crate::web::AppState;

use super::{
    CheckoutView, DataResponse, ImagePurchaseRequest, activation_response, json_error,
    not_configured, provider_error_response, purchasable_image,
};

#[derive(Debug, Deserialize)]
pub struct ActivateSessionRequest {
    pub session_id: String,
    /// Fallback when the session cookie did not survive the redirect back from Stripe
    pub user_id: Option<Uuid>,
}

/// POST /stripe/checkout
pub async fn create_checkout(
    auth_user: AuthUser,
    State(state): State<AppState>,
    Json(plan): Json<PlanSelection>,
) -> impl IntoResponse {
    let Some(stripe) = &state.stripe else {
        return not_configured(PaymentProvider::Stripe);
    };

    match stripe
        .create_subscription_checkout(plan, auth_user.id, &state.base_url)
        .await
    {
        Ok(session) => {
            metrics::counter!("billing.checkout.created", "provider" => "stripe").increment(1);
            Json(DataResponse {
                data: CheckoutView {
                    provider: PaymentProvider::Stripe,
                    id: session.id.to_string(),
                    url: session.url,
                },
            })
            .into_response()
        }
        Err(e) => provider_error_response(&e),
    }
}

/// POST /stripe/purchase
pub async fn create_purchase_checkout(
    auth_user: AuthUser,
    State(state): State<AppState>,
    Json(request): Json<ImagePurchaseRequest>,
) -> impl IntoResponse {
    let Some(stripe) = &state.stripe else {
        return not_configured(PaymentProvider::Stripe);
    };
    let image = match purchasable_image(state.store.as_ref(), request.image_id).await {
        Ok(image) => image,
        Err(response) => return response,
    };

    match stripe
        .create_purchase_checkout(&image, auth_user.id, &state.base_url)
        .await
    {
        Ok(session) => {
            metrics::counter!("billing.checkout.created", "provider" => "stripe").increment(1);
            Json(DataResponse {
                data: CheckoutView {
                    provider: PaymentProvider::Stripe,
                    id: session.id.to_string(),
                    url: session.url,
                },
            })
            .into_response()
        }
        Err(e) => provider_error_response(&e),
    }
}

/// POST /stripe/activate
/// Reconcile a checkout the buyer just returned from, ahead of (or instead of) the webhook
pub async fn activate(
    maybe_user: MaybeAuthUser,
    State(state): State<AppState>,
    Json(request): Json<ActivateSessionRequest>,
) -> impl IntoResponse {
    let Some(stripe) = &state.stripe else {
        return not_configured(PaymentProvider::Stripe);
    };

    let session = match stripe.retrieve_session(&request.session_id).await {
        Ok(session) => session,
        Err(e) => return provider_error_response(&e),
    };
    if !session_is_paid(&session) {
        warn!(session_id = %request.session_id, "Activation requested for unpaid checkout session");
        return json_error(StatusCode::BAD_REQUEST, "Payment is not complete");
    }

    let event = PaymentEvent::Stripe(StripeEvent::CheckoutCompleted(checkout_from_session(
        &session,
    )))
    .with_request_user(maybe_user.user_id(), request.user_id);

    activation_response(state.store.as_ref(), event).await
}
