use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::Deserialize;
use tracing::warn;
use uuid::Uuid;

use crate::auth::{AuthUser, MaybeAuthUser};
use crate::plans::{BillingInterval, PlanSelection, PlanType};
use crate::subscriptions::PaymentProvider;
use crate::web::AppState;

use super::{
    CheckoutView, DataResponse, activation_response, json_error, not_configured,
    provider_error_response, purchasable_image,
};

/// Either a plan (`plan_type` + `billing_interval`) or an `image_id`
#[derive(Debug, Deserialize)]
pub struct CreateChargeRequest {
    pub plan_type: Option<PlanType>,
    pub billing_interval: Option<BillingInterval>,
    pub image_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct ActivateChargeRequest {
    pub charge_id: String,
    pub user_id: Option<Uuid>,
}

/// POST /crypto/charges
/// Fixed-price charge. A plan charge buys one billing interval; it does not renew.
pub async fn create_charge(
    auth_user: AuthUser,
    State(state): State<AppState>,
    Json(request): Json<CreateChargeRequest>,
) -> impl IntoResponse {
    let Some(coinbase) = &state.coinbase else {
        return not_configured(PaymentProvider::Crypto);
    };

    let result = match (request.plan_type, request.billing_interval, request.image_id) {
        (Some(plan_type), Some(billing_interval), None) => {
            let plan = PlanSelection::new(plan_type, billing_interval);
            coinbase
                .create_subscription_charge(
                    plan,
                    state.plans.price_cents(plan),
                    auth_user.id,
                    &state.base_url,
                )
                .await
        }
        (None, None, Some(image_id)) => {
            let image = match purchasable_image(state.store.as_ref(), image_id).await {
                Ok(image) => image,
                Err(response) => return response,
            };
            coinbase
                .create_purchase_charge(&image, auth_user.id, &state.base_url)
                .await
        }
        _ => {
            return json_error(
                StatusCode::BAD_REQUEST,
                "Specify either plan_type and billing_interval, or image_id",
            );
        }
    };

    match result {
        Ok(charge) => {
            metrics::counter!("billing.checkout.created", "provider" => "crypto").increment(1);
            Json(DataResponse {
                data: CheckoutView {
                    provider: PaymentProvider::Crypto,
                    id: charge.id,
                    url: charge.hosted_url,
                },
            })
            .into_response()
        }
        Err(e) => provider_error_response(&e),
    }
}

/// POST /crypto/activate
pub async fn activate(
    maybe_user: MaybeAuthUser,
    State(state): State<AppState>,
    Json(request): Json<ActivateChargeRequest>,
) -> impl IntoResponse {
    let Some(coinbase) = &state.coinbase else {
        return not_configured(PaymentProvider::Crypto);
    };

    let charge = match coinbase.get_charge(&request.charge_id).await {
        Ok(charge) => charge,
        Err(e) => return provider_error_response(&e),
    };
    if !charge.is_settled() {
        warn!(
            charge_id = %charge.id,
            status = charge.last_status().unwrap_or("NEW"),
            "Activation requested for unsettled charge"
        );
        return json_error(StatusCode::BAD_REQUEST, "Payment is not complete");
    }

    let event = charge
        .confirmed_event()
        .with_request_user(maybe_user.user_id(), request.user_id);
    activation_response(state.store.as_ref(), event).await
}
