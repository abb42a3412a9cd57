use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
};
use tracing::error;

use crate::auth::AuthUser;
use crate::web::AppState;

use super::{DataListResponse, json_error};

/// GET /purchases
/// List current user's image purchases, newest first
pub async fn list_my_purchases(
    auth_user: AuthUser,
    State(state): State<AppState>,
) -> impl IntoResponse {
    match state.store.purchases_for_user(auth_user.id).await {
        Ok(purchases) => Json(DataListResponse { data: purchases }).into_response(),
        Err(e) => {
            error!(user_id = %auth_user.id, error = %e, "Failed to list user purchases");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to list purchases")
        }
    }
}
