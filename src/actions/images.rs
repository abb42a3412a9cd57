use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{error, info};
use uuid::Uuid;

use crate::auth::{AuthUser, MaybeAuthUser};
use crate::images::{Image, NewImage};
use crate::web::AppState;

use super::{DataResponse, PaginatedDataResponse, PaginationMetadata, json_error};

const DEFAULT_PER_PAGE: i64 = 24;
const MAX_PER_PAGE: i64 = 100;
/// Keeps `(page - 1) * per_page` inside i64
const MAX_PAGE: i64 = i64::MAX / MAX_PER_PAGE;

/// View model for image metadata (API response)
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageView {
    pub id: String,
    pub owner_id: String,
    pub title: String,
    pub storage_path: String,
    pub width: i32,
    pub height: i32,
    pub mime_type: String,
    pub price_cents: i32,
    pub for_sale: bool,
    /// Only present for authenticated callers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub purchased: Option<bool>,
    pub created_at: String,
}

impl ImageView {
    fn new(image: Image, purchased: Option<bool>) -> Self {
        Self {
            id: image.id.to_string(),
            owner_id: image.owner_id.to_string(),
            for_sale: image.is_for_sale(),
            title: image.title,
            storage_path: image.storage_path,
            width: image.width,
            height: image.height,
            mime_type: image.mime_type,
            price_cents: image.price_cents,
            purchased,
            created_at: image.created_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ImagesQuery {
    pub page: Option<i64>,
    /// Results per page
    pub per_page: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateImageRequest {
    pub title: String,
    pub storage_path: String,
    pub width: i32,
    pub height: i32,
    pub mime_type: String,
    #[serde(default)]
    pub price_cents: i32,
}

/// GET /images
/// List images newest first
pub async fn list_images(
    maybe_user: MaybeAuthUser,
    State(state): State<AppState>,
    Query(query): Query<ImagesQuery>,
) -> impl IntoResponse {
    let page = query.page.unwrap_or(1).clamp(1, MAX_PAGE);
    let per_page = query
        .per_page
        .unwrap_or(DEFAULT_PER_PAGE)
        .clamp(1, MAX_PER_PAGE);

    let (images, total_count) = match state.store.list_images(page, per_page).await {
        Ok(result) => result,
        Err(e) => {
            error!(error = %e, "Failed to list images");
            return json_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to list images");
        }
    };

    let purchased: Option<HashSet<Uuid>> = match maybe_user.user_id() {
        Some(user_id) => match state.store.purchases_for_user(user_id).await {
            Ok(purchases) => Some(purchases.into_iter().map(|p| p.image_id).collect()),
            Err(e) => {
                error!(user_id = %user_id, error = %e, "Failed to load purchases");
                return json_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to list images");
            }
        },
        None => None,
    };

    let views: Vec<ImageView> = images
        .into_iter()
        .map(|image| {
            let owned = purchased.as_ref().map(|set| set.contains(&image.id));
            ImageView::new(image, owned)
        })
        .collect();
    let total_pages = (total_count + per_page - 1) / per_page;

    Json(PaginatedDataResponse {
        data: views,
        metadata: PaginationMetadata {
            page,
            total_pages,
            total_count,
        },
    })
    .into_response()
}

/// GET /images/{id}
pub async fn get_image(
    maybe_user: MaybeAuthUser,
    State(state): State<AppState>,
    Path(image_id): Path<Uuid>,
) -> impl IntoResponse {
    let image = match state.store.image(image_id).await {
        Ok(Some(image)) => image,
        Ok(None) => return json_error(StatusCode::NOT_FOUND, "Image not found"),
        Err(e) => {
            error!(image_id = %image_id, error = %e, "Failed to get image");
            return json_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to get image");
        }
    };

    let purchased = match maybe_user.user_id() {
        Some(user_id) => match state.store.has_purchased(user_id, image_id).await {
            Ok(owned) => Some(owned),
            Err(e) => {
                error!(image_id = %image_id, error = %e, "Failed to check purchase");
                return json_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to get image");
            }
        },
        None => None,
    };

    Json(DataResponse {
        data: ImageView::new(image, purchased),
    })
    .into_response()
}

/// POST /images
/// Record metadata for an image already uploaded to storage
pub async fn create_image(
    auth_user: AuthUser,
    State(state): State<AppState>,
    Json(request): Json<CreateImageRequest>,
) -> impl IntoResponse {
    if request.title.trim().is_empty() || request.storage_path.trim().is_empty() {
        return json_error(
            StatusCode::BAD_REQUEST,
            "Title and storage path are required",
        );
    }
    if request.width <= 0 || request.height <= 0 {
        return json_error(StatusCode::BAD_REQUEST, "Width and height must be positive");
    }
    if request.price_cents < 0 {
        return json_error(StatusCode::BAD_REQUEST, "Price cannot be negative");
    }

    let new_image = NewImage {
        owner_id: auth_user.id,
        title: request.title.trim().to_string(),
        storage_path: request.storage_path,
        width: request.width,
        height: request.height,
        mime_type: request.mime_type,
        price_cents: request.price_cents,
    };

    match state.store.create_image(new_image).await {
        Ok(Some(image)) => {
            info!(image_id = %image.id, owner_id = %auth_user.id, "Created image");
            (
                StatusCode::CREATED,
                Json(DataResponse {
                    data: ImageView::new(image, Some(false)),
                }),
            )
                .into_response()
        }
        Ok(None) => json_error(
            StatusCode::CONFLICT,
            "An image with this storage path already exists",
        ),
        Err(e) => {
            error!(owner_id = %auth_user.id, error = %e, "Failed to create image");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to create image")
        }
    }
}
