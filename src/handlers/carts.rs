use crate::auth::{AuthenticatedUser, CartSession, OptionalUser};
use crate::handlers::common::{
    map_service_error, no_content_response, success_response, validate_input,
};
use crate::services::carts::CartIdentity;
use crate::{errors::ApiError, AppState};
use axum::{
    extract::{Json, Path, State},
    routing::{delete, get, post, put},
    Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

/// Cart endpoints. Guest identity travels in `X-Cart-Session`; an
/// absent `X-User-Id` is the valid guest flow, not an error.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(get_cart))
        .route("/items", post(add_item))
        .route("/items/:product_id", put(update_item))
        .route("/items/:product_id", delete(remove_item))
        .route("/merge", post(merge_cart))
}

fn identity(user: OptionalUser, session: CartSession) -> CartIdentity {
    CartIdentity {
        user_id: user.0,
        session_id: session.0,
    }
}

/// Current cart with live-priced summary. Creates the cart on first
/// contact; the response carries the session id the client must echo
/// back in `X-Cart-Session`.
async fn get_cart(
    State(state): State<Arc<AppState>>,
    user: OptionalUser,
    session: CartSession,
) -> Result<impl axum::response::IntoResponse, ApiError> {
    let cart = state
        .services
        .carts
        .get_or_create_active(identity(user, session))
        .await
        .map_err(map_service_error)?;

    let with_lines = state
        .services
        .carts
        .get_cart(cart.id)
        .await
        .map_err(map_service_error)?;
    let summary = state
        .services
        .carts
        .summary(cart.id)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(json!({
        "cart": with_lines.cart,
        "lines": with_lines.lines,
        "summary": summary,
    })))
}

async fn add_item(
    State(state): State<Arc<AppState>>,
    user: OptionalUser,
    session: CartSession,
    Json(payload): Json<AddItemRequest>,
) -> Result<impl axum::response::IntoResponse, ApiError> {
    validate_input(&payload)?;

    let cart = state
        .services
        .carts
        .get_or_create_active(identity(user, session))
        .await
        .map_err(map_service_error)?;

    let cart = state
        .services
        .carts
        .add_line(cart.id, payload.product_id, payload.quantity)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(cart))
}

async fn update_item(
    State(state): State<Arc<AppState>>,
    user: OptionalUser,
    session: CartSession,
    Path(product_id): Path<Uuid>,
    Json(payload): Json<UpdateQuantityRequest>,
) -> Result<impl axum::response::IntoResponse, ApiError> {
    validate_input(&payload)?;

    let cart = state
        .services
        .carts
        .find_active(&identity(user, session))
        .await
        .map_err(map_service_error)?
        .ok_or_else(|| ApiError::NotFound("No active cart for this identity".to_string()))?;

    let cart = state
        .services
        .carts
        .update_line_quantity(cart.id, product_id, payload.quantity)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(cart))
}

async fn remove_item(
    State(state): State<Arc<AppState>>,
    user: OptionalUser,
    session: CartSession,
    Path(product_id): Path<Uuid>,
) -> Result<impl axum::response::IntoResponse, ApiError> {
    let cart = state
        .services
        .carts
        .find_active(&identity(user, session))
        .await
        .map_err(map_service_error)?
        .ok_or_else(|| ApiError::NotFound("No active cart for this identity".to_string()))?;

    state
        .services
        .carts
        .update_line_quantity(cart.id, product_id, 0)
        .await
        .map_err(map_service_error)?;

    Ok(no_content_response())
}

/// Claims the guest cart for the just-authenticated user.
async fn merge_cart(
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    session: CartSession,
    payload: Option<Json<MergeRequest>>,
) -> Result<impl axum::response::IntoResponse, ApiError> {
    let session_id = payload
        .and_then(|Json(p)| p.session_id)
        .or(session.0)
        .ok_or_else(|| {
            ApiError::BadRequest("a guest session id is required to merge".to_string())
        })?;

    let cart = state
        .services
        .carts
        .merge_guest_into_user(&session_id, user_id)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(cart))
}

// Request DTOs

#[derive(Debug, Deserialize, Validate)]
pub struct AddItemRequest {
    pub product_id: Uuid,
    #[validate(range(min = 1))]
    pub quantity: i32,
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateQuantityRequest {
    #[validate(range(min = 0))]
    pub quantity: i32,
}

#[derive(Debug, Deserialize)]
pub struct MergeRequest {
    pub session_id: Option<String>,
}
