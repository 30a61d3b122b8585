use crate::auth::AuthenticatedUser;
use crate::handlers::common::{created_response, map_service_error, success_response};
use crate::services::checkout::DeliveryInput;
use crate::{errors::ApiError, AppState};
use axum::{
    extract::{Json, Path, State},
    routing::{get, post, put},
    Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

/// Checkout wizard endpoints. Every step requires the authenticated
/// user who owns the session.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", post(begin_checkout))
        .route("/:id", get(get_session))
        .route("/:id/delivery", put(set_delivery))
        .route("/:id/payment-method", put(set_payment_method))
        .route("/:id/order", post(create_order))
}

async fn begin_checkout(
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Json(payload): Json<BeginCheckoutRequest>,
) -> Result<impl axum::response::IntoResponse, ApiError> {
    let session = state
        .services
        .checkout
        .begin(user_id, payload.cart_id)
        .await
        .map_err(map_service_error)?;

    Ok(created_response(session))
}

async fn get_session(
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> Result<impl axum::response::IntoResponse, ApiError> {
    let session = state
        .services
        .checkout
        .session(id)
        .await
        .map_err(map_service_error)?;
    if session.user_id != user_id {
        return Err(ApiError::Unauthorized);
    }
    Ok(success_response(session))
}

async fn set_delivery(
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<DeliveryInput>,
) -> Result<impl axum::response::IntoResponse, ApiError> {
    let session = state
        .services
        .checkout
        .session(id)
        .await
        .map_err(map_service_error)?;
    if session.user_id != user_id {
        return Err(ApiError::Unauthorized);
    }

    let session = state
        .services
        .checkout
        .set_delivery(id, payload)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(session))
}

/// Validates the method against the live cart total and records it
/// when valid. The validation verdict is always returned so the
/// client can render the reason.
async fn set_payment_method(
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<PaymentMethodRequest>,
) -> Result<impl axum::response::IntoResponse, ApiError> {
    let session = state
        .services
        .checkout
        .session(id)
        .await
        .map_err(map_service_error)?;
    if session.user_id != user_id {
        return Err(ApiError::Unauthorized);
    }

    let (session, validation) = state
        .services
        .checkout
        .set_payment_method(id, payload.payment_method_id)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(json!({
        "session": session,
        "validation": validation,
    })))
}

/// Freezes the cart into an order and destroys the session.
async fn create_order(
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> Result<impl axum::response::IntoResponse, ApiError> {
    let session = state
        .services
        .checkout
        .session(id)
        .await
        .map_err(map_service_error)?;
    if session.user_id != user_id {
        return Err(ApiError::Unauthorized);
    }

    let order = state
        .services
        .checkout
        .create_order(id)
        .await
        .map_err(map_service_error)?;

    Ok(created_response(order))
}

// Request DTOs

#[derive(Debug, Deserialize)]
pub struct BeginCheckoutRequest {
    pub cart_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct PaymentMethodRequest {
    pub payment_method_id: Uuid,
}
