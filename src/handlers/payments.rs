use crate::handlers::common::{map_service_error, success_response};
use crate::services::payments::PaymentRequest;
use crate::{errors::ApiError, AppState};
use axum::{
    extract::{Json, Path, State},
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use uuid::Uuid;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/status/:transaction_id", get(payment_status))
        .route("/pse/banks", get(pse_banks))
        .route("/:id/refund", post(refund_payment))
}

/// Runs one payment attempt for the order. Registered under
/// `/orders/:id/payments`. Declines come back as structured data with
/// the method-aware description, never as raw gateway payloads.
pub async fn process_payment(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<Uuid>,
    Json(payload): Json<PaymentRequest>,
) -> Result<impl axum::response::IntoResponse, ApiError> {
    let outcome = state
        .services
        .payments
        .process_payment(order_id, payload)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(outcome))
}

async fn payment_status(
    State(state): State<Arc<AppState>>,
    Path(transaction_id): Path<String>,
) -> Result<impl axum::response::IntoResponse, ApiError> {
    let status = state
        .services
        .payments
        .payment_status(&transaction_id)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(status))
}

async fn refund_payment(
    State(state): State<Arc<AppState>>,
    Path(payment_id): Path<Uuid>,
) -> Result<impl axum::response::IntoResponse, ApiError> {
    let outcome = state
        .services
        .payments
        .refund_payment(payment_id)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(outcome))
}

async fn pse_banks(
    State(state): State<Arc<AppState>>,
) -> Result<impl axum::response::IntoResponse, ApiError> {
    let banks = state
        .services
        .payments
        .pse_banks()
        .await
        .map_err(map_service_error)?;

    Ok(success_response(banks))
}
