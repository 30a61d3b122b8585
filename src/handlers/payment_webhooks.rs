use crate::{errors::ServiceError, AppState};
use axum::{
    extract::{Path, State},
    http::HeaderMap,
    response::IntoResponse,
};
use bytes::Bytes;
use std::sync::Arc;
use tracing::info;

// POST /api/v1/webhooks/:gateway
//
// 200 is returned only after the durable state update commits; any
// verification or processing failure maps to a non-2xx so the provider
// retries the delivery.
#[utoipa::path(
    post,
    path = "/api/v1/webhooks/{gateway}",
    request_body = String,
    responses(
        (status = 200, description = "Webhook accepted"),
        (status = 401, description = "Invalid signature", body = crate::errors::ErrorResponse),
        (status = 400, description = "Invalid payload or event type", body = crate::errors::ErrorResponse),
        (status = 404, description = "Unknown gateway or unrecorded transaction", body = crate::errors::ErrorResponse)
    ),
    tag = "Webhooks"
)]
pub async fn gateway_webhook(
    State(state): State<Arc<AppState>>,
    Path(gateway): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ServiceError> {
    state
        .services
        .reconciler
        .handle(&gateway, &headers, &body)
        .await?;

    info!(gateway, "webhook processed");
    Ok((axum::http::StatusCode::OK, "ok"))
}
