pub mod carts;
pub mod checkout;
pub mod common;
pub mod health;
pub mod orders;
pub mod payment_webhooks;
pub mod payments;

use crate::{
    cache::CacheBackend,
    config::AppConfig,
    events::EventSender,
    gateway::GatewayRegistry,
    services::{CartService, CheckoutService, OrderService, PaymentService, WebhookReconciler},
    AppState,
};
use axum::{
    routing::{get, post},
    Router,
};
use sea_orm::DatabaseConnection;
use std::sync::Arc;

/// Service container shared by the HTTP handlers.
#[derive(Clone)]
pub struct AppServices {
    pub carts: Arc<CartService>,
    pub checkout: Arc<CheckoutService>,
    pub orders: Arc<OrderService>,
    pub payments: Arc<PaymentService>,
    pub reconciler: Arc<WebhookReconciler>,
}

impl AppServices {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        cache: Arc<dyn CacheBackend>,
        registry: Arc<GatewayRegistry>,
        config: Arc<AppConfig>,
    ) -> Self {
        let carts = Arc::new(CartService::new(
            db.clone(),
            event_sender.clone(),
            config.clone(),
        ));
        let orders = Arc::new(OrderService::new(
            db.clone(),
            event_sender.clone(),
            config.clone(),
        ));
        let checkout = Arc::new(CheckoutService::new(
            db.clone(),
            cache,
            orders.clone(),
            event_sender.clone(),
            config.clone(),
        ));
        let payments = Arc::new(PaymentService::new(
            db.clone(),
            registry.clone(),
            event_sender.clone(),
            config,
        ));
        let reconciler = Arc::new(WebhookReconciler::new(db, registry, event_sender));

        Self {
            carts,
            checkout,
            orders,
            payments,
            reconciler,
        }
    }
}

/// Full API surface under `/api/v1`.
pub fn api_router() -> Router<Arc<AppState>> {
    Router::new()
        .nest("/cart", carts::routes())
        .nest("/checkout", checkout::routes())
        .nest("/orders", orders::routes())
        .nest("/payments", payments::routes())
        .route("/webhooks/:gateway", post(payment_webhooks::gateway_webhook))
        .route("/health", get(health::health))
}
