//! Storefront order pipeline.
//!
//! Carts, checkout and payment orchestration: the cart state machine
//! with guest/user merge, the pricing freeze performed at order
//! creation, the payment-gateway abstraction with per-method routing,
//! the payment attempt state machine, and webhook-driven
//! reconciliation sharing the orchestrator's state mapping.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod auth;
pub mod cache;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod gateway;
pub mod handlers;
pub mod services;

use axum::Router;
use sea_orm::DatabaseConnection;
use std::sync::Arc;
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};

use crate::events::EventSender;
use crate::gateway::GatewayRegistry;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: Arc<config::AppConfig>,
    pub event_sender: EventSender,
    pub services: handlers::AppServices,
    pub registry: Arc<GatewayRegistry>,
}

/// Builds the full application router with the standard middleware
/// stack applied.
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = if state.config.is_development() {
        CorsLayer::permissive()
    } else {
        CorsLayer::new()
    };

    Router::new()
        .nest("/api/v1", handlers::api_router())
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(cors)
}
