use std::{net::SocketAddr, sync::Arc};

use tokio::{signal, sync::mpsc};
use tracing::{error, info};

use storefront_api as api;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = api::config::load_config()?;
    api::config::init_tracing(cfg.log_level(), cfg.log_json);

    let db_pool = api::db::establish_connection_from_app_config(&cfg).await?;
    let db = Arc::new(db_pool);

    // Redis client; construction only, connectivity surfaces at use
    let redis_client = match redis::Client::open(cfg.redis_url.clone()) {
        Ok(client) => Some(Arc::new(client)),
        Err(err) => {
            error!("Failed to construct Redis client: {}", err);
            None
        }
    };
    let cache = api::cache::build_cache(&cfg.cache.cache_type, redis_client);

    // Domain events
    let (event_tx, event_rx) = mpsc::channel(cfg.event_channel_capacity);
    let event_sender = api::events::EventSender::new(event_tx);
    tokio::spawn(api::events::process_events(event_rx));

    // Gateway registry: constructed once, injected everywhere
    let registry = Arc::new(api::gateway::GatewayRegistry::from_config(&cfg));
    info!(gateways = ?registry.configured_ids(), "payment gateways configured");

    let config = Arc::new(cfg);
    let services = api::handlers::AppServices::new(
        db.clone(),
        Arc::new(event_sender.clone()),
        cache,
        registry.clone(),
        config.clone(),
    );

    let state = Arc::new(api::AppState {
        db,
        config: config.clone(),
        event_sender,
        services,
        registry,
    });

    let app = api::build_router(state);
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", err);
    }
    info!("Shutdown signal received");
}
