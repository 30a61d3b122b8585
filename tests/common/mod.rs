#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ConnectionTrait, Database, DatabaseBackend as DbBackend, Set, Statement,
};
use tokio::sync::mpsc;
use uuid::Uuid;

use storefront_api::{
    cache::InMemoryCache,
    config::{AppConfig, GatewaySettings},
    entities::{
        address, agency, order::DeliveryType, payment_method, payment_method::PaymentMethodKind,
        price_history, product, promotion,
        promotion::{PromotionKind, PromotionState},
    },
    events::{self, EventSender},
    gateway::GatewayRegistry,
    handlers::AppServices,
    AppState,
};

/// Test harness backed by a single-connection in-memory SQLite
/// database with the pipeline schema bootstrapped by hand.
pub struct TestApp {
    pub state: Arc<AppState>,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_gateways(Vec::new(), HashMap::new()).await
    }

    /// Harness with payment gateways configured, typically pointing at
    /// a local mock server.
    pub async fn with_gateways(
        gateways: Vec<GatewaySettings>,
        routing: HashMap<String, String>,
    ) -> Self {
        let mut cfg = AppConfig::new(
            "sqlite::memory:".to_string(),
            "redis://127.0.0.1:6379".to_string(),
            "127.0.0.1".to_string(),
            18_080,
            "test".to_string(),
        );
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;
        cfg.gateway_timeout_secs = 2;
        cfg.gateways = gateways;
        cfg.gateway_routing = routing;

        let mut options = sea_orm::ConnectOptions::new(cfg.database_url.clone());
        options.max_connections(1).min_connections(1);
        let pool = Database::connect(options)
            .await
            .expect("failed to create test database");

        create_schema(&pool).await;

        let (event_tx, event_rx) = mpsc::channel(256);
        let event_sender = EventSender::new(event_tx);
        let event_task = tokio::spawn(events::process_events(event_rx));

        let db = Arc::new(pool);
        let cache = Arc::new(InMemoryCache::new());
        let registry = Arc::new(GatewayRegistry::from_config(&cfg));
        let config = Arc::new(cfg);

        let services = AppServices::new(
            db.clone(),
            Arc::new(event_sender.clone()),
            cache,
            registry.clone(),
            config.clone(),
        );

        let state = Arc::new(AppState {
            db,
            config,
            event_sender,
            services,
            registry,
        });

        Self {
            state,
            _event_task: event_task,
        }
    }

    /// Inserts a product with one current price row; returns the
    /// product id.
    pub async fn seed_product(&self, price: Decimal, stock: i32, active: bool) -> Uuid {
        let product_id = Uuid::new_v4();
        let now = Utc::now();
        product::ActiveModel {
            id: Set(product_id),
            name: Set(format!("Product {}", &product_id.to_string()[..8])),
            active: Set(active),
            stock: Set(stock),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.state.db)
        .await
        .expect("failed to seed product");

        self.seed_price(product_id, price, now).await;
        product_id
    }

    /// Appends a price-history row, making it the product's current
    /// price.
    pub async fn seed_price(&self, product_id: Uuid, price: Decimal, at: DateTime<Utc>) -> Uuid {
        let price_id = Uuid::new_v4();
        price_history::ActiveModel {
            id: Set(price_id),
            product_id: Set(product_id),
            unit_price: Set(price),
            created_at: Set(at),
        }
        .insert(&*self.state.db)
        .await
        .expect("failed to seed price history");
        price_id
    }

    pub async fn seed_promotion(
        &self,
        product_id: Uuid,
        discount: Decimal,
        kind: PromotionKind,
        window: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> Uuid {
        let promotion_id = Uuid::new_v4();
        let now = Utc::now();
        promotion::ActiveModel {
            id: Set(promotion_id),
            product_id: Set(product_id),
            name: Set("test promotion".to_string()),
            state: Set(PromotionState::Active),
            kind: Set(kind),
            discount: Set(discount),
            start_date: Set(window.map(|(s, _)| s)),
            end_date: Set(window.map(|(_, e)| e)),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.state.db)
        .await
        .expect("failed to seed promotion");
        promotion_id
    }

    pub async fn seed_payment_method(
        &self,
        kind: PaymentMethodKind,
        min_amount: Option<Decimal>,
        max_amount: Option<Decimal>,
    ) -> Uuid {
        let method_id = Uuid::new_v4();
        payment_method::ActiveModel {
            id: Set(method_id),
            name: Set(format!("{:?}", kind)),
            kind: Set(kind),
            enabled: Set(true),
            min_amount: Set(min_amount),
            max_amount: Set(max_amount),
            currency: Set("COP".to_string()),
            gateway_id: Set(None),
            created_at: Set(Utc::now()),
        }
        .insert(&*self.state.db)
        .await
        .expect("failed to seed payment method");
        method_id
    }

    pub async fn seed_address(&self, user_id: Uuid) -> Uuid {
        let address_id = Uuid::new_v4();
        address::ActiveModel {
            id: Set(address_id),
            user_id: Set(user_id),
            line1: Set("Calle 1 # 2-3".to_string()),
            line2: Set(None),
            city: Set("Bogotá".to_string()),
            country: Set("CO".to_string()),
            created_at: Set(Utc::now()),
        }
        .insert(&*self.state.db)
        .await
        .expect("failed to seed address");
        address_id
    }

    pub async fn seed_agency(&self, active: bool) -> Uuid {
        let agency_id = Uuid::new_v4();
        agency::ActiveModel {
            id: Set(agency_id),
            name: Set("Agencia Centro".to_string()),
            city: Set("Medellín".to_string()),
            active: Set(active),
            created_at: Set(Utc::now()),
        }
        .insert(&*self.state.db)
        .await
        .expect("failed to seed agency");
        agency_id
    }

    /// Shorthand: active cart for a user with one priced line, ready
    /// for checkout.
    pub async fn seed_user_cart_with_line(
        &self,
        user_id: Uuid,
        price: Decimal,
        quantity: i32,
    ) -> (Uuid, Uuid) {
        let product_id = self.seed_product(price, 1_000, true).await;
        let cart = self
            .state
            .services
            .carts
            .get_or_create_active(storefront_api::services::carts::CartIdentity {
                user_id: Some(user_id),
                session_id: None,
            })
            .await
            .expect("failed to create cart");
        self.state
            .services
            .carts
            .add_line(cart.id, product_id, quantity)
            .await
            .expect("failed to add line");
        (cart.id, product_id)
    }

    /// Runs the full wizard for a shipping checkout and returns the
    /// frozen order.
    pub async fn checkout_to_order(
        &self,
        user_id: Uuid,
        cart_id: Uuid,
        payment_method_id: Uuid,
    ) -> storefront_api::entities::OrderModel {
        let address_id = self.seed_address(user_id).await;
        let session = self
            .state
            .services
            .checkout
            .begin(user_id, cart_id)
            .await
            .expect("failed to begin checkout");
        self.state
            .services
            .checkout
            .set_delivery(
                session.id,
                storefront_api::services::checkout::DeliveryInput {
                    delivery_type: DeliveryType::Shipping,
                    delivery_address_id: Some(address_id),
                    pickup_agency_id: None,
                },
            )
            .await
            .expect("failed to set delivery");
        let (_, validation) = self
            .state
            .services
            .checkout
            .set_payment_method(session.id, payment_method_id)
            .await
            .expect("failed to set payment method");
        assert!(validation.valid, "payment method rejected: {:?}", validation.reason);
        self.state
            .services
            .checkout
            .create_order(session.id)
            .await
            .expect("failed to create order")
    }
}

async fn create_schema(pool: &sea_orm::DatabaseConnection) {
    let statements = [
        r#"CREATE TABLE IF NOT EXISTS carts (
            id TEXT PRIMARY KEY NOT NULL,
            session_id TEXT,
            user_id TEXT,
            status TEXT NOT NULL,
            expires_at TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );"#,
        r#"CREATE TABLE IF NOT EXISTS cart_lines (
            id TEXT PRIMARY KEY NOT NULL,
            cart_id TEXT NOT NULL,
            product_id TEXT NOT NULL,
            quantity INTEGER NOT NULL,
            price_history_id TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE (cart_id, product_id)
        );"#,
        r#"CREATE TABLE IF NOT EXISTS products (
            id TEXT PRIMARY KEY NOT NULL,
            name TEXT NOT NULL,
            active INTEGER NOT NULL,
            stock INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );"#,
        r#"CREATE TABLE IF NOT EXISTS price_history (
            id TEXT PRIMARY KEY NOT NULL,
            product_id TEXT NOT NULL,
            unit_price REAL NOT NULL,
            created_at TEXT NOT NULL
        );"#,
        r#"CREATE TABLE IF NOT EXISTS promotions (
            id TEXT PRIMARY KEY NOT NULL,
            product_id TEXT NOT NULL,
            name TEXT NOT NULL,
            state TEXT NOT NULL,
            kind TEXT NOT NULL,
            discount REAL NOT NULL,
            start_date TEXT,
            end_date TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );"#,
        r#"CREATE TABLE IF NOT EXISTS payment_methods (
            id TEXT PRIMARY KEY NOT NULL,
            name TEXT NOT NULL,
            kind TEXT NOT NULL,
            enabled INTEGER NOT NULL,
            min_amount REAL,
            max_amount REAL,
            currency TEXT NOT NULL,
            gateway_id TEXT,
            created_at TEXT NOT NULL
        );"#,
        r#"CREATE TABLE IF NOT EXISTS addresses (
            id TEXT PRIMARY KEY NOT NULL,
            user_id TEXT NOT NULL,
            line1 TEXT NOT NULL,
            line2 TEXT,
            city TEXT NOT NULL,
            country TEXT NOT NULL,
            created_at TEXT NOT NULL
        );"#,
        r#"CREATE TABLE IF NOT EXISTS agencies (
            id TEXT PRIMARY KEY NOT NULL,
            name TEXT NOT NULL,
            city TEXT NOT NULL,
            active INTEGER NOT NULL,
            created_at TEXT NOT NULL
        );"#,
        r#"CREATE TABLE IF NOT EXISTS orders (
            id TEXT PRIMARY KEY NOT NULL,
            order_number TEXT NOT NULL,
            user_id TEXT NOT NULL,
            cart_id TEXT NOT NULL,
            state TEXT NOT NULL,
            delivery_type TEXT NOT NULL,
            delivery_address_id TEXT,
            pickup_agency_id TEXT,
            payment_method_id TEXT NOT NULL,
            subtotal_amount REAL NOT NULL,
            discount_amount REAL NOT NULL,
            shipping_amount REAL NOT NULL,
            tax_amount REAL NOT NULL,
            total_amount REAL NOT NULL,
            currency TEXT NOT NULL,
            last_payment_id TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );"#,
        r#"CREATE TABLE IF NOT EXISTS order_price_history (
            id TEXT PRIMARY KEY NOT NULL,
            order_id TEXT NOT NULL,
            product_id TEXT NOT NULL,
            quantity INTEGER NOT NULL,
            unit_price REAL NOT NULL,
            subtotal REAL NOT NULL,
            discount_amount REAL NOT NULL,
            final_amount REAL NOT NULL,
            promotion_id TEXT,
            created_at TEXT NOT NULL
        );"#,
        r#"CREATE TABLE IF NOT EXISTS payments (
            id TEXT PRIMARY KEY NOT NULL,
            order_id TEXT NOT NULL,
            payment_method_id TEXT NOT NULL,
            gateway_id TEXT NOT NULL,
            transaction_id TEXT,
            amount REAL NOT NULL,
            currency TEXT NOT NULL,
            state TEXT NOT NULL,
            attempts INTEGER NOT NULL,
            last_attempt_at TEXT NOT NULL,
            description TEXT,
            gateway_response TEXT,
            metadata TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );"#,
    ];

    for sql in statements {
        pool.execute(Statement::from_string(DbBackend::Sqlite, sql.to_string()))
            .await
            .expect("failed to create test schema");
    }
}

/// A sporadic promotion window around now.
pub fn window_around_now() -> (DateTime<Utc>, DateTime<Utc>) {
    let now = Utc::now();
    (now - Duration::days(1), now + Duration::days(1))
}
