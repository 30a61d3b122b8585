use crate::{
    config::AppConfig,
    entities::{cart, cart_line, Cart, CartLine, CartModel},
    errors::ServiceError,
    events::{Event, EventSender},
    services::{catalog, pricing},
};
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DatabaseTransaction,
    EntityTrait, ModelTrait, PaginatorTrait, QueryFilter, QuerySelect, Set, SqlErr,
    TransactionTrait,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Cart store: owns cart and cart-line lifecycle.
///
/// Every mutating operation runs inside one transaction with an
/// exclusive lock on the cart row; the unique `(cart_id, product_id)`
/// constraint is the backstop for concurrent line inserts.
#[derive(Clone)]
pub struct CartService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    config: Arc<AppConfig>,
}

/// Requesting identity: an authenticated user id, a guest session id,
/// or both (authenticated request from a previously-guest browser).
#[derive(Debug, Clone, Default)]
pub struct CartIdentity {
    pub user_id: Option<Uuid>,
    pub session_id: Option<String>,
}

/// Cart with fully-materialized lines.
#[derive(Debug, Serialize)]
pub struct CartWithLines {
    pub cart: CartModel,
    pub lines: Vec<cart_line::Model>,
}

/// Live-priced view of one cart line.
#[derive(Debug, Serialize)]
pub struct LineSummary {
    pub product_id: Uuid,
    pub product_name: String,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub subtotal: Decimal,
    pub discount: Decimal,
    pub final_price: Decimal,
    pub applied_promotion_id: Option<Uuid>,
}

/// Cart totals recomputed from current prices and currently-applicable
/// promotions. Intentionally non-frozen: the cart tracks live pricing
/// until it is frozen into an order.
#[derive(Debug, Serialize)]
pub struct CartSummary {
    pub cart_id: Uuid,
    pub lines: Vec<LineSummary>,
    pub subtotal: Decimal,
    pub total_discount: Decimal,
    pub total: Decimal,
}

impl CartService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            db,
            event_sender,
            config,
        }
    }

    /// Returns the identity's active cart, creating one when none
    /// exists. Resolution is always user-id first, then session-id, so
    /// an authenticated request on a previously-guest browser finds
    /// the user's cart rather than a stale guest cart. Creation is the
    /// only path that issues a fresh session id when none was supplied.
    #[instrument(skip(self))]
    pub async fn get_or_create_active(
        &self,
        identity: CartIdentity,
    ) -> Result<CartModel, ServiceError> {
        if let Some(user_id) = identity.user_id {
            if let Some(cart) = find_active_by_user(&*self.db, user_id).await? {
                return Ok(cart);
            }
        }
        if let Some(session_id) = identity.session_id.as_deref() {
            if let Some(cart) = find_active_by_session(&*self.db, session_id).await? {
                return Ok(cart);
            }
        }

        self.create_active(identity).await
    }

    /// Creates a fresh active cart, demoting any cart the identity
    /// already holds active so the one-active-per-identity invariant
    /// survives racing callers.
    async fn create_active(&self, identity: CartIdentity) -> Result<CartModel, ServiceError> {
        let txn = self.db.begin().await?;

        if let Some(user_id) = identity.user_id {
            demote_active_by_user(&txn, user_id).await?;
        }
        if let Some(session_id) = identity.session_id.as_deref() {
            demote_active_by_session(&txn, session_id).await?;
        }

        let now = Utc::now();
        let cart_id = Uuid::new_v4();
        let session_id = identity
            .session_id
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());

        let cart = cart::ActiveModel {
            id: Set(cart_id),
            session_id: Set(Some(session_id)),
            user_id: Set(identity.user_id),
            status: Set(cart::CartStatus::Active),
            expires_at: Set(now + Duration::days(self.config.cart_ttl_days)),
            created_at: Set(now),
            updated_at: Set(now),
        };
        let cart = cart.insert(&txn).await?;
        txn.commit().await?;

        self.event_sender.send_or_log(Event::CartCreated(cart_id)).await;
        info!(%cart_id, "created cart");
        Ok(cart)
    }

    /// Adds a product line, summing quantity when the line already
    /// exists. Stock and product activity are read live from the
    /// catalog; the current price-history id is captured once, here.
    #[instrument(skip(self))]
    pub async fn add_line(
        &self,
        cart_id: Uuid,
        product_id: Uuid,
        quantity: i32,
    ) -> Result<CartModel, ServiceError> {
        if quantity < 1 {
            return Err(ServiceError::ValidationError(
                "quantity must be at least 1".to_string(),
            ));
        }

        let txn = self.db.begin().await?;
        let cart = lock_active_cart(&txn, cart_id).await?;

        let snapshot = catalog::product_snapshot(&txn, product_id).await?;
        if !snapshot.active {
            return Err(ServiceError::ProductUnavailable(format!(
                "product {} is not available",
                snapshot.name
            )));
        }

        let existing = CartLine::find()
            .filter(cart_line::Column::CartId.eq(cart_id))
            .filter(cart_line::Column::ProductId.eq(product_id))
            .one(&txn)
            .await?;

        let new_quantity = existing.as_ref().map(|l| l.quantity).unwrap_or(0) + quantity;
        if snapshot.stock < new_quantity {
            return Err(ServiceError::InsufficientStock(format!(
                "requested {} of {}, {} in stock",
                new_quantity, snapshot.name, snapshot.stock
            )));
        }

        match existing {
            Some(line) => {
                increment_line(&txn, line, quantity).await?;
            }
            None => {
                let now = Utc::now();
                let line = cart_line::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    cart_id: Set(cart_id),
                    product_id: Set(product_id),
                    quantity: Set(quantity),
                    price_history_id: Set(snapshot.price_history_id),
                    created_at: Set(now),
                    updated_at: Set(now),
                };
                if let Err(err) = line.insert(&txn).await {
                    // A concurrent insert for the same product won the
                    // race; fall back to an increment-in-place.
                    if !matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) {
                        return Err(err.into());
                    }
                    warn!(%cart_id, %product_id, "concurrent line insert; retrying as update");
                    let line = CartLine::find()
                        .filter(cart_line::Column::CartId.eq(cart_id))
                        .filter(cart_line::Column::ProductId.eq(product_id))
                        .one(&txn)
                        .await?
                        .ok_or_else(|| {
                            ServiceError::InternalError(
                                "cart line vanished after unique conflict".to_string(),
                            )
                        })?;
                    increment_line(&txn, line, quantity).await?;
                }
            }
        }

        let cart = self.touch_cart(&txn, cart).await?;
        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::CartLineAdded {
                cart_id,
                product_id,
            })
            .await;
        Ok(cart)
    }

    /// Sets a line's quantity. Zero removes the line; removing the
    /// last line demotes the cart to `abandoned` inside the same
    /// transaction.
    #[instrument(skip(self))]
    pub async fn update_line_quantity(
        &self,
        cart_id: Uuid,
        product_id: Uuid,
        quantity: i32,
    ) -> Result<CartModel, ServiceError> {
        if quantity < 0 {
            return Err(ServiceError::ValidationError(
                "quantity must not be negative".to_string(),
            ));
        }

        let txn = self.db.begin().await?;
        let cart = lock_active_cart(&txn, cart_id).await?;

        let line = CartLine::find()
            .filter(cart_line::Column::CartId.eq(cart_id))
            .filter(cart_line::Column::ProductId.eq(product_id))
            .one(&txn)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Product {} is not in the cart", product_id))
            })?;

        let cart = if quantity == 0 {
            line.delete(&txn).await?;

            let remaining = CartLine::find()
                .filter(cart_line::Column::CartId.eq(cart_id))
                .count(&txn)
                .await?;

            let mut active: cart::ActiveModel = cart.into();
            if remaining == 0 {
                // Explicit post-mutation step, same transaction
                active.status = Set(cart::CartStatus::Abandoned);
            }
            active.updated_at = Set(Utc::now());
            active.expires_at = Set(Utc::now() + Duration::days(self.config.cart_ttl_days));
            let cart = active.update(&txn).await?;

            self.event_sender
                .send_or_log(Event::CartLineRemoved {
                    cart_id,
                    product_id,
                })
                .await;
            if cart.status == cart::CartStatus::Abandoned {
                self.event_sender.send_or_log(Event::CartAbandoned(cart_id)).await;
            }
            cart
        } else {
            let snapshot = catalog::product_snapshot(&txn, product_id).await?;
            if snapshot.stock < quantity {
                return Err(ServiceError::InsufficientStock(format!(
                    "requested {} of {}, {} in stock",
                    quantity, snapshot.name, snapshot.stock
                )));
            }

            let mut active: cart_line::ActiveModel = line.into();
            active.quantity = Set(quantity);
            active.updated_at = Set(Utc::now());
            active.update(&txn).await?;

            let cart = self.touch_cart(&txn, cart).await?;
            self.event_sender
                .send_or_log(Event::CartLineUpdated {
                    cart_id,
                    product_id,
                })
                .await;
            cart
        };

        txn.commit().await?;
        Ok(cart)
    }

    /// Claims the guest cart for the user at login.
    ///
    /// When the user has no active cart the guest cart is re-parented.
    /// When the user already has one, guest lines are merged into it
    /// (quantities summed, the user line's price capture kept) and the
    /// guest cart is demoted. Neither cart's lines are lost.
    #[instrument(skip(self))]
    pub async fn merge_guest_into_user(
        &self,
        session_id: &str,
        user_id: Uuid,
    ) -> Result<CartModel, ServiceError> {
        let txn = self.db.begin().await?;

        let guest = find_active_by_session(&txn, session_id)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("No active guest cart for session {}", session_id))
            })?;

        let merged = match find_active_by_user(&txn, user_id).await? {
            None => {
                let guest_id = guest.id;
                let mut active: cart::ActiveModel = guest.into();
                active.user_id = Set(Some(user_id));
                active.updated_at = Set(Utc::now());
                let cart = active.update(&txn).await?;
                info!(cart_id = %guest_id, %user_id, "re-parented guest cart");
                cart
            }
            Some(user_cart) => {
                let guest_lines = CartLine::find()
                    .filter(cart_line::Column::CartId.eq(guest.id))
                    .all(&txn)
                    .await?;

                for guest_line in guest_lines {
                    let existing = CartLine::find()
                        .filter(cart_line::Column::CartId.eq(user_cart.id))
                        .filter(cart_line::Column::ProductId.eq(guest_line.product_id))
                        .one(&txn)
                        .await?;
                    match existing {
                        Some(line) => {
                            increment_line(&txn, line, guest_line.quantity).await?;
                        }
                        None => {
                            let now = Utc::now();
                            cart_line::ActiveModel {
                                id: Set(Uuid::new_v4()),
                                cart_id: Set(user_cart.id),
                                product_id: Set(guest_line.product_id),
                                quantity: Set(guest_line.quantity),
                                price_history_id: Set(guest_line.price_history_id),
                                created_at: Set(now),
                                updated_at: Set(now),
                            }
                            .insert(&txn)
                            .await?;
                        }
                    }
                }

                let guest_id = guest.id;
                let mut guest_active: cart::ActiveModel = guest.into();
                guest_active.status = Set(cart::CartStatus::Abandoned);
                guest_active.updated_at = Set(Utc::now());
                guest_active.update(&txn).await?;

                let cart = self.touch_cart(&txn, user_cart).await?;
                self.event_sender
                    .send_or_log(Event::CartsMerged {
                        guest_cart_id: guest_id,
                        user_cart_id: cart.id,
                    })
                    .await;
                cart
            }
        };

        txn.commit().await?;
        Ok(merged)
    }

    /// Resolves the identity's active cart without creating one.
    pub async fn find_active(
        &self,
        identity: &CartIdentity,
    ) -> Result<Option<CartModel>, ServiceError> {
        if let Some(user_id) = identity.user_id {
            if let Some(cart) = find_active_by_user(&*self.db, user_id).await? {
                return Ok(Some(cart));
            }
        }
        if let Some(session_id) = identity.session_id.as_deref() {
            if let Some(cart) = find_active_by_session(&*self.db, session_id).await? {
                return Ok(Some(cart));
            }
        }
        Ok(None)
    }

    /// Cart with its materialized lines.
    pub async fn get_cart(&self, cart_id: Uuid) -> Result<CartWithLines, ServiceError> {
        let cart = Cart::find_by_id(cart_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Cart {} not found", cart_id)))?;
        let lines = CartLine::find()
            .filter(cart_line::Column::CartId.eq(cart_id))
            .all(&*self.db)
            .await?;
        Ok(CartWithLines { cart, lines })
    }

    /// Live-priced totals for the cart.
    pub async fn summary(&self, cart_id: Uuid) -> Result<CartSummary, ServiceError> {
        compute_summary(&*self.db, cart_id).await
    }

    /// Rolls the cart's expiry window forward after a mutation.
    async fn touch_cart(
        &self,
        txn: &DatabaseTransaction,
        cart: CartModel,
    ) -> Result<CartModel, ServiceError> {
        let mut active: cart::ActiveModel = cart.into();
        active.updated_at = Set(Utc::now());
        active.expires_at = Set(Utc::now() + Duration::days(self.config.cart_ttl_days));
        Ok(active.update(txn).await?)
    }
}

/// Recomputes the summary from live prices and currently-applicable
/// promotions, via the same resolver the order freeze uses. Takes any
/// connection so the freeze can run it inside its own transaction.
pub async fn compute_summary<C: ConnectionTrait>(
    conn: &C,
    cart_id: Uuid,
) -> Result<CartSummary, ServiceError> {
    let cart = Cart::find_by_id(cart_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Cart {} not found", cart_id)))?;

    let lines = CartLine::find()
        .filter(cart_line::Column::CartId.eq(cart.id))
        .all(conn)
        .await?;

    let now = Utc::now();
    let mut line_summaries = Vec::with_capacity(lines.len());
    let mut subtotal = Decimal::ZERO;
    let mut total_discount = Decimal::ZERO;

    for line in lines {
        let snapshot = catalog::product_snapshot(conn, line.product_id).await?;
        let promotions = catalog::active_promotions_for_product(conn, line.product_id).await?;
        let pricing = pricing::price_line(snapshot.unit_price, line.quantity, &promotions, now);

        subtotal += pricing.subtotal;
        total_discount += pricing.discount;
        line_summaries.push(LineSummary {
            product_id: line.product_id,
            product_name: snapshot.name,
            quantity: line.quantity,
            unit_price: pricing.unit_price,
            subtotal: pricing.subtotal,
            discount: pricing.discount,
            final_price: pricing.final_price,
            applied_promotion_id: pricing.applied_promotion.map(|p| p.id),
        });
    }

    Ok(CartSummary {
        cart_id,
        lines: line_summaries,
        subtotal,
        total_discount,
        total: subtotal - total_discount,
    })
}

/// Per-line pricing resolved exactly as the summary resolves it; the
/// order freeze consumes these for its immutable snapshot rows.
pub async fn priced_lines<C: ConnectionTrait>(
    conn: &C,
    cart_id: Uuid,
) -> Result<Vec<(cart_line::Model, pricing::LinePricing)>, ServiceError> {
    let lines = CartLine::find()
        .filter(cart_line::Column::CartId.eq(cart_id))
        .all(conn)
        .await?;

    let now = Utc::now();
    let mut priced = Vec::with_capacity(lines.len());
    for line in lines {
        let snapshot = catalog::product_snapshot(conn, line.product_id).await?;
        let promotions = catalog::active_promotions_for_product(conn, line.product_id).await?;
        let pricing = pricing::price_line(snapshot.unit_price, line.quantity, &promotions, now);
        priced.push((line, pricing));
    }
    Ok(priced)
}

/// Loads the cart under an exclusive row lock and checks it is active.
pub(crate) async fn lock_active_cart<C: ConnectionTrait>(
    conn: &C,
    cart_id: Uuid,
) -> Result<CartModel, ServiceError> {
    let cart = Cart::find_by_id(cart_id)
        .lock_exclusive()
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Cart {} not found", cart_id)))?;

    if cart.status != cart::CartStatus::Active {
        return Err(ServiceError::InvalidOperation(
            "Cart is not active".to_string(),
        ));
    }
    Ok(cart)
}

async fn find_active_by_user<C: ConnectionTrait>(
    conn: &C,
    user_id: Uuid,
) -> Result<Option<CartModel>, ServiceError> {
    Ok(Cart::find()
        .filter(cart::Column::UserId.eq(Some(user_id)))
        .filter(cart::Column::Status.eq(cart::CartStatus::Active))
        .one(conn)
        .await?)
}

async fn find_active_by_session<C: ConnectionTrait>(
    conn: &C,
    session_id: &str,
) -> Result<Option<CartModel>, ServiceError> {
    Ok(Cart::find()
        .filter(cart::Column::SessionId.eq(Some(session_id.to_string())))
        .filter(cart::Column::UserId.is_null())
        .filter(cart::Column::Status.eq(cart::CartStatus::Active))
        .one(conn)
        .await?)
}

async fn demote_active_by_user<C: ConnectionTrait>(
    conn: &C,
    user_id: Uuid,
) -> Result<(), ServiceError> {
    if let Some(cart) = find_active_by_user(conn, user_id).await? {
        let mut active: cart::ActiveModel = cart.into();
        active.status = Set(cart::CartStatus::Abandoned);
        active.updated_at = Set(Utc::now());
        active.update(conn).await?;
    }
    Ok(())
}

async fn demote_active_by_session<C: ConnectionTrait>(
    conn: &C,
    session_id: &str,
) -> Result<(), ServiceError> {
    if let Some(cart) = find_active_by_session(conn, session_id).await? {
        let mut active: cart::ActiveModel = cart.into();
        active.status = Set(cart::CartStatus::Abandoned);
        active.updated_at = Set(Utc::now());
        active.update(conn).await?;
    }
    Ok(())
}

async fn increment_line<C: ConnectionTrait>(
    conn: &C,
    line: cart_line::Model,
    by: i32,
) -> Result<(), ServiceError> {
    let quantity = line.quantity + by;
    let mut active: cart_line::ActiveModel = line.into();
    active.quantity = Set(quantity);
    active.updated_at = Set(Utc::now());
    active.update(conn).await?;
    Ok(())
}
