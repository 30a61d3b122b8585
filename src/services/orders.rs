use crate::{
    config::AppConfig,
    entities::{
        cart, order,
        order::{DeliveryType, OrderState},
        order_price_history, Order, OrderModel, OrderPriceHistory,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::{carts, checkout::CheckoutSession},
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

/// Order freeze and order lifecycle.
///
/// The freeze is the only place cart contents become binding: totals
/// and per-line snapshots are written once, inside one transaction,
/// and never recomputed from live prices.
#[derive(Clone)]
pub struct OrderService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    config: Arc<AppConfig>,
}

/// Order with its immutable line snapshots.
#[derive(Debug, Serialize)]
pub struct OrderWithLines {
    pub order: OrderModel,
    pub lines: Vec<order_price_history::Model>,
}

impl OrderService {
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

    /// Converts the session's cart into an immutable order.
    ///
    /// In one transaction: resolve live pricing through the same
    /// resolver the cart summary uses, write the order with frozen
    /// totals, write one price-history row per line (capturing the
    /// promotion actually applied at this instant), and demote the
    /// cart to `ordered`.
    #[instrument(skip(self, session), fields(cart_id = %session.cart_id))]
    pub async fn freeze_order(
        &self,
        session: &CheckoutSession,
    ) -> Result<OrderModel, ServiceError> {
        let txn = self.db.begin().await?;

        let cart = carts::lock_active_cart(&txn, session.cart_id).await?;
        if cart.user_id != Some(session.user_id) {
            return Err(ServiceError::Unauthorized(
                "Cart does not belong to this user".to_string(),
            ));
        }

        let priced = carts::priced_lines(&txn, cart.id).await?;
        if priced.is_empty() {
            return Err(ServiceError::InvalidOperation("Cart is empty".to_string()));
        }

        let subtotal: Decimal = priced.iter().map(|(_, p)| p.subtotal).sum();
        let discount: Decimal = priced.iter().map(|(_, p)| p.discount).sum();
        let goods_total = subtotal - discount;

        let delivery_type = session.delivery_type.unwrap_or(DeliveryType::Shipping);
        let shipping = self.shipping_amount(delivery_type, goods_total);
        let tax = goods_total
            * Decimal::from_f64_retain(self.config.default_tax_rate).unwrap_or(Decimal::ZERO);
        let total = goods_total + shipping + tax;

        let now = Utc::now();
        let order_id = Uuid::new_v4();
        let order = order::ActiveModel {
            id: Set(order_id),
            order_number: Set(generate_order_number()),
            user_id: Set(session.user_id),
            cart_id: Set(cart.id),
            state: Set(OrderState::Pending),
            delivery_type: Set(delivery_type),
            delivery_address_id: Set(session.delivery_address_id),
            pickup_agency_id: Set(session.pickup_agency_id),
            payment_method_id: Set(session.payment_method_id.ok_or_else(|| {
                ServiceError::ValidationError("payment method has not been set".to_string())
            })?),
            subtotal_amount: Set(subtotal),
            discount_amount: Set(discount),
            shipping_amount: Set(shipping),
            tax_amount: Set(tax),
            total_amount: Set(total),
            currency: Set(self.config.currency.clone()),
            last_payment_id: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        };
        let order = order.insert(&txn).await?;

        for (line, pricing) in &priced {
            order_price_history::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                product_id: Set(line.product_id),
                quantity: Set(pricing.quantity),
                unit_price: Set(pricing.unit_price),
                subtotal: Set(pricing.subtotal),
                discount_amount: Set(pricing.discount),
                final_amount: Set(pricing.final_price),
                promotion_id: Set(pricing.applied_promotion.as_ref().map(|p| p.id)),
                created_at: Set(now),
            }
            .insert(&txn)
            .await?;
        }

        // The cart transitions to `ordered` exactly once, here.
        let mut cart_active: cart::ActiveModel = cart.into();
        cart_active.status = Set(cart::CartStatus::Ordered);
        cart_active.updated_at = Set(now);
        cart_active.update(&txn).await?;

        txn.commit().await?;

        self.event_sender.send_or_log(Event::OrderCreated(order_id)).await;
        info!(%order_id, total = %total, "order frozen");
        Ok(order)
    }

    pub async fn get_order(&self, order_id: Uuid) -> Result<OrderWithLines, ServiceError> {
        let order = Order::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;
        let lines = OrderPriceHistory::find()
            .filter(order_price_history::Column::OrderId.eq(order_id))
            .all(&*self.db)
            .await?;
        Ok(OrderWithLines { order, lines })
    }

    pub async fn list_orders_for_user(
        &self,
        user_id: Uuid,
        page: u64,
        per_page: u64,
    ) -> Result<(Vec<OrderModel>, u64), ServiceError> {
        let paginator = Order::find()
            .filter(order::Column::UserId.eq(user_id))
            .order_by_desc(order::Column::CreatedAt)
            .paginate(&*self.db, per_page);

        let total = paginator.num_items().await?;
        let data = paginator.fetch_page(page.saturating_sub(1)).await?;
        Ok((data, total))
    }

    /// Applies a state transition with full FSM validation. Used by
    /// the fulfillment endpoints; payment-driven transitions go
    /// through the orchestrator's shared mapping instead.
    #[instrument(skip(self))]
    pub async fn transition(
        &self,
        order_id: Uuid,
        next: OrderState,
    ) -> Result<OrderModel, ServiceError> {
        let txn = self.db.begin().await?;

        let order = Order::find_by_id(order_id)
            .lock_exclusive()
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        let from = order.state;
        ensure_transition(from, next)?;

        if from == next {
            txn.commit().await?;
            return Ok(order);
        }

        let mut active: order::ActiveModel = order.into();
        active.state = Set(next);
        active.updated_at = Set(Utc::now());
        let updated = active.update(&txn).await?;
        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::OrderStateChanged {
                order_id,
                from,
                to: next,
            })
            .await;
        info!(%order_id, %from, %next, "order transitioned");
        Ok(updated)
    }

    fn shipping_amount(&self, delivery_type: DeliveryType, goods_total: Decimal) -> Decimal {
        if delivery_type == DeliveryType::Pickup {
            return Decimal::ZERO;
        }
        let threshold =
            Decimal::from_f64_retain(self.config.free_shipping_threshold).unwrap_or(Decimal::ZERO);
        if threshold > Decimal::ZERO && goods_total >= threshold {
            Decimal::ZERO
        } else {
            Decimal::from_f64_retain(self.config.shipping_flat_rate).unwrap_or(Decimal::ZERO)
        }
    }
}

/// Rejects any transition the state machine does not list.
pub(crate) fn ensure_transition(from: OrderState, to: OrderState) -> Result<(), ServiceError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(ServiceError::InvalidStateTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

fn generate_order_number() -> String {
    let date = Utc::now().format("%Y%m%d");
    let suffix = Uuid::new_v4()
        .to_string()
        .split('-')
        .next()
        .unwrap()
        .to_uppercase();
    format!("ORD-{}-{}", date, suffix)
}

/// Loads an order inside an existing transaction under an exclusive
/// lock; shared with the payment orchestrator and the reconciler.
pub(crate) async fn lock_order<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
) -> Result<OrderModel, ServiceError> {
    Order::find_by_id(order_id)
        .lock_exclusive()
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_transition_rejects_unlisted_jump() {
        let err = ensure_transition(OrderState::Pending, OrderState::Delivered).unwrap_err();
        assert!(matches!(
            err,
            ServiceError::InvalidStateTransition { .. }
        ));
    }

    #[test]
    fn ensure_transition_accepts_retry_reentry() {
        assert!(ensure_transition(OrderState::PaymentFailed, OrderState::PaymentPending).is_ok());
    }

    #[test]
    fn order_number_shape() {
        let n = generate_order_number();
        assert!(n.starts_with("ORD-"));
        assert_eq!(n.split('-').count(), 3);
    }
}
