use crate::{
    cache::CacheBackend,
    config::AppConfig,
    entities::{cart, order::DeliveryType, payment_method, Cart, PaymentMethod},
    errors::ServiceError,
    events::{Event, EventSender},
    services::{carts, geography, orders::OrderService},
};
use chrono::{DateTime, Utc};
use sea_orm::{DatabaseConnection, EntityTrait};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;
use validator::Validate;

/// Checkout wizard state accumulated between "begin checkout" and
/// "order created".
///
/// Lives only in the cache layer under a hard TTL; expiry mid-flow
/// means the shopper restarts checkout. Each step is independently
/// re-settable until the order is created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutSession {
    pub id: Uuid,
    pub cart_id: Uuid,
    pub user_id: Uuid,
    pub delivery_type: Option<DeliveryType>,
    pub delivery_address_id: Option<Uuid>,
    pub pickup_agency_id: Option<Uuid>,
    pub payment_method_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// Delivery step input. `SHIPPING` takes an address id XOR `PICKUP`
/// takes an agency id.
#[derive(Debug, Deserialize, Validate)]
pub struct DeliveryInput {
    pub delivery_type: DeliveryType,
    pub delivery_address_id: Option<Uuid>,
    pub pickup_agency_id: Option<Uuid>,
}

/// Result of validating a payment method against the live cart total.
#[derive(Debug, Serialize)]
pub struct PaymentMethodValidation {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Clone)]
pub struct CheckoutService {
    db: Arc<DatabaseConnection>,
    cache: Arc<dyn CacheBackend>,
    orders: Arc<OrderService>,
    event_sender: Arc<EventSender>,
    config: Arc<AppConfig>,
}

impl CheckoutService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        cache: Arc<dyn CacheBackend>,
        orders: Arc<OrderService>,
        event_sender: Arc<EventSender>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            db,
            cache,
            orders,
            event_sender,
            config,
        }
    }

    /// Starts a checkout session for the user's active cart. Guest
    /// checkout is not supported: session creation requires a user id.
    #[instrument(skip(self))]
    pub async fn begin(&self, user_id: Uuid, cart_id: Uuid) -> Result<CheckoutSession, ServiceError> {
        let cart = Cart::find_by_id(cart_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Cart {} not found", cart_id)))?;

        if cart.user_id != Some(user_id) {
            return Err(ServiceError::Unauthorized(
                "Cart does not belong to this user".to_string(),
            ));
        }
        if cart.status != cart::CartStatus::Active {
            return Err(ServiceError::InvalidOperation(
                "Cart is not active".to_string(),
            ));
        }

        let summary = carts::compute_summary(&*self.db, cart_id).await?;
        if summary.lines.is_empty() {
            return Err(ServiceError::InvalidOperation("Cart is empty".to_string()));
        }

        let session = CheckoutSession {
            id: Uuid::new_v4(),
            cart_id,
            user_id,
            delivery_type: None,
            delivery_address_id: None,
            pickup_agency_id: None,
            payment_method_id: None,
            created_at: Utc::now(),
        };
        self.store(&session).await?;

        self.event_sender
            .send_or_log(Event::CheckoutStarted {
                cart_id,
                session_id: session.id,
            })
            .await;
        info!(session_id = %session.id, %cart_id, "checkout started");
        Ok(session)
    }

    /// Loads a live session; an expired or unknown id is a not-found,
    /// and the shopper restarts checkout.
    pub async fn session(&self, session_id: Uuid) -> Result<CheckoutSession, ServiceError> {
        let raw = self
            .cache
            .get(&cache_key(session_id))
            .await
            .map_err(|e| ServiceError::CacheError(e.to_string()))?
            .ok_or_else(|| {
                ServiceError::NotFound("Checkout session not found or expired".to_string())
            })?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Sets the delivery step. Validation fails closed: a shipping
    /// selection must reference an existing address, a pickup
    /// selection an existing agency.
    #[instrument(skip(self))]
    pub async fn set_delivery(
        &self,
        session_id: Uuid,
        input: DeliveryInput,
    ) -> Result<CheckoutSession, ServiceError> {
        let mut session = self.session(session_id).await?;
        self.validate_delivery_method(&input).await?;

        session.delivery_type = Some(input.delivery_type);
        match input.delivery_type {
            DeliveryType::Shipping => {
                session.delivery_address_id = input.delivery_address_id;
                session.pickup_agency_id = None;
            }
            DeliveryType::Pickup => {
                session.pickup_agency_id = input.pickup_agency_id;
                session.delivery_address_id = None;
            }
        }
        self.store(&session).await?;
        Ok(session)
    }

    async fn validate_delivery_method(&self, input: &DeliveryInput) -> Result<(), ServiceError> {
        match input.delivery_type {
            DeliveryType::Shipping => {
                let address_id = input.delivery_address_id.ok_or_else(|| {
                    ServiceError::ValidationError(
                        "delivery_address_id is required for shipping".to_string(),
                    )
                })?;
                if !geography::address_exists(&*self.db, address_id).await? {
                    return Err(ServiceError::ValidationError(format!(
                        "address {} does not exist",
                        address_id
                    )));
                }
            }
            DeliveryType::Pickup => {
                let agency_id = input.pickup_agency_id.ok_or_else(|| {
                    ServiceError::ValidationError(
                        "pickup_agency_id is required for pickup".to_string(),
                    )
                })?;
                if !geography::agency_exists(&*self.db, agency_id).await? {
                    return Err(ServiceError::ValidationError(format!(
                        "agency {} does not exist",
                        agency_id
                    )));
                }
            }
        }
        Ok(())
    }

    /// Checks the chosen method against the *live* cart total. Run on
    /// every call rather than cached; the cart can still change until
    /// the order is created.
    pub async fn validate_payment_method(
        &self,
        session: &CheckoutSession,
        payment_method_id: Uuid,
    ) -> Result<PaymentMethodValidation, ServiceError> {
        let method = PaymentMethod::find_by_id(payment_method_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Payment method {} not found", payment_method_id))
            })?;

        if !method.enabled {
            return Ok(PaymentMethodValidation {
                valid: false,
                reason: Some(format!("payment method {} is disabled", method.name)),
            });
        }

        let summary = carts::compute_summary(&*self.db, session.cart_id).await?;
        if !method.accepts_amount(summary.total) {
            return Ok(PaymentMethodValidation {
                valid: false,
                reason: Some(method_window_message(&method, &summary)),
            });
        }

        Ok(PaymentMethodValidation {
            valid: true,
            reason: None,
        })
    }

    /// Sets the payment method step after validating it.
    #[instrument(skip(self))]
    pub async fn set_payment_method(
        &self,
        session_id: Uuid,
        payment_method_id: Uuid,
    ) -> Result<(CheckoutSession, PaymentMethodValidation), ServiceError> {
        let mut session = self.session(session_id).await?;
        let validation = self.validate_payment_method(&session, payment_method_id).await?;

        if validation.valid {
            session.payment_method_id = Some(payment_method_id);
            self.store(&session).await?;
        }
        Ok((session, validation))
    }

    /// Freezes the session's cart into an order and destroys the
    /// session. Both wizard steps must be complete, and the payment
    /// method is re-validated against the live total one last time.
    #[instrument(skip(self))]
    pub async fn create_order(
        &self,
        session_id: Uuid,
    ) -> Result<crate::entities::OrderModel, ServiceError> {
        let session = self.session(session_id).await?;

        if session.delivery_type.is_none() {
            return Err(ServiceError::ValidationError(
                "delivery method has not been set".to_string(),
            ));
        }
        let payment_method_id = session.payment_method_id.ok_or_else(|| {
            ServiceError::ValidationError("payment method has not been set".to_string())
        })?;

        let validation = self
            .validate_payment_method(&session, payment_method_id)
            .await?;
        if !validation.valid {
            return Err(ServiceError::ValidationError(
                validation
                    .reason
                    .unwrap_or_else(|| "payment method is not valid for this cart".to_string()),
            ));
        }

        let order = self.orders.freeze_order(&session).await?;
        self.destroy(session_id).await?;

        self.event_sender
            .send_or_log(Event::CheckoutCompleted {
                session_id,
                order_id: order.id,
            })
            .await;
        info!(order_id = %order.id, %session_id, "checkout completed");
        Ok(order)
    }

    pub async fn destroy(&self, session_id: Uuid) -> Result<(), ServiceError> {
        self.cache
            .delete(&cache_key(session_id))
            .await
            .map_err(|e| ServiceError::CacheError(e.to_string()))
    }

    /// Persists the session with the TTL that remains from creation;
    /// the 30-minute window is hard, not rolling.
    async fn store(&self, session: &CheckoutSession) -> Result<(), ServiceError> {
        let elapsed = (Utc::now() - session.created_at).num_seconds().max(0) as u64;
        let ttl_secs = self.config.checkout_session_ttl_secs;
        if elapsed >= ttl_secs {
            return Err(ServiceError::NotFound(
                "Checkout session not found or expired".to_string(),
            ));
        }
        let remaining = Duration::from_secs(ttl_secs - elapsed);

        let raw = serde_json::to_string(session)?;
        self.cache
            .set(&cache_key(session.id), &raw, Some(remaining))
            .await
            .map_err(|e| ServiceError::CacheError(e.to_string()))
    }
}

fn cache_key(session_id: Uuid) -> String {
    format!("checkout:{}", session_id)
}

fn method_window_message(
    method: &payment_method::Model,
    summary: &carts::CartSummary,
) -> String {
    match (method.min_amount, method.max_amount) {
        (Some(min), _) if summary.total < min => format!(
            "cart total {} is below the minimum {} for {}",
            summary.total, min, method.name
        ),
        (_, Some(max)) if summary.total > max => format!(
            "cart total {} is above the maximum {} for {}",
            summary.total, max, method.name
        ),
        _ => format!("cart total {} is not accepted by {}", summary.total, method.name),
    }
}
