use crate::{
    config::AppConfig,
    entities::{
        order::OrderState,
        payment,
        payment::PaymentState,
        payment_method::PaymentMethodKind,
        Order, Payment, PaymentMethod, PaymentModel,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    gateway::{
        Bank, CardChargeRequest, ChargeOutcome, GatewayError, GatewayRegistry, PseChargeRequest,
    },
    services::orders::{ensure_transition, lock_order},
};
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait,
    PaginatorTrait, QueryFilter, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Payment orchestrator.
///
/// Creates one attempt row per gateway call sequence, dispatches to
/// the routed provider, and maps the normalized outcome onto the order
/// state through the same routine the webhook reconciler replays, so
/// the synchronous and asynchronous paths cannot diverge.
#[derive(Clone)]
pub struct PaymentService {
    db: Arc<DatabaseConnection>,
    registry: Arc<GatewayRegistry>,
    event_sender: Arc<EventSender>,
    config: Arc<AppConfig>,
}

/// Client payment input. Card fields for card methods, PSE fields for
/// bank redirect; the raw card never appears here, only the token.
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentRequest {
    pub customer_email: String,
    pub card_token: Option<String>,
    pub installments: Option<u32>,
    pub bank_code: Option<String>,
    pub user_type: Option<String>,
    pub user_legal_id: Option<String>,
    pub redirect_url: Option<String>,
}

/// Structured result the client can render a retry prompt from.
/// Failures are reported here as data, never as raw gateway payloads.
#[derive(Debug, Serialize)]
pub struct PaymentOutcomeView {
    pub payment_id: Uuid,
    pub order_id: Uuid,
    pub transaction_id: Option<String>,
    pub state: PaymentState,
    pub order_state: OrderState,
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PaymentStatusView {
    pub payment: PaymentModel,
    pub order_state: OrderState,
}

impl PaymentService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        registry: Arc<GatewayRegistry>,
        event_sender: Arc<EventSender>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            db,
            registry,
            event_sender,
            config,
        }
    }

    /// Runs one payment attempt for the order.
    ///
    /// The attempt row is committed `pending` (and the order moved to
    /// `payment_pending`) *before* the gateway call, so a crash
    /// mid-call still leaves the attempt on record. The gateway
    /// outcome, including failure (which is data), is committed with
    /// the derived order state in a second transaction. A timed-out
    /// call is an unknown outcome: the payment stays `processing` for
    /// the webhook to resolve, never force-failed.
    #[instrument(skip(self, request), fields(order_id = %order_id))]
    pub async fn process_payment(
        &self,
        order_id: Uuid,
        request: PaymentRequest,
    ) -> Result<PaymentOutcomeView, ServiceError> {
        let order = Order::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        if !matches!(
            order.state,
            OrderState::Pending | OrderState::PaymentPending | OrderState::PaymentFailed
        ) {
            return Err(ServiceError::Conflict(format!(
                "Order in state {} cannot accept a new payment attempt",
                order.state
            )));
        }

        let attempts_so_far = Payment::find()
            .filter(payment::Column::OrderId.eq(order_id))
            .count(&*self.db)
            .await?;
        if attempts_so_far >= self.config.max_payment_attempts {
            return Err(ServiceError::Conflict(format!(
                "Order {} reached the limit of {} payment attempts",
                order.order_number, self.config.max_payment_attempts
            )));
        }

        let method = PaymentMethod::find_by_id(order.payment_method_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!(
                    "Payment method {} not found",
                    order.payment_method_id
                ))
            })?;
        validate_request_fields(method.kind, &request)?;

        let gateway = self
            .registry
            .resolve_for_method(&method, order.total_amount, &order.currency)
            .map_err(map_gateway_error)?;
        let gateway_id = gateway.info().id;

        // Transaction 1: the attempt exists before the gateway is hit.
        let txn = self.db.begin().await?;
        let order = lock_order(&txn, order_id).await?;
        ensure_transition(order.state, OrderState::PaymentPending)?;

        let now = Utc::now();
        let payment_id = Uuid::new_v4();
        let attempt = payment::ActiveModel {
            id: Set(payment_id),
            order_id: Set(order_id),
            payment_method_id: Set(method.id),
            gateway_id: Set(gateway_id.clone()),
            transaction_id: Set(None),
            amount: Set(order.total_amount),
            currency: Set(order.currency.clone()),
            state: Set(PaymentState::Pending),
            attempts: Set(1),
            last_attempt_at: Set(now),
            description: Set(None),
            gateway_response: Set(None),
            metadata: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        };
        let attempt = attempt.insert(&txn).await?;

        let order_from = order.state;
        let mut order_active: crate::entities::order::ActiveModel = order.clone().into();
        if order_from != OrderState::PaymentPending {
            order_active.state = Set(OrderState::PaymentPending);
        }
        order_active.last_payment_id = Set(Some(payment_id));
        order_active.updated_at = Set(now);
        order_active.update(&txn).await?;
        txn.commit().await?;

        if order_from != OrderState::PaymentPending {
            self.event_sender
                .send_or_log(Event::OrderStateChanged {
                    order_id,
                    from: order_from,
                    to: OrderState::PaymentPending,
                })
                .await;
        }
        self.event_sender
            .send_or_log(Event::PaymentAttemptCreated {
                payment_id,
                order_id,
            })
            .await;

        // Gateway dispatch, outside any transaction.
        let dispatch = self
            .dispatch(&*gateway, method.kind, &order, &request)
            .await;

        // Transaction 2: outcome + derived order state, atomically.
        let txn = self.db.begin().await?;
        let application = match dispatch {
            Ok(outcome) => {
                let description = describe_outcome(method.kind, outcome.state);
                apply_payment_outcome(
                    &txn,
                    attempt,
                    outcome.state,
                    Some(outcome.transaction_id.clone()),
                    Some(outcome.status_message.unwrap_or(description)),
                    Some(outcome.raw),
                )
                .await?
                .with_redirect(outcome.redirect_url)
            }
            Err(GatewayError::Timeout) => {
                warn!(%payment_id, "gateway call timed out; outcome unknown until webhook");
                apply_payment_outcome(
                    &txn,
                    attempt,
                    PaymentState::Processing,
                    None,
                    Some("payment outcome pending gateway confirmation".to_string()),
                    None,
                )
                .await?
            }
            Err(err) => {
                // The failure itself is data; losing it would make
                // reconciliation impossible later.
                apply_payment_outcome(
                    &txn,
                    attempt,
                    PaymentState::Failed,
                    None,
                    Some(err.to_string()),
                    None,
                )
                .await?
            }
        };
        txn.commit().await?;

        self.emit_outcome_events(&application).await;

        Ok(PaymentOutcomeView {
            payment_id: application.payment.id,
            order_id,
            transaction_id: application.payment.transaction_id.clone(),
            state: application.payment.state,
            order_state: application.order_state,
            description: application.payment.description.clone(),
            redirect_url: application.redirect_url,
        })
    }

    async fn dispatch(
        &self,
        gateway: &dyn crate::gateway::PaymentGateway,
        kind: PaymentMethodKind,
        order: &crate::entities::OrderModel,
        request: &PaymentRequest,
    ) -> Result<ChargeOutcome, GatewayError> {
        match kind {
            PaymentMethodKind::CreditCard | PaymentMethodKind::DebitCard => {
                let charge = CardChargeRequest {
                    reference: order.order_number.clone(),
                    amount: order.total_amount,
                    currency: order.currency.clone(),
                    card_token: request.card_token.clone().unwrap_or_default(),
                    installments: request.installments.unwrap_or(1),
                    customer_email: request.customer_email.clone(),
                };
                gateway.process_card_payment(&charge).await
            }
            PaymentMethodKind::Pse => {
                let charge = PseChargeRequest {
                    reference: order.order_number.clone(),
                    amount: order.total_amount,
                    currency: order.currency.clone(),
                    bank_code: request.bank_code.clone().unwrap_or_default(),
                    user_type: request.user_type.clone().unwrap_or_else(|| "0".to_string()),
                    user_legal_id: request.user_legal_id.clone().unwrap_or_default(),
                    customer_email: request.customer_email.clone(),
                    redirect_url: request.redirect_url.clone().unwrap_or_default(),
                };
                gateway.process_pse_payment(&charge).await
            }
            PaymentMethodKind::Transfer | PaymentMethodKind::Cash => Err(
                GatewayError::MissingConfiguration(format!(
                    "no online gateway handles {:?} payments",
                    kind
                )),
            ),
        }
    }

    /// Read model for `GET /payments/status/:transaction_id`.
    pub async fn payment_status(
        &self,
        transaction_id: &str,
    ) -> Result<PaymentStatusView, ServiceError> {
        let payment = Payment::find()
            .filter(payment::Column::TransactionId.eq(Some(transaction_id.to_string())))
            .one(&*self.db)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!(
                    "No payment with transaction id {}",
                    transaction_id
                ))
            })?;

        let order = Order::find_by_id(payment.order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Order {} not found", payment.order_id))
            })?;

        Ok(PaymentStatusView {
            payment,
            order_state: order.state,
        })
    }

    /// Initiates a full refund for an approved payment.
    #[instrument(skip(self))]
    pub async fn refund_payment(&self, payment_id: Uuid) -> Result<PaymentOutcomeView, ServiceError> {
        let payment = Payment::find_by_id(payment_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Payment {} not found", payment_id)))?;

        if payment.state != PaymentState::Approved {
            return Err(ServiceError::Conflict(format!(
                "Payment in state {} cannot be refunded",
                payment.state
            )));
        }
        let transaction_id = payment.transaction_id.clone().ok_or_else(|| {
            ServiceError::Conflict("Payment has no gateway transaction to refund".to_string())
        })?;

        let gateway = self
            .registry
            .get(&payment.gateway_id)
            .map_err(map_gateway_error)?;
        let outcome = gateway
            .refund_transaction(&transaction_id, payment.amount)
            .await
            .map_err(map_gateway_error)?;

        let txn = self.db.begin().await?;
        let application = apply_payment_outcome(
            &txn,
            payment,
            outcome.state,
            Some(outcome.transaction_id),
            Some("payment refunded".to_string()),
            Some(outcome.raw),
        )
        .await?;
        txn.commit().await?;

        self.emit_outcome_events(&application).await;
        let order_id = application.payment.order_id;
        Ok(PaymentOutcomeView {
            payment_id: application.payment.id,
            order_id,
            transaction_id: application.payment.transaction_id.clone(),
            state: application.payment.state,
            order_state: application.order_state,
            description: application.payment.description.clone(),
            redirect_url: None,
        })
    }

    /// PSE participating banks, from the routed provider.
    pub async fn pse_banks(&self) -> Result<Vec<Bank>, ServiceError> {
        let gateway = self
            .registry
            .route_for(PaymentMethodKind::Pse.routing_key())
            .map_err(map_gateway_error)?;
        gateway.banks().await.map_err(map_gateway_error)
    }

    async fn emit_outcome_events(&self, application: &OutcomeApplication) {
        if !application.changed {
            return;
        }
        self.event_sender
            .send_or_log(Event::PaymentStateChanged {
                payment_id: application.payment.id,
                order_id: application.payment.order_id,
                state: application.payment.state,
            })
            .await;
        if let Some(from) = application.order_transition {
            self.event_sender
                .send_or_log(Event::OrderStateChanged {
                    order_id: application.payment.order_id,
                    from,
                    to: application.order_state,
                })
                .await;
        }
    }
}

/// Result of running the shared outcome-mapping routine.
#[derive(Debug)]
pub(crate) struct OutcomeApplication {
    pub payment: PaymentModel,
    pub order_state: OrderState,
    /// Previous order state when a transition actually happened
    pub order_transition: Option<OrderState>,
    /// False when the application was an idempotent replay
    pub changed: bool,
    pub redirect_url: Option<String>,
}

impl OutcomeApplication {
    fn with_redirect(mut self, redirect_url: Option<String>) -> Self {
        self.redirect_url = redirect_url;
        self
    }
}

/// The one place a normalized payment state is written and the order
/// state derived from it. The orchestrator calls this synchronously
/// and the webhook reconciler replays it; replaying values that are
/// already set is a logged no-op, which is what makes duplicate
/// webhook deliveries harmless.
pub(crate) async fn apply_payment_outcome<C: ConnectionTrait>(
    conn: &C,
    payment: PaymentModel,
    new_state: PaymentState,
    transaction_id: Option<String>,
    description: Option<String>,
    raw: Option<serde_json::Value>,
) -> Result<OutcomeApplication, ServiceError> {
    let target = map_payment_state_to_order(new_state);
    let order = lock_order(conn, payment.order_id).await?;

    // Replay detection: state already applied and no new transaction
    // id to record. A fresh pending outcome still writes its id.
    let transaction_recorded = match transaction_id.as_deref() {
        None => true,
        Some(tx_id) => payment.transaction_id.as_deref() == Some(tx_id),
    };
    if payment.state == new_state && order.state == target && transaction_recorded {
        info!(
            payment_id = %payment.id,
            state = %new_state,
            "outcome already applied; idempotent replay"
        );
        return Ok(OutcomeApplication {
            payment,
            order_state: order.state,
            order_transition: None,
            changed: false,
            redirect_url: None,
        });
    }

    ensure_transition(order.state, target)?;

    let payment_id = payment.id;
    let mut payment_active: payment::ActiveModel = payment.into();
    payment_active.state = Set(new_state);
    if let Some(tx_id) = transaction_id {
        payment_active.transaction_id = Set(Some(tx_id));
    }
    if let Some(description) = description {
        payment_active.description = Set(Some(description));
    }
    if let Some(raw) = raw {
        payment_active.gateway_response = Set(Some(raw));
    }
    payment_active.updated_at = Set(Utc::now());
    let payment = payment_active.update(conn).await?;

    let order_from = order.state;
    let order_state = if order_from != target {
        let mut order_active: crate::entities::order::ActiveModel = order.into();
        order_active.state = Set(target);
        order_active.last_payment_id = Set(Some(payment_id));
        order_active.updated_at = Set(Utc::now());
        order_active.update(conn).await?.state
    } else {
        order_from
    };

    Ok(OutcomeApplication {
        payment,
        order_state,
        order_transition: (order_from != order_state).then_some(order_from),
        changed: true,
        redirect_url: None,
    })
}

/// Shared payment-state to order-state mapping. Identical for every
/// payment method; only the user-facing description text varies.
pub fn map_payment_state_to_order(state: PaymentState) -> OrderState {
    match state {
        PaymentState::Pending => OrderState::PaymentPending,
        PaymentState::Processing => OrderState::PaymentProcessing,
        PaymentState::Approved => OrderState::PaymentCompleted,
        PaymentState::Rejected | PaymentState::Failed => OrderState::PaymentFailed,
        PaymentState::Cancelled => OrderState::Cancelled,
        PaymentState::Refunded => OrderState::Refunded,
    }
}

/// Method-aware wording for the shopper; the state mapping above is
/// method-agnostic.
pub fn describe_outcome(kind: PaymentMethodKind, state: PaymentState) -> String {
    match (kind, state) {
        (PaymentMethodKind::Pse, PaymentState::Pending) => {
            "waiting for the shopper to approve the debit at their bank".to_string()
        }
        (PaymentMethodKind::Pse, PaymentState::Rejected | PaymentState::Failed) => {
            "the bank did not authorize the PSE debit".to_string()
        }
        (_, PaymentState::Rejected | PaymentState::Failed) => {
            "the card payment was declined".to_string()
        }
        (_, PaymentState::Approved) => "payment approved".to_string(),
        (_, PaymentState::Pending) => "payment pending".to_string(),
        (_, PaymentState::Processing) => "payment processing".to_string(),
        (_, PaymentState::Cancelled) => "payment cancelled".to_string(),
        (_, PaymentState::Refunded) => "payment refunded".to_string(),
    }
}

fn validate_request_fields(
    kind: PaymentMethodKind,
    request: &PaymentRequest,
) -> Result<(), ServiceError> {
    match kind {
        PaymentMethodKind::CreditCard | PaymentMethodKind::DebitCard => {
            if request.card_token.as_deref().unwrap_or("").is_empty() {
                return Err(ServiceError::ValidationError(
                    "card_token is required for card payments".to_string(),
                ));
            }
        }
        PaymentMethodKind::Pse => {
            if request.bank_code.as_deref().unwrap_or("").is_empty() {
                return Err(ServiceError::ValidationError(
                    "bank_code is required for PSE payments".to_string(),
                ));
            }
            if request.user_legal_id.as_deref().unwrap_or("").is_empty() {
                return Err(ServiceError::ValidationError(
                    "user_legal_id is required for PSE payments".to_string(),
                ));
            }
        }
        PaymentMethodKind::Transfer | PaymentMethodKind::Cash => {}
    }
    Ok(())
}

/// Configuration problems surface as 500s, everything else the
/// provider reports stays a gateway error (502).
fn map_gateway_error(err: GatewayError) -> ServiceError {
    match err {
        GatewayError::MissingConfiguration(msg) => ServiceError::MissingGatewayConfiguration(msg),
        other => ServiceError::Gateway(other),
    }
}
