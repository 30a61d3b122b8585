use crate::{
    entities::{payment, Payment},
    errors::ServiceError,
    events::{Event, EventSender},
    gateway::GatewayRegistry,
    services::payments::apply_payment_outcome,
};
use http::HeaderMap;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, TransactionTrait};
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Webhook reconciler.
///
/// Replays the orchestrator's outcome-mapping routine on asynchronous
/// provider notifications. Nothing mutates before the signature
/// verifies and the event type passes the provider's allow-list.
/// Replaying an identical event is a logged no-op, which is also what
/// lets a late webhook resolve a synchronous timeout.
#[derive(Clone)]
pub struct WebhookReconciler {
    db: Arc<DatabaseConnection>,
    registry: Arc<GatewayRegistry>,
    event_sender: Arc<EventSender>,
}

impl WebhookReconciler {
    pub fn new(
        db: Arc<DatabaseConnection>,
        registry: Arc<GatewayRegistry>,
        event_sender: Arc<EventSender>,
    ) -> Self {
        Self {
            db,
            registry,
            event_sender,
        }
    }

    /// Processes one provider notification. Returns only after the
    /// durable state update commits; any error maps to a non-2xx so
    /// the provider retries.
    #[instrument(skip(self, headers, body))]
    pub async fn handle(
        &self,
        gateway_id: &str,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<(), ServiceError> {
        let gateway = self.registry.get(gateway_id).map_err(|_| {
            ServiceError::NotFound(format!("Unknown gateway '{}'", gateway_id))
        })?;

        if !gateway.verify_webhook_signature(headers, body) {
            warn!(gateway_id, "webhook signature verification failed");
            return Err(ServiceError::Unauthorized(
                "invalid webhook signature".to_string(),
            ));
        }

        let event = gateway
            .parse_webhook(body)
            .map_err(|e| ServiceError::ValidationError(format!("invalid webhook payload: {}", e)))?;

        if !gateway
            .allowed_webhook_events()
            .contains(&event.event_type.as_str())
        {
            return Err(ServiceError::ValidationError(format!(
                "event type '{}' is not accepted from gateway '{}'",
                event.event_type, gateway_id
            )));
        }

        // The provider transaction id is the stable key; an order
        // reference may not be resolvable yet in degenerate cases.
        let payment = Payment::find()
            .filter(payment::Column::GatewayId.eq(gateway_id))
            .filter(payment::Column::TransactionId.eq(Some(event.transaction_id.clone())))
            .one(&*self.db)
            .await?
            .ok_or_else(|| {
                // The provider knows an attempt this side never
                // recorded; that is a reportable inconsistency.
                warn!(
                    gateway_id,
                    transaction_id = %event.transaction_id,
                    "webhook references a payment that was never recorded"
                );
                ServiceError::NotFound(format!(
                    "no payment recorded for transaction {}",
                    event.transaction_id
                ))
            })?;

        let txn = self.db.begin().await?;
        let application = apply_payment_outcome(
            &txn,
            payment,
            event.state,
            Some(event.transaction_id.clone()),
            None,
            Some(event.raw),
        )
        .await?;
        txn.commit().await?;

        if application.changed {
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
        } else {
            info!(
                gateway_id,
                transaction_id = %event.transaction_id,
                "webhook replay; state already applied"
            );
        }

        self.event_sender
            .send_or_log(Event::WebhookProcessed {
                gateway_id: gateway_id.to_string(),
                transaction_id: event.transaction_id,
            })
            .await;
        Ok(())
    }
}
