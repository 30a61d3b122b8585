use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::entities::order::OrderState;
use crate::entities::payment::PaymentState;

/// Domain events published by the pipeline. The processing loop is the
/// hook point for the external notification collaborator: state is
/// always durably committed before the event is sent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    // Cart events
    CartCreated(Uuid),
    CartLineAdded { cart_id: Uuid, product_id: Uuid },
    CartLineUpdated { cart_id: Uuid, product_id: Uuid },
    CartLineRemoved { cart_id: Uuid, product_id: Uuid },
    CartAbandoned(Uuid),
    CartsMerged { guest_cart_id: Uuid, user_cart_id: Uuid },

    // Checkout events
    CheckoutStarted { cart_id: Uuid, session_id: Uuid },
    CheckoutCompleted { session_id: Uuid, order_id: Uuid },

    // Order events
    OrderCreated(Uuid),
    OrderStateChanged {
        order_id: Uuid,
        from: OrderState,
        to: OrderState,
    },

    // Payment events
    PaymentAttemptCreated { payment_id: Uuid, order_id: Uuid },
    PaymentStateChanged {
        payment_id: Uuid,
        order_id: Uuid,
        state: PaymentState,
    },
    WebhookProcessed {
        gateway_id: String,
        transaction_id: String,
    },
}

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event, surfacing the failure to the caller.
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends an event, logging (not propagating) delivery failures.
    /// Services use this after commit: a full channel must not fail the
    /// request whose state is already durable.
    pub async fn send_or_log(&self, event: Event) {
        if let Err(e) = self.send(event.clone()).await {
            warn!(?event, "Dropping event: {}", e);
        }
    }
}

/// Background event processing loop. Forwards state-change events to
/// whatever notification transport is wired in.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match &event {
            Event::OrderStateChanged { order_id, from, to } => {
                info!(%order_id, ?from, ?to, "order state changed");
            }
            Event::PaymentStateChanged {
                payment_id,
                order_id,
                state,
            } => {
                info!(%payment_id, %order_id, ?state, "payment state changed");
            }
            other => {
                info!(event = ?other, "event processed");
            }
        }
    }

    info!("Event processing loop stopped");
}
