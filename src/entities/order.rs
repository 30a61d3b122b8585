use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use strum::Display;
use uuid::Uuid;

/// Immutable order created from exactly one cart. Monetary fields are
/// frozen at creation and never recomputed from live prices.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "orders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub order_number: String,
    pub user_id: Uuid,
    pub cart_id: Uuid,
    pub state: OrderState,
    pub delivery_type: DeliveryType,
    #[sea_orm(nullable)]
    pub delivery_address_id: Option<Uuid>,
    #[sea_orm(nullable)]
    pub pickup_agency_id: Option<Uuid>,
    pub payment_method_id: Uuid,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub subtotal_amount: Decimal,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub discount_amount: Decimal,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub shipping_amount: Decimal,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub tax_amount: Decimal,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub total_amount: Decimal,
    pub currency: String,
    /// Back-reference to the most recent payment attempt; the payment
    /// owns the relationship via its `order_id`.
    #[sea_orm(nullable)]
    pub last_payment_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::order_price_history::Entity")]
    Lines,
    #[sea_orm(has_many = "super::payment::Entity")]
    Payments,
}

impl Related<super::order_price_history::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Lines.def()
    }
}

impl Related<super::payment::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Payments.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum, Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DeliveryType {
    #[sea_orm(string_value = "shipping")]
    Shipping,
    #[sea_orm(string_value = "pickup")]
    Pickup,
}

/// Order lifecycle state machine.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum, Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OrderState {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "payment_pending")]
    PaymentPending,
    #[sea_orm(string_value = "payment_processing")]
    PaymentProcessing,
    #[sea_orm(string_value = "payment_completed")]
    PaymentCompleted,
    #[sea_orm(string_value = "payment_failed")]
    PaymentFailed,
    #[sea_orm(string_value = "processing")]
    Processing,
    #[sea_orm(string_value = "ready_for_pickup")]
    ReadyForPickup,
    #[sea_orm(string_value = "shipping")]
    Shipping,
    #[sea_orm(string_value = "delivered")]
    Delivered,
    #[sea_orm(string_value = "cancelled")]
    Cancelled,
    #[sea_orm(string_value = "refunded")]
    Refunded,
}

impl OrderState {
    /// Whether the transition `self -> next` is permitted. Same-state
    /// application is a no-op the callers treat as allowed, which is
    /// what makes webhook replays idempotent.
    pub fn can_transition_to(self, next: OrderState) -> bool {
        use OrderState::*;
        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (Pending, PaymentPending | Cancelled)
                | (
                    PaymentPending,
                    PaymentProcessing | PaymentCompleted | PaymentFailed | Cancelled
                )
                | (PaymentProcessing, PaymentCompleted | PaymentFailed | Cancelled)
                | (PaymentCompleted, Processing | Refunded | Cancelled)
                | (PaymentFailed, PaymentPending | Cancelled)
                | (Processing, ReadyForPickup | Shipping | Cancelled)
                | (ReadyForPickup, Delivered | Cancelled)
                | (Shipping, Delivered | Cancelled)
                | (Delivered, Refunded)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, OrderState::Cancelled | OrderState::Refunded)
    }
}
