use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Configured way to pay. The kind selects the gateway route; the
/// amount window is validated against the live cart total at checkout.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "payment_methods")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub name: String,
    pub kind: PaymentMethodKind,
    pub enabled: bool,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))", nullable)]
    pub min_amount: Option<Decimal>,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))", nullable)]
    pub max_amount: Option<Decimal>,
    pub currency: String,
    /// Routing override; when null the registry's table decides
    #[sea_orm(nullable)]
    pub gateway_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethodKind {
    #[sea_orm(string_value = "pse")]
    Pse,
    #[sea_orm(string_value = "credit_card")]
    CreditCard,
    #[sea_orm(string_value = "debit_card")]
    DebitCard,
    #[sea_orm(string_value = "transfer")]
    Transfer,
    #[sea_orm(string_value = "cash")]
    Cash,
}

impl PaymentMethodKind {
    /// Routing key used in the gateway routing table.
    pub fn routing_key(&self) -> &'static str {
        match self {
            Self::Pse => "pse",
            Self::CreditCard => "credit_card",
            Self::DebitCard => "debit_card",
            Self::Transfer => "transfer",
            Self::Cash => "cash",
        }
    }
}

impl Model {
    /// Checks an order/cart total against the configured window.
    pub fn accepts_amount(&self, amount: Decimal) -> bool {
        if let Some(min) = self.min_amount {
            if amount < min {
                return false;
            }
        }
        if let Some(max) = self.max_amount {
            if amount > max {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn method(min: Option<Decimal>, max: Option<Decimal>) -> Model {
        Model {
            id: Uuid::new_v4(),
            name: "PSE".into(),
            kind: PaymentMethodKind::Pse,
            enabled: true,
            min_amount: min,
            max_amount: max,
            currency: "COP".into(),
            gateway_id: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn amount_window_is_inclusive() {
        let m = method(Some(dec!(200)), Some(dec!(1000)));
        assert!(!m.accepts_amount(dec!(150)));
        assert!(m.accepts_amount(dec!(200)));
        assert!(m.accepts_amount(dec!(1000)));
        assert!(!m.accepts_amount(dec!(1001)));
    }

    #[test]
    fn open_window_accepts_everything() {
        let m = method(None, None);
        assert!(m.accepts_amount(dec!(0.01)));
        assert!(m.accepts_amount(dec!(9999999)));
    }
}
