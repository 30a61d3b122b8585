use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Product discount. A promotion is *sporadic* when it has both a
/// start and an end date (valid only inside that window) or
/// *permanent* when both dates are null.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "promotions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub product_id: Uuid,
    pub name: String,
    pub state: PromotionState,
    pub kind: PromotionKind,
    /// Percentage (0-100) or fixed amount per unit, depending on `kind`
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub discount: Decimal,
    #[sea_orm(nullable)]
    pub start_date: Option<DateTime<Utc>>,
    #[sea_orm(nullable)]
    pub end_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::product::Entity",
        from = "Column::ProductId",
        to = "super::product::Column::Id"
    )]
    Product,
}

impl Related<super::product::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Product.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
pub enum PromotionState {
    #[sea_orm(string_value = "active")]
    Active,
    #[sea_orm(string_value = "inactive")]
    Inactive,
    #[sea_orm(string_value = "draft")]
    Draft,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
pub enum PromotionKind {
    #[sea_orm(string_value = "percentage")]
    Percentage,
    #[sea_orm(string_value = "fixed")]
    Fixed,
}

impl Model {
    /// Sporadic promotions carry both window dates.
    pub fn is_sporadic(&self) -> bool {
        self.start_date.is_some() && self.end_date.is_some()
    }

    /// A sporadic promotion is valid inside its window; a permanent
    /// one is always valid while `Active`.
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        if self.state != PromotionState::Active {
            return false;
        }
        match (self.start_date, self.end_date) {
            (Some(start), Some(end)) => start <= now && now <= end,
            (None, None) => true,
            // Half-open windows are malformed; fail closed
            _ => false,
        }
    }

    /// Discount applied to a single unit at the given price.
    pub fn discount_per_unit(&self, unit_price: Decimal) -> Decimal {
        let raw = match self.kind {
            PromotionKind::Percentage => unit_price * self.discount / Decimal::from(100),
            PromotionKind::Fixed => self.discount,
        };
        raw.min(unit_price)
    }
}
