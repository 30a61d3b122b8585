//! Pricing/promotion resolver.
//!
//! Pure given its inputs, and deliberately the *only* place line
//! pricing is computed: the cart summary and the order freeze both
//! call [`price_line`], so the two can never diverge.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::entities::promotion;

/// Resolved pricing for one line.
#[derive(Debug, Clone, Serialize)]
pub struct LinePricing {
    pub unit_price: Decimal,
    pub quantity: i32,
    pub subtotal: Decimal,
    pub discount: Decimal,
    pub final_price: Decimal,
    pub applied_promotion: Option<promotion::Model>,
}

/// Picks the single applicable promotion out of the candidate set.
///
/// Tie-break: any valid sporadic promotion beats any permanent one,
/// even when the permanent discount is larger. Among sporadic
/// candidates the latest `start_date` wins, then the larger discount.
/// With no valid sporadic candidate, the first permanent promotion in
/// the candidate order is taken; discounts are not compared among
/// permanents.
pub fn select_promotion<'a>(
    promotions: &'a [promotion::Model],
    now: DateTime<Utc>,
) -> Option<&'a promotion::Model> {
    let valid: Vec<&promotion::Model> = promotions.iter().filter(|p| p.is_valid(now)).collect();

    let best_sporadic = valid
        .iter()
        .filter(|p| p.is_sporadic())
        .max_by_key(|p| (p.start_date, p.discount))
        .copied();
    if best_sporadic.is_some() {
        return best_sporadic;
    }

    valid.iter().find(|p| !p.is_sporadic()).copied()
}

/// Computes unit discount, line discount and final price for a line.
pub fn price_line(
    unit_price: Decimal,
    quantity: i32,
    promotions: &[promotion::Model],
    now: DateTime<Utc>,
) -> LinePricing {
    let subtotal = unit_price * Decimal::from(quantity);
    let applied = select_promotion(promotions, now).cloned();

    let discount = applied
        .as_ref()
        .map(|p| p.discount_per_unit(unit_price) * Decimal::from(quantity))
        .unwrap_or(Decimal::ZERO);

    LinePricing {
        unit_price,
        quantity,
        subtotal,
        discount,
        final_price: subtotal - discount,
        applied_promotion: applied,
    }
}
