//! Catalog collaborator contract.
//!
//! The pipeline consumes the catalog through these two reads only:
//! a fully-materialized product snapshot (activity, live stock and the
//! current price-history row) and the set of active promotions for a
//! product. Stock and price are read at call time, never cached.

use rust_decimal::Decimal;
use sea_orm::{ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder};
use uuid::Uuid;

use crate::entities::{price_history, product, promotion, PriceHistory, Product, Promotion};
use crate::errors::ServiceError;

/// Point-in-time product view used by cart mutations and pricing.
#[derive(Debug, Clone)]
pub struct ProductSnapshot {
    pub product_id: Uuid,
    pub name: String,
    pub active: bool,
    pub stock: i32,
    pub unit_price: Decimal,
    /// The price-history row the price came from; captured onto cart
    /// lines at add time
    pub price_history_id: Uuid,
}

pub async fn product_snapshot<C: ConnectionTrait>(
    conn: &C,
    product_id: Uuid,
) -> Result<ProductSnapshot, ServiceError> {
    let product = Product::find_by_id(product_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", product_id)))?;

    // Current price = most recent append-only row
    let price = PriceHistory::find()
        .filter(price_history::Column::ProductId.eq(product_id))
        .order_by_desc(price_history::Column::CreatedAt)
        .one(conn)
        .await?
        .ok_or_else(|| {
            ServiceError::NotFound(format!("Product {} has no price history", product_id))
        })?;

    Ok(ProductSnapshot {
        product_id: product.id,
        name: product.name,
        active: product.active,
        stock: product.stock,
        unit_price: price.unit_price,
        price_history_id: price.id,
    })
}

/// Promotions in `Active` state referencing the product. Date-window
/// validity is the resolver's concern, not a query filter, so the
/// tie-break sees every candidate.
pub async fn active_promotions_for_product<C: ConnectionTrait>(
    conn: &C,
    product_id: Uuid,
) -> Result<Vec<promotion::Model>, ServiceError> {
    Ok(Promotion::find()
        .filter(promotion::Column::ProductId.eq(product_id))
        .filter(promotion::Column::State.eq(promotion::PromotionState::Active))
        .order_by_asc(promotion::Column::CreatedAt)
        .all(conn)
        .await?)
}

pub async fn product_name<C: ConnectionTrait>(
    conn: &C,
    product_id: Uuid,
) -> Result<String, ServiceError> {
    Ok(Product::find_by_id(product_id)
        .one(conn)
        .await?
        .map(|p| p.name)
        .unwrap_or_else(|| product_id.to_string()))
}
