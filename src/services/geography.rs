//! Geography collaborator contract: existence and validity checks
//! only. Checkout validation fails closed on anything that does not
//! resolve here.

use sea_orm::{ConnectionTrait, EntityTrait};
use uuid::Uuid;

use crate::entities::{Address, Agency};
use crate::errors::ServiceError;

pub async fn address_exists<C: ConnectionTrait>(
    conn: &C,
    address_id: Uuid,
) -> Result<bool, ServiceError> {
    Ok(Address::find_by_id(address_id).one(conn).await?.is_some())
}

/// Inactive agencies do not count as valid pickup points.
pub async fn agency_exists<C: ConnectionTrait>(
    conn: &C,
    agency_id: Uuid,
) -> Result<bool, ServiceError> {
    Ok(Agency::find_by_id(agency_id)
        .one(conn)
        .await?
        .map(|a| a.active)
        .unwrap_or(false))
}
