mod common;

use common::TestApp;
use rust_decimal_macros::dec;
use storefront_api::{
    entities::cart::CartStatus,
    entities::order::{DeliveryType, OrderState},
    entities::payment_method::PaymentMethodKind,
    errors::ServiceError,
    services::checkout::DeliveryInput,
};
use uuid::Uuid;

#[tokio::test]
#[cfg_attr(not(feature = "mock-tests"), ignore)]
async fn begin_requires_owned_active_nonempty_cart() {
    let app = TestApp::new().await;
    let user_id = Uuid::new_v4();
    let (cart_id, _) = app.seed_user_cart_with_line(user_id, dec!(100), 1).await;

    // Someone else's cart
    let err = app
        .state
        .services
        .checkout
        .begin(Uuid::new_v4(), cart_id)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Unauthorized(_)));

    // Empty cart
    let empty = app
        .state
        .services
        .carts
        .get_or_create_active(storefront_api::services::carts::CartIdentity {
            user_id: Some(Uuid::new_v4()),
            session_id: None,
        })
        .await
        .unwrap();
    let err = app
        .state
        .services
        .checkout
        .begin(empty.user_id.unwrap(), empty.id)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::InvalidOperation(_)));

    // The owner can begin
    assert!(app
        .state
        .services
        .checkout
        .begin(user_id, cart_id)
        .await
        .is_ok());
}

#[tokio::test]
#[cfg_attr(not(feature = "mock-tests"), ignore)]
async fn delivery_validation_fails_closed() {
    let app = TestApp::new().await;
    let user_id = Uuid::new_v4();
    let (cart_id, _) = app.seed_user_cart_with_line(user_id, dec!(100), 1).await;
    let session = app
        .state
        .services
        .checkout
        .begin(user_id, cart_id)
        .await
        .unwrap();

    // Shipping without an address id
    let err = app
        .state
        .services
        .checkout
        .set_delivery(
            session.id,
            DeliveryInput {
                delivery_type: DeliveryType::Shipping,
                delivery_address_id: None,
                pickup_agency_id: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::ValidationError(_)));

    // Shipping to an address that does not resolve
    let err = app
        .state
        .services
        .checkout
        .set_delivery(
            session.id,
            DeliveryInput {
                delivery_type: DeliveryType::Shipping,
                delivery_address_id: Some(Uuid::new_v4()),
                pickup_agency_id: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::ValidationError(_)));

    // Pickup at an inactive agency
    let inactive_agency = app.seed_agency(false).await;
    let err = app
        .state
        .services
        .checkout
        .set_delivery(
            session.id,
            DeliveryInput {
                delivery_type: DeliveryType::Pickup,
                delivery_address_id: None,
                pickup_agency_id: Some(inactive_agency),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::ValidationError(_)));

    // A real agency passes
    let agency = app.seed_agency(true).await;
    let session = app
        .state
        .services
        .checkout
        .set_delivery(
            session.id,
            DeliveryInput {
                delivery_type: DeliveryType::Pickup,
                delivery_address_id: None,
                pickup_agency_id: Some(agency),
            },
        )
        .await
        .unwrap();
    assert_eq!(session.pickup_agency_id, Some(agency));
    assert_eq!(session.delivery_address_id, None);
}

#[tokio::test]
#[cfg_attr(not(feature = "mock-tests"), ignore)]
async fn payment_method_below_minimum_blocks_order_creation() {
    let app = TestApp::new().await;
    let user_id = Uuid::new_v4();
    // Order total 150, method minimum 200
    let (cart_id, _) = app.seed_user_cart_with_line(user_id, dec!(150), 1).await;
    let method_id = app
        .seed_payment_method(PaymentMethodKind::Pse, Some(dec!(200)), None)
        .await;
    let address_id = app.seed_address(user_id).await;

    let session = app
        .state
        .services
        .checkout
        .begin(user_id, cart_id)
        .await
        .unwrap();
    app.state
        .services
        .checkout
        .set_delivery(
            session.id,
            DeliveryInput {
                delivery_type: DeliveryType::Shipping,
                delivery_address_id: Some(address_id),
                pickup_agency_id: None,
            },
        )
        .await
        .unwrap();

    let (_, validation) = app
        .state
        .services
        .checkout
        .set_payment_method(session.id, method_id)
        .await
        .unwrap();
    assert!(!validation.valid);
    assert!(validation.reason.is_some());

    // The method was not recorded, so the freeze is unreachable
    let err = app
        .state
        .services
        .checkout
        .create_order(session.id)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::ValidationError(_)));
}

#[tokio::test]
#[cfg_attr(not(feature = "mock-tests"), ignore)]
async fn freeze_writes_immutable_snapshots_and_demotes_cart() {
    let app = TestApp::new().await;
    let user_id = Uuid::new_v4();
    let (cart_id, product_id) = app.seed_user_cart_with_line(user_id, dec!(100), 2).await;
    let method_id = app
        .seed_payment_method(PaymentMethodKind::CreditCard, None, None)
        .await;

    let order = app.checkout_to_order(user_id, cart_id, method_id).await;
    assert_eq!(order.state, OrderState::Pending);
    assert_eq!(order.subtotal_amount, dec!(200));
    assert_eq!(order.discount_amount, dec!(0));
    assert_eq!(order.total_amount, dec!(200));
    assert_eq!(order.delivery_type, DeliveryType::Shipping);

    // The cart transitioned to ordered exactly once
    let cart = app.state.services.carts.get_cart(cart_id).await.unwrap();
    assert_eq!(cart.cart.status, CartStatus::Ordered);

    let frozen = app.state.services.orders.get_order(order.id).await.unwrap();
    assert_eq!(frozen.lines.len(), 1);
    assert_eq!(frozen.lines[0].unit_price, dec!(100));
    assert_eq!(frozen.lines[0].final_amount, dec!(200));

    // Changing the live price afterwards must not touch the snapshot
    app.seed_price(product_id, dec!(999), chrono::Utc::now() + chrono::Duration::seconds(5))
        .await;
    let frozen_after = app.state.services.orders.get_order(order.id).await.unwrap();
    assert_eq!(frozen_after.lines[0].unit_price, dec!(100));
    assert_eq!(frozen_after.lines[0].final_amount, dec!(200));
    assert_eq!(frozen_after.order.total_amount, dec!(200));
}

#[tokio::test]
#[cfg_attr(not(feature = "mock-tests"), ignore)]
async fn session_is_destroyed_after_order_creation() {
    let app = TestApp::new().await;
    let user_id = Uuid::new_v4();
    let (cart_id, _) = app.seed_user_cart_with_line(user_id, dec!(100), 1).await;
    let method_id = app
        .seed_payment_method(PaymentMethodKind::CreditCard, None, None)
        .await;
    let address_id = app.seed_address(user_id).await;

    let session = app
        .state
        .services
        .checkout
        .begin(user_id, cart_id)
        .await
        .unwrap();
    app.state
        .services
        .checkout
        .set_delivery(
            session.id,
            DeliveryInput {
                delivery_type: DeliveryType::Shipping,
                delivery_address_id: Some(address_id),
                pickup_agency_id: None,
            },
        )
        .await
        .unwrap();
    app.state
        .services
        .checkout
        .set_payment_method(session.id, method_id)
        .await
        .unwrap();
    app.state
        .services
        .checkout
        .create_order(session.id)
        .await
        .unwrap();

    let err = app
        .state
        .services
        .checkout
        .session(session.id)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::NotFound(_)));
}

#[tokio::test]
#[cfg_attr(not(feature = "mock-tests"), ignore)]
async fn fulfillment_transitions_follow_the_state_machine() {
    let app = TestApp::new().await;
    let user_id = Uuid::new_v4();
    let (cart_id, _) = app.seed_user_cart_with_line(user_id, dec!(100), 1).await;
    let method_id = app
        .seed_payment_method(PaymentMethodKind::CreditCard, None, None)
        .await;
    let order = app.checkout_to_order(user_id, cart_id, method_id).await;

    // Direct jump from pending to delivered must be rejected
    let err = app
        .state
        .services
        .orders
        .transition(order.id, OrderState::Delivered)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::InvalidStateTransition { .. }));

    // Cancellation from pending is listed
    let cancelled = app
        .state
        .services
        .orders
        .transition(order.id, OrderState::Cancelled)
        .await
        .unwrap();
    assert_eq!(cancelled.state, OrderState::Cancelled);
}
