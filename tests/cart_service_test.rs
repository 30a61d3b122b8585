mod common;

use common::{window_around_now, TestApp};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use storefront_api::{
    entities::cart::CartStatus,
    entities::promotion::PromotionKind,
    errors::ServiceError,
    services::carts::CartIdentity,
};
use uuid::Uuid;

fn guest(session_id: &str) -> CartIdentity {
    CartIdentity {
        user_id: None,
        session_id: Some(session_id.to_string()),
    }
}

fn user(user_id: Uuid) -> CartIdentity {
    CartIdentity {
        user_id: Some(user_id),
        session_id: None,
    }
}

#[tokio::test]
#[cfg_attr(not(feature = "mock-tests"), ignore)]
async fn guest_first_contact_issues_session_id() {
    let app = TestApp::new().await;

    let cart = app
        .state
        .services
        .carts
        .get_or_create_active(CartIdentity::default())
        .await
        .expect("failed to create cart");

    assert!(cart.session_id.is_some());
    assert!(cart.user_id.is_none());
    assert_eq!(cart.status, CartStatus::Active);
}

#[tokio::test]
#[cfg_attr(not(feature = "mock-tests"), ignore)]
async fn at_most_one_active_cart_per_identity() {
    let app = TestApp::new().await;
    let carts = &app.state.services.carts;

    let first = carts.get_or_create_active(guest("sess-1")).await.unwrap();
    let second = carts.get_or_create_active(guest("sess-1")).await.unwrap();
    assert_eq!(first.id, second.id);

    let user_id = Uuid::new_v4();
    let first = carts.get_or_create_active(user(user_id)).await.unwrap();
    let second = carts.get_or_create_active(user(user_id)).await.unwrap();
    assert_eq!(first.id, second.id);
}

#[tokio::test]
#[cfg_attr(not(feature = "mock-tests"), ignore)]
async fn user_cart_wins_over_stale_guest_cart() {
    let app = TestApp::new().await;
    let carts = &app.state.services.carts;
    let user_id = Uuid::new_v4();

    let guest_cart = carts.get_or_create_active(guest("sess-2")).await.unwrap();
    let user_cart = carts.get_or_create_active(user(user_id)).await.unwrap();

    // Authenticated request on the previously-guest browser
    let resolved = carts
        .get_or_create_active(CartIdentity {
            user_id: Some(user_id),
            session_id: Some("sess-2".to_string()),
        })
        .await
        .unwrap();

    assert_eq!(resolved.id, user_cart.id);
    assert_ne!(resolved.id, guest_cart.id);
}

#[tokio::test]
#[cfg_attr(not(feature = "mock-tests"), ignore)]
async fn adding_existing_product_increments_quantity() {
    let app = TestApp::new().await;
    let carts = &app.state.services.carts;

    let product_id = app.seed_product(dec!(100), 50, true).await;
    let cart = carts.get_or_create_active(guest("sess-3")).await.unwrap();

    carts.add_line(cart.id, product_id, 2).await.unwrap();
    carts.add_line(cart.id, product_id, 3).await.unwrap();

    let with_lines = carts.get_cart(cart.id).await.unwrap();
    assert_eq!(with_lines.lines.len(), 1);
    assert_eq!(with_lines.lines[0].quantity, 5);
}

#[tokio::test]
#[cfg_attr(not(feature = "mock-tests"), ignore)]
async fn add_line_rejects_inactive_product_and_insufficient_stock() {
    let app = TestApp::new().await;
    let carts = &app.state.services.carts;
    let cart = carts.get_or_create_active(guest("sess-4")).await.unwrap();

    let inactive = app.seed_product(dec!(100), 50, false).await;
    let err = carts.add_line(cart.id, inactive, 1).await.unwrap_err();
    assert!(matches!(err, ServiceError::ProductUnavailable(_)));

    let scarce = app.seed_product(dec!(100), 2, true).await;
    let err = carts.add_line(cart.id, scarce, 3).await.unwrap_err();
    assert!(matches!(err, ServiceError::InsufficientStock(_)));

    // Stock also bounds the summed quantity across calls
    carts.add_line(cart.id, scarce, 2).await.unwrap();
    let err = carts.add_line(cart.id, scarce, 1).await.unwrap_err();
    assert!(matches!(err, ServiceError::InsufficientStock(_)));
}

#[tokio::test]
#[cfg_attr(not(feature = "mock-tests"), ignore)]
async fn line_captures_price_at_add_time_but_summary_prices_live() {
    let app = TestApp::new().await;
    let carts = &app.state.services.carts;

    let product_id = app.seed_product(dec!(100), 50, true).await;
    let cart = carts.get_or_create_active(guest("sess-5")).await.unwrap();
    carts.add_line(cart.id, product_id, 1).await.unwrap();

    let captured = carts.get_cart(cart.id).await.unwrap().lines[0].price_history_id;

    // Price change after the line was added
    let new_price_id = app
        .seed_price(product_id, dec!(250), chrono::Utc::now() + chrono::Duration::seconds(5))
        .await;

    // The capture is not re-taken...
    let line = &carts.get_cart(cart.id).await.unwrap().lines[0];
    assert_eq!(line.price_history_id, captured);
    assert_ne!(line.price_history_id, new_price_id);

    // ...but the summary reflects the live price
    let summary = carts.summary(cart.id).await.unwrap();
    assert_eq!(summary.subtotal, dec!(250));
}

#[tokio::test]
#[cfg_attr(not(feature = "mock-tests"), ignore)]
async fn guest_summary_and_zero_quantity_abandonment_scenario() {
    let app = TestApp::new().await;
    let carts = &app.state.services.carts;

    // Guest adds product A, qty 2, unit price 100, no promotion
    let product_id = app.seed_product(dec!(100), 50, true).await;
    let cart = carts.get_or_create_active(guest("sess-6")).await.unwrap();
    carts.add_line(cart.id, product_id, 2).await.unwrap();

    let summary = carts.summary(cart.id).await.unwrap();
    assert_eq!(summary.subtotal, dec!(200));
    assert_eq!(summary.total_discount, Decimal::ZERO);
    assert_eq!(summary.total, dec!(200));

    // Quantity to 0: line removed, cart demoted to abandoned
    let cart = carts
        .update_line_quantity(cart.id, product_id, 0)
        .await
        .unwrap();
    assert_eq!(cart.status, CartStatus::Abandoned);

    let with_lines = carts.get_cart(cart.id).await.unwrap();
    assert!(with_lines.lines.is_empty());
}

#[tokio::test]
#[cfg_attr(not(feature = "mock-tests"), ignore)]
async fn summary_applies_the_tie_broken_promotion() {
    let app = TestApp::new().await;
    let carts = &app.state.services.carts;

    let product_id = app.seed_product(dec!(100), 50, true).await;
    // Permanent 50% vs valid sporadic 5%: sporadic must win
    app.seed_promotion(product_id, dec!(50), PromotionKind::Percentage, None)
        .await;
    let sporadic_id = app
        .seed_promotion(
            product_id,
            dec!(5),
            PromotionKind::Percentage,
            Some(window_around_now()),
        )
        .await;

    let cart = carts.get_or_create_active(guest("sess-7")).await.unwrap();
    carts.add_line(cart.id, product_id, 2).await.unwrap();

    let summary = carts.summary(cart.id).await.unwrap();
    assert_eq!(summary.total_discount, dec!(10)); // 5% of 100, x2
    assert_eq!(summary.total, dec!(190));
    assert_eq!(summary.lines[0].applied_promotion_id, Some(sporadic_id));
}

#[tokio::test]
#[cfg_attr(not(feature = "mock-tests"), ignore)]
async fn merge_reparents_guest_cart_when_user_has_none() {
    let app = TestApp::new().await;
    let carts = &app.state.services.carts;
    let user_id = Uuid::new_v4();

    let product_id = app.seed_product(dec!(100), 50, true).await;
    let guest_cart = carts.get_or_create_active(guest("sess-8")).await.unwrap();
    carts.add_line(guest_cart.id, product_id, 1).await.unwrap();

    let merged = carts.merge_guest_into_user("sess-8", user_id).await.unwrap();
    assert_eq!(merged.id, guest_cart.id);
    assert_eq!(merged.user_id, Some(user_id));
}

#[tokio::test]
#[cfg_attr(not(feature = "mock-tests"), ignore)]
async fn merge_combines_lines_when_user_already_has_a_cart() {
    let app = TestApp::new().await;
    let carts = &app.state.services.carts;
    let user_id = Uuid::new_v4();

    let shared = app.seed_product(dec!(100), 50, true).await;
    let guest_only = app.seed_product(dec!(40), 50, true).await;

    let user_cart = carts.get_or_create_active(user(user_id)).await.unwrap();
    carts.add_line(user_cart.id, shared, 1).await.unwrap();

    let guest_cart = carts.get_or_create_active(guest("sess-9")).await.unwrap();
    carts.add_line(guest_cart.id, shared, 2).await.unwrap();
    carts.add_line(guest_cart.id, guest_only, 1).await.unwrap();

    let merged = carts.merge_guest_into_user("sess-9", user_id).await.unwrap();
    assert_eq!(merged.id, user_cart.id);

    let with_lines = carts.get_cart(merged.id).await.unwrap();
    assert_eq!(with_lines.lines.len(), 2);
    let shared_line = with_lines
        .lines
        .iter()
        .find(|l| l.product_id == shared)
        .unwrap();
    assert_eq!(shared_line.quantity, 3);

    // The guest cart is demoted, not deleted
    let guest_cart = carts.get_cart(guest_cart.id).await.unwrap();
    assert_eq!(guest_cart.cart.status, CartStatus::Abandoned);
}
