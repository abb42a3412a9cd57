mod common;

use axum::http::StatusCode;
use chrono::{Duration, Utc};
use common::TestApp;
use gallery_billing::BillingStore;
use gallery_billing::plans::{BillingInterval, PlanType};
use gallery_billing::purchases::NewPurchase;
use gallery_billing::subscriptions::{
    ExternalSubscriptionId, PaymentProvider, Subscription, SubscriptionStatus,
};
use serde_json::json;
use uuid::Uuid;

fn subscription(user_id: Uuid, external_id: ExternalSubscriptionId, ends_in: Duration) -> Subscription {
    let now = Utc::now();
    Subscription {
        id: Uuid::new_v4(),
        user_id,
        plan_type: PlanType::Premium,
        billing_interval: BillingInterval::Yearly,
        status: SubscriptionStatus::Active,
        external_id,
        current_period_start: now - Duration::days(30),
        current_period_end: now + ends_in,
        cancelled_at: None,
        created_at: now - Duration::days(30),
        updated_at: now - Duration::days(30),
    }
}

#[tokio::test]
async fn test_current_subscription_requires_token() {
    let app = TestApp::new();

    let (status, body) = app.get("/api/subscriptions/current", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["errors"], "Missing authorization token");
}

#[tokio::test]
async fn test_current_subscription_is_null_for_new_user() {
    let app = TestApp::new();

    let (status, body) = app
        .get("/api/subscriptions/current", Some(Uuid::new_v4()))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["data"].is_null());
}

#[tokio::test]
async fn test_current_subscription_view() {
    let app = TestApp::new();
    let user_id = Uuid::new_v4();
    app.store.insert_subscription(subscription(
        user_id,
        ExternalSubscriptionId::Crypto("charge-9".to_string()),
        Duration::days(300),
    ));

    let (status, body) = app.get("/api/subscriptions/current", Some(user_id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "active");
    assert_eq!(body["data"]["planType"], "premium");
    assert_eq!(body["data"]["billingInterval"], "yearly");
    assert_eq!(body["data"]["provider"], "crypto");
    assert_eq!(body["data"]["externalId"], "charge-9");
}

#[tokio::test]
async fn test_lapsed_subscription_reads_as_expired() {
    let app = TestApp::new();
    let user_id = Uuid::new_v4();
    app.store.insert_subscription(subscription(
        user_id,
        ExternalSubscriptionId::Crypto("charge-old".to_string()),
        -Duration::days(1),
    ));

    let (status, body) = app.get("/api/subscriptions/current", Some(user_id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "expired");
}

#[tokio::test]
async fn test_cancel_keeps_purchases() {
    let app = TestApp::new();
    let user_id = Uuid::new_v4();
    let image_id = Uuid::new_v4();
    app.store.insert_subscription(subscription(
        user_id,
        ExternalSubscriptionId::Crypto("charge-c".to_string()),
        Duration::days(20),
    ));
    app.store
        .record_purchase(NewPurchase {
            user_id: Some(user_id),
            image_id,
            provider: PaymentProvider::Crypto,
            provider_session_id: "charge-img".to_string(),
            amount_cents: 1200,
            currency: "usd".to_string(),
        })
        .await
        .unwrap();

    let (status, body) = app
        .post_json("/api/subscriptions/cancel", Some(user_id), json!({}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "cancelled");
    assert!(body["data"]["cancelledAt"].is_string());

    let stored = app
        .store
        .subscription_for_user(user_id)
        .await
        .unwrap()
        .expect("row kept after cancel");
    assert_eq!(stored.status, SubscriptionStatus::Cancelled);
    assert!(app.store.has_purchased(user_id, image_id).await.unwrap());

    let (status, body) = app.get("/api/purchases", Some(user_id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().map(Vec::len), Some(1));
    assert_eq!(body["data"][0]["providerSessionId"], "charge-img");
    assert_eq!(body["data"][0]["imageId"], image_id.to_string());
}

#[tokio::test]
async fn test_cancel_twice_returns_cancelled_row() {
    let app = TestApp::new();
    let user_id = Uuid::new_v4();
    app.store.insert_subscription(subscription(
        user_id,
        ExternalSubscriptionId::Crypto("charge-twice".to_string()),
        Duration::days(20),
    ));

    let (status, _) = app
        .post_json("/api/subscriptions/cancel", Some(user_id), json!({}))
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = app
        .post_json("/api/subscriptions/cancel", Some(user_id), json!({}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "cancelled");
    assert_eq!(app.store.subscription_count(), 1);
}

#[tokio::test]
async fn test_cancel_without_subscription_is_not_found() {
    let app = TestApp::new();

    let (status, body) = app
        .post_json("/api/subscriptions/cancel", Some(Uuid::new_v4()), json!({}))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["errors"], "No subscription found");
}

#[tokio::test]
async fn test_cancel_stripe_subscription_needs_stripe() {
    let app = TestApp::new();
    let user_id = Uuid::new_v4();
    app.store.insert_subscription(subscription(
        user_id,
        ExternalSubscriptionId::Stripe("sub_123".to_string()),
        Duration::days(20),
    ));

    let (status, _) = app
        .post_json("/api/subscriptions/cancel", Some(user_id), json!({}))
        .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    // Local row untouched when the provider could not be told
    let stored = app
        .store
        .subscription_for_user(user_id)
        .await
        .unwrap()
        .expect("row");
    assert_eq!(stored.status, SubscriptionStatus::Active);
}

#[tokio::test]
async fn test_purchases_are_per_user() {
    let app = TestApp::new();
    let buyer = Uuid::new_v4();
    app.store
        .record_purchase(NewPurchase {
            user_id: Some(buyer),
            image_id: Uuid::new_v4(),
            provider: PaymentProvider::PayPal,
            provider_session_id: "ORDER-1".to_string(),
            amount_cents: 500,
            currency: "usd".to_string(),
        })
        .await
        .unwrap();

    let (status, body) = app.get("/api/purchases", Some(Uuid::new_v4())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], json!([]));

    let (status, _) = app.get("/api/purchases", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}
