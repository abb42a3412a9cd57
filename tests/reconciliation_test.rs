use chrono::{TimeZone, Utc};
use gallery_billing::memory_store::MemoryBillingStore;
use gallery_billing::payment_events::{
    OrderMetadata, PayPalEvent, PaymentEvent, StripeCheckout, StripeEvent, UserRef,
};
use gallery_billing::plans::{BillingInterval, PlanSelection, PlanType};
use gallery_billing::reconciliation::{ReconcileError, ReconcileOutcome, reconcile};
use gallery_billing::subscriptions::{PaymentProvider, SubscriptionStatus};
use gallery_billing::BillingStore;
use uuid::Uuid;

fn basic_monthly() -> PlanSelection {
    PlanSelection::new(PlanType::Basic, BillingInterval::Monthly)
}

/// The checkout as the webhook sees it: user id in metadata
fn webhook_checkout(user_id: Uuid) -> PaymentEvent {
    PaymentEvent::Stripe(StripeEvent::CheckoutCompleted(StripeCheckout {
        session_id: "cs_test_1".to_string(),
        subscription_id: Some("sub_1".to_string()),
        metadata: OrderMetadata::for_subscription(Some(user_id), basic_monthly()),
        amount_total_cents: Some(499),
        currency: Some("usd".to_string()),
        user: UserRef::from_provider(Some(user_id)),
    }))
}

/// The same checkout reported by the browser, after metadata was lost
fn client_checkout(session_user: Option<Uuid>, fallback_user: Option<Uuid>) -> PaymentEvent {
    PaymentEvent::Stripe(StripeEvent::CheckoutCompleted(StripeCheckout {
        session_id: "cs_test_1".to_string(),
        subscription_id: Some("sub_1".to_string()),
        metadata: OrderMetadata {
            plan: Some(basic_monthly()),
            ..OrderMetadata::default()
        },
        amount_total_cents: Some(499),
        currency: Some("usd".to_string()),
        user: UserRef::default(),
    }))
    .with_request_user(session_user, fallback_user)
}

#[tokio::test]
async fn test_webhook_and_activate_converge_on_one_row() {
    let store = MemoryBillingStore::new();
    let user_id = Uuid::new_v4();
    let first = Utc.with_ymd_and_hms(2024, 1, 31, 12, 0, 0).unwrap();
    let later = Utc.with_ymd_and_hms(2024, 1, 31, 12, 0, 5).unwrap();

    let from_webhook = reconcile(&store, webhook_checkout(user_id), first)
        .await
        .unwrap();
    let from_client = reconcile(&store, client_checkout(None, Some(user_id)), later)
        .await
        .unwrap();

    assert_eq!(store.subscription_count(), 1);
    let (ReconcileOutcome::SubscriptionActivated(a), ReconcileOutcome::SubscriptionActivated(b)) =
        (from_webhook, from_client)
    else {
        panic!("expected two activations");
    };
    assert_eq!(a.id, b.id);
    // The repeat keeps the period computed by the first activation
    assert_eq!(b.current_period_start, first);
    assert_eq!(
        b.current_period_end,
        Utc.with_ymd_and_hms(2024, 2, 29, 12, 0, 0).unwrap()
    );
}

#[tokio::test]
async fn test_session_user_beats_client_fallback() {
    let store = MemoryBillingStore::new();
    let session_user = Uuid::new_v4();
    let spoofed = Uuid::new_v4();

    reconcile(&store, client_checkout(Some(session_user), Some(spoofed)), Utc::now())
        .await
        .unwrap();

    assert!(store.subscription_for_user(session_user).await.unwrap().is_some());
    assert!(store.subscription_for_user(spoofed).await.unwrap().is_none());
}

#[tokio::test]
async fn test_activation_without_any_user_is_rejected() {
    let store = MemoryBillingStore::new();

    let result = reconcile(&store, client_checkout(None, None), Utc::now()).await;
    assert!(matches!(
        result,
        Err(ReconcileError::MissingUser {
            provider: PaymentProvider::Stripe,
            ..
        })
    ));
    assert_eq!(store.subscription_count(), 0);
}

#[tokio::test]
async fn test_paypal_lifecycle() {
    let store = MemoryBillingStore::new();
    let user_id = Uuid::new_v4();
    let now = Utc::now();

    reconcile(
        &store,
        PaymentEvent::PayPal(PayPalEvent::SubscriptionActivated {
            subscription_id: "I-BW452GLLEP1G".to_string(),
            plan: Some(PlanSelection::new(PlanType::Pro, BillingInterval::Yearly)),
            user: UserRef::from_provider(Some(user_id)),
        }),
        now,
    )
    .await
    .unwrap();

    for status in [SubscriptionStatus::PastDue, SubscriptionStatus::Cancelled] {
        let outcome = reconcile(
            &store,
            PaymentEvent::PayPal(PayPalEvent::SubscriptionStatusChanged {
                subscription_id: "I-BW452GLLEP1G".to_string(),
                status,
            }),
            now,
        )
        .await
        .unwrap();
        assert!(matches!(outcome, ReconcileOutcome::SubscriptionUpdated(ref s) if s.status == status));
    }

    let stored = store.subscription_for_user(user_id).await.unwrap().unwrap();
    assert_eq!(stored.status, SubscriptionStatus::Cancelled);
    assert!(stored.cancelled_at.is_some());
}
