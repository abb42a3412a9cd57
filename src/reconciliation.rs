//! Apply provider payment events to subscription and purchase rows.
//!
//! Activation and completion events arrive twice for most payments (the
//! provider webhook and the client's post-redirect activate call), in either
//! order and possibly concurrently. Both paths end here, and every write is
//! keyed so that repeats converge on the same row.

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{info, warn};

use crate::billing_store::BillingStore;
use crate::payment_events::{Intent, PaymentEvent};
use crate::purchases::PurchaseRecord;
use crate::subscriptions::{
    ExternalSubscriptionId, NewSubscription, PaymentProvider, Subscription, SubscriptionStatus,
};

#[derive(Debug, Error)]
pub enum ReconcileError {
    /// No user id in provider metadata, session or client fallback
    #[error("no user could be resolved for {provider} {reference}")]
    MissingUser {
        provider: PaymentProvider,
        reference: String,
    },

    #[error("no plan could be resolved for {provider} {reference}")]
    MissingPlan {
        provider: PaymentProvider,
        reference: String,
    },

    #[error("malformed payment event: {0}")]
    Malformed(String),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl ReconcileError {
    /// Whether the caller sent something unusable, as opposed to a storage failure
    pub fn is_client_error(&self) -> bool {
        !matches!(self, ReconcileError::Store(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    SubscriptionActivated(Subscription),
    SubscriptionUpdated(Subscription),
    /// Status change for a subscription id no row carries
    SubscriptionNotFound(ExternalSubscriptionId),
    PurchaseRecorded(PurchaseRecord),
    Ignored(String),
}

impl ReconcileOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileOutcome::SubscriptionActivated(_) => "subscription_activated",
            ReconcileOutcome::SubscriptionUpdated(_) => "subscription_updated",
            ReconcileOutcome::SubscriptionNotFound(_) => "subscription_not_found",
            ReconcileOutcome::PurchaseRecorded(record) if record.is_new() => "purchase_recorded",
            ReconcileOutcome::PurchaseRecorded(_) => "purchase_already_recorded",
            ReconcileOutcome::Ignored(_) => "ignored",
        }
    }
}

/// Map `event` to its intent and apply it. Safe to call any number of times for the same event.
pub async fn reconcile(
    store: &dyn BillingStore,
    event: PaymentEvent,
    now: DateTime<Utc>,
) -> Result<ReconcileOutcome, ReconcileError> {
    let provider = event.provider();
    let description = event.to_string();

    let intent = match event.into_intent() {
        Ok(intent) => intent,
        Err(e) => {
            metrics::counter!(
                "billing.reconcile.rejected",
                "provider" => provider.as_str()
            )
            .increment(1);
            warn!(event = %description, error = %e, "Rejected payment event");
            return Err(e);
        }
    };

    let outcome = apply_intent(store, intent, now).await?;

    metrics::counter!(
        "billing.reconcile.applied",
        "provider" => provider.as_str(),
        "outcome" => outcome.as_str()
    )
    .increment(1);
    info!(event = %description, outcome = outcome.as_str(), "Reconciled payment event");

    Ok(outcome)
}

async fn apply_intent(
    store: &dyn BillingStore,
    intent: Intent,
    now: DateTime<Utc>,
) -> Result<ReconcileOutcome, ReconcileError> {
    match intent {
        Intent::ActivateSubscription {
            user_id,
            plan,
            external_id,
        } => {
            // A payment activates at most once. Replays of it never restart a
            // period, whatever happened to the row since.
            if let Some(existing) = store.subscription_by_external_id(&external_id).await? {
                if existing.user_id != user_id {
                    warn!(
                        provider = %external_id.provider(),
                        external_id = external_id.id(),
                        owner = %existing.user_id,
                        requested_by = %user_id,
                        "Activation replayed for a subscription owned by another user"
                    );
                } else if existing.status != SubscriptionStatus::Active {
                    info!(
                        provider = %external_id.provider(),
                        external_id = external_id.id(),
                        status = %existing.status,
                        "Ignoring replayed activation"
                    );
                }
                return Ok(ReconcileOutcome::SubscriptionActivated(existing));
            }

            let subscription = store
                .upsert_subscription(NewSubscription::starting_at(
                    user_id,
                    plan,
                    external_id,
                    now,
                ))
                .await?;
            Ok(ReconcileOutcome::SubscriptionActivated(subscription))
        }
        Intent::UpdateSubscriptionStatus {
            external_id,
            status,
            period,
        } => {
            match store
                .update_subscription_status(&external_id, status, period, now)
                .await?
            {
                Some(subscription) => Ok(ReconcileOutcome::SubscriptionUpdated(subscription)),
                None => {
                    warn!(
                        provider = %external_id.provider(),
                        external_id = external_id.id(),
                        status = %status,
                        "Status change for unknown subscription"
                    );
                    Ok(ReconcileOutcome::SubscriptionNotFound(external_id))
                }
            }
        }
        Intent::CompletePurchase(purchase) => {
            let record = store.record_purchase(purchase).await?;
            Ok(ReconcileOutcome::PurchaseRecorded(record))
        }
        Intent::Ignore(reason) => Ok(ReconcileOutcome::Ignored(reason)),
    }
}

/// Expire crypto subscriptions whose period ended. Crypto charges never renew,
/// so nothing else moves these rows out of `active`.
pub async fn expire_crypto_subscriptions(
    store: &dyn BillingStore,
    now: DateTime<Utc>,
) -> anyhow::Result<usize> {
    let expired = store
        .expire_lapsed_subscriptions(PaymentProvider::Crypto, now)
        .await?;
    metrics::counter!("billing.subscriptions.expired").increment(expired as u64);
    info!(expired, "Expired lapsed crypto subscriptions");
    Ok(expired)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::MemoryBillingStore;
    use crate::payment_events::{
        CryptoEvent, OrderMetadata, PayPalEvent, StripeCheckout, StripeEvent, UserRef,
    };
    use crate::plans::{BillingInterval, PlanSelection, PlanType};
    use chrono::TimeZone;
    use uuid::Uuid;

    fn stripe_activation(user_id: Uuid, subscription_id: &str, plan: PlanSelection) -> PaymentEvent {
        PaymentEvent::Stripe(StripeEvent::CheckoutCompleted(StripeCheckout {
            session_id: format!("cs_{}", subscription_id),
            subscription_id: Some(subscription_id.to_string()),
            metadata: OrderMetadata::for_subscription(Some(user_id), plan),
            amount_total_cents: None,
            currency: None,
            user: UserRef::from_provider(Some(user_id)),
        }))
    }

    fn crypto_purchase(charge_id: &str, user_id: Uuid, image_id: Uuid) -> PaymentEvent {
        PaymentEvent::Crypto(CryptoEvent::ChargeConfirmed {
            charge_id: charge_id.to_string(),
            metadata: OrderMetadata::for_purchase(Some(user_id), image_id),
            amount_cents: Some(1200),
            currency: Some("USD".to_string()),
            user: UserRef::from_provider(Some(user_id)),
        })
    }

    #[tokio::test]
    async fn test_repeated_activation_keeps_one_row() {
        let store = MemoryBillingStore::new();
        let user_id = Uuid::new_v4();
        let plan = PlanSelection::new(PlanType::Pro, BillingInterval::Monthly);
        let now = Utc.with_ymd_and_hms(2025, 1, 31, 12, 0, 0).unwrap();

        let first = reconcile(&store, stripe_activation(user_id, "sub_1", plan), now)
            .await
            .unwrap();
        let later = now + chrono::Duration::minutes(5);
        let second = reconcile(&store, stripe_activation(user_id, "sub_1", plan), later)
            .await
            .unwrap();

        assert_eq!(store.subscription_count(), 1);
        match (first, second) {
            (
                ReconcileOutcome::SubscriptionActivated(a),
                ReconcileOutcome::SubscriptionActivated(b),
            ) => {
                assert_eq!(a.id, b.id);
                assert_eq!(b.current_period_start, now);
            }
            other => panic!("unexpected outcomes {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_activation_period_end_is_calendar_exact() {
        let store = MemoryBillingStore::new();
        let user_id = Uuid::new_v4();
        let now = Utc.with_ymd_and_hms(2024, 2, 29, 8, 30, 0).unwrap();

        let monthly = PlanSelection::new(PlanType::Basic, BillingInterval::Monthly);
        let outcome = reconcile(&store, stripe_activation(user_id, "sub_m", monthly), now)
            .await
            .unwrap();
        let ReconcileOutcome::SubscriptionActivated(subscription) = outcome else {
            panic!("expected activation");
        };
        assert_eq!(
            subscription.current_period_end,
            Utc.with_ymd_and_hms(2024, 3, 29, 8, 30, 0).unwrap()
        );

        let yearly = PlanSelection::new(PlanType::Basic, BillingInterval::Yearly);
        let outcome = reconcile(&store, stripe_activation(user_id, "sub_y", yearly), now)
            .await
            .unwrap();
        let ReconcileOutcome::SubscriptionActivated(subscription) = outcome else {
            panic!("expected activation");
        };
        assert_eq!(
            subscription.current_period_end,
            Utc.with_ymd_and_hms(2025, 2, 28, 8, 30, 0).unwrap()
        );
        assert_eq!(store.subscription_count(), 1);
    }

    #[tokio::test]
    async fn test_switching_provider_replaces_external_id() {
        let store = MemoryBillingStore::new();
        let user_id = Uuid::new_v4();
        let plan = PlanSelection::new(PlanType::Premium, BillingInterval::Monthly);
        let now = Utc::now();

        reconcile(&store, stripe_activation(user_id, "sub_old", plan), now)
            .await
            .unwrap();
        let paypal = PaymentEvent::PayPal(PayPalEvent::SubscriptionActivated {
            subscription_id: "I-NEW".to_string(),
            plan: Some(plan),
            user: UserRef::from_provider(Some(user_id)),
        });
        reconcile(&store, paypal, now).await.unwrap();

        let subscription = store.subscription_for_user(user_id).await.unwrap().unwrap();
        assert_eq!(
            subscription.external_id,
            ExternalSubscriptionId::PayPal("I-NEW".to_string())
        );
        assert_eq!(store.subscription_count(), 1);
    }

    #[tokio::test]
    async fn test_repeated_purchase_keeps_one_row() {
        let store = MemoryBillingStore::new();
        let user_id = Uuid::new_v4();
        let image_id = Uuid::new_v4();
        let now = Utc::now();

        let first = reconcile(&store, crypto_purchase("chg_1", user_id, image_id), now)
            .await
            .unwrap();
        let second = reconcile(&store, crypto_purchase("chg_1", user_id, image_id), now)
            .await
            .unwrap();

        assert_eq!(first.as_str(), "purchase_recorded");
        assert_eq!(second.as_str(), "purchase_already_recorded");
        assert_eq!(store.purchase_count(), 1);
        assert!(store.has_purchased(user_id, image_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_cancel_leaves_purchases() {
        let store = MemoryBillingStore::new();
        let user_id = Uuid::new_v4();
        let image_id = Uuid::new_v4();
        let plan = PlanSelection::new(PlanType::Pro, BillingInterval::Yearly);
        let now = Utc::now();

        reconcile(&store, stripe_activation(user_id, "sub_c", plan), now)
            .await
            .unwrap();
        reconcile(&store, crypto_purchase("chg_c", user_id, image_id), now)
            .await
            .unwrap();

        let cancelled = store.cancel_subscription(user_id, now).await.unwrap().unwrap();
        assert_eq!(cancelled.status, SubscriptionStatus::Cancelled);
        assert_eq!(cancelled.cancelled_at, Some(now));

        let purchases = store.purchases_for_user(user_id).await.unwrap();
        assert_eq!(purchases.len(), 1);
        assert_eq!(purchases[0].image_id, image_id);
    }

    #[tokio::test]
    async fn test_status_update_for_unknown_subscription() {
        let store = MemoryBillingStore::new();
        let event = PaymentEvent::Stripe(StripeEvent::SubscriptionDeleted {
            subscription_id: "sub_missing".to_string(),
        });

        let outcome = reconcile(&store, event, Utc::now()).await.unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::SubscriptionNotFound(ExternalSubscriptionId::Stripe(
                "sub_missing".to_string()
            ))
        );
    }

    #[tokio::test]
    async fn test_deleted_subscription_is_cancelled() {
        let store = MemoryBillingStore::new();
        let user_id = Uuid::new_v4();
        let plan = PlanSelection::new(PlanType::Basic, BillingInterval::Monthly);
        let now = Utc::now();
        reconcile(&store, stripe_activation(user_id, "sub_d", plan), now)
            .await
            .unwrap();

        let event = PaymentEvent::Stripe(StripeEvent::SubscriptionDeleted {
            subscription_id: "sub_d".to_string(),
        });
        let outcome = reconcile(&store, event, now).await.unwrap();
        let ReconcileOutcome::SubscriptionUpdated(subscription) = outcome else {
            panic!("expected update");
        };
        assert_eq!(subscription.status, SubscriptionStatus::Cancelled);
        assert!(subscription.cancelled_at.is_some());
    }

    #[tokio::test]
    async fn test_missing_user_is_rejected() {
        let store = MemoryBillingStore::new();
        let plan = PlanSelection::new(PlanType::Pro, BillingInterval::Monthly);
        let event = PaymentEvent::Crypto(CryptoEvent::ChargeConfirmed {
            charge_id: "chg_anon".to_string(),
            metadata: OrderMetadata::for_subscription(None, plan),
            amount_cents: None,
            currency: None,
            user: UserRef::default(),
        });

        let err = reconcile(&store, event, Utc::now()).await.unwrap_err();
        assert!(matches!(err, ReconcileError::MissingUser { .. }));
        assert!(err.is_client_error());
        assert_eq!(store.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_expire_only_touches_lapsed_crypto_rows() {
        let store = MemoryBillingStore::new();
        let plan = PlanSelection::new(PlanType::Pro, BillingInterval::Monthly);
        let start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let after = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();

        let crypto_user = Uuid::new_v4();
        let crypto = PaymentEvent::Crypto(CryptoEvent::ChargeConfirmed {
            charge_id: "chg_old".to_string(),
            metadata: OrderMetadata::for_subscription(Some(crypto_user), plan),
            amount_cents: None,
            currency: None,
            user: UserRef::from_provider(Some(crypto_user)),
        });
        reconcile(&store, crypto, start).await.unwrap();

        let stripe_user = Uuid::new_v4();
        reconcile(&store, stripe_activation(stripe_user, "sub_live", plan), start)
            .await
            .unwrap();

        let expired = expire_crypto_subscriptions(&store, after).await.unwrap();
        assert_eq!(expired, 1);

        let crypto_row = store.subscription_for_user(crypto_user).await.unwrap().unwrap();
        assert_eq!(crypto_row.status, SubscriptionStatus::Expired);
        let stripe_row = store.subscription_for_user(stripe_user).await.unwrap().unwrap();
        assert_eq!(stripe_row.status, SubscriptionStatus::Active);

        // Second run finds nothing left to expire
        assert_eq!(expire_crypto_subscriptions(&store, after).await.unwrap(), 0);
    }

    fn crypto_subscription(charge_id: &str, user_id: Uuid, plan: PlanSelection) -> PaymentEvent {
        PaymentEvent::Crypto(CryptoEvent::ChargeConfirmed {
            charge_id: charge_id.to_string(),
            metadata: OrderMetadata::for_subscription(Some(user_id), plan),
            amount_cents: None,
            currency: None,
            user: UserRef::from_provider(Some(user_id)),
        })
    }

    #[tokio::test]
    async fn test_replayed_charge_does_not_revive_expired_subscription() {
        let store = MemoryBillingStore::new();
        let user_id = Uuid::new_v4();
        let plan = PlanSelection::new(PlanType::Pro, BillingInterval::Monthly);
        let start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let after = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();

        reconcile(&store, crypto_subscription("chg_once", user_id, plan), start)
            .await
            .unwrap();
        expire_crypto_subscriptions(&store, after).await.unwrap();

        let outcome = reconcile(&store, crypto_subscription("chg_once", user_id, plan), after)
            .await
            .unwrap();
        let ReconcileOutcome::SubscriptionActivated(subscription) = outcome else {
            panic!("expected the existing row");
        };
        assert_eq!(subscription.status, SubscriptionStatus::Expired);
        assert_eq!(
            subscription.current_period_end,
            Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn test_replayed_checkout_does_not_revive_cancelled_subscription() {
        let store = MemoryBillingStore::new();
        let user_id = Uuid::new_v4();
        let plan = PlanSelection::new(PlanType::Basic, BillingInterval::Monthly);
        let now = Utc.with_ymd_and_hms(2025, 1, 11, 0, 0, 0).unwrap();

        reconcile(&store, stripe_activation(user_id, "sub_1", plan), now)
            .await
            .unwrap();
        store.cancel_subscription(user_id, now).await.unwrap();

        let later = now + chrono::Duration::days(3);
        reconcile(&store, stripe_activation(user_id, "sub_1", plan), later)
            .await
            .unwrap();

        let stored = store.subscription_for_user(user_id).await.unwrap().unwrap();
        assert_eq!(stored.status, SubscriptionStatus::Cancelled);
        assert_eq!(stored.cancelled_at, Some(now));
        assert_eq!(stored.current_period_start, now);
    }

    #[tokio::test]
    async fn test_new_payment_after_expiry_starts_fresh_period() {
        let store = MemoryBillingStore::new();
        let user_id = Uuid::new_v4();
        let plan = PlanSelection::new(PlanType::Pro, BillingInterval::Monthly);
        let start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let after = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();

        reconcile(&store, crypto_subscription("chg_first", user_id, plan), start)
            .await
            .unwrap();
        expire_crypto_subscriptions(&store, after).await.unwrap();
        reconcile(&store, crypto_subscription("chg_second", user_id, plan), after)
            .await
            .unwrap();

        let stored = store.subscription_for_user(user_id).await.unwrap().unwrap();
        assert_eq!(stored.status, SubscriptionStatus::Active);
        assert_eq!(stored.external_id.id(), "chg_second");
        assert_eq!(
            stored.current_period_end,
            Utc.with_ymd_and_hms(2025, 4, 1, 0, 0, 0).unwrap()
        );
    }
}
