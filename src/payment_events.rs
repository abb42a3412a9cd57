//! Provider events normalised into one tagged type.
//!
//! Every provider reports the same handful of facts (a subscription became
//! active, a subscription changed state, a one-time purchase completed) with
//! its own field names. Adapters in `stripe_client`, `paypal_client` and
//! `coinbase_client` build a [`PaymentEvent`]; [`PaymentEvent::into_intent`]
//! maps it onto the common row shape that `reconciliation::reconcile` applies.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

use crate::plans::PlanSelection;
use crate::purchases::NewPurchase;
use crate::reconciliation::ReconcileError;
use crate::subscriptions::{
    BillingPeriod, ExternalSubscriptionId, PaymentProvider, SubscriptionStatus,
};

pub const META_KIND: &str = "kind";
pub const META_USER_ID: &str = "user_id";
pub const META_PLAN_TYPE: &str = "plan_type";
pub const META_BILLING_INTERVAL: &str = "billing_interval";
pub const META_IMAGE_ID: &str = "image_id";

/// What a checkout/charge/order was created for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderKind {
    Subscription,
    Purchase,
}

impl OrderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderKind::Subscription => "subscription",
            OrderKind::Purchase => "purchase",
        }
    }
}

/// Metadata we attach to every provider-side checkout and read back from events
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderMetadata {
    pub kind: Option<OrderKind>,
    pub user_id: Option<Uuid>,
    pub plan: Option<PlanSelection>,
    pub image_id: Option<Uuid>,
}

impl OrderMetadata {
    pub fn for_subscription(user_id: Option<Uuid>, plan: PlanSelection) -> Self {
        Self {
            kind: Some(OrderKind::Subscription),
            user_id,
            plan: Some(plan),
            image_id: None,
        }
    }

    pub fn for_purchase(user_id: Option<Uuid>, image_id: Uuid) -> Self {
        Self {
            kind: Some(OrderKind::Purchase),
            user_id,
            plan: None,
            image_id: Some(image_id),
        }
    }

    /// Read from string key/value metadata. Unparseable values are treated as absent.
    pub fn from_pairs<'a, I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let map: HashMap<&str, &str> = pairs.into_iter().collect();
        let kind = match map.get(META_KIND).map(|k| k.trim()) {
            Some("subscription") => Some(OrderKind::Subscription),
            Some("purchase") => Some(OrderKind::Purchase),
            _ => None,
        };
        let plan = match (map.get(META_PLAN_TYPE), map.get(META_BILLING_INTERVAL)) {
            (Some(plan), Some(interval)) => PlanSelection::parse(plan, interval).ok(),
            _ => None,
        };
        Self {
            kind,
            user_id: map.get(META_USER_ID).and_then(|v| parse_uuid(v)),
            plan,
            image_id: map.get(META_IMAGE_ID).and_then(|v| parse_uuid(v)),
        }
    }

    /// Read from a JSON object of string values (Coinbase charge metadata)
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value.as_object() {
            Some(object) => Self::from_pairs(
                object
                    .iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.as_str(), s))),
            ),
            None => Self::default(),
        }
    }

    pub fn to_pairs(&self) -> HashMap<String, String> {
        let mut pairs = HashMap::new();
        if let Some(kind) = self.kind {
            pairs.insert(META_KIND.to_string(), kind.as_str().to_string());
        }
        if let Some(user_id) = self.user_id {
            pairs.insert(META_USER_ID.to_string(), user_id.to_string());
        }
        if let Some(plan) = self.plan {
            pairs.insert(META_PLAN_TYPE.to_string(), plan.plan_type.to_string());
            pairs.insert(
                META_BILLING_INTERVAL.to_string(),
                plan.billing_interval.to_string(),
            );
        }
        if let Some(image_id) = self.image_id {
            pairs.insert(META_IMAGE_ID.to_string(), image_id.to_string());
        }
        pairs
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self.to_pairs()).unwrap_or_default()
    }
}

pub fn parse_uuid(raw: &str) -> Option<Uuid> {
    Uuid::parse_str(raw.trim()).ok()
}

/// Places a user id can come from, in order of trust:
/// provider-side metadata, then the authenticated session, then a client-supplied fallback
/// (sent when session cookies do not survive the provider redirect).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UserRef {
    pub from_provider: Option<Uuid>,
    pub from_session: Option<Uuid>,
    pub from_client: Option<Uuid>,
}

impl UserRef {
    pub fn from_provider(user_id: Option<Uuid>) -> Self {
        Self {
            from_provider: user_id,
            ..Self::default()
        }
    }

    pub fn with_request(mut self, session: Option<Uuid>, client: Option<Uuid>) -> Self {
        self.from_session = session;
        self.from_client = client;
        self
    }

    pub fn resolve(&self) -> Option<Uuid> {
        self.from_provider
            .or(self.from_session)
            .or(self.from_client)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StripeCheckout {
    pub session_id: String,
    pub subscription_id: Option<String>,
    pub metadata: OrderMetadata,
    pub amount_total_cents: Option<i64>,
    pub currency: Option<String>,
    pub user: UserRef,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StripeEvent {
    CheckoutCompleted(StripeCheckout),
    /// `status` is None for Stripe states that do not change our row (e.g. `incomplete`)
    SubscriptionChanged {
        subscription_id: String,
        status: Option<SubscriptionStatus>,
        period: Option<BillingPeriod>,
    },
    SubscriptionDeleted {
        subscription_id: String,
    },
    /// Renewal periods arrive separately as `SubscriptionChanged`
    InvoicePaid {
        subscription_id: String,
    },
    InvoicePaymentFailed {
        subscription_id: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum PayPalEvent {
    SubscriptionActivated {
        subscription_id: String,
        plan: Option<PlanSelection>,
        user: UserRef,
    },
    SubscriptionStatusChanged {
        subscription_id: String,
        status: SubscriptionStatus,
    },
    OrderCompleted {
        order_id: String,
        image_id: Option<Uuid>,
        amount_cents: i64,
        currency: String,
        user: UserRef,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum CryptoEvent {
    ChargeConfirmed {
        charge_id: String,
        metadata: OrderMetadata,
        amount_cents: Option<i64>,
        currency: Option<String>,
        user: UserRef,
    },
    ChargeFailed {
        charge_id: String,
        reason: String,
    },
    ChargePending {
        charge_id: String,
    },
}

/// A payment event from any provider, delivered by webhook or by a client "activate" call
#[derive(Debug, Clone, PartialEq)]
pub enum PaymentEvent {
    Stripe(StripeEvent),
    PayPal(PayPalEvent),
    Crypto(CryptoEvent),
}

/// The provider-independent change an event asks for
#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    ActivateSubscription {
        user_id: Uuid,
        plan: PlanSelection,
        external_id: ExternalSubscriptionId,
    },
    UpdateSubscriptionStatus {
        external_id: ExternalSubscriptionId,
        status: SubscriptionStatus,
        period: Option<BillingPeriod>,
    },
    CompletePurchase(NewPurchase),
    Ignore(String),
}

fn amount_to_i32(amount_cents: i64, reference: &str) -> Result<i32, ReconcileError> {
    i32::try_from(amount_cents).map_err(|_| {
        ReconcileError::Malformed(format!(
            "Amount {} for {} does not fit a purchase row",
            amount_cents, reference
        ))
    })
}

fn require_user(
    user: &UserRef,
    provider: PaymentProvider,
    reference: &str,
) -> Result<Uuid, ReconcileError> {
    user.resolve().ok_or_else(|| ReconcileError::MissingUser {
        provider,
        reference: reference.to_string(),
    })
}

fn require_plan(
    plan: Option<PlanSelection>,
    provider: PaymentProvider,
    reference: &str,
) -> Result<PlanSelection, ReconcileError> {
    plan.ok_or_else(|| ReconcileError::MissingPlan {
        provider,
        reference: reference.to_string(),
    })
}

fn purchase_intent(
    provider: PaymentProvider,
    session_id: &str,
    image_id: Option<Uuid>,
    amount_cents: i64,
    currency: &str,
    user_id: Option<Uuid>,
) -> Result<Intent, ReconcileError> {
    let image_id = image_id.ok_or_else(|| {
        ReconcileError::Malformed(format!("Purchase {} has no image id", session_id))
    })?;
    Ok(Intent::CompletePurchase(NewPurchase {
        user_id,
        image_id,
        provider,
        provider_session_id: session_id.to_string(),
        amount_cents: amount_to_i32(amount_cents, session_id)?,
        currency: currency.to_ascii_lowercase(),
    }))
}

impl PaymentEvent {
    pub fn provider(&self) -> PaymentProvider {
        match self {
            PaymentEvent::Stripe(_) => PaymentProvider::Stripe,
            PaymentEvent::PayPal(_) => PaymentProvider::PayPal,
            PaymentEvent::Crypto(_) => PaymentProvider::Crypto,
        }
    }

    /// The provider-side id the event is about
    pub fn reference(&self) -> &str {
        match self {
            PaymentEvent::Stripe(StripeEvent::CheckoutCompleted(checkout)) => &checkout.session_id,
            PaymentEvent::Stripe(StripeEvent::SubscriptionChanged { subscription_id, .. })
            | PaymentEvent::Stripe(StripeEvent::SubscriptionDeleted { subscription_id })
            | PaymentEvent::Stripe(StripeEvent::InvoicePaid { subscription_id })
            | PaymentEvent::Stripe(StripeEvent::InvoicePaymentFailed { subscription_id })
            | PaymentEvent::PayPal(PayPalEvent::SubscriptionActivated { subscription_id, .. })
            | PaymentEvent::PayPal(PayPalEvent::SubscriptionStatusChanged {
                subscription_id, ..
            }) => subscription_id,
            PaymentEvent::PayPal(PayPalEvent::OrderCompleted { order_id, .. }) => order_id,
            PaymentEvent::Crypto(CryptoEvent::ChargeConfirmed { charge_id, .. })
            | PaymentEvent::Crypto(CryptoEvent::ChargeFailed { charge_id, .. })
            | PaymentEvent::Crypto(CryptoEvent::ChargePending { charge_id }) => charge_id,
        }
    }

    /// Attach the caller's session user and client fallback to events that carry a user
    pub fn with_request_user(self, session: Option<Uuid>, client: Option<Uuid>) -> Self {
        match self {
            PaymentEvent::Stripe(StripeEvent::CheckoutCompleted(mut checkout)) => {
                checkout.user = checkout.user.with_request(session, client);
                PaymentEvent::Stripe(StripeEvent::CheckoutCompleted(checkout))
            }
            PaymentEvent::PayPal(PayPalEvent::SubscriptionActivated {
                subscription_id,
                plan,
                user,
            }) => PaymentEvent::PayPal(PayPalEvent::SubscriptionActivated {
                subscription_id,
                plan,
                user: user.with_request(session, client),
            }),
            PaymentEvent::PayPal(PayPalEvent::OrderCompleted {
                order_id,
                image_id,
                amount_cents,
                currency,
                user,
            }) => PaymentEvent::PayPal(PayPalEvent::OrderCompleted {
                order_id,
                image_id,
                amount_cents,
                currency,
                user: user.with_request(session, client),
            }),
            PaymentEvent::Crypto(CryptoEvent::ChargeConfirmed {
                charge_id,
                metadata,
                amount_cents,
                currency,
                user,
            }) => PaymentEvent::Crypto(CryptoEvent::ChargeConfirmed {
                charge_id,
                metadata,
                amount_cents,
                currency,
                user: user.with_request(session, client),
            }),
            other => other,
        }
    }

    /// Map provider fields onto the common change
    pub fn into_intent(self) -> Result<Intent, ReconcileError> {
        match self {
            PaymentEvent::Stripe(event) => stripe_intent(event),
            PaymentEvent::PayPal(event) => paypal_intent(event),
            PaymentEvent::Crypto(event) => crypto_intent(event),
        }
    }
}

impl fmt::Display for PaymentEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            PaymentEvent::Stripe(StripeEvent::CheckoutCompleted(_)) => "checkout_completed",
            PaymentEvent::Stripe(StripeEvent::SubscriptionChanged { .. }) => "subscription_changed",
            PaymentEvent::Stripe(StripeEvent::SubscriptionDeleted { .. }) => "subscription_deleted",
            PaymentEvent::Stripe(StripeEvent::InvoicePaid { .. }) => "invoice_paid",
            PaymentEvent::Stripe(StripeEvent::InvoicePaymentFailed { .. }) => {
                "invoice_payment_failed"
            }
            PaymentEvent::PayPal(PayPalEvent::SubscriptionActivated { .. }) => {
                "subscription_activated"
            }
            PaymentEvent::PayPal(PayPalEvent::SubscriptionStatusChanged { .. }) => {
                "subscription_status_changed"
            }
            PaymentEvent::PayPal(PayPalEvent::OrderCompleted { .. }) => "order_completed",
            PaymentEvent::Crypto(CryptoEvent::ChargeConfirmed { .. }) => "charge_confirmed",
            PaymentEvent::Crypto(CryptoEvent::ChargeFailed { .. }) => "charge_failed",
            PaymentEvent::Crypto(CryptoEvent::ChargePending { .. }) => "charge_pending",
        };
        write!(f, "{}:{} ({})", self.provider(), kind, self.reference())
    }
}

fn stripe_intent(event: StripeEvent) -> Result<Intent, ReconcileError> {
    let provider = PaymentProvider::Stripe;
    match event {
        StripeEvent::CheckoutCompleted(checkout) => {
            let is_purchase = match checkout.metadata.kind {
                Some(kind) => kind == OrderKind::Purchase,
                None => checkout.subscription_id.is_none(),
            };
            if is_purchase {
                return purchase_intent(
                    provider,
                    &checkout.session_id,
                    checkout.metadata.image_id,
                    checkout.amount_total_cents.unwrap_or_default(),
                    checkout.currency.as_deref().unwrap_or("usd"),
                    checkout.user.resolve(),
                );
            }

            let subscription_id = checkout.subscription_id.ok_or_else(|| {
                ReconcileError::Malformed(format!(
                    "Subscription checkout {} has no subscription id",
                    checkout.session_id
                ))
            })?;
            let user_id = require_user(&checkout.user, provider, &subscription_id)?;
            let plan = require_plan(checkout.metadata.plan, provider, &subscription_id)?;
            Ok(Intent::ActivateSubscription {
                user_id,
                plan,
                external_id: ExternalSubscriptionId::Stripe(subscription_id),
            })
        }
        StripeEvent::SubscriptionChanged {
            subscription_id,
            status,
            period,
        } => match status {
            Some(status) => Ok(Intent::UpdateSubscriptionStatus {
                external_id: ExternalSubscriptionId::Stripe(subscription_id),
                status,
                period,
            }),
            None => Ok(Intent::Ignore(format!(
                "Stripe subscription {} is in a state that does not change access",
                subscription_id
            ))),
        },
        StripeEvent::SubscriptionDeleted { subscription_id } => {
            Ok(Intent::UpdateSubscriptionStatus {
                external_id: ExternalSubscriptionId::Stripe(subscription_id),
                status: SubscriptionStatus::Cancelled,
                period: None,
            })
        }
        StripeEvent::InvoicePaid { subscription_id } => Ok(Intent::UpdateSubscriptionStatus {
            external_id: ExternalSubscriptionId::Stripe(subscription_id),
            status: SubscriptionStatus::Active,
            period: None,
        }),
        StripeEvent::InvoicePaymentFailed { subscription_id } => {
            Ok(Intent::UpdateSubscriptionStatus {
                external_id: ExternalSubscriptionId::Stripe(subscription_id),
                status: SubscriptionStatus::PastDue,
                period: None,
            })
        }
    }
}

fn paypal_intent(event: PayPalEvent) -> Result<Intent, ReconcileError> {
    let provider = PaymentProvider::PayPal;
    match event {
        PayPalEvent::SubscriptionActivated {
            subscription_id,
            plan,
            user,
        } => {
            let user_id = require_user(&user, provider, &subscription_id)?;
            let plan = require_plan(plan, provider, &subscription_id)?;
            Ok(Intent::ActivateSubscription {
                user_id,
                plan,
                external_id: ExternalSubscriptionId::PayPal(subscription_id),
            })
        }
        PayPalEvent::SubscriptionStatusChanged {
            subscription_id,
            status,
        } => Ok(Intent::UpdateSubscriptionStatus {
            external_id: ExternalSubscriptionId::PayPal(subscription_id),
            status,
            period: None,
        }),
        PayPalEvent::OrderCompleted {
            order_id,
            image_id,
            amount_cents,
            currency,
            user,
        } => purchase_intent(
            provider,
            &order_id,
            image_id,
            amount_cents,
            &currency,
            user.resolve(),
        ),
    }
}

fn crypto_intent(event: CryptoEvent) -> Result<Intent, ReconcileError> {
    let provider = PaymentProvider::Crypto;
    match event {
        CryptoEvent::ChargeConfirmed {
            charge_id,
            metadata,
            amount_cents,
            currency,
            user,
        } => match metadata.kind {
            Some(OrderKind::Purchase) => purchase_intent(
                provider,
                &charge_id,
                metadata.image_id,
                amount_cents.unwrap_or_default(),
                currency.as_deref().unwrap_or("usd"),
                user.resolve(),
            ),
            Some(OrderKind::Subscription) | None => {
                let user_id = require_user(&user, provider, &charge_id)?;
                let plan = require_plan(metadata.plan, provider, &charge_id)?;
                Ok(Intent::ActivateSubscription {
                    user_id,
                    plan,
                    external_id: ExternalSubscriptionId::Crypto(charge_id),
                })
            }
        },
        CryptoEvent::ChargeFailed { charge_id, reason } => Ok(Intent::Ignore(format!(
            "Crypto charge {} failed: {}",
            charge_id, reason
        ))),
        CryptoEvent::ChargePending { charge_id } => Ok(Intent::Ignore(format!(
            "Crypto charge {} is awaiting confirmations",
            charge_id
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plans::{BillingInterval, PlanType};

    fn pro_monthly() -> PlanSelection {
        PlanSelection::new(PlanType::Pro, BillingInterval::Monthly)
    }

    #[test]
    fn test_user_ref_precedence() {
        let provider = Uuid::new_v4();
        let session = Uuid::new_v4();
        let client = Uuid::new_v4();

        let all = UserRef::from_provider(Some(provider)).with_request(Some(session), Some(client));
        assert_eq!(all.resolve(), Some(provider));

        let no_provider = UserRef::default().with_request(Some(session), Some(client));
        assert_eq!(no_provider.resolve(), Some(session));

        let only_client = UserRef::default().with_request(None, Some(client));
        assert_eq!(only_client.resolve(), Some(client));

        assert_eq!(UserRef::default().resolve(), None);
    }

    #[test]
    fn test_metadata_pairs() {
        let user_id = Uuid::new_v4();
        let metadata = OrderMetadata::for_subscription(Some(user_id), pro_monthly());
        let pairs = metadata.to_pairs();
        let parsed = OrderMetadata::from_pairs(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        assert_eq!(parsed, metadata);
    }

    #[test]
    fn test_metadata_ignores_garbage() {
        let parsed = OrderMetadata::from_pairs([
            ("kind", "subscription"),
            ("user_id", "not-a-uuid"),
            ("plan_type", "gold"),
            ("billing_interval", "monthly"),
        ]);
        assert_eq!(parsed.kind, Some(OrderKind::Subscription));
        assert_eq!(parsed.user_id, None);
        assert_eq!(parsed.plan, None);
    }

    #[test]
    fn test_metadata_from_json() {
        let image_id = Uuid::new_v4();
        let value = serde_json::json!({
            "kind": "purchase",
            "image_id": image_id.to_string(),
            "unrelated": 42
        });
        let parsed = OrderMetadata::from_json(&value);
        assert_eq!(parsed.kind, Some(OrderKind::Purchase));
        assert_eq!(parsed.image_id, Some(image_id));
        assert_eq!(OrderMetadata::from_json(&serde_json::Value::Null), OrderMetadata::default());
    }

    #[test]
    fn test_stripe_subscription_checkout_maps_to_activation() {
        let user_id = Uuid::new_v4();
        let event = PaymentEvent::Stripe(StripeEvent::CheckoutCompleted(StripeCheckout {
            session_id: "cs_test_1".to_string(),
            subscription_id: Some("sub_1".to_string()),
            metadata: OrderMetadata::for_subscription(Some(user_id), pro_monthly()),
            amount_total_cents: Some(999),
            currency: Some("usd".to_string()),
            user: UserRef::from_provider(Some(user_id)),
        }));

        let intent = event.into_intent().unwrap();
        assert_eq!(
            intent,
            Intent::ActivateSubscription {
                user_id,
                plan: pro_monthly(),
                external_id: ExternalSubscriptionId::Stripe("sub_1".to_string()),
            }
        );
    }

    #[test]
    fn test_stripe_checkout_without_user_is_missing_user() {
        let event = PaymentEvent::Stripe(StripeEvent::CheckoutCompleted(StripeCheckout {
            session_id: "cs_test_2".to_string(),
            subscription_id: Some("sub_2".to_string()),
            metadata: OrderMetadata::for_subscription(None, pro_monthly()),
            amount_total_cents: None,
            currency: None,
            user: UserRef::default(),
        }));

        assert!(matches!(
            event.into_intent(),
            Err(ReconcileError::MissingUser { .. })
        ));
    }

    #[test]
    fn test_stripe_checkout_uses_client_fallback_user() {
        let fallback = Uuid::new_v4();
        let event = PaymentEvent::Stripe(StripeEvent::CheckoutCompleted(StripeCheckout {
            session_id: "cs_test_3".to_string(),
            subscription_id: Some("sub_3".to_string()),
            metadata: OrderMetadata::for_subscription(None, pro_monthly()),
            amount_total_cents: None,
            currency: None,
            user: UserRef::default(),
        }))
        .with_request_user(None, Some(fallback));

        match event.into_intent().unwrap() {
            Intent::ActivateSubscription { user_id, .. } => assert_eq!(user_id, fallback),
            other => panic!("unexpected intent {:?}", other),
        }
    }

    #[test]
    fn test_stripe_purchase_checkout_maps_to_purchase() {
        let image_id = Uuid::new_v4();
        let event = PaymentEvent::Stripe(StripeEvent::CheckoutCompleted(StripeCheckout {
            session_id: "cs_test_4".to_string(),
            subscription_id: None,
            metadata: OrderMetadata::for_purchase(None, image_id),
            amount_total_cents: Some(1500),
            currency: Some("USD".to_string()),
            user: UserRef::default(),
        }));

        match event.into_intent().unwrap() {
            Intent::CompletePurchase(purchase) => {
                assert_eq!(purchase.image_id, image_id);
                assert_eq!(purchase.user_id, None);
                assert_eq!(purchase.provider_session_id, "cs_test_4");
                assert_eq!(purchase.amount_cents, 1500);
                assert_eq!(purchase.currency, "usd");
            }
            other => panic!("unexpected intent {:?}", other),
        }
    }

    #[test]
    fn test_stripe_status_events() {
        let deleted = PaymentEvent::Stripe(StripeEvent::SubscriptionDeleted {
            subscription_id: "sub_9".to_string(),
        });
        assert_eq!(
            deleted.into_intent().unwrap(),
            Intent::UpdateSubscriptionStatus {
                external_id: ExternalSubscriptionId::Stripe("sub_9".to_string()),
                status: SubscriptionStatus::Cancelled,
                period: None,
            }
        );

        let failed = PaymentEvent::Stripe(StripeEvent::InvoicePaymentFailed {
            subscription_id: "sub_9".to_string(),
        });
        assert!(matches!(
            failed.into_intent().unwrap(),
            Intent::UpdateSubscriptionStatus {
                status: SubscriptionStatus::PastDue,
                ..
            }
        ));

        let incomplete = PaymentEvent::Stripe(StripeEvent::SubscriptionChanged {
            subscription_id: "sub_9".to_string(),
            status: None,
            period: None,
        });
        assert!(matches!(incomplete.into_intent().unwrap(), Intent::Ignore(_)));
    }

    #[test]
    fn test_paypal_activation_requires_plan() {
        let event = PaymentEvent::PayPal(PayPalEvent::SubscriptionActivated {
            subscription_id: "I-123".to_string(),
            plan: None,
            user: UserRef::from_provider(Some(Uuid::new_v4())),
        });
        assert!(matches!(
            event.into_intent(),
            Err(ReconcileError::MissingPlan { .. })
        ));
    }

    #[test]
    fn test_crypto_purchase_requires_image() {
        let event = PaymentEvent::Crypto(CryptoEvent::ChargeConfirmed {
            charge_id: "chg_1".to_string(),
            metadata: OrderMetadata {
                kind: Some(OrderKind::Purchase),
                ..OrderMetadata::default()
            },
            amount_cents: Some(500),
            currency: Some("USD".to_string()),
            user: UserRef::default(),
        });
        assert!(matches!(
            event.into_intent(),
            Err(ReconcileError::Malformed(_))
        ));
    }

    #[test]
    fn test_crypto_failed_is_ignored() {
        let event = PaymentEvent::Crypto(CryptoEvent::ChargeFailed {
            charge_id: "chg_2".to_string(),
            reason: "expired".to_string(),
        });
        assert_eq!(event.reference(), "chg_2");
        assert!(matches!(event.into_intent().unwrap(), Intent::Ignore(_)));
    }

    #[test]
    fn test_display() {
        let event = PaymentEvent::PayPal(PayPalEvent::SubscriptionStatusChanged {
            subscription_id: "I-7".to_string(),
            status: SubscriptionStatus::Expired,
        });
        assert_eq!(
            event.to_string(),
            "paypal:subscription_status_changed (I-7)"
        );
    }
}
