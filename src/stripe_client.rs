use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use stripe::{
    CancelSubscription, CheckoutSession, CheckoutSessionId, CheckoutSessionMode,
    CheckoutSessionPaymentStatus, Client, CreateCheckoutSession, CreateCheckoutSessionLineItems,
    CreateCheckoutSessionLineItemsPriceData, CreateCheckoutSessionLineItemsPriceDataProductData,
    CreateCheckoutSessionSubscriptionData, Currency, Event, EventObject, Subscription,
    SubscriptionId,
};
use tracing::info;
use uuid::Uuid;

use crate::images::Image;
use crate::payment_events::{OrderMetadata, PaymentEvent, StripeCheckout, StripeEvent, UserRef};
use crate::plans::{PlanSelection, plan_ids_from_env};
use crate::provider_error::ProviderError;
use crate::subscriptions::{BillingPeriod, PaymentProvider, SubscriptionStatus};

/// Configuration for Stripe integration
#[derive(Clone)]
pub struct StripeConfig {
    pub client: Client,
    pub webhook_secret: String,
    /// Recurring price ids keyed by plan, from `STRIPE_PRICE_<PLAN>_<INTERVAL>`
    pub price_ids: HashMap<PlanSelection, String>,
}

impl StripeConfig {
    /// Initialize Stripe configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let secret_key =
            std::env::var("STRIPE_SECRET_KEY").context("STRIPE_SECRET_KEY must be set")?;
        let webhook_secret =
            std::env::var("STRIPE_WEBHOOK_SECRET").context("STRIPE_WEBHOOK_SECRET must be set")?;
        let price_ids = plan_ids_from_env("STRIPE_PRICE");
        if price_ids.is_empty() {
            anyhow::bail!("At least one STRIPE_PRICE_<PLAN>_<INTERVAL> must be set");
        }

        Ok(Self {
            client: Client::new(secret_key),
            webhook_secret,
            price_ids,
        })
    }

    pub fn price_id(&self, plan: PlanSelection) -> Option<&str> {
        self.price_ids.get(&plan).map(String::as_str)
    }

    /// Create a Checkout Session for a recurring plan
    pub async fn create_subscription_checkout(
        &self,
        plan: PlanSelection,
        user_id: Uuid,
        base_url: &str,
    ) -> Result<CheckoutSession, ProviderError> {
        let price_id = self
            .price_id(plan)
            .ok_or_else(|| ProviderError::NotConfigured {
                provider: PaymentProvider::Stripe,
            })?;

        let success_url = format!(
            "{}/billing/success?provider=stripe&session_id={{CHECKOUT_SESSION_ID}}",
            base_url
        );
        let cancel_url = format!("{}/billing/cancel", base_url);
        let user_id_str = user_id.to_string();
        let metadata = OrderMetadata::for_subscription(Some(user_id), plan).to_pairs();

        let mut params = CreateCheckoutSession::new();
        params.success_url = Some(&success_url);
        params.cancel_url = Some(&cancel_url);
        params.mode = Some(CheckoutSessionMode::Subscription);
        params.client_reference_id = Some(&user_id_str);
        params.line_items = Some(vec![CreateCheckoutSessionLineItems {
            price: Some(price_id.to_string()),
            quantity: Some(1),
            ..Default::default()
        }]);
        // Copied onto the subscription so later subscription events can be traced to the user
        params.subscription_data = Some(CreateCheckoutSessionSubscriptionData {
            metadata: Some(metadata.clone()),
            ..Default::default()
        });
        params.metadata = Some(metadata);

        let session = CheckoutSession::create(&self.client, params).await?;
        info!(session_id = %session.id, user_id = %user_id, plan = %plan.label(), "Created Stripe subscription checkout");
        Ok(session)
    }

    /// Create a one-time Checkout Session for an image license
    pub async fn create_purchase_checkout(
        &self,
        image: &Image,
        user_id: Uuid,
        base_url: &str,
    ) -> Result<CheckoutSession, ProviderError> {
        let success_url = format!(
            "{}/billing/success?provider=stripe&session_id={{CHECKOUT_SESSION_ID}}",
            base_url
        );
        let cancel_url = format!("{}/images/{}", base_url, image.id);
        let user_id_str = user_id.to_string();

        let mut params = CreateCheckoutSession::new();
        params.success_url = Some(&success_url);
        params.cancel_url = Some(&cancel_url);
        params.mode = Some(CheckoutSessionMode::Payment);
        params.client_reference_id = Some(&user_id_str);
        params.line_items = Some(vec![CreateCheckoutSessionLineItems {
            price_data: Some(CreateCheckoutSessionLineItemsPriceData {
                currency: Currency::USD,
                product_data: Some(CreateCheckoutSessionLineItemsPriceDataProductData {
                    name: image.title.clone(),
                    ..Default::default()
                }),
                unit_amount: Some(image.price_cents as i64),
                ..Default::default()
            }),
            quantity: Some(1),
            ..Default::default()
        }]);
        params.metadata = Some(OrderMetadata::for_purchase(Some(user_id), image.id).to_pairs());

        let session = CheckoutSession::create(&self.client, params).await?;
        info!(session_id = %session.id, image_id = %image.id, "Created Stripe purchase checkout");
        Ok(session)
    }

    pub async fn retrieve_session(&self, session_id: &str) -> Result<CheckoutSession, ProviderError> {
        let id: CheckoutSessionId = session_id.parse().map_err(|_| ProviderError::Rejected {
            provider: PaymentProvider::Stripe,
            status: 400,
            message: format!("Invalid checkout session id: {}", session_id),
        })?;
        Ok(CheckoutSession::retrieve(&self.client, &id, &[]).await?)
    }

    pub async fn cancel_subscription(&self, subscription_id: &str) -> Result<(), ProviderError> {
        let id: SubscriptionId = subscription_id.parse().map_err(|_| ProviderError::Rejected {
            provider: PaymentProvider::Stripe,
            status: 400,
            message: format!("Invalid subscription id: {}", subscription_id),
        })?;
        Subscription::cancel(&self.client, &id, CancelSubscription::new()).await?;
        Ok(())
    }
}

impl std::fmt::Debug for StripeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeConfig")
            .field("webhook_secret", &"[REDACTED]")
            .field("price_ids", &self.price_ids.len())
            .finish()
    }
}

/// Map a Stripe subscription state onto ours. None for states that do not change access.
pub fn map_subscription_status(status: stripe::SubscriptionStatus) -> Option<SubscriptionStatus> {
    use stripe::SubscriptionStatus as Stripe;
    match status {
        Stripe::Active | Stripe::Trialing => Some(SubscriptionStatus::Active),
        Stripe::PastDue | Stripe::Unpaid | Stripe::Paused => Some(SubscriptionStatus::PastDue),
        Stripe::Canceled => Some(SubscriptionStatus::Cancelled),
        Stripe::IncompleteExpired => Some(SubscriptionStatus::Expired),
        Stripe::Incomplete => None,
    }
}

fn timestamp(seconds: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(seconds, 0)
}

pub fn subscription_period(subscription: &Subscription) -> Option<BillingPeriod> {
    Some(BillingPeriod {
        start: timestamp(subscription.current_period_start)?,
        end: timestamp(subscription.current_period_end)?,
    })
}

/// Whether the session has been paid for (or needs no payment)
pub fn session_is_paid(session: &CheckoutSession) -> bool {
    matches!(
        session.payment_status,
        CheckoutSessionPaymentStatus::Paid | CheckoutSessionPaymentStatus::NoPaymentRequired
    )
}

/// Normalise a completed checkout session.
///
/// The user comes from our metadata first, then `client_reference_id`.
pub fn checkout_from_session(session: &CheckoutSession) -> StripeCheckout {
    let metadata = session
        .metadata
        .as_ref()
        .map(|m| OrderMetadata::from_pairs(m.iter().map(|(k, v)| (k.as_str(), v.as_str()))))
        .unwrap_or_default();
    let user_id = metadata.user_id.or_else(|| {
        session
            .client_reference_id
            .as_deref()
            .and_then(crate::payment_events::parse_uuid)
    });

    StripeCheckout {
        session_id: session.id.to_string(),
        subscription_id: session.subscription.as_ref().map(|s| s.id().to_string()),
        metadata,
        amount_total_cents: session.amount_total,
        currency: session.currency.map(|c| c.to_string()),
        user: UserRef::from_provider(user_id),
    }
}

/// Map a verified webhook event. None for event types we do not act on.
pub fn payment_event_from_webhook(event: &Event) -> Option<PaymentEvent> {
    let event_type = event.type_.to_string();
    let stripe_event = match (event_type.as_str(), &event.data.object) {
        ("checkout.session.completed", EventObject::CheckoutSession(session)) => {
            if !session_is_paid(session) {
                return None;
            }
            StripeEvent::CheckoutCompleted(checkout_from_session(session))
        }
        ("customer.subscription.updated", EventObject::Subscription(subscription)) => {
            StripeEvent::SubscriptionChanged {
                subscription_id: subscription.id.to_string(),
                status: map_subscription_status(subscription.status),
                period: subscription_period(subscription),
            }
        }
        ("customer.subscription.deleted", EventObject::Subscription(subscription)) => {
            StripeEvent::SubscriptionDeleted {
                subscription_id: subscription.id.to_string(),
            }
        }
        ("invoice.paid", EventObject::Invoice(invoice)) => StripeEvent::InvoicePaid {
            subscription_id: invoice.subscription.as_ref()?.id().to_string(),
        },
        ("invoice.payment_failed", EventObject::Invoice(invoice)) => {
            StripeEvent::InvoicePaymentFailed {
                subscription_id: invoice.subscription.as_ref()?.id().to_string(),
            }
        }
        _ => return None,
    };
    Some(PaymentEvent::Stripe(stripe_event))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_status_mapping() {
        use stripe::SubscriptionStatus as Stripe;
        assert_eq!(
            map_subscription_status(Stripe::Trialing),
            Some(SubscriptionStatus::Active)
        );
        assert_eq!(
            map_subscription_status(Stripe::Unpaid),
            Some(SubscriptionStatus::PastDue)
        );
        assert_eq!(
            map_subscription_status(Stripe::Canceled),
            Some(SubscriptionStatus::Cancelled)
        );
        assert_eq!(
            map_subscription_status(Stripe::IncompleteExpired),
            Some(SubscriptionStatus::Expired)
        );
        assert_eq!(map_subscription_status(Stripe::Incomplete), None);
    }

    #[test]
    #[serial]
    fn test_from_env_requires_a_price() {
        unsafe {
            std::env::set_var("STRIPE_SECRET_KEY", "sk_test_123");
            std::env::set_var("STRIPE_WEBHOOK_SECRET", "whsec_123");
        }
        for plan in PlanSelection::all() {
            unsafe {
                std::env::remove_var(format!("STRIPE_PRICE_{}", plan.env_suffix()));
            }
        }
        assert!(StripeConfig::from_env().is_err());

        unsafe {
            std::env::set_var("STRIPE_PRICE_PRO_MONTHLY", "price_pro_monthly");
        }
        let config = StripeConfig::from_env().unwrap();
        let pro_monthly = PlanSelection::parse("pro", "monthly").unwrap();
        assert_eq!(config.price_id(pro_monthly), Some("price_pro_monthly"));
        assert_eq!(
            config.price_id(PlanSelection::parse("pro", "yearly").unwrap()),
            None
        );
        assert!(!format!("{:?}", config).contains("whsec_123"));

        unsafe {
            std::env::remove_var("STRIPE_PRICE_PRO_MONTHLY");
            std::env::remove_var("STRIPE_SECRET_KEY");
            std::env::remove_var("STRIPE_WEBHOOK_SECRET");
        }
    }
}
