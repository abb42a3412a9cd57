use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_derive_enum::DbEnum;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::plans::{BillingInterval, PlanSelection, PlanType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, DbEnum)]
#[db_enum(existing_type_path = "crate::schema::sql_types::PaymentProvider")]
#[serde(rename_all = "snake_case")]
pub enum PaymentProvider {
    #[db_enum(rename = "stripe")]
    Stripe,
    #[db_enum(rename = "paypal")]
    PayPal,
    #[db_enum(rename = "crypto")]
    Crypto,
}

impl PaymentProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentProvider::Stripe => "stripe",
            PaymentProvider::PayPal => "paypal",
            PaymentProvider::Crypto => "crypto",
        }
    }
}

impl fmt::Display for PaymentProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, DbEnum)]
#[db_enum(existing_type_path = "crate::schema::sql_types::SubscriptionStatus")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    #[db_enum(rename = "active")]
    Active,
    #[db_enum(rename = "past_due")]
    PastDue,
    #[db_enum(rename = "cancelled")]
    Cancelled,
    #[db_enum(rename = "expired")]
    Expired,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Cancelled => "cancelled",
            SubscriptionStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider-side identifier of a subscription. A row carries exactly one of these.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "provider", content = "id", rename_all = "snake_case")]
pub enum ExternalSubscriptionId {
    Stripe(String),
    PayPal(String),
    Crypto(String),
}

impl ExternalSubscriptionId {
    pub fn new(provider: PaymentProvider, id: impl Into<String>) -> Self {
        let id = id.into();
        match provider {
            PaymentProvider::Stripe => ExternalSubscriptionId::Stripe(id),
            PaymentProvider::PayPal => ExternalSubscriptionId::PayPal(id),
            PaymentProvider::Crypto => ExternalSubscriptionId::Crypto(id),
        }
    }

    pub fn provider(&self) -> PaymentProvider {
        match self {
            ExternalSubscriptionId::Stripe(_) => PaymentProvider::Stripe,
            ExternalSubscriptionId::PayPal(_) => PaymentProvider::PayPal,
            ExternalSubscriptionId::Crypto(_) => PaymentProvider::Crypto,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            ExternalSubscriptionId::Stripe(id)
            | ExternalSubscriptionId::PayPal(id)
            | ExternalSubscriptionId::Crypto(id) => id,
        }
    }

    /// Column values (stripe, paypal, crypto) with the other two cleared
    pub fn columns(&self) -> (Option<String>, Option<String>, Option<String>) {
        match self {
            ExternalSubscriptionId::Stripe(id) => (Some(id.clone()), None, None),
            ExternalSubscriptionId::PayPal(id) => (None, Some(id.clone()), None),
            ExternalSubscriptionId::Crypto(id) => (None, None, Some(id.clone())),
        }
    }
}

/// API model for subscriptions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub plan_type: PlanType,
    pub billing_interval: BillingInterval,
    pub status: SubscriptionStatus,
    pub external_id: ExternalSubscriptionId,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    pub fn provider(&self) -> PaymentProvider {
        self.external_id.provider()
    }

    /// Whether the period has run out while the row still claims to be live
    pub fn is_lapsed(&self, now: DateTime<Utc>) -> bool {
        matches!(
            self.status,
            SubscriptionStatus::Active | SubscriptionStatus::PastDue
        ) && self.current_period_end < now
    }

    /// Status as the user should see it at `now`
    pub fn effective_status(&self, now: DateTime<Utc>) -> SubscriptionStatus {
        if self.is_lapsed(now) {
            SubscriptionStatus::Expired
        } else {
            self.status
        }
    }
}

/// Diesel model for the subscriptions table
#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = crate::schema::subscriptions)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct SubscriptionModel {
    pub id: Uuid,
    pub user_id: Uuid,
    pub plan_type: PlanType,
    pub billing_interval: BillingInterval,
    pub status: SubscriptionStatus,
    pub provider: PaymentProvider,
    pub stripe_subscription_id: Option<String>,
    pub paypal_subscription_id: Option<String>,
    pub crypto_charge_id: Option<String>,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<SubscriptionModel> for Subscription {
    type Error = anyhow::Error;

    fn try_from(model: SubscriptionModel) -> Result<Self, Self::Error> {
        let external = match model.provider {
            PaymentProvider::Stripe => model.stripe_subscription_id,
            PaymentProvider::PayPal => model.paypal_subscription_id,
            PaymentProvider::Crypto => model.crypto_charge_id,
        };
        let external = external.ok_or_else(|| {
            anyhow::anyhow!(
                "Subscription {} has provider {} but no matching external id",
                model.id,
                model.provider
            )
        })?;

        Ok(Self {
            id: model.id,
            user_id: model.user_id,
            plan_type: model.plan_type,
            billing_interval: model.billing_interval,
            status: model.status,
            external_id: ExternalSubscriptionId::new(model.provider, external),
            current_period_start: model.current_period_start,
            current_period_end: model.current_period_end,
            cancelled_at: model.cancelled_at,
            created_at: model.created_at,
            updated_at: model.updated_at,
        })
    }
}

/// Desired state of a user's subscription after an activation.
/// Applying it is an upsert keyed by `user_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSubscription {
    pub user_id: Uuid,
    pub plan: PlanSelection,
    pub external_id: ExternalSubscriptionId,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
}

impl NewSubscription {
    /// Activation starting at `now`, running one billing interval
    pub fn starting_at(
        user_id: Uuid,
        plan: PlanSelection,
        external_id: ExternalSubscriptionId,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id,
            plan,
            external_id,
            current_period_start: now,
            current_period_end: plan.billing_interval.period_end(now),
        }
    }

    pub fn to_row(&self) -> SubscriptionRow {
        let (stripe_subscription_id, paypal_subscription_id, crypto_charge_id) =
            self.external_id.columns();
        SubscriptionRow {
            user_id: self.user_id,
            plan_type: self.plan.plan_type,
            billing_interval: self.plan.billing_interval,
            status: SubscriptionStatus::Active,
            provider: self.external_id.provider(),
            stripe_subscription_id,
            paypal_subscription_id,
            crypto_charge_id,
            current_period_start: self.current_period_start,
            current_period_end: self.current_period_end,
            cancelled_at: None,
        }
    }
}

/// Insert/upsert model for the subscriptions table.
/// `treat_none_as_null` so an upsert clears the ids of other providers.
#[derive(Debug, Clone, Insertable, AsChangeset)]
#[diesel(table_name = crate::schema::subscriptions)]
#[diesel(treat_none_as_null = true)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct SubscriptionRow {
    pub user_id: Uuid,
    pub plan_type: PlanType,
    pub billing_interval: BillingInterval,
    pub status: SubscriptionStatus,
    pub provider: PaymentProvider,
    pub stripe_subscription_id: Option<String>,
    pub paypal_subscription_id: Option<String>,
    pub crypto_charge_id: Option<String>,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

/// Period bounds reported by a provider alongside a status change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BillingPeriod {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}
