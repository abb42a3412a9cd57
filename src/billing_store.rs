use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::images::{Image, NewImage};
use crate::images_repo::ImagesRepository;
use crate::purchases::{NewPurchase, Purchase, PurchaseRecord};
use crate::purchases_repo::PurchasesRepository;
use crate::subscriptions::{
    BillingPeriod, ExternalSubscriptionId, NewSubscription, PaymentProvider, Subscription,
    SubscriptionStatus,
};
use crate::subscriptions_repo::SubscriptionsRepository;
use crate::web::PgPool;
use crate::webhook_events::NewWebhookEvent;
use crate::webhook_events_repo::WebhookEventsRepository;

/// Persistence used by reconciliation and the billing endpoints.
///
/// Every write is idempotent: subscriptions are keyed by user, purchases by
/// provider session id and webhook deliveries by (provider, event id). Image
/// metadata lives here too, since purchases are priced from it.
#[async_trait]
pub trait BillingStore: Send + Sync {
    /// Insert or overwrite the user's single subscription row
    async fn upsert_subscription(&self, subscription: NewSubscription) -> Result<Subscription>;

    async fn subscription_for_user(&self, user_id: Uuid) -> Result<Option<Subscription>>;

    async fn subscription_by_external_id(
        &self,
        external_id: &ExternalSubscriptionId,
    ) -> Result<Option<Subscription>>;

    /// Returns None when no row carries `external_id`
    async fn update_subscription_status(
        &self,
        external_id: &ExternalSubscriptionId,
        status: SubscriptionStatus,
        period: Option<BillingPeriod>,
        now: DateTime<Utc>,
    ) -> Result<Option<Subscription>>;

    async fn cancel_subscription(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Subscription>>;

    async fn expire_lapsed_subscriptions(
        &self,
        provider: PaymentProvider,
        now: DateTime<Utc>,
    ) -> Result<usize>;

    /// Record a completed purchase, returning the existing row on a repeat
    async fn record_purchase(&self, purchase: NewPurchase) -> Result<PurchaseRecord>;

    async fn purchases_for_user(&self, user_id: Uuid) -> Result<Vec<Purchase>>;

    async fn has_purchased(&self, user_id: Uuid, image_id: Uuid) -> Result<bool>;

    async fn image(&self, image_id: Uuid) -> Result<Option<Image>>;

    /// Newest first, with the total row count. `page` starts at 1.
    async fn list_images(&self, page: i64, per_page: i64) -> Result<(Vec<Image>, i64)>;

    /// Returns None when an image already uses the storage path
    async fn create_image(&self, image: NewImage) -> Result<Option<Image>>;

    /// Record a webhook delivery. Returns false if it was already recorded.
    async fn record_webhook_event(&self, event: NewWebhookEvent) -> Result<bool>;

    async fn is_webhook_processed(&self, provider: PaymentProvider, event_id: &str)
    -> Result<bool>;

    async fn mark_webhook_processed(&self, provider: PaymentProvider, event_id: &str)
    -> Result<()>;

    async fn mark_webhook_failed(
        &self,
        provider: PaymentProvider,
        event_id: &str,
        error: &str,
    ) -> Result<()>;
}

/// Postgres-backed store built from the diesel repositories
#[derive(Clone)]
pub struct PgBillingStore {
    images: ImagesRepository,
    subscriptions: SubscriptionsRepository,
    purchases: PurchasesRepository,
    webhook_events: WebhookEventsRepository,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            images: ImagesRepository::new(pool.clone()),
            subscriptions: SubscriptionsRepository::new(pool.clone()),
            purchases: PurchasesRepository::new(pool.clone()),
            webhook_events: WebhookEventsRepository::new(pool),
        }
    }
}

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn upsert_subscription(&self, subscription: NewSubscription) -> Result<Subscription> {
        self.subscriptions.upsert(subscription).await
    }

    async fn subscription_for_user(&self, user_id: Uuid) -> Result<Option<Subscription>> {
        self.subscriptions.get_by_user_id(user_id).await
    }

    async fn subscription_by_external_id(
        &self,
        external_id: &ExternalSubscriptionId,
    ) -> Result<Option<Subscription>> {
        self.subscriptions.get_by_external_id(external_id).await
    }

    async fn update_subscription_status(
        &self,
        external_id: &ExternalSubscriptionId,
        status: SubscriptionStatus,
        period: Option<BillingPeriod>,
        now: DateTime<Utc>,
    ) -> Result<Option<Subscription>> {
        self.subscriptions
            .update_status_by_external_id(external_id, status, period, now)
            .await
    }

    async fn cancel_subscription(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Subscription>> {
        self.subscriptions.cancel_for_user(user_id, now).await
    }

    async fn expire_lapsed_subscriptions(
        &self,
        provider: PaymentProvider,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        self.subscriptions.expire_lapsed(provider, now).await
    }

    async fn record_purchase(&self, purchase: NewPurchase) -> Result<PurchaseRecord> {
        self.purchases.record(purchase).await
    }

    async fn purchases_for_user(&self, user_id: Uuid) -> Result<Vec<Purchase>> {
        self.purchases.get_by_user_id(user_id).await
    }

    async fn has_purchased(&self, user_id: Uuid, image_id: Uuid) -> Result<bool> {
        self.purchases.has_purchased(user_id, image_id).await
    }

    async fn image(&self, image_id: Uuid) -> Result<Option<Image>> {
        self.images.get_by_id(image_id).await
    }

    async fn list_images(&self, page: i64, per_page: i64) -> Result<(Vec<Image>, i64)> {
        self.images.list_paginated(page, per_page).await
    }

    async fn create_image(&self, image: NewImage) -> Result<Option<Image>> {
        self.images.create(image).await
    }

    async fn record_webhook_event(&self, event: NewWebhookEvent) -> Result<bool> {
        Ok(self.webhook_events.create(event).await?.is_some())
    }

    async fn is_webhook_processed(
        &self,
        provider: PaymentProvider,
        event_id: &str,
    ) -> Result<bool> {
        self.webhook_events.is_processed(provider, event_id).await
    }

    async fn mark_webhook_processed(
        &self,
        provider: PaymentProvider,
        event_id: &str,
    ) -> Result<()> {
        self.webhook_events.mark_processed(provider, event_id).await
    }

    async fn mark_webhook_failed(
        &self,
        provider: PaymentProvider,
        event_id: &str,
        error: &str,
    ) -> Result<()> {
        self.webhook_events
            .mark_failed(provider, event_id, error)
            .await
    }
}
