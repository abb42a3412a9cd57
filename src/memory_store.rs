//! In-memory [`BillingStore`] with the same uniqueness rules as the Postgres
//! tables. Used by unit and integration tests.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

use crate::billing_store::BillingStore;
use crate::images::{Image, NewImage};
use crate::purchases::{NewPurchase, Purchase, PurchaseRecord};
use crate::subscriptions::{
    BillingPeriod, ExternalSubscriptionId, NewSubscription, PaymentProvider, Subscription,
    SubscriptionStatus,
};
use crate::webhook_events::NewWebhookEvent;

#[derive(Debug, Clone)]
pub struct StoredWebhookEvent {
    pub event: NewWebhookEvent,
    pub processed: bool,
    pub processing_error: Option<String>,
}

#[derive(Default)]
struct Tables {
    images: Vec<Image>,
    subscriptions: HashMap<Uuid, Subscription>,
    purchases: Vec<Purchase>,
    webhook_events: HashMap<(PaymentProvider, String), StoredWebhookEvent>,
}

#[derive(Default)]
pub struct MemoryBillingStore {
    tables: Mutex<Tables>,
    /// When set, subscription and purchase writes fail like a lost connection
    fail_writes: AtomicBool,
}

impl MemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            anyhow::bail!("memory store writes are disabled");
        }
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store lock poisoned"))
    }

    pub fn subscription_count(&self) -> usize {
        self.lock().map(|t| t.subscriptions.len()).unwrap_or_default()
    }

    pub fn purchase_count(&self) -> usize {
        self.lock().map(|t| t.purchases.len()).unwrap_or_default()
    }

    pub fn all_purchases(&self) -> Vec<Purchase> {
        self.lock().map(|t| t.purchases.clone()).unwrap_or_default()
    }

    pub fn webhook_event(
        &self,
        provider: PaymentProvider,
        event_id: &str,
    ) -> Option<StoredWebhookEvent> {
        self.lock()
            .ok()?
            .webhook_events
            .get(&(provider, event_id.to_string()))
            .cloned()
    }

    /// Overwrite a row directly, bypassing activation rules
    pub fn insert_subscription(&self, subscription: Subscription) {
        if let Ok(mut tables) = self.lock() {
            tables
                .subscriptions
                .insert(subscription.user_id, subscription);
        }
    }
}

#[async_trait]
impl BillingStore for MemoryBillingStore {
    async fn upsert_subscription(&self, new: NewSubscription) -> Result<Subscription> {
        self.check_writable()?;
        let mut tables = self.lock()?;
        let now = Utc::now();
        if let Some(other) = tables
            .subscriptions
            .values()
            .find(|s| s.external_id == new.external_id && s.user_id != new.user_id)
        {
            anyhow::bail!(
                "duplicate key: {} is already held by user {}",
                new.external_id.id(),
                other.user_id
            );
        }
        let existing = tables.subscriptions.get(&new.user_id).cloned();
        let subscription = Subscription {
            id: existing.as_ref().map(|s| s.id).unwrap_or_else(Uuid::new_v4),
            user_id: new.user_id,
            plan_type: new.plan.plan_type,
            billing_interval: new.plan.billing_interval,
            status: SubscriptionStatus::Active,
            external_id: new.external_id,
            current_period_start: new.current_period_start,
            current_period_end: new.current_period_end,
            cancelled_at: None,
            created_at: existing.as_ref().map(|s| s.created_at).unwrap_or(now),
            updated_at: now,
        };
        tables
            .subscriptions
            .insert(subscription.user_id, subscription.clone());
        Ok(subscription)
    }

    async fn subscription_for_user(&self, user_id: Uuid) -> Result<Option<Subscription>> {
        Ok(self.lock()?.subscriptions.get(&user_id).cloned())
    }

    async fn subscription_by_external_id(
        &self,
        external_id: &ExternalSubscriptionId,
    ) -> Result<Option<Subscription>> {
        Ok(self
            .lock()?
            .subscriptions
            .values()
            .find(|s| &s.external_id == external_id)
            .cloned())
    }

    async fn update_subscription_status(
        &self,
        external_id: &ExternalSubscriptionId,
        status: SubscriptionStatus,
        period: Option<BillingPeriod>,
        now: DateTime<Utc>,
    ) -> Result<Option<Subscription>> {
        let mut tables = self.lock()?;
        let Some(subscription) = tables
            .subscriptions
            .values_mut()
            .find(|s| &s.external_id == external_id)
        else {
            return Ok(None);
        };

        subscription.cancelled_at = if status == SubscriptionStatus::Cancelled {
            subscription.cancelled_at.or(Some(now))
        } else {
            None
        };
        subscription.status = status;
        if let Some(period) = period {
            subscription.current_period_start = period.start;
            subscription.current_period_end = period.end;
        }
        subscription.updated_at = now;
        Ok(Some(subscription.clone()))
    }

    async fn cancel_subscription(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Subscription>> {
        let mut tables = self.lock()?;
        Ok(tables.subscriptions.get_mut(&user_id).map(|subscription| {
            subscription.status = SubscriptionStatus::Cancelled;
            subscription.cancelled_at = Some(now);
            subscription.updated_at = now;
            subscription.clone()
        }))
    }

    async fn expire_lapsed_subscriptions(
        &self,
        provider: PaymentProvider,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let mut tables = self.lock()?;
        let mut count = 0;
        for subscription in tables.subscriptions.values_mut() {
            if subscription.provider() == provider && subscription.is_lapsed(now) {
                subscription.status = SubscriptionStatus::Expired;
                subscription.updated_at = now;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn record_purchase(&self, new: NewPurchase) -> Result<PurchaseRecord> {
        self.check_writable()?;
        let mut tables = self.lock()?;
        if let Some(existing) = tables
            .purchases
            .iter()
            .find(|p| p.provider_session_id == new.provider_session_id)
        {
            return Ok(PurchaseRecord::AlreadyRecorded(existing.clone()));
        }

        let purchase = Purchase {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            image_id: new.image_id,
            provider: new.provider,
            provider_session_id: new.provider_session_id,
            amount_cents: new.amount_cents,
            currency: new.currency,
            created_at: Utc::now(),
        };
        tables.purchases.push(purchase.clone());
        Ok(PurchaseRecord::Created(purchase))
    }

    async fn purchases_for_user(&self, user_id: Uuid) -> Result<Vec<Purchase>> {
        let mut purchases: Vec<Purchase> = self
            .lock()?
            .purchases
            .iter()
            .filter(|p| p.user_id == Some(user_id))
            .cloned()
            .collect();
        purchases.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(purchases)
    }

    async fn has_purchased(&self, user_id: Uuid, image_id: Uuid) -> Result<bool> {
        Ok(self
            .lock()?
            .purchases
            .iter()
            .any(|p| p.user_id == Some(user_id) && p.image_id == image_id))
    }

    async fn image(&self, image_id: Uuid) -> Result<Option<Image>> {
        Ok(self.lock()?.images.iter().find(|i| i.id == image_id).cloned())
    }

    async fn list_images(&self, page: i64, per_page: i64) -> Result<(Vec<Image>, i64)> {
        let tables = self.lock()?;
        let mut images = tables.images.clone();
        images.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let total = images.len() as i64;
        let offset = (page - 1).max(0).saturating_mul(per_page);
        let skip = usize::try_from(offset).unwrap_or(usize::MAX);
        let take = usize::try_from(per_page).unwrap_or_default();
        Ok((images.into_iter().skip(skip).take(take).collect(), total))
    }

    async fn create_image(&self, new: NewImage) -> Result<Option<Image>> {
        let mut tables = self.lock()?;
        if tables
            .images
            .iter()
            .any(|i| i.storage_path == new.storage_path)
        {
            return Ok(None);
        }
        let image = Image {
            id: Uuid::new_v4(),
            owner_id: new.owner_id,
            title: new.title,
            storage_path: new.storage_path,
            width: new.width,
            height: new.height,
            mime_type: new.mime_type,
            price_cents: new.price_cents,
            created_at: Utc::now(),
        };
        tables.images.push(image.clone());
        Ok(Some(image))
    }

    async fn record_webhook_event(&self, event: NewWebhookEvent) -> Result<bool> {
        let mut tables = self.lock()?;
        let key = (event.provider, event.event_id.clone());
        if tables.webhook_events.contains_key(&key) {
            return Ok(false);
        }
        tables.webhook_events.insert(
            key,
            StoredWebhookEvent {
                event,
                processed: false,
                processing_error: None,
            },
        );
        Ok(true)
    }

    async fn is_webhook_processed(
        &self,
        provider: PaymentProvider,
        event_id: &str,
    ) -> Result<bool> {
        Ok(self
            .lock()?
            .webhook_events
            .get(&(provider, event_id.to_string()))
            .is_some_and(|e| e.processed))
    }

    async fn mark_webhook_processed(
        &self,
        provider: PaymentProvider,
        event_id: &str,
    ) -> Result<()> {
        if let Some(event) = self
            .lock()?
            .webhook_events
            .get_mut(&(provider, event_id.to_string()))
        {
            event.processed = true;
            event.processing_error = None;
        }
        Ok(())
    }

    async fn mark_webhook_failed(
        &self,
        provider: PaymentProvider,
        event_id: &str,
        error: &str,
    ) -> Result<()> {
        if let Some(event) = self
            .lock()?
            .webhook_events
            .get_mut(&(provider, event_id.to_string()))
        {
            event.processing_error = Some(error.to_string());
        }
        Ok(())
    }
}
