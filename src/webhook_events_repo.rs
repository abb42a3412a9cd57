use anyhow::Result;
use diesel::prelude::*;

use crate::schema::payment_webhook_events;
use crate::subscriptions::PaymentProvider;
use crate::webhook_events::{NewWebhookEvent, WebhookEventModel};
use crate::web::PgPool;

#[derive(Clone)]
pub struct WebhookEventsRepository {
    pool: PgPool,
}

impl WebhookEventsRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Check if an event has already been processed (idempotency)
    pub async fn is_processed(&self, provider: PaymentProvider, event_id: &str) -> Result<bool> {
        use payment_webhook_events::dsl;

        let pool = self.pool.clone();
        let event_id = event_id.to_string();
        let result = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;

            let exists: bool = diesel::select(diesel::dsl::exists(
                dsl::payment_webhook_events
                    .filter(dsl::provider.eq(provider))
                    .filter(dsl::event_id.eq(&event_id))
                    .filter(dsl::processed.eq(true)),
            ))
            .get_result(&mut conn)?;

            Ok::<bool, anyhow::Error>(exists)
        })
        .await??;

        Ok(result)
    }

    /// Record a new webhook event. Returns None if the delivery was already recorded.
    pub async fn create(&self, new_event: NewWebhookEvent) -> Result<Option<WebhookEventModel>> {
        use payment_webhook_events::dsl;

        let pool = self.pool.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;

            let inserted: Option<WebhookEventModel> =
                diesel::insert_into(dsl::payment_webhook_events)
                    .values(&new_event)
                    .on_conflict((dsl::provider, dsl::event_id))
                    .do_nothing()
                    .returning(WebhookEventModel::as_returning())
                    .get_result(&mut conn)
                    .optional()?;

            Ok::<Option<WebhookEventModel>, anyhow::Error>(inserted)
        })
        .await??;

        Ok(result)
    }

    /// Mark an event as processed
    pub async fn mark_processed(&self, provider: PaymentProvider, event_id: &str) -> Result<()> {
        use payment_webhook_events::dsl;

        let pool = self.pool.clone();
        let event_id = event_id.to_string();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;

            diesel::update(dsl::payment_webhook_events)
                .filter(dsl::provider.eq(provider))
                .filter(dsl::event_id.eq(&event_id))
                .set((
                    dsl::processed.eq(true),
                    dsl::processing_error.eq(None::<String>),
                ))
                .execute(&mut conn)?;

            Ok::<(), anyhow::Error>(())
        })
        .await??;

        Ok(())
    }

    /// Record a processing failure. The event stays unprocessed so a redelivery is retried.
    pub async fn mark_failed(
        &self,
        provider: PaymentProvider,
        event_id: &str,
        error: &str,
    ) -> Result<()> {
        use payment_webhook_events::dsl;

        let pool = self.pool.clone();
        let event_id = event_id.to_string();
        let error = error.to_string();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;

            diesel::update(dsl::payment_webhook_events)
                .filter(dsl::provider.eq(provider))
                .filter(dsl::event_id.eq(&event_id))
                .set(dsl::processing_error.eq(Some(&error)))
                .execute(&mut conn)?;

            Ok::<(), anyhow::Error>(())
        })
        .await??;

        Ok(())
    }
}
