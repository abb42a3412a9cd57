use anyhow::Result;
use chrono::Utc;
use gallery_billing::reconciliation::expire_crypto_subscriptions;
use gallery_billing::{PgBillingStore, PgPool};
use tracing::info;

/// One sweep over crypto subscriptions. Meant to run from cron.
pub async fn handle_expire_subscriptions(pool: PgPool) -> Result<()> {
    sentry::configure_scope(|scope| {
        scope.set_tag("operation", "expire-subscriptions");
    });

    let store = PgBillingStore::new(pool);
    let expired = expire_crypto_subscriptions(&store, Utc::now()).await?;
    info!(expired, "Subscription expiry sweep finished");
    Ok(())
}
