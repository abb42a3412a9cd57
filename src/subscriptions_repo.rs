use anyhow::Result;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use uuid::Uuid;

use crate::schema::subscriptions;
use crate::subscriptions::{
    BillingPeriod, ExternalSubscriptionId, NewSubscription, PaymentProvider, Subscription,
    SubscriptionModel, SubscriptionStatus,
};
use crate::web::PgPool;

#[derive(Clone)]
pub struct SubscriptionsRepository {
    pool: PgPool,
}

fn find_by_external_id(
    conn: &mut PgConnection,
    external_id: &ExternalSubscriptionId,
) -> QueryResult<Option<SubscriptionModel>> {
    let mut query = subscriptions::table
        .select(SubscriptionModel::as_select())
        .into_boxed();
    query = match external_id {
        ExternalSubscriptionId::Stripe(id) => {
            query.filter(subscriptions::stripe_subscription_id.eq(id.clone()))
        }
        ExternalSubscriptionId::PayPal(id) => {
            query.filter(subscriptions::paypal_subscription_id.eq(id.clone()))
        }
        ExternalSubscriptionId::Crypto(id) => {
            query.filter(subscriptions::crypto_charge_id.eq(id.clone()))
        }
    };
    query.first::<SubscriptionModel>(conn).optional()
}

impl SubscriptionsRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert or overwrite the user's single subscription row (ON CONFLICT (user_id))
    pub async fn upsert(&self, new_subscription: NewSubscription) -> Result<Subscription> {
        let pool = self.pool.clone();
        let row = new_subscription.to_row();
        let model = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;

            let model: SubscriptionModel = diesel::insert_into(subscriptions::table)
                .values(&row)
                .on_conflict(subscriptions::user_id)
                .do_update()
                .set((&row, subscriptions::updated_at.eq(diesel::dsl::now)))
                .returning(SubscriptionModel::as_returning())
                .get_result(&mut conn)?;

            Ok::<SubscriptionModel, anyhow::Error>(model)
        })
        .await??;

        model.try_into()
    }

    /// Get the subscription row for a user
    pub async fn get_by_user_id(&self, user_id: Uuid) -> Result<Option<Subscription>> {
        let pool = self.pool.clone();
        let model = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;

            let model: Option<SubscriptionModel> = subscriptions::table
                .filter(subscriptions::user_id.eq(user_id))
                .select(SubscriptionModel::as_select())
                .first(&mut conn)
                .optional()?;

            Ok::<Option<SubscriptionModel>, anyhow::Error>(model)
        })
        .await??;

        model.map(Subscription::try_from).transpose()
    }

    /// Get a subscription by its provider-side id
    pub async fn get_by_external_id(
        &self,
        external_id: &ExternalSubscriptionId,
    ) -> Result<Option<Subscription>> {
        let pool = self.pool.clone();
        let external_id = external_id.clone();
        let model = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            let model = find_by_external_id(&mut conn, &external_id)?;
            Ok::<Option<SubscriptionModel>, anyhow::Error>(model)
        })
        .await??;

        model.map(Subscription::try_from).transpose()
    }

    /// Apply a provider-reported status change. Returns None when no row carries the id.
    pub async fn update_status_by_external_id(
        &self,
        external_id: &ExternalSubscriptionId,
        status: SubscriptionStatus,
        period: Option<BillingPeriod>,
        now: DateTime<Utc>,
    ) -> Result<Option<Subscription>> {
        let pool = self.pool.clone();
        let external_id = external_id.clone();
        let model = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;

            let updated = conn.transaction::<_, diesel::result::Error, _>(|conn| {
                let Some(existing) = find_by_external_id(conn, &external_id)? else {
                    return Ok(None);
                };

                let cancelled_at = if status == SubscriptionStatus::Cancelled {
                    existing.cancelled_at.or(Some(now))
                } else {
                    None
                };
                let (period_start, period_end) = match period {
                    Some(p) => (p.start, p.end),
                    None => (existing.current_period_start, existing.current_period_end),
                };

                diesel::update(subscriptions::table.find(existing.id))
                    .set((
                        subscriptions::status.eq(status),
                        subscriptions::current_period_start.eq(period_start),
                        subscriptions::current_period_end.eq(period_end),
                        subscriptions::cancelled_at.eq(cancelled_at),
                        subscriptions::updated_at.eq(now),
                    ))
                    .returning(SubscriptionModel::as_returning())
                    .get_result(conn)
                    .optional()
            })?;

            Ok::<Option<SubscriptionModel>, anyhow::Error>(updated)
        })
        .await??;

        model.map(Subscription::try_from).transpose()
    }

    /// Mark the user's subscription cancelled. Purchases are not touched.
    pub async fn cancel_for_user(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Subscription>> {
        let pool = self.pool.clone();
        let model = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;

            let updated: Option<SubscriptionModel> = diesel::update(subscriptions::table)
                .filter(subscriptions::user_id.eq(user_id))
                .set((
                    subscriptions::status.eq(SubscriptionStatus::Cancelled),
                    subscriptions::cancelled_at.eq(Some(now)),
                    subscriptions::updated_at.eq(now),
                ))
                .returning(SubscriptionModel::as_returning())
                .get_result(&mut conn)
                .optional()?;

            Ok::<Option<SubscriptionModel>, anyhow::Error>(updated)
        })
        .await??;

        model.map(Subscription::try_from).transpose()
    }

    /// Mark live rows of `provider` whose period ended before `now` as expired
    pub async fn expire_lapsed(&self, provider: PaymentProvider, now: DateTime<Utc>) -> Result<usize> {
        let pool = self.pool.clone();
        let count = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;

            let count = diesel::update(subscriptions::table)
                .filter(subscriptions::provider.eq(provider))
                .filter(
                    subscriptions::status
                        .eq_any(vec![SubscriptionStatus::Active, SubscriptionStatus::PastDue]),
                )
                .filter(subscriptions::current_period_end.lt(now))
                .set((
                    subscriptions::status.eq(SubscriptionStatus::Expired),
                    subscriptions::updated_at.eq(now),
                ))
                .execute(&mut conn)?;

            Ok::<usize, anyhow::Error>(count)
        })
        .await??;

        Ok(count)
    }
}
