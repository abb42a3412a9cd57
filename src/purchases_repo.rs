use anyhow::{Context, Result};
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use tracing::warn;
use uuid::Uuid;

use crate::purchases::{NewPurchase, Purchase, PurchaseRecord};
use crate::schema::purchases;
use crate::web::PgPool;

#[derive(Clone)]
pub struct PurchasesRepository {
    pool: PgPool,
}

impl PurchasesRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a completed purchase. A unique violation on `provider_session_id`
    /// means another delivery got there first; the existing row is returned instead.
    pub async fn record(&self, new_purchase: NewPurchase) -> Result<PurchaseRecord> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> Result<PurchaseRecord> {
            let mut conn = pool.get()?;

            let inserted = diesel::insert_into(purchases::table)
                .values(&new_purchase)
                .returning(Purchase::as_returning())
                .get_result::<Purchase>(&mut conn);

            match inserted {
                Ok(purchase) => Ok(PurchaseRecord::Created(purchase)),
                Err(DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _)) => {
                    warn!(
                        provider = %new_purchase.provider,
                        session_id = %new_purchase.provider_session_id,
                        "Purchase already recorded by a concurrent delivery, refetching"
                    );
                    let existing = purchases::table
                        .filter(
                            purchases::provider_session_id.eq(&new_purchase.provider_session_id),
                        )
                        .select(Purchase::as_select())
                        .first::<Purchase>(&mut conn)
                        .with_context(|| {
                            format!(
                                "Purchase {} vanished after unique violation",
                                new_purchase.provider_session_id
                            )
                        })?;
                    Ok(PurchaseRecord::AlreadyRecorded(existing))
                }
                Err(e) => Err(e).with_context(|| {
                    format!(
                        "Failed to record purchase {}",
                        new_purchase.provider_session_id
                    )
                }),
            }
        })
        .await?
    }

    /// Get purchases for a specific user, newest first
    pub async fn get_by_user_id(&self, user_id: Uuid) -> Result<Vec<Purchase>> {
        let pool = self.pool.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;

            let purchases: Vec<Purchase> = purchases::table
                .filter(purchases::user_id.eq(user_id))
                .order_by(purchases::created_at.desc())
                .select(Purchase::as_select())
                .load(&mut conn)?;

            Ok::<Vec<Purchase>, anyhow::Error>(purchases)
        })
        .await??;

        Ok(result)
    }

    /// Whether the user holds a license for the image
    pub async fn has_purchased(&self, user_id: Uuid, image_id: Uuid) -> Result<bool> {
        let pool = self.pool.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;

            let exists: bool = diesel::select(diesel::dsl::exists(
                purchases::table
                    .filter(purchases::user_id.eq(user_id))
                    .filter(purchases::image_id.eq(image_id)),
            ))
            .get_result(&mut conn)?;

            Ok::<bool, anyhow::Error>(exists)
        })
        .await??;

        Ok(result)
    }
}
