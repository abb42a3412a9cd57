use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::subscriptions::PaymentProvider;

/// Diesel model for the purchases table, also used as the API model
#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::purchases)]
#[diesel(check_for_backend(diesel::pg::Pg))]
#[serde(rename_all = "camelCase")]
pub struct Purchase {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub image_id: Uuid,
    pub provider: PaymentProvider,
    /// Stripe checkout session id, PayPal order id or Coinbase charge id
    pub provider_session_id: String,
    pub amount_cents: i32,
    pub currency: String,
    pub created_at: DateTime<Utc>,
}

/// Insert model for completed one-time purchases
#[derive(Debug, Clone, PartialEq, Insertable)]
#[diesel(table_name = crate::schema::purchases)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct NewPurchase {
    pub user_id: Option<Uuid>,
    pub image_id: Uuid,
    pub provider: PaymentProvider,
    pub provider_session_id: String,
    pub amount_cents: i32,
    pub currency: String,
}

/// Result of recording a purchase completion
#[derive(Debug, Clone, PartialEq)]
pub enum PurchaseRecord {
    Created(Purchase),
    /// A row for the same provider session id already existed
    AlreadyRecorded(Purchase),
}

impl PurchaseRecord {
    pub fn purchase(&self) -> &Purchase {
        match self {
            PurchaseRecord::Created(p) | PurchaseRecord::AlreadyRecorded(p) => p,
        }
    }

    pub fn into_purchase(self) -> Purchase {
        match self {
            PurchaseRecord::Created(p) | PurchaseRecord::AlreadyRecorded(p) => p,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, PurchaseRecord::Created(_))
    }
}
