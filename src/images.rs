use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Uploaded asset metadata. The bytes live in object storage at `storage_path`.
#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::images)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Image {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub title: String,
    pub storage_path: String,
    pub width: i32,
    pub height: i32,
    pub mime_type: String,
    pub price_cents: i32,
    pub created_at: DateTime<Utc>,
}

impl Image {
    /// Images priced at zero are free to download and cannot be bought
    pub fn is_for_sale(&self) -> bool {
        self.price_cents > 0
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::images)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct NewImage {
    pub owner_id: Uuid,
    pub title: String,
    pub storage_path: String,
    pub width: i32,
    pub height: i32,
    pub mime_type: String,
    pub price_cents: i32,
}
