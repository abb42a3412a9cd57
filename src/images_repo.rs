use anyhow::Result;
use diesel::prelude::*;
use uuid::Uuid;

use crate::images::{Image, NewImage};
use crate::schema::images;
use crate::web::PgPool;

#[derive(Clone)]
pub struct ImagesRepository {
    pool: PgPool,
}

impl ImagesRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get an image by ID
    pub async fn get_by_id(&self, image_id: Uuid) -> Result<Option<Image>> {
        let pool = self.pool.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;

            let image: Option<Image> = images::table
                .find(image_id)
                .select(Image::as_select())
                .first(&mut conn)
                .optional()?;

            Ok::<Option<Image>, anyhow::Error>(image)
        })
        .await??;

        Ok(result)
    }

    /// List images newest first. Returns the page and the total row count.
    pub async fn list_paginated(&self, page: i64, per_page: i64) -> Result<(Vec<Image>, i64)> {
        let pool = self.pool.clone();
        let offset = (page - 1).max(0).saturating_mul(per_page);
        let result = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;

            let total_count: i64 = images::table.count().get_result(&mut conn)?;
            let page: Vec<Image> = images::table
                .order_by(images::created_at.desc())
                .limit(per_page)
                .offset(offset)
                .select(Image::as_select())
                .load(&mut conn)?;

            Ok::<(Vec<Image>, i64), anyhow::Error>((page, total_count))
        })
        .await??;

        Ok(result)
    }

    /// Record metadata for an uploaded image. None if the storage path is taken.
    pub async fn create(&self, new_image: NewImage) -> Result<Option<Image>> {
        let pool = self.pool.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;

            let inserted: Option<Image> = diesel::insert_into(images::table)
                .values(&new_image)
                .on_conflict(images::storage_path)
                .do_nothing()
                .returning(Image::as_returning())
                .get_result(&mut conn)
                .optional()?;

            Ok::<Option<Image>, anyhow::Error>(inserted)
        })
        .await??;

        Ok(result)
    }
}
