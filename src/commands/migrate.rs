use anyhow::{Context, Result};
use diesel_migrations::MigrationHarness;
use gallery_billing::{MIGRATIONS, PgPool};
use tracing::info;

/// Apply pending migrations on a pooled connection
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || {
        let mut conn = pool.get().context("Failed to get database connection")?;
        let applied = conn
            .run_pending_migrations(MIGRATIONS)
            .map_err(|e| anyhow::anyhow!("Failed to run migrations: {}", e))?;
        for version in &applied {
            info!(version = %version, "Applied migration");
        }
        if applied.is_empty() {
            info!("Database schema is up to date");
        }
        Ok(())
    })
    .await?
}

pub async fn handle_migrate(pool: PgPool) -> Result<()> {
    sentry::configure_scope(|scope| {
        scope.set_tag("operation", "migrate");
    });
    run_migrations(&pool).await
}
