use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use diesel::PgConnection;
use diesel::r2d2::{ConnectionManager, Pool};
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use gallery_billing::PgPool;

mod commands;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[derive(Parser)]
#[command(name = "gallery-billing")]
#[command(about = "Payment reconciliation service for the gallery app")]
struct Cli {
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// Maximum database connections in the pool
    #[arg(long, env = "DB_POOL_SIZE", default_value_t = 10)]
    pool_size: u32,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the billing API
    Serve {
        #[arg(long, env = "WEB_INTERFACE", default_value = "0.0.0.0")]
        interface: String,

        #[arg(long, env = "WEB_PORT", default_value_t = 8080)]
        port: u16,

        /// Port for the Prometheus metrics endpoint
        #[arg(long, env = "METRICS_PORT", default_value_t = 9090)]
        metrics_port: u16,

        /// Public origin of the web app, used for provider return URLs
        #[arg(long, env = "BASE_URL", default_value = "http://localhost:5173")]
        base_url: String,
    },
    /// Apply pending database migrations and exit
    Migrate,
    /// Mark crypto subscriptions whose paid period has ended as expired
    ExpireSubscriptions,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_tracing::layer())
        .init();
}

fn init_sentry() -> Option<sentry::ClientInitGuard> {
    let dsn = std::env::var("SENTRY_DSN").ok().filter(|dsn| !dsn.is_empty())?;
    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            environment: std::env::var("SENTRY_ENVIRONMENT").ok().map(Into::into),
            attach_stacktrace: true,
            ..Default::default()
        },
    )))
}

fn create_pool(database_url: &str, pool_size: u32) -> Result<PgPool> {
    let manager = ConnectionManager::<PgConnection>::new(database_url);
    Pool::builder()
        .max_size(pool_size)
        .build(manager)
        .context("Failed to create database connection pool")
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Keep the guard alive so queued events are flushed on exit
    let _sentry = init_sentry();
    init_tracing();

    let cli = Cli::parse();
    let pool = create_pool(&cli.database_url, cli.pool_size)?;
    info!(pool_size = cli.pool_size, "Connected to database");

    match cli.command {
        Commands::Serve {
            interface,
            port,
            metrics_port,
            base_url,
        } => commands::handle_serve(pool, interface, port, metrics_port, base_url).await,
        Commands::Migrate => commands::handle_migrate(pool).await,
        Commands::ExpireSubscriptions => commands::handle_expire_subscriptions(pool).await,
    }
}
