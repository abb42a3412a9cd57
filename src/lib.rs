//! Gallery billing - payment reconciliation for the gallery web app
//!
//! Stripe, PayPal and Coinbase Commerce payments are reconciled into one
//! subscription row per user and one purchase row per provider session,
//! whether they arrive by webhook or by the client's activate call.

pub mod actions;
pub mod auth;
pub mod billing_store;
pub mod coinbase_client;
pub mod images;
pub mod images_repo;
#[cfg(any(test, feature = "test-support"))]
pub mod memory_store;
pub mod metrics;
pub mod payment_events;
pub mod paypal_client;
pub mod plans;
pub mod provider_error;
pub mod purchases;
pub mod purchases_repo;
pub mod reconciliation;
pub mod schema;
pub mod stripe_client;
pub mod subscriptions;
pub mod subscriptions_repo;
pub mod web;
pub mod webhook_events;
pub mod webhook_events_repo;

use diesel_migrations::{EmbeddedMigrations, embed_migrations};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

pub use billing_store::{BillingStore, PgBillingStore};
pub use payment_events::PaymentEvent;
pub use reconciliation::{ReconcileError, ReconcileOutcome, reconcile};
pub use web::{AppState, PgPool};
