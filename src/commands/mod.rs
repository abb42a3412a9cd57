pub mod expire_subscriptions;
pub mod migrate;
pub mod serve;

pub use expire_subscriptions::handle_expire_subscriptions;
pub use migrate::{handle_migrate, run_migrations};
pub use serve::handle_serve;
