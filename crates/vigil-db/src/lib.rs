//! Persistence layer for the Vigil engine.
//!
//! Provides SQLite connection pooling (via `r2d2`), WAL-mode initialization
//! and the embedded migrations that create the engine's bookkeeping tables:
//! observers, subscribers and their links, the table dependency index, the
//! last-known snapshot of every observer, and evaluation leases.
//!
//! All engine tables are prefixed with `vigil_` so that change capture can
//! tell bookkeeping writes apart from application writes. The application
//! tables the observers read live in the same database file.

mod migrations;
mod pool;

pub use migrations::{run_migrations, MigrationError};
pub use pool::{configure_connection, create_pool, DbPool, DbRuntimeSettings, PoolError};

/// The tables created by [`run_migrations`], in dependency order.
pub const ENGINE_TABLES: &[&str] = &[
    "vigil_observers",
    "vigil_subscribers",
    "vigil_subscriptions",
    "vigil_dependencies",
    "vigil_items",
    "vigil_leases",
];
