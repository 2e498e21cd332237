//! Vigil server binary.
//!
//! Starts the engine and an axum HTTP server with structured logging and
//! graceful shutdown on SIGTERM/SIGINT.
//!
//! Usage:
//!
//! ```text
//! vigil-server [config.toml]
//! vigil-server clear-observers [config.toml]
//! ```

use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use vigil_server::config::{self, Config};
use vigil_server::{app, AppState};

/// Subcommand that deletes every observer and subscriber, then exits.
const CLEAR_OBSERVERS: &str = "clear-observers";

fn resolve_config_path(args: &[String]) -> (Option<String>, &'static str) {
    if let Some(path) = args.first().filter(|value| !value.trim().is_empty()) {
        return (Some(path.clone()), "cli-arg");
    }

    if let Ok(path) = std::env::var("VIGIL_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return (Some(path), "env-var");
        }
    }

    (None, "default")
}

fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn open_database(config: &Config) -> vigil_db::DbPool {
    let pool = vigil_db::create_pool(
        &config.database.path,
        vigil_db::DbRuntimeSettings {
            busy_timeout_ms: config.database.busy_timeout_ms,
            pool_max_size: config.database.pool_max_size,
            ..vigil_db::DbRuntimeSettings::default()
        },
    )
    .expect("failed to create database pool — check database.path in config");

    {
        let conn = pool
            .get()
            .expect("failed to get database connection for migrations");
        let applied = vigil_db::run_migrations(&conn).expect("failed to run database migrations");
        if applied > 0 {
            tracing::info!(count = applied, "applied database migrations");
        }
    }
    pool
}

#[tokio::main]
async fn main() {
    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let clear_observers = args.first().is_some_and(|a| a == CLEAR_OBSERVERS);
    if clear_observers {
        args.remove(0);
    }

    let (resolved_config_path, config_source) = resolve_config_path(&args);
    let selected_config_path = resolved_config_path.as_deref().or(Some("config.toml"));

    // Load configuration
    let config = config::load_config(selected_config_path)
        .expect("failed to load configuration — the server cannot start without valid config");

    init_tracing(&config);

    tracing::info!(
        source = config_source,
        path = selected_config_path.unwrap_or("<none>"),
        "resolved startup configuration path"
    );

    let pool = open_database(&config);

    if clear_observers {
        let mut conn = pool
            .get()
            .expect("failed to get database connection");
        let report = vigil_engine::registry::clear_all(&mut conn).expect("failed to clear observers");
        tracing::info!(
            observers = report.observers,
            subscribers = report.subscribers,
            "cleared all observers"
        );
        return;
    }

    let state = AppState::start(pool, config.engine.to_settings())
        .expect("failed to start the engine");
    let engine = state.engine.clone();

    let app = app(state);
    let addr = SocketAddr::new(config.server.host, config.server.port);

    tracing::info!(%addr, "starting vigil server");

    let listener = TcpListener::bind(addr)
        .await
        .expect("failed to bind to address — is another process using this port?");

    // Serve with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    engine.shutdown().await;
    tracing::info!("vigil server shut down");
}

/// Waits for a SIGINT (Ctrl+C) or SIGTERM signal for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { tracing::info!("received SIGINT, initiating graceful shutdown"); }
        () = terminate => { tracing::info!("received SIGTERM, initiating graceful shutdown"); }
    }
}
