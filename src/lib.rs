pub mod auth;
pub mod config;
pub mod control_loops;
pub mod crypto;
pub mod error;
pub mod events;
pub mod groups;
pub mod lifecycle;
pub mod models;
pub mod rate_limit;
pub mod routes;
pub mod store;
pub mod webhooks;

use config::{Config, StorageBackend};
use events::EventBus;
use rate_limit::{RateLimitConfig, RateLimiter};
use rocket_cors::CorsOptions;
use std::sync::Arc;
use store::Store;
use store::memory::MemoryStore;
use store::sqlite::SqliteStore;

/// Entry point used by the binary/test harness: reads configuration from the
/// environment itself so callers don't need to thread it through twice.
pub fn rocket() -> rocket::Rocket<rocket::Build> {
    rocket_with_config(Config::from_env())
}

pub fn rocket_with_config(config: Config) -> rocket::Rocket<rocket::Build> {
    build_rocket(config, RateLimitConfig::from_env())
}

fn build_rocket(config: Config, rate_limit_config: RateLimitConfig) -> rocket::Rocket<rocket::Build> {
    init_tracing();

    let store: Arc<dyn Store> = match config.storage_backend {
        StorageBackend::Memory => Arc::new(MemoryStore::new()),
        StorageBackend::Sqlite => Arc::new(
            SqliteStore::new(&config.database_path).expect("failed to open durable store"),
        ),
    };

    let events = EventBus::new();
    let rate_limiter = RateLimiter::new();
    let config = Arc::new(config);

    let cors = CorsOptions::default().to_cors().expect("failed to build CORS");

    // Background loops spawn `tokio::spawn` tasks, which panic outside a live
    // Tokio reactor. `on_liftoff` defers the spawn until Rocket's runtime (or
    // the local test client's) is actually running.
    let liftoff_store = store.clone();
    let liftoff_config = config.clone();
    let liftoff_events = events.clone();

    rocket::build()
        .manage(store)
        .manage((*config).clone())
        .manage(config)
        .manage(events)
        .manage(rate_limiter)
        .manage(rate_limit_config)
        .attach(cors)
        .attach(rocket::fairing::AdHoc::on_liftoff("Control Loops", move |_rocket| {
            let store = liftoff_store.clone();
            let config = liftoff_config.clone();
            let events = liftoff_events.clone();
            Box::pin(async move {
                control_loops::spawn_all(store, config, &events);
            })
        }))
        .mount(
            "/api/v1",
            rocket::routes![
                routes::register,
                routes::deregister,
                routes::heartbeat,
                routes::rotate_key,
                routes::set_webhook,
                routes::get_webhook,
                routes::delete_webhook,
                routes::approve,
                routes::inbox_stats,
                routes::send,
                routes::pull,
                routes::ack,
                routes::nack,
                routes::reply,
                routes::status,
                routes::create_group,
                routes::get_group,
                routes::add_member,
                routes::join_group,
                routes::leave_group,
                routes::post_message,
                routes::group_history,
                routes::health,
                routes::stats,
            ],
        )
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();
}
