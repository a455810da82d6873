use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod rate_limiter;
mod store;

use config::Config;
use dbus_interface::{AppState, RollcallService};
use rate_limiter::RateLimiter;
use store::RollcallStore;

const BUS_NAME: &str = "org.freedesktop.Rollcall1";
const OBJECT_PATH: &str = "/org/freedesktop/Rollcall1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = Config::from_env();

    rollcall_models::verify_models_dir(&config.model_dir).with_context(|| {
        format!(
            "model verification failed in {} — run `rollcall setup` to download models",
            config.model_dir.display()
        )
    })?;
    tracing::info!(dir = %config.model_dir.display(), "model files verified");

    let store = RollcallStore::open(&config.db_path)
        .await
        .with_context(|| format!("failed to open database at {}", config.db_path.display()))?;
    tracing::info!(path = %config.db_path.display(), "database opened");

    let engine = engine::spawn_engine(
        &config.detector_model_path(),
        &config.mesh_model_path(),
        &config.embedder_model_path(),
        &config.db_path,
        store.encryption_key(),
    )
    .context("failed to start verification engine")?;

    let session_bus = config.session_bus;
    let rate_limiter = RateLimiter::new(config.rate_limits());
    let service = RollcallService {
        state: Arc::new(Mutex::new(AppState {
            config,
            engine,
            store,
            rate_limiter,
        })),
    };

    let builder = if session_bus {
        tracing::warn!("running on the session bus (development mode)");
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let _connection = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to register on the bus")?;

    tracing::info!(bus = BUS_NAME, "rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    Ok(())
}
