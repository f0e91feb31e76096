use std::sync::Arc;

use anyhow::Result;
use tokio::{
    net::TcpListener,
    signal,
    sync::{mpsc, watch},
};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use smart_plug_service::{
    api,
    config::Config,
    db::{self, PgStore},
    device::{DeviceClient, TuyaPlug},
    reconcile::Reconciler,
    store::StateStore,
    tuya::TuyaClient,
    watcher::CommandWatcher,
};

const MAILBOX_CAPACITY: usize = 16;

#[tokio::main]
async fn main() -> Result<()> {
    // Env vars may be set externally.
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return Err(e.into());
        }
    };

    let pool = db::create_pool(&config.database_url, config.call_timeout()).await?;
    db::run_migrations(&pool).await?;
    info!("Database ready");

    let store: Arc<dyn StateStore> = Arc::new(PgStore::new(pool, &config.tuya_device_id));
    let tuya = TuyaClient::new(&config)?;
    let plug = Arc::new(TuyaPlug::new(tuya, &config.tuya_device_id));
    let device = DeviceClient::new(plug, store.clone());

    let (schedule_tx, schedule_rx) = watch::channel(None);
    let (mailbox_tx, mailbox_rx) = mpsc::channel(MAILBOX_CAPACITY);

    let reconciler = Reconciler::new(device, store.clone(), schedule_rx, config.call_timeout());
    tokio::spawn(reconciler.run(mailbox_rx, config.poll_interval()));
    tokio::spawn(CommandWatcher::new(store.clone(), schedule_tx, mailbox_tx).run());

    let addr = format!("{}:{}", config.server_host, config.server_port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, device_id = %config.tuya_device_id, "HTTP server listening");

    axum::serve(listener, api::router(store))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
