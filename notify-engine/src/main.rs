use std::path::PathBuf;
use std::sync::Arc;

use notify_engine::config::{ChannelsConfig, EngineConfig};
use notify_engine::database::{self, repositories::{SqlxNotificationRepository, SqlxPreferenceStore}};
use notify_engine::logging::{self, LoggingOptions};
use notify_engine::notification::{BroadcastEventSink, InAppChannel, NotificationEngine, build_senders};
use tracing::{debug, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let (_logging, _log_guard) = logging::init_logging(LoggingOptions {
        filter: None,
        log_dir: std::env::var("NOTIFY_LOG_DIR").ok().map(PathBuf::from),
        ansi: true,
    })?;

    let engine_config = EngineConfig::from_env()?;
    let channels_config = ChannelsConfig::from_env()?;

    // Initialize database
    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite:notify.db?mode=rwc".to_string());
    let pool = database::init_pool(&database_url).await?;
    database::run_migrations(&pool).await?;

    let events = Arc::new(BroadcastEventSink::new(engine_config.event_buffer));
    let mut event_rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match event_rx.recv().await {
                Ok(event) => debug!(event = %event.name, payload = %event.payload, "Engine event"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event log lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let senders = build_senders(&channels_config, Arc::new(InAppChannel::new()));
    let engine = Arc::new(
        NotificationEngine::builder(
            Arc::new(SqlxPreferenceStore::new(pool.clone())),
            Arc::new(SqlxNotificationRepository::new(pool.clone())),
        )
        .config(engine_config)
        .channels(senders)
        .event_sink(events)
        .build()?,
    );

    engine.start();
    info!("notify-engine initialized successfully");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    engine.stop().await;
    pool.close().await;

    Ok(())
}
