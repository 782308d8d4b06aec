use anyhow::Context;
use poolledger::datasource::{HttpEventFeed, HttpPriceFeed};
use poolledger::orchestration::{FeedSync, Scheduler};
use poolledger::{
    api, config::Config, db::init_db, EngineSnapshot, QuerySurface, RefreshSettings, Refresher,
    Repository, SnapshotHandle,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into()),
        )
        .init();

    let config = Config::from_env().context("Configuration error")?;
    let port = config.port;

    let pool = init_db(&config.database_path)
        .await
        .context("Failed to initialize database")?;
    let repo = Repository::new(pool, config.chain_id.clone());

    let snapshots = SnapshotHandle::new(EngineSnapshot::empty(
        config.chain_id.clone(),
        config.token_decimals.clone(),
    ));
    let settings = RefreshSettings {
        batch_blocks: config.refresh_batch_blocks,
        lookback_blocks: config.late_event_lookback_blocks,
        concurrency: config.refresh_concurrency,
        decimals: config.token_decimals.clone(),
    };
    let store = Arc::new(repo.clone());
    let refresher = Refresher::load(
        repo.clone(),
        store.clone(),
        store.clone(),
        snapshots.clone(),
        settings,
    )
    .await
    .context("Failed to load refresh state")?;

    let mut sync = FeedSync::new(repo.clone(), config.late_event_lookback_blocks);
    if let Some(url) = &config.event_feed_url {
        sync = sync.with_event_feed(Arc::new(HttpEventFeed::new(
            url.clone(),
            config.chain_id.clone(),
        )));
    }
    if let Some(url) = &config.price_feed_url {
        sync = sync.with_price_feed(HttpPriceFeed::new(reqwest::Client::new(), url.clone()));
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = Scheduler::new(
        refresher,
        Duration::from_millis(config.refresh_interval_ms),
        config.full_rebuild_every,
    )
    .with_sync(sync);
    let scheduler_task = tokio::spawn(scheduler.run(shutdown_rx));

    let query = QuerySurface::new(
        snapshots,
        store,
        config.freshness_threshold_secs,
        config.max_page_size,
    );
    let app = api::create_router(api::AppState::new(query));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    tracing::info!(chain_id = %config.chain_id, "Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown requested");
        })
        .await
        .context("Server error")?;

    let _ = shutdown_tx.send(true);
    scheduler_task.await.context("Scheduler task failed")?;
    Ok(())
}
