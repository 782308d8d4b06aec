use crate::compile::{RefreshOutcome, Refresher};
use crate::orchestration::sync::FeedSync;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

/// Periodic driver: mirror feeds, then refresh (or rebuild) the engine.
#[derive(Debug)]
pub struct Scheduler {
    refresher: Refresher,
    sync: Option<FeedSync>,
    interval: Duration,
    full_rebuild_every: u64,
    ticks: u64,
}

impl Scheduler {
    pub fn new(refresher: Refresher, interval: Duration, full_rebuild_every: u64) -> Self {
        Self {
            refresher,
            sync: None,
            interval,
            full_rebuild_every,
            ticks: 0,
        }
    }

    pub fn with_sync(mut self, sync: FeedSync) -> Self {
        self.sync = Some(sync);
        self
    }

    pub fn refresher(&self) -> &Refresher {
        &self.refresher
    }

    /// Run until `shutdown` flips to `true`. An in-flight refresh stops between batches.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_ms = self.interval.as_millis() as u64, "Scheduler started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            self.tick(&shutdown).await;
            if *shutdown.borrow() {
                break;
            }
        }

        info!(ticks = self.ticks, "Scheduler stopped");
    }

    /// One scheduled pass. Failures are logged; the next tick retries from the checkpoint.
    pub async fn tick(&mut self, cancel: &watch::Receiver<bool>) -> Option<RefreshOutcome> {
        self.ticks += 1;

        if let Some(sync) = &self.sync {
            match sync.sync_events().await {
                Ok(result) => info!(
                    pages = result.pages,
                    fetched = result.events_fetched,
                    new = result.events_new,
                    "Event feed synced"
                ),
                Err(e) => warn!(error = %e, "Event feed sync failed"),
            }
            if let Err(e) = sync.sync_prices().await {
                warn!(error = %e, "Price feed sync failed");
            }
        }

        let rebuild = self.full_rebuild_every > 0 && self.ticks % self.full_rebuild_every == 0;
        let result = if rebuild {
            self.refresher.rebuild(cancel).await
        } else {
            self.refresher.refresh(cancel).await
        };

        match result {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                error!(error = %e, rebuild, "Refresh failed");
                None
            }
        }
    }
}
