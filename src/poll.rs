use crate::api::ApiError;
use crate::engine::{SampleSource, SyncContext};
use crate::events::SyncEvent;
use crate::model::{EntityId, Sample};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(5000);

#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("fetch did not finish within {0:?}")]
    Timeout(Duration),
}

impl FetchError {
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::Api(ApiError::Request(_)) => "request",
            FetchError::Api(ApiError::Status { .. }) => "status",
            FetchError::Api(ApiError::Validation(_)) => "validation",
            FetchError::Timeout(_) => "timeout",
        }
    }
}

#[async_trait]
pub trait SampleFetcher: Send + Sync {
    async fn fetch(&self, id: &EntityId) -> Result<Vec<Sample>, FetchError>;
}

struct PollHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct PollSource {
    fetcher: Arc<dyn SampleFetcher>,
    interval: Duration,
    fetch_timeout: Duration,
    ctx: SyncContext,
    timers: Mutex<HashMap<EntityId, PollHandle>>,
}

impl PollSource {
    pub fn new(
        fetcher: Arc<dyn SampleFetcher>,
        interval: Duration,
        fetch_timeout: Duration,
        ctx: SyncContext,
    ) -> Self {
        Self {
            fetcher,
            interval,
            fetch_timeout,
            ctx,
            timers: Mutex::new(HashMap::new()),
        }
    }

    pub fn track(&self, ids: &HashSet<EntityId>) {
        let mut timers = self.timers.lock();

        let removed: Vec<EntityId> = timers
            .keys()
            .filter(|id| !ids.contains(*id))
            .cloned()
            .collect();
        for id in removed {
            if let Some(handle) = timers.remove(&id) {
                handle.cancel.cancel();
                handle.task.abort();
            }
            self.ctx.store.evict(&id);
            debug!(entity = %id, "poll timer cancelled");
        }

        for id in ids {
            if timers.contains_key(id) {
                continue;
            }
            let cancel = CancellationToken::new();
            let task = tokio::spawn(run_entity_timer(
                id.clone(),
                Arc::clone(&self.fetcher),
                self.ctx.clone(),
                self.interval,
                self.fetch_timeout,
                cancel.clone(),
            ));
            timers.insert(id.clone(), PollHandle { cancel, task });
            debug!(entity = %id, "poll timer started");
        }
    }

    pub fn polled(&self) -> usize {
        self.timers.lock().len()
    }

    pub fn stop(&self) {
        for (_, handle) in self.timers.lock().drain() {
            handle.cancel.cancel();
            handle.task.abort();
        }
    }
}

impl Drop for PollSource {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_entity_timer(
    id: EntityId,
    fetcher: Arc<dyn SampleFetcher>,
    ctx: SyncContext,
    interval: Duration,
    fetch_timeout: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut inflight = JoinSet::new();

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                inflight.spawn(fetch_once(
                    id.clone(),
                    Arc::clone(&fetcher),
                    ctx.clone(),
                    fetch_timeout,
                    cancel.clone(),
                ));
            }
            Some(_) = inflight.join_next(), if !inflight.is_empty() => {}
        }
    }

    inflight.abort_all();
}

async fn fetch_once(
    id: EntityId,
    fetcher: Arc<dyn SampleFetcher>,
    ctx: SyncContext,
    fetch_timeout: Duration,
    cancel: CancellationToken,
) {
    let result = match tokio::time::timeout(fetch_timeout, fetcher.fetch(&id)).await {
        Ok(result) => result,
        Err(_elapsed) => Err(FetchError::Timeout(fetch_timeout)),
    };
    if cancel.is_cancelled() {
        return;
    }

    match result {
        Ok(samples) => {
            for sample in samples {
                if let Err(err) = sample.validate() {
                    warn!(entity = %id, error = %err, "skipping invalid polled sample");
                    continue;
                }
                ctx.ingest(SampleSource::Poll, &id, sample);
            }
        }
        Err(err) => {
            warn!(entity = %id, error = %err, "fetch failed, retrying next tick");
            ctx.metrics.inc_fetch_error(err.kind());
            let _ = ctx.events.send(SyncEvent::FetchFailed {
                entity_id: id,
                error: err.to_string(),
            });
        }
    }
}
