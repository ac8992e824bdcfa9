use crate::config::Config;
use crate::events::{SyncEvent, EVENT_CHANNEL_CAPACITY};
use crate::liveness::{is_online, Liveness, LivenessSweeper};
use crate::metrics::Metrics;
use crate::model::{EntityId, Sample};
use crate::poll::{PollSource, SampleFetcher};
use crate::push::{ConnectionState, PushConnector, PushSource, ReconnectPolicy};
use crate::store::{AppendOutcome, RejectReason, SampleStore};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleSource {
    Poll,
    Push,
}

impl SampleSource {
    pub fn as_str(self) -> &'static str {
        match self {
            SampleSource::Poll => "poll",
            SampleSource::Push => "push",
        }
    }
}

#[derive(Clone)]
pub struct SyncContext {
    pub store: Arc<SampleStore>,
    pub tracked: Arc<RwLock<HashSet<EntityId>>>,
    pub events: broadcast::Sender<SyncEvent>,
    pub metrics: Arc<Metrics>,
}

impl SyncContext {
    pub fn new(store: Arc<SampleStore>, metrics: Arc<Metrics>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store,
            tracked: Arc::new(RwLock::new(HashSet::new())),
            events,
            metrics,
        }
    }

    pub fn is_tracked(&self, id: &EntityId) -> bool {
        self.tracked.read().contains(id)
    }

    /// `routed_to` is the host the sample was delivered for. A sample whose
    /// own id differs is rejected by the store.
    pub fn ingest(
        &self,
        source: SampleSource,
        routed_to: &EntityId,
        sample: Sample,
    ) -> AppendOutcome {
        let outcome = if self.is_tracked(routed_to) {
            self.store.append(routed_to, sample)
        } else {
            AppendOutcome::Rejected(RejectReason::UnknownEntity)
        };
        self.metrics.record_append(source.as_str(), outcome);
        match outcome {
            AppendOutcome::Rejected(RejectReason::UnknownEntity) => {
                trace!(entity = %routed_to, source = source.as_str(), "dropping sample for untracked host");
            }
            AppendOutcome::Rejected(reason) => {
                debug!(entity = %routed_to, source = source.as_str(), ?reason, "sample rejected");
            }
            AppendOutcome::Inserted | AppendOutcome::Replaced => {}
        }
        outcome
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self::new(
            Arc::new(SampleStore::default()),
            Metrics::new().expect("metrics init"),
        )
    }

    #[cfg(test)]
    pub(crate) fn track_for_tests(&self, id: &EntityId) {
        self.tracked.write().insert(id.clone());
        self.store.register(id);
    }
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub poll_interval: Duration,
    pub fetch_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    pub staleness: Duration,
    pub sweep_interval: Duration,
    pub window_capacity: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            poll_interval: crate::poll::DEFAULT_POLL_INTERVAL,
            fetch_timeout: crate::poll::DEFAULT_POLL_INTERVAL,
            reconnect: ReconnectPolicy::default(),
            staleness: crate::liveness::DEFAULT_STALENESS,
            sweep_interval: Duration::from_secs(5),
            window_capacity: crate::store::DEFAULT_WINDOW_CAPACITY,
        }
    }
}

impl From<&Config> for EngineSettings {
    fn from(cfg: &Config) -> Self {
        Self {
            poll_interval: Duration::from_millis(cfg.poll.interval_ms),
            fetch_timeout: Duration::from_millis(cfg.poll.fetch_timeout_ms()),
            reconnect: cfg.push.backoff.policy(),
            staleness: Duration::from_secs(cfg.liveness.staleness_secs),
            sweep_interval: Duration::from_secs(cfg.liveness.sweep_interval_secs),
            window_capacity: cfg.window_capacity,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackDiff {
    pub added: Vec<EntityId>,
    pub removed: Vec<EntityId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HostView {
    pub id: EntityId,
    pub liveness: Liveness,
    pub latest: Option<Sample>,
    pub window_len: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct HostDetail {
    #[serde(flatten)]
    pub host: HostView,
    pub recent: Vec<Sample>,
}

struct Sweeper {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct SyncEngine {
    ctx: SyncContext,
    poll: PollSource,
    push: Option<PushSource>,
    staleness: Duration,
    sweep_interval: Duration,
    track_lock: Mutex<()>,
    sweeper: Mutex<Option<Sweeper>>,
    stopped: AtomicBool,
}

impl SyncEngine {
    pub fn new(
        settings: EngineSettings,
        fetcher: Arc<dyn SampleFetcher>,
        connector: Option<Arc<dyn PushConnector>>,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        let store = Arc::new(SampleStore::new(settings.window_capacity));
        let ctx = SyncContext::new(store, metrics);
        let poll = PollSource::new(
            fetcher,
            settings.poll_interval,
            settings.fetch_timeout,
            ctx.clone(),
        );
        let push = connector.map(|c| PushSource::new(c, settings.reconnect.clone(), ctx.clone()));

        Arc::new(Self {
            ctx,
            poll,
            push,
            staleness: settings.staleness,
            sweep_interval: settings.sweep_interval,
            track_lock: Mutex::new(()),
            sweeper: Mutex::new(None),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn start(&self) {
        if self.stopped.load(Ordering::SeqCst) {
            warn!("start called on a stopped sync engine");
            return;
        }
        if let Some(push) = &self.push {
            push.start();
        }

        let mut sweeper = self.sweeper.lock();
        if sweeper.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_liveness_sweep(
            self.ctx.clone(),
            self.staleness,
            self.sweep_interval,
            cancel.clone(),
        ));
        *sweeper = Some(Sweeper { cancel, handle });
    }

    /// Removed hosts stop polling, stop receiving push samples and lose their
    /// window before this returns. Hosts present in both sets are untouched.
    pub fn track<I>(&self, ids: I) -> TrackDiff
    where
        I: IntoIterator<Item = EntityId>,
    {
        if self.stopped.load(Ordering::SeqCst) {
            return TrackDiff::default();
        }
        let next: HashSet<EntityId> = ids.into_iter().collect();
        let _guard = self.track_lock.lock();

        let mut diff = TrackDiff::default();
        {
            // Windows exist before an id becomes visible to ingest, and are
            // evicted only after it has left the filter.
            let mut tracked = self.ctx.tracked.write();
            diff.removed = tracked.difference(&next).cloned().collect();
            diff.added = next.difference(&tracked).cloned().collect();
            for id in &diff.added {
                self.ctx.store.register(id);
            }
            *tracked = next.clone();
        }
        diff.added.sort();
        diff.removed.sort();

        for id in &diff.removed {
            self.ctx.store.evict(id);
        }
        self.poll.track(&next);
        self.ctx.metrics.tracked_entities.set(next.len() as f64);

        if !diff.added.is_empty() || !diff.removed.is_empty() {
            info!(
                added = diff.added.len(),
                removed = diff.removed.len(),
                tracked = next.len(),
                "tracked hosts updated"
            );
        }
        diff
    }

    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(push) = &self.push {
            push.stop();
        }
        self.poll.stop();
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.cancel.cancel();
            sweeper.handle.abort();
        }

        let _guard = self.track_lock.lock();
        self.ctx.tracked.write().clear();
        self.ctx.store.clear();
        self.ctx.metrics.tracked_entities.set(0.0);
        self.ctx.metrics.online_entities.set(0.0);
        info!("sync engine stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.ctx.events.subscribe()
    }

    pub fn latest(&self, id: &EntityId) -> Option<Sample> {
        if !self.ctx.is_tracked(id) {
            return None;
        }
        self.ctx.store.latest(id)
    }

    pub fn recent(&self, id: &EntityId) -> Vec<Sample> {
        if !self.ctx.is_tracked(id) {
            return Vec::new();
        }
        self.ctx.store.recent(id)
    }

    pub fn liveness(&self, id: &EntityId) -> Liveness {
        self.liveness_at(id, Utc::now())
    }

    pub fn liveness_at(&self, id: &EntityId, now: DateTime<Utc>) -> Liveness {
        if !self.ctx.is_tracked(id) {
            return Liveness::Unknown;
        }
        if is_online(self.ctx.store.latest(id).as_ref(), now, self.staleness) {
            Liveness::Online
        } else {
            Liveness::Offline
        }
    }

    pub fn is_online(&self, id: &EntityId) -> bool {
        self.liveness(id) == Liveness::Online
    }

    pub fn connection_state(&self) -> Option<ConnectionState> {
        self.push.as_ref().map(PushSource::state)
    }

    pub fn watch_connection(&self) -> Option<watch::Receiver<ConnectionState>> {
        self.push.as_ref().map(PushSource::watch_state)
    }

    pub fn is_degraded(&self) -> bool {
        self.connection_state()
            .is_some_and(ConnectionState::is_degraded)
    }

    pub fn tracked(&self) -> Vec<EntityId> {
        let mut ids: Vec<EntityId> = self.ctx.tracked.read().iter().cloned().collect();
        ids.sort();
        ids
    }

    pub fn snapshot(&self) -> Vec<HostView> {
        self.snapshot_at(Utc::now())
    }

    pub fn snapshot_at(&self, now: DateTime<Utc>) -> Vec<HostView> {
        self.tracked()
            .into_iter()
            .map(|id| self.view(id, now))
            .collect()
    }

    pub fn host(&self, id: &EntityId) -> Option<HostDetail> {
        if !self.ctx.is_tracked(id) {
            return None;
        }
        let recent = self.ctx.store.recent(id);
        let host = HostView {
            id: id.clone(),
            liveness: self.liveness(id),
            latest: recent.last().cloned(),
            window_len: recent.len(),
        };
        Some(HostDetail { host, recent })
    }

    fn view(&self, id: EntityId, now: DateTime<Utc>) -> HostView {
        let recent = self.ctx.store.recent(&id);
        let latest = recent.last().cloned();
        let liveness = if is_online(latest.as_ref(), now, self.staleness) {
            Liveness::Online
        } else {
            Liveness::Offline
        };
        HostView {
            id,
            liveness,
            latest,
            window_len: recent.len(),
        }
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_liveness_sweep(
    ctx: SyncContext,
    staleness: Duration,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut sweeper = LivenessSweeper::new(staleness);
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let report = sweeper.sweep(&ctx.store, Utc::now());
                ctx.metrics.online_entities.set(report.online as f64);
                for change in report.changes {
                    info!(entity = %change.entity_id, online = change.online, "host liveness changed");
                    let _ = ctx.events.send(SyncEvent::LivenessChanged {
                        entity_id: change.entity_id,
                        online: change.online,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::sample_at;
    use crate::poll::FetchError;
    use crate::push::{ChannelError, PushStream};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use parking_lot::Mutex as PlMutex;
    use std::collections::HashMap;

    #[derive(Default)]
    struct CannedFetcher {
        responses: PlMutex<HashMap<EntityId, Vec<Vec<Sample>>>>,
        calls: PlMutex<HashMap<EntityId, u32>>,
    }

    impl CannedFetcher {
        fn calls(&self, id: &str) -> u32 {
            self.calls
                .lock()
                .get(&EntityId::from(id))
                .copied()
                .unwrap_or(0)
        }
    }

    #[async_trait]
    impl SampleFetcher for CannedFetcher {
        async fn fetch(&self, id: &EntityId) -> Result<Vec<Sample>, FetchError> {
            *self.calls.lock().entry(id.clone()).or_insert(0) += 1;
            let mut responses = self.responses.lock();
            let queue = responses.entry(id.clone()).or_default();
            if queue.is_empty() {
                Ok(Vec::new())
            } else {
                Ok(queue.remove(0))
            }
        }
    }

    struct RefusingConnector;

    #[async_trait]
    impl PushConnector for RefusingConnector {
        async fn connect(&self) -> Result<PushStream, ChannelError> {
            Err(ChannelError::Connect("refused".to_string()))
        }
    }

    fn engine(fetcher: Arc<CannedFetcher>, push: bool) -> Arc<SyncEngine> {
        let connector: Option<Arc<dyn PushConnector>> = if push {
            Some(Arc::new(RefusingConnector))
        } else {
            None
        };
        SyncEngine::new(
            EngineSettings::default(),
            fetcher,
            connector,
            Metrics::new().expect("metrics init"),
        )
    }

    fn push(engine: &SyncEngine, sample: Sample) -> AppendOutcome {
        let id = sample.entity_id.clone();
        engine.ctx.ingest(SampleSource::Push, &id, sample)
    }

    fn ids(list: &[&str]) -> Vec<EntityId> {
        list.iter().map(|s| EntityId::from(*s)).collect()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn track_reports_only_the_delta() {
        let engine = engine(Arc::new(CannedFetcher::default()), false);
        let diff = engine.track(ids(&["a", "b"]));
        assert_eq!(diff.added, ids(&["a", "b"]));
        assert!(diff.removed.is_empty());

        let diff = engine.track(ids(&["b", "c"]));
        assert_eq!(diff.added, ids(&["c"]));
        assert_eq!(diff.removed, ids(&["a"]));
        assert_eq!(engine.tracked(), ids(&["b", "c"]));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn tracked_hosts_always_have_a_window() {
        let engine = engine(Arc::new(CannedFetcher::default()), false);
        let done = Arc::new(AtomicBool::new(false));
        let reader = {
            let engine = engine.clone();
            let done = done.clone();
            tokio::task::spawn_blocking(move || {
                let mut checked = 0_usize;
                while !done.load(Ordering::SeqCst) {
                    for id in engine.tracked() {
                        assert!(engine.ctx.store.is_registered(&id), "{id} tracked without a window");
                        checked += 1;
                    }
                }
                checked
            })
        };

        let mut hosts = Vec::new();
        for i in 0..200 {
            hosts.push(EntityId::new(format!("h{i}")));
            engine.track(hosts.clone());
            tokio::task::yield_now().await;
        }
        done.store(true, Ordering::SeqCst);
        reader.await.unwrap();

        let last = hosts.last().cloned().unwrap();
        assert_eq!(push(&engine, sample_at(last.as_str(), 1)), AppendOutcome::Inserted);
        engine.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn older_polled_sample_lands_before_newer_pushed_one() {
        let e = EntityId::from("e");
        let fetcher = Arc::new(CannedFetcher::default());
        let engine = engine(fetcher.clone(), false);
        engine.track(ids(&["e"]));
        tokio::time::sleep(Duration::from_millis(10)).await;

        fetcher
            .responses
            .lock()
            .insert(e.clone(), vec![vec![sample_at("e", 99)]]);
        assert_eq!(
            push(&engine, sample_at("e", 100)),
            AppendOutcome::Inserted
        );

        tokio::time::sleep(Duration::from_secs(5)).await;
        let ts: Vec<i64> = engine
            .recent(&e)
            .iter()
            .map(|s| s.timestamp.timestamp())
            .collect();
        assert_eq!(ts, vec![99, 100]);
        assert_eq!(engine.latest(&e).map(|s| s.timestamp.timestamp()), Some(100));
    }

    #[tokio::test(start_paused = true)]
    async fn same_sample_from_both_sources_is_kept_once() {
        let e = EntityId::from("e");
        let fetcher = Arc::new(CannedFetcher::default());
        fetcher
            .responses
            .lock()
            .insert(e.clone(), vec![vec![sample_at("e", 50)]]);
        let engine = engine(fetcher, false);
        engine.track(ids(&["e"]));
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(
            push(&engine, sample_at("e", 50)),
            AppendOutcome::Replaced
        );
        assert_eq!(engine.recent(&e).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn removed_host_is_unknown_and_not_resurrected() {
        let e = EntityId::from("e");
        let engine = engine(Arc::new(CannedFetcher::default()), false);
        engine.track(ids(&["e", "f"]));
        push(&engine, sample_at("e", 1_000));
        assert_eq!(engine.liveness_at(&e, at(1_010)), Liveness::Online);

        engine.track(ids(&["f"]));
        assert_eq!(engine.latest(&e), None);
        assert_eq!(engine.liveness_at(&e, at(1_010)), Liveness::Unknown);

        assert_eq!(
            push(&engine, sample_at("e", 1_011)),
            AppendOutcome::Rejected(RejectReason::UnknownEntity)
        );
        assert_eq!(engine.latest(&e), None);
        assert!(engine.recent(&e).is_empty());
        assert!(engine.host(&e).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn liveness_follows_staleness_of_latest_sample() {
        let engine = engine(Arc::new(CannedFetcher::default()), false);
        engine.track(ids(&["quiet", "busy"]));
        push(&engine, sample_at("busy", 1_000));

        assert_eq!(
            engine.liveness_at(&EntityId::from("quiet"), at(1_000)),
            Liveness::Offline
        );
        assert_eq!(
            engine.liveness_at(&EntityId::from("busy"), at(1_059)),
            Liveness::Online
        );
        assert_eq!(
            engine.liveness_at(&EntityId::from("busy"), at(1_060)),
            Liveness::Offline
        );

        let views = engine.snapshot_at(at(1_030));
        assert_eq!(views.len(), 2);
        let busy = views.iter().find(|v| v.id.as_str() == "busy").unwrap();
        assert_eq!(busy.liveness, Liveness::Online);
        assert_eq!(busy.window_len, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn polling_continues_after_push_degrades() {
        let fetcher = Arc::new(CannedFetcher::default());
        let engine = engine(fetcher.clone(), true);
        engine.track(ids(&["e"]));
        engine.start();

        tokio::time::sleep(Duration::from_millis(35_010)).await;
        assert_eq!(
            engine.connection_state(),
            Some(ConnectionState::Closed { degraded: true })
        );
        assert!(engine.is_degraded());
        // Ticks at 0, 5, ..., 35 seconds.
        assert_eq!(fetcher.calls("e"), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_idempotent_and_releases_state() {
        let engine = engine(Arc::new(CannedFetcher::default()), true);
        engine.track(ids(&["e"]));
        engine.start();
        push(&engine, sample_at("e", 1));

        engine.stop();
        engine.stop();
        assert!(engine.is_stopped());
        assert!(engine.tracked().is_empty());
        assert_eq!(engine.latest(&EntityId::from("e")), None);
        assert_eq!(
            engine.connection_state(),
            Some(ConnectionState::Closed { degraded: false })
        );
        assert_eq!(engine.track(ids(&["e"])), TrackDiff::default());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_emits_liveness_changes() {
        let engine = engine(Arc::new(CannedFetcher::default()), false);
        let mut events = engine.subscribe();
        engine.track(ids(&["e"]));
        let mut fresh = sample_at("e", 0);
        fresh.timestamp = Utc::now();
        push(&engine, fresh);
        engine.start();

        let event = loop {
            if let SyncEvent::LivenessChanged { entity_id, online } = events.recv().await.unwrap() {
                break (entity_id, online);
            }
        };
        assert_eq!(event, (EntityId::from("e"), true));
    }
}
