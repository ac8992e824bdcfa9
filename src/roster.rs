use crate::api::{ApiError, DashboardApi};
use crate::engine::{SyncEngine, TrackDiff};
use crate::model::{EntityId, RosterEntry};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

#[async_trait]
pub trait RosterSource: Send + Sync {
    async fn roster(&self) -> Result<Vec<RosterEntry>, ApiError>;
}

#[async_trait]
impl RosterSource for DashboardApi {
    async fn roster(&self) -> Result<Vec<RosterEntry>, ApiError> {
        self.list_clients().await
    }
}

#[derive(Debug, Default)]
pub struct Roster {
    entries: RwLock<HashMap<EntityId, RosterEntry>>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace(&self, entries: Vec<RosterEntry>) {
        let map = entries.into_iter().map(|e| (e.id.clone(), e)).collect();
        *self.entries.write() = map;
    }

    pub fn hostname(&self, id: &EntityId) -> Option<String> {
        self.entries.read().get(id).map(|e| e.hostname.clone())
    }

    pub fn display_name(&self, id: &EntityId) -> String {
        self.hostname(id)
            .filter(|h| !h.trim().is_empty())
            .unwrap_or_else(|| id.to_string())
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

pub async fn refresh_once(
    source: &dyn RosterSource,
    engine: &SyncEngine,
    roster: &Roster,
) -> Result<TrackDiff, ApiError> {
    let entries = source.roster().await?;
    let ids: Vec<EntityId> = entries.iter().map(|e| e.id.clone()).collect();
    roster.replace(entries);
    Ok(engine.track(ids))
}

pub async fn run_roster_refresh(
    source: Arc<dyn RosterSource>,
    engine: Arc<SyncEngine>,
    roster: Arc<Roster>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("roster refresh stopping");
                break;
            }
            _ = ticker.tick() => {
                match refresh_once(source.as_ref(), &engine, &roster).await {
                    Ok(_) if roster.is_empty() => {
                        warn!("backend roster is empty, no hosts tracked");
                    }
                    Ok(diff) if !diff.added.is_empty() || !diff.removed.is_empty() => {
                        info!(hosts = roster.len(), "roster refreshed");
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(error = %err, "roster refresh failed, keeping previous host set");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineSettings;
    use crate::metrics::Metrics;
    use crate::model::Sample;
    use crate::poll::{FetchError, SampleFetcher};
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    struct NoSamples;

    #[async_trait]
    impl SampleFetcher for NoSamples {
        async fn fetch(&self, _id: &EntityId) -> Result<Vec<Sample>, FetchError> {
            Ok(Vec::new())
        }
    }

    struct ScriptedRoster {
        script: Mutex<VecDeque<Result<Vec<RosterEntry>, ApiError>>>,
    }

    #[async_trait]
    impl RosterSource for ScriptedRoster {
        async fn roster(&self) -> Result<Vec<RosterEntry>, ApiError> {
            self.script
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    fn entry(id: &str, hostname: &str) -> RosterEntry {
        RosterEntry {
            id: EntityId::from(id),
            hostname: hostname.to_string(),
            last_seen: "2025-01-01T00:00:00Z".to_string(),
            version: None,
        }
    }

    fn engine() -> Arc<SyncEngine> {
        SyncEngine::new(
            EngineSettings::default(),
            Arc::new(NoSamples),
            None,
            Metrics::new().expect("metrics init"),
        )
    }

    #[test]
    fn display_name_falls_back_to_id() {
        let roster = Roster::new();
        roster.replace(vec![entry("a", "alpha"), entry("b", "")]);
        assert_eq!(roster.display_name(&EntityId::from("a")), "alpha");
        assert_eq!(roster.display_name(&EntityId::from("b")), "b");
        assert_eq!(roster.display_name(&EntityId::from("zzz")), "zzz");
    }

    #[tokio::test(start_paused = true)]
    async fn failed_refresh_keeps_previous_hosts() {
        let engine = engine();
        let roster = Arc::new(Roster::new());
        let source = Arc::new(ScriptedRoster {
            script: Mutex::new(VecDeque::from([
                Ok(vec![entry("a", "alpha"), entry("b", "beta")]),
                Err(ApiError::Status {
                    status: 502,
                    body: "bad gateway".to_string(),
                }),
                Ok(vec![entry("b", "beta")]),
            ])),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_roster_refresh(
            source,
            engine.clone(),
            roster.clone(),
            DEFAULT_REFRESH_INTERVAL,
            shutdown_rx,
        ));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(engine.tracked(), vec![EntityId::from("a"), EntityId::from("b")]);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(engine.tracked().len(), 2);
        assert_eq!(roster.len(), 2);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(engine.tracked(), vec![EntityId::from("b")]);
        assert_eq!(roster.hostname(&EntityId::from("a")), None);

        let _ = shutdown_tx.send(true);
        task.await.unwrap();
    }
}
