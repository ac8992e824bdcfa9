use crate::model::{EntityId, Sample};
use crate::store::SampleStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

pub const DEFAULT_STALENESS: Duration = Duration::from_secs(60);

/// A host with no sample is offline. An age of exactly `threshold` is offline.
pub fn is_online(latest: Option<&Sample>, now: DateTime<Utc>, threshold: Duration) -> bool {
    let Some(sample) = latest else {
        return false;
    };
    let age = now.signed_duration_since(sample.timestamp);
    match chrono::Duration::from_std(threshold) {
        Ok(limit) => age < limit,
        Err(_) => true,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Liveness {
    Unknown,
    Offline,
    Online,
}

impl Liveness {
    pub fn as_str(self) -> &'static str {
        match self {
            Liveness::Unknown => "unknown",
            Liveness::Offline => "offline",
            Liveness::Online => "online",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivenessChange {
    pub entity_id: EntityId,
    pub online: bool,
}

#[derive(Debug, Default)]
pub struct SweepReport {
    pub changes: Vec<LivenessChange>,
    pub online: usize,
    pub tracked: usize,
}

#[derive(Debug)]
pub struct LivenessSweeper {
    threshold: Duration,
    reported: HashMap<EntityId, bool>,
}

impl LivenessSweeper {
    pub fn new(threshold: Duration) -> Self {
        Self {
            threshold,
            reported: HashMap::new(),
        }
    }

    pub fn sweep(&mut self, store: &SampleStore, now: DateTime<Utc>) -> SweepReport {
        let ids = store.tracked_ids();
        let current: HashSet<&EntityId> = ids.iter().collect();
        self.reported.retain(|id, _| current.contains(id));

        let mut report = SweepReport {
            tracked: ids.len(),
            ..SweepReport::default()
        };
        for id in ids {
            let online = is_online(store.latest(&id).as_ref(), now, self.threshold);
            if online {
                report.online += 1;
            }
            let previous = self.reported.insert(id.clone(), online).unwrap_or(false);
            if previous != online {
                report.changes.push(LivenessChange {
                    entity_id: id,
                    online,
                });
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::sample_at;
    use chrono::TimeZone;

    fn at(secs: i64, millis: u32) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, millis * 1_000_000).unwrap()
    }

    #[test]
    fn no_sample_is_offline() {
        assert!(!is_online(None, at(100, 0), DEFAULT_STALENESS));
    }

    #[test]
    fn staleness_boundary_is_exclusive() {
        let sample = sample_at("e", 1_000);
        assert!(is_online(Some(&sample), at(1_059, 999), DEFAULT_STALENESS));
        assert!(!is_online(Some(&sample), at(1_060, 0), DEFAULT_STALENESS));
        assert!(!is_online(Some(&sample), at(2_000, 0), DEFAULT_STALENESS));
    }

    #[test]
    fn sample_from_the_future_counts_as_online() {
        let sample = sample_at("e", 1_000);
        assert!(is_online(Some(&sample), at(990, 0), DEFAULT_STALENESS));
    }

    #[test]
    fn sweep_reports_flip_to_offline_without_new_samples() {
        let store = SampleStore::default();
        let id = EntityId::from("e");
        store.register(&id);
        store.append(&id, sample_at("e", 1_000));

        let mut sweeper = LivenessSweeper::new(DEFAULT_STALENESS);
        let report = sweeper.sweep(&store, at(1_010, 0));
        assert_eq!(report.online, 1);
        assert_eq!(
            report.changes,
            vec![LivenessChange {
                entity_id: id.clone(),
                online: true
            }]
        );

        let report = sweeper.sweep(&store, at(1_030, 0));
        assert!(report.changes.is_empty());

        let report = sweeper.sweep(&store, at(1_060, 0));
        assert_eq!(report.online, 0);
        assert_eq!(
            report.changes,
            vec![LivenessChange {
                entity_id: id,
                online: false
            }]
        );
    }

    #[test]
    fn sweep_forgets_evicted_hosts() {
        let store = SampleStore::default();
        let id = EntityId::from("e");
        store.register(&id);
        store.append(&id, sample_at("e", 1_000));
        let mut sweeper = LivenessSweeper::new(DEFAULT_STALENESS);
        sweeper.sweep(&store, at(1_001, 0));

        store.evict(&id);
        let report = sweeper.sweep(&store, at(1_002, 0));
        assert_eq!(report.tracked, 0);
        assert!(report.changes.is_empty());
    }
}
