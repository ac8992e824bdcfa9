use crate::model::{EntityId, Sample};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

pub const DEFAULT_WINDOW_CAPACITY: usize = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Inserted,
    Replaced,
    Rejected(RejectReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    UnknownEntity,
    EntityMismatch,
    TooOld,
}

impl AppendOutcome {
    pub fn as_label(&self) -> &'static str {
        match self {
            AppendOutcome::Inserted => "inserted",
            AppendOutcome::Replaced => "replaced",
            AppendOutcome::Rejected(RejectReason::UnknownEntity) => "unknown_entity",
            AppendOutcome::Rejected(RejectReason::EntityMismatch) => "entity_mismatch",
            AppendOutcome::Rejected(RejectReason::TooOld) => "too_old",
        }
    }
}

#[derive(Debug, Default)]
struct SampleWindow {
    samples: VecDeque<Sample>,
}

impl SampleWindow {
    fn insert(&mut self, sample: Sample, capacity: usize) -> AppendOutcome {
        let ts = sample.timestamp;
        match self.samples.binary_search_by(|s| s.timestamp.cmp(&ts)) {
            Ok(idx) => {
                self.samples[idx] = sample;
                AppendOutcome::Replaced
            }
            Err(0) if self.samples.len() >= capacity => {
                AppendOutcome::Rejected(RejectReason::TooOld)
            }
            Err(idx) => {
                self.samples.insert(idx, sample);
                while self.samples.len() > capacity {
                    self.samples.pop_front();
                }
                AppendOutcome::Inserted
            }
        }
    }
}

#[derive(Debug)]
pub struct SampleStore {
    capacity: usize,
    windows: RwLock<HashMap<EntityId, Arc<Mutex<SampleWindow>>>>,
}

impl Default for SampleStore {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_CAPACITY)
    }
}

impl SampleStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            windows: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, id: &EntityId) -> bool {
        let mut windows = self.windows.write();
        if windows.contains_key(id) {
            return false;
        }
        windows.insert(id.clone(), Arc::new(Mutex::new(SampleWindow::default())));
        true
    }

    pub fn is_registered(&self, id: &EntityId) -> bool {
        self.windows.read().contains_key(id)
    }

    pub fn append(&self, id: &EntityId, sample: Sample) -> AppendOutcome {
        if &sample.entity_id != id {
            return AppendOutcome::Rejected(RejectReason::EntityMismatch);
        }
        // The map lock is released before the window lock is taken; a
        // concurrent evict leaves this append writing into a detached window.
        let window = match self.windows.read().get(id) {
            Some(w) => Arc::clone(w),
            None => return AppendOutcome::Rejected(RejectReason::UnknownEntity),
        };
        let mut guard = window.lock();
        guard.insert(sample, self.capacity)
    }

    pub fn latest(&self, id: &EntityId) -> Option<Sample> {
        let window = self.windows.read().get(id).cloned()?;
        let guard = window.lock();
        guard.samples.back().cloned()
    }

    pub fn recent(&self, id: &EntityId) -> Vec<Sample> {
        let Some(window) = self.windows.read().get(id).cloned() else {
            return Vec::new();
        };
        let guard = window.lock();
        guard.samples.iter().cloned().collect()
    }

    pub fn evict(&self, id: &EntityId) -> bool {
        self.windows.write().remove(id).is_some()
    }

    pub fn tracked_ids(&self) -> Vec<EntityId> {
        let mut ids: Vec<EntityId> = self.windows.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn clear(&self) {
        self.windows.write().clear();
    }
}
