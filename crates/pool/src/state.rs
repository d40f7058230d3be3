//! Pool bookkeeping: the per-instance record and the map/list structures
//! `Pool::get` mutates under the coarse lock.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use apppool_core::{AppRoot, RestartChecker};
use apppool_spawn::ApplicationInstance;

pub(crate) type InstanceId = u64;

pub(crate) struct InstanceRecord {
    pub instance: ApplicationInstance,
    pub app_root: AppRoot,
    pub active_sessions: u64,
    pub last_used: Instant,
}

impl InstanceRecord {
    pub fn is_idle(&self) -> bool {
        self.active_sessions == 0
    }
}

/// Per-appRoot instance list. Front of `order` is the least recently
/// active instance; a session close moves its instance back to the front.
#[derive(Default)]
pub(crate) struct AppEntry {
    pub order: VecDeque<InstanceId>,
}

pub(crate) struct PoolState {
    pub apps: HashMap<AppRoot, AppEntry>,
    /// Global idle list, front = oldest idle.
    pub idle: VecDeque<InstanceId>,
    pub app_instance_count: HashMap<AppRoot, usize>,
    pub instances: HashMap<InstanceId, InstanceRecord>,
    pub next_instance_id: InstanceId,
    pub restart_checker: RestartChecker,
    pub max: usize,
    pub max_per_app: usize,
    pub max_idle_time: std::time::Duration,
    /// Set by `Pool::clear_and_shutdown`; the reaper observes this and
    /// exits without touching already-destroyed state.
    pub done: bool,
}

impl PoolState {
    pub fn new(max: usize, max_per_app: usize, max_idle_time: std::time::Duration) -> Self {
        PoolState {
            apps: HashMap::new(),
            idle: VecDeque::new(),
            app_instance_count: HashMap::new(),
            instances: HashMap::new(),
            next_instance_id: 1,
            restart_checker: RestartChecker::new(),
            max,
            max_per_app,
            max_idle_time,
            done: false,
        }
    }

    pub fn count(&self) -> usize {
        self.instances.len()
    }

    pub fn active(&self) -> usize {
        self.instances.values().filter(|r| !r.is_idle()).count()
    }

    pub fn per_app_count(&self, app_root: &AppRoot) -> usize {
        self.app_instance_count.get(app_root).copied().unwrap_or(0)
    }

    /// Inserts a freshly spawned instance, appending it to its appRoot's
    /// list and to the global idle list (it starts with zero sessions).
    pub fn insert(&mut self, app_root: AppRoot, instance: ApplicationInstance) -> InstanceId {
        let id = self.next_instance_id;
        self.next_instance_id += 1;
        self.apps.entry(app_root.clone()).or_default().order.push_back(id);
        *self.app_instance_count.entry(app_root.clone()).or_insert(0) += 1;
        self.idle.push_back(id);
        self.instances.insert(
            id,
            InstanceRecord {
                instance,
                app_root,
                active_sessions: 0,
                last_used: Instant::now(),
            },
        );
        id
    }

    /// Removes an instance entirely: from its appRoot list (dropping the
    /// list and its restart-checker memory if it becomes empty), from the
    /// idle list if present, and from `instances`. Returns the record so
    /// the caller can close its owner pipe / unlink its socket.
    pub fn remove(&mut self, id: InstanceId) -> Option<InstanceRecord> {
        let record = self.instances.remove(&id)?;
        if let Some(entry) = self.apps.get_mut(&record.app_root) {
            entry.order.retain(|&x| x != id);
            if entry.order.is_empty() {
                self.apps.remove(&record.app_root);
                self.app_instance_count.remove(&record.app_root);
                self.restart_checker.forget(&record.app_root);
            } else if let Some(count) = self.app_instance_count.get_mut(&record.app_root) {
                *count = count.saturating_sub(1);
            }
        }
        self.idle.retain(|&x| x != id);
        Some(record)
    }

    /// Moves `id` to the tail of its appRoot list: "most recently active",
    /// used when a `get()` caller takes an instance.
    pub fn move_to_tail(&mut self, id: InstanceId, app_root: &AppRoot) {
        if let Some(entry) = self.apps.get_mut(app_root) {
            entry.order.retain(|&x| x != id);
            entry.order.push_back(id);
        }
    }

    /// Moves `id` to the head of its appRoot list: "least recently active",
    /// used when a session close returns an instance to idle so it becomes `get()`'s next reuse candidate.
    pub fn move_to_head(&mut self, id: InstanceId, app_root: &AppRoot) {
        if let Some(entry) = self.apps.get_mut(app_root) {
            entry.order.retain(|&x| x != id);
            entry.order.push_front(id);
        }
    }

    pub fn remove_from_idle(&mut self, id: InstanceId) {
        self.idle.retain(|&x| x != id);
    }

    pub fn push_idle(&mut self, id: InstanceId) {
        if !self.idle.contains(&id) {
            self.idle.push_back(id);
        }
    }
}
