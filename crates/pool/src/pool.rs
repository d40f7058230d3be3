//! The Pool scheduler: admission control, LRU idle reuse, global
//! eviction, restart-file detection and the idle reaper, all serialized
//! behind one coarse async lock ("Coarse pool lock").

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use apppool_core::{PoolError, PoolResult, SpawnOptions};
use apppool_spawn::{Session, SpawnManager};
use tokio::sync::{Mutex, Notify};
use tracing::{info, warn};

use crate::state::{InstanceId, PoolState};

/// Total deadline across all waits inside one `get()` call.
const GET_TIMEOUT: Duration = Duration::from_millis(5000);
/// Bound on connect()-failure retries from step 2.
const MAX_GET_ATTEMPTS: u32 = 10;

struct PoolInner {
    state: Mutex<PoolState>,
    /// Signalled on every activeSessions decrement and every tunable
    /// change.
    notify: Notify,
    reaper_notify: Notify,
    spawn_manager: SpawnManager,
    /// `get()` callers currently blocked, tracked without a second lock
    /// by making the counter atomic.
    waiting: AtomicUsize,
    reaper_handle: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        if let Some(handle) = self.reaper_handle.get_mut().unwrap().take() {
            handle.abort();
        }
    }
}

enum Attempt {
    Session(Session),
    Retry,
}

/// Handle to the shared pool. Cheap to clone (an `Arc` underneath); every
/// clone shares the same instances, locks and background reaper.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    pub fn new(
        spawn_manager: SpawnManager,
        max: usize,
        max_per_app: usize,
        max_idle_time: Duration,
    ) -> Self {
        let inner = Arc::new(PoolInner {
            state: Mutex::new(PoolState::new(max, max_per_app, max_idle_time)),
            notify: Notify::new(),
            reaper_notify: Notify::new(),
            spawn_manager,
            waiting: AtomicUsize::new(0),
            reaper_handle: std::sync::Mutex::new(None),
        });
        let handle = spawn_reaper(inner.clone());
        *inner.reaper_handle.lock().unwrap() = Some(handle);
        Pool { inner }
    }

    /// Returns a session bound to one live instance for `options.appRoot`.
    /// `options.appRoot` is already canonical — it can only be constructed
    /// via [`AppRoot::normalize`] — so canonicalization is enforced by the
    /// type system rather than repeated here.
    pub async fn get(&self, mut options: SpawnOptions) -> PoolResult<Session> {
        let deadline = Instant::now() + GET_TIMEOUT;
        let mut attempts = 0u32;
        loop {
            match self.attempt(&mut options, deadline).await? {
                Attempt::Session(session) => return Ok(session),
                Attempt::Retry => {
                    attempts += 1;
                    if attempts >= MAX_GET_ATTEMPTS {
                        return Err(PoolError::spawn(
                            options.app_root.to_string(),
                            format!("no usable instance after {MAX_GET_ATTEMPTS} attempts"),
                        ));
                    }
                }
            }
        }
    }

    async fn attempt(&self, options: &mut SpawnOptions, deadline: Instant) -> PoolResult<Attempt> {
        let mut state = self.inner.state.lock().await;
        self.apply_restart_check(&mut state, options).await?;

        // Step 3: an idle head instance for this appRoot is reused as-is.
        let head = state
            .apps
            .get(&options.app_root)
            .and_then(|e| e.order.front().copied());
        if let Some(id) = head {
            let idle = state.instances.get(&id).map(|r| r.is_idle()).unwrap_or(false);
            if idle {
                return self.finish_acquire(state, id, options).await;
            }
        }

        if state.apps.contains_key(&options.app_root) {
            // Step 4: head is busy, but there's room to spawn another
            // instance for this appRoot specifically.
            let per_app_ok =
                state.max_per_app == 0 || state.per_app_count(&options.app_root) < state.max_per_app;
            if state.count() < state.max && per_app_ok {
                let instance = self.inner.spawn_manager.spawn(options).await?;
                let id = state.insert(options.app_root.clone(), instance);
                return self.finish_acquire(state, id, options).await;
            }

            // Step 5: saturated for this appRoot.
            if options.use_global_queue {
                let notified = self.inner.notify.notified();
                drop(state);
                self.wait_for_capacity(notified, deadline).await?;
                return Ok(Attempt::Retry);
            }
            // useGlobalQueue == false: fall through to step 6 below.
        }

        // Step 6: appRoot absent, or present-but-saturated without a
        // global queue.
        let per_app_ok =
            state.max_per_app == 0 || state.per_app_count(&options.app_root) < state.max_per_app;
        if state.active() < state.max && per_app_ok {
            if state.count() >= state.max {
                if let Some(&victim) = state.idle.front() {
                    info!(instance = victim, "evicting idle instance to admit new appRoot");
                    state.remove(victim);
                }
            }
            let instance = self.inner.spawn_manager.spawn(options).await?;
            let id = state.insert(options.app_root.clone(), instance);
            return self.finish_acquire(state, id, options).await;
        }

        let notified = self.inner.notify.notified();
        drop(state);
        self.wait_for_capacity(notified, deadline).await?;
        Ok(Attempt::Retry)
    }

    /// Step 2: restart-file detection, throttled by `statThrottleRate`.
    async fn apply_restart_check(
        &self,
        state: &mut PoolState,
        options: &SpawnOptions,
    ) -> PoolResult<()> {
        let restart_dir = options.restart_dir();
        let throttle = Duration::from_secs(options.stat_throttle_rate);
        let triggered = state
            .restart_checker
            .should_restart(&options.app_root, &restart_dir, throttle);
        if !triggered {
            return Ok(());
        }
        info!(app_root = %options.app_root, "restart file observed, discarding instances");
        let ids: Vec<InstanceId> = state
            .apps
            .get(&options.app_root)
            .map(|e| e.order.iter().copied().collect())
            .unwrap_or_default();
        for id in ids {
            state.remove(id);
        }
        self.inner
            .spawn_manager
            .reload(&options.app_root.to_string())
            .await
    }

    /// Steps 7/8: bump bookkeeping for the chosen instance and connect to
    /// it; on connect failure, unwind the instance and ask the caller to
    /// retry from step 2.
    async fn finish_acquire(
        &self,
        mut state: tokio::sync::MutexGuard<'_, PoolState>,
        id: InstanceId,
        options: &SpawnOptions,
    ) -> PoolResult<Attempt> {
        {
            let record = state
                .instances
                .get_mut(&id)
                .expect("instance just inserted or located under the same lock");
            record.active_sessions += 1;
            record.last_used = Instant::now();
        }
        state.remove_from_idle(id);
        state.move_to_tail(id, &options.app_root);

        let callback = close_callback(self.inner.clone(), id);
        let connect_result = {
            let record = state.instances.get(&id).expect("present");
            record.instance.connect(callback).await
        };

        match connect_result {
            Ok(session) => Ok(Attempt::Session(session)),
            Err(e) => {
                warn!(error = %e, "connect() to instance failed, discarding it");
                state.remove(id);
                Ok(Attempt::Retry)
            }
        }
    }

    async fn wait_for_capacity(
        &self,
        notified: impl std::future::Future<Output = ()>,
        deadline: Instant,
    ) -> PoolResult<()> {
        self.inner.waiting.fetch_add(1, Ordering::SeqCst);
        let remaining = deadline.saturating_duration_since(Instant::now());
        let result = tokio::time::timeout(remaining, notified).await;
        self.inner.waiting.fetch_sub(1, Ordering::SeqCst);
        result.map_err(|_| PoolError::Busy)
    }

    /// Number of `get()` callers currently blocked waiting for capacity.
    pub fn waiting(&self) -> usize {
        self.inner.waiting.load(Ordering::SeqCst)
    }

    pub async fn clear(&self) {
        let mut state = self.inner.state.lock().await;
        let ids: Vec<InstanceId> = state.instances.keys().copied().collect();
        for id in ids {
            state.remove(id);
        }
        self.inner.notify.notify_waiters();
    }

    /// Destroys every instance and stops the reaper task. The reaper
    /// observes `done` under the same lock it naps on, so it cannot race
    /// with this and never touches state that's already been torn down.
    pub async fn shutdown(&self) {
        self.clear().await;
        {
            let mut state = self.inner.state.lock().await;
            state.done = true;
        }
        self.inner.reaper_notify.notify_one();
        let handle = self.inner.reaper_handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub async fn set_max(&self, max: usize) {
        let mut state = self.inner.state.lock().await;
        state.max = max;
        self.inner.notify.notify_waiters();
    }

    pub async fn set_max_per_app(&self, max_per_app: usize) {
        let mut state = self.inner.state.lock().await;
        state.max_per_app = max_per_app;
        self.inner.notify.notify_waiters();
    }

    pub async fn set_max_idle_time(&self, seconds: u64) {
        let mut state = self.inner.state.lock().await;
        state.max_idle_time = Duration::from_secs(seconds);
        drop(state);
        self.inner.notify.notify_waiters();
        self.inner.reaper_notify.notify_one();
    }

    pub async fn get_active(&self) -> usize {
        self.inner.state.lock().await.active()
    }

    pub async fn get_count(&self) -> usize {
        self.inner.state.lock().await.count()
    }

    pub async fn get_spawn_server_pid(&self) -> u32 {
        self.inner.spawn_manager.spawn_server_pid().await
    }

    /// `toString()`. Safe to call whether or not the caller already holds
    /// the pool lock, by exposing both a self-locking entry point and a
    /// `&PoolState` one for callers already inside a locked section.
    pub async fn describe(&self) -> String {
        describe_locked(&self.inner.state.lock().await)
    }
}

pub(crate) fn describe_locked(state: &PoolState) -> String {
    format!(
        "Pool(count={}, active={}, max={}, maxPerApp={})",
        state.count(),
        state.active(),
        state.max,
        state.max_per_app
    )
}

/// Builds the close callback handed to `ApplicationInstance::connect`.
/// Session's destructor runs this synchronously (it cannot be `async fn`),
/// so it schedules the actual release — which needs the async pool lock —
/// onto the ambient Tokio runtime rather than blocking on it. This keeps
/// the weak-handle design, where the callback is a no-op if the
/// instance is already gone, while respecting Rust's sync `Drop`.
fn close_callback(inner: Arc<PoolInner>, id: InstanceId) -> impl FnOnce() + Send + 'static {
    move || match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move { release(inner, id).await });
        }
        Err(_) => {
            warn!(instance = id, "session closed with no Tokio runtime active; pool release skipped");
        }
    }
}

async fn release(inner: Arc<PoolInner>, id: InstanceId) {
    let mut state = inner.state.lock().await;
    let Some(record) = state.instances.get_mut(&id) else {
        return; // Instance already gone: no-op, per the weak-handle design.
    };
    record.active_sessions = record.active_sessions.saturating_sub(1);
    record.last_used = Instant::now();
    if record.active_sessions == 0 {
        let app_root = record.app_root.clone();
        state.move_to_head(id, &app_root);
        state.push_idle(id);
    }
    drop(state);
    inner.notify.notify_waiters();
}

#[cfg(test)]
mod tests {
    use super::*;
    use apppool_core::AppRoot;
    use apppool_spawn::testing::FakeSpawnLauncher;

    async fn pool(max: usize, max_per_app: usize) -> Pool {
        let manager = SpawnManager::start(Box::new(FakeSpawnLauncher::new()))
            .await
            .unwrap();
        Pool::new(manager, max, max_per_app, Duration::from_secs(300))
    }

    fn opts(app_root: &std::path::Path) -> SpawnOptions {
        SpawnOptions::new(AppRoot::normalize(app_root).unwrap(), "production")
    }

    async fn wait_for_active(pool: &Pool, expected: usize) {
        for _ in 0..200 {
            if pool.get_active().await == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("active count never reached {expected}");
    }

    #[tokio::test]
    async fn get_reuses_the_idle_instance_on_the_next_call() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(10, 10).await;

        let session = pool.get(opts(dir.path())).await.unwrap();
        let pid = session.pid();
        drop(session);
        wait_for_active(&pool, 0).await;

        let session = pool.get(opts(dir.path())).await.unwrap();
        assert_eq!(session.pid(), pid);
        assert_eq!(pool.get_count().await, 1);
    }

    #[tokio::test]
    async fn busy_head_spawns_a_second_instance_for_the_same_app_root() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(10, 10).await;

        let first = pool.get(opts(dir.path())).await.unwrap();
        let second = pool.get(opts(dir.path())).await.unwrap();

        assert_ne!(first.pid(), second.pid());
        assert_eq!(pool.get_count().await, 2);
        assert_eq!(pool.get_active().await, 2);
    }

    #[tokio::test]
    async fn saturated_pool_evicts_the_idle_lru_instance_for_a_new_app_root() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let pool = pool(1, 1).await;

        let session_a = pool.get(opts(dir_a.path())).await.unwrap();
        drop(session_a);
        wait_for_active(&pool, 0).await;
        assert_eq!(pool.get_count().await, 1);

        let _session_b = pool.get(opts(dir_b.path())).await.unwrap();
        // Had the idle A instance not been evicted, this spawn for B would
        // have pushed count above `max`.
        assert_eq!(pool.get_count().await, 1);
    }

    #[tokio::test]
    async fn global_queue_waiter_is_woken_and_reuses_the_released_instance() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(1, 1).await;

        let mut options = opts(dir.path());
        options.use_global_queue = true;
        let first = pool.get(options.clone()).await.unwrap();
        let first_pid = first.pid();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            drop(first);
        });

        let second = pool.get(options).await.unwrap();
        assert_eq!(second.pid(), first_pid);
        assert_eq!(pool.get_count().await, 1);
    }

    #[tokio::test]
    async fn restart_file_discards_the_instance_and_forces_a_fresh_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(10, 10).await;

        let session = pool.get(opts(dir.path())).await.unwrap();
        let pid = session.pid();
        drop(session);
        wait_for_active(&pool, 0).await;

        let tmp_dir = dir.path().join("tmp");
        std::fs::create_dir_all(&tmp_dir).unwrap();
        std::fs::write(tmp_dir.join("restart.txt"), b"x").unwrap();

        let session = pool.get(opts(dir.path())).await.unwrap();
        assert_ne!(session.pid(), pid);
        assert_eq!(pool.get_count().await, 1);
    }

    #[tokio::test]
    async fn exhausted_max_requests_evicts_the_dead_backend_and_respawns() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("FAKE_MAX_REQUESTS"), b"1").unwrap();
        let pool = pool(10, 10).await;

        let session = pool.get(opts(dir.path())).await.unwrap();
        let pid = session.pid();
        drop(session);
        wait_for_active(&pool, 0).await;

        // The fake backend stopped accepting after its one request; connect()
        // against the stale instance fails, so get() must evict it and spawn
        // a fresh one rather than surfacing the connect failure.
        let session = pool.get(opts(dir.path())).await.unwrap();
        assert_ne!(session.pid(), pid);
        assert_eq!(pool.get_count().await, 1);
    }

    #[tokio::test]
    async fn clear_destroys_every_instance() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let pool = pool(10, 10).await;

        drop(pool.get(opts(dir_a.path())).await.unwrap());
        drop(pool.get(opts(dir_b.path())).await.unwrap());
        wait_for_active(&pool, 0).await;
        assert_eq!(pool.get_count().await, 2);

        pool.clear().await;
        assert_eq!(pool.get_count().await, 0);
    }

    #[tokio::test]
    async fn zero_max_idle_time_disables_reaping() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(10, 10).await;

        let session = pool.get(opts(dir.path())).await.unwrap();
        drop(session);
        wait_for_active(&pool, 0).await;
        assert_eq!(pool.get_count().await, 1);

        pool.set_max_idle_time(0).await;
        // maxIdleTime of zero means "reap nothing"; give the reaper a beat
        // to wake on the notify and confirm it left the instance alone.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.get_count().await, 1);
    }

    #[tokio::test]
    async fn shutdown_destroys_instances_and_stops_the_reaper() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(10, 10).await;
        drop(pool.get(opts(dir.path())).await.unwrap());
        wait_for_active(&pool, 0).await;

        pool.shutdown().await;
        assert_eq!(pool.get_count().await, 0);
    }
}

fn spawn_reaper(inner: Arc<PoolInner>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let sleep_for = {
                let state = inner.state.lock().await;
                if state.done {
                    return;
                }
                if state.max_idle_time.is_zero() {
                    Duration::from_secs(60)
                } else {
                    state.max_idle_time + Duration::from_secs(1)
                }
            };
            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = inner.reaper_notify.notified() => {}
            }

            let mut state = inner.state.lock().await;
            if state.done {
                return;
            }
            if state.max_idle_time.is_zero() {
                continue;
            }
            let now = Instant::now();
            let max_idle_time = state.max_idle_time;
            let idle_ids: Vec<InstanceId> = state.idle.iter().copied().collect();
            let mut reaped_any = false;
            for id in idle_ids {
                let expired = state
                    .instances
                    .get(&id)
                    .map(|r| now.duration_since(r.last_used) > max_idle_time)
                    .unwrap_or(false);
                if expired {
                    state.remove(id);
                    reaped_any = true;
                }
            }
            if reaped_any {
                inner.notify.notify_waiters();
            }
        }
    })
}
