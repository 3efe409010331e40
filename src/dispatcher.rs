// dispatcher.rs - Global FIFO task queue plus eligibility-aware selection;
// worker registry; admission control.

use crate::error::{DispatchError, Result};
use crate::runtime_adapter::RuntimeAdapter;
use crate::state::DispatcherState;
use crate::task::{RenderRequest, Task};
use crate::task_cache::TaskCache;
use crate::worker;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Tunable timeouts, mirroring the teacher's `Args` struct: wired through
/// `AppConfig`/`CliArgs` rather than hardcoded so an operator can tune them
/// without a rebuild.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub lock_timeout: Duration,
    pub task_ttl: Duration,
    pub device_start_timeout: Duration,
    pub cpu_unload_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(15),
            task_ttl: Duration::from_secs(15 * 60),
            device_start_timeout: Duration::from_secs(60),
            cpu_unload_timeout: Duration::from_secs(4 * 60),
        }
    }
}

/// Per-device bookkeeping, shared between the registry and the worker loop
/// that owns the device. No weak references are needed (cf. the source's
/// weak-keyed thread metadata): `Dispatcher` owns these `Arc`s outright and
/// drops its registry entry when the worker exits.
pub struct WorkerInfo {
    pub device: String,
    device_name: Mutex<String>,
    alive: AtomicBool,
    last_active: Mutex<Option<Instant>>,
}

impl WorkerInfo {
    fn new(device: String) -> Self {
        Self {
            device,
            device_name: Mutex::new(String::new()),
            alive: AtomicBool::new(false),
            last_active: Mutex::new(None),
        }
    }

    pub async fn device_name(&self) -> String {
        self.device_name.lock().await.clone()
    }

    async fn mark_alive(&self, device_name: String) {
        *self.device_name.lock().await = device_name;
        self.alive.store(true, Ordering::Release);
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    fn mark_dead(&self) {
        self.alive.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone)]
pub struct EnqueueOutcome {
    pub task_id: String,
    pub queue_len: usize,
}

struct ManagerState {
    queue: VecDeque<Arc<Task>>,
    workers: HashMap<String, Arc<WorkerInfo>>,
    task_index: HashMap<String, String>, // task_id -> session_id
}

/// Parses the numeric suffix of a `cuda:N` tag.
fn cuda_index(tag: &str) -> Option<u32> {
    tag.strip_prefix("cuda:").and_then(|n| n.parse().ok())
}

/// The lowest-index CUDA device currently registered with a live worker.
fn first_cuda_device_locked(state: &ManagerState) -> Option<String> {
    state
        .workers
        .values()
        .filter(|w| w.is_alive() && cuda_index(&w.device).is_some())
        .min_by_key(|w| cuda_index(&w.device).unwrap())
        .map(|w| w.device.clone())
}

fn is_alive_locked(state: &ManagerState, name: Option<&str>) -> usize {
    match name {
        None => state.workers.values().filter(|w| w.is_alive()).count(),
        Some("cuda:0") => {
            // "cuda:0" means "the first CUDA device", not literally that tag.
            usize::from(first_cuda_device_locked(state).is_some())
        }
        Some(target) => state
            .workers
            .values()
            .filter(|w| w.is_alive() && w.device == target)
            .count(),
    }
}

pub type AdapterFactory = dyn Fn(&str) -> Arc<dyn RuntimeAdapter> + Send + Sync;

pub struct Dispatcher {
    cache: Arc<TaskCache>,
    state: Arc<DispatcherState>,
    manager: Mutex<ManagerState>,
    adapter_factory: Arc<AdapterFactory>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(adapter_factory: Arc<AdapterFactory>, config: DispatcherConfig) -> Arc<Self> {
        Arc::new(Self {
            cache: Arc::new(TaskCache::new(config.lock_timeout)),
            state: DispatcherState::new(),
            manager: Mutex::new(ManagerState {
                queue: VecDeque::new(),
                workers: HashMap::new(),
                task_index: HashMap::new(),
            }),
            adapter_factory,
            config,
        })
    }

    pub fn cache(&self) -> Arc<TaskCache> {
        self.cache.clone()
    }

    pub fn state(&self) -> Arc<DispatcherState> {
        self.state.clone()
    }

    pub fn task_ttl(&self) -> Duration {
        self.config.task_ttl
    }

    // ---- worker registry -------------------------------------------------

    pub async fn start_worker(self: &Arc<Self>, device: &str) -> Result<()> {
        let info = Arc::new(WorkerInfo::new(device.to_string()));
        {
            let mut guard = tokio::time::timeout(self.config.lock_timeout, self.manager.lock())
                .await
                .map_err(|_| DispatchError::LockTimeout(self.config.lock_timeout))?;
            guard.workers.insert(device.to_string(), info.clone());
        }

        let adapter = (self.adapter_factory)(device);
        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();
        let dispatcher = self.clone();
        let worker_info = info.clone();
        let device_owned = device.to_string();
        tokio::spawn(async move {
            worker::run(dispatcher, worker_info, adapter, device_owned, ready_tx).await;
        });

        match tokio::time::timeout(self.config.device_start_timeout, ready_rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(init_err))) => Err(DispatchError::InitError(device.to_string(), init_err)),
            Ok(Err(_)) => Err(DispatchError::InitError(
                device.to_string(),
                "worker task ended before reporting readiness".to_string(),
            )),
            Err(_) => Err(DispatchError::DeviceStartTimeout(device.to_string())),
        }
    }

    /// Reconciles the live worker set against a requested device list:
    /// starts workers for devices not yet running, and signals termination
    /// for running devices no longer requested. A device dropped and later
    /// re-requested gets a fresh `WorkerInfo` and worker loop: the old
    /// loop observes `is_alive() == false` on its own `WorkerInfo` and exits,
    /// so there is never more than one live loop per device tag.
    pub async fn update_workers(self: &Arc<Self>, requested: &[String]) -> Result<()> {
        let active: Vec<String> = self.get_devices().await.into_keys().collect();

        for device in requested {
            if !active.contains(device) {
                self.start_worker(device).await?;
            }
        }
        for device in &active {
            if !requested.contains(device) {
                if let Some(info) = self.manager.lock().await.workers.get(device) {
                    info.mark_dead();
                }
            }
        }
        Ok(())
    }

    pub async fn is_alive(&self, name: Option<&str>) -> usize {
        let guard = self.manager.lock().await;
        is_alive_locked(&guard, name)
    }

    pub async fn get_devices(&self) -> HashMap<String, String> {
        let guard = self.manager.lock().await;
        let mut out = HashMap::new();
        for w in guard.workers.values() {
            if w.is_alive() {
                out.insert(w.device.clone(), w.device_name().await);
            }
        }
        out
    }

    pub(crate) async fn register_worker_alive(&self, info: &Arc<WorkerInfo>, device_name: String) {
        info.mark_alive(device_name).await;
    }

    pub(crate) async fn mark_cpu_active(&self, device: &str) {
        let guard = self.manager.lock().await;
        if let Some(info) = guard.workers.get(device) {
            *info.last_active.lock().await = Some(Instant::now());
        }
    }

    pub(crate) async fn clear_cpu_active(&self, device: &str) {
        let guard = self.manager.lock().await;
        if let Some(info) = guard.workers.get(device) {
            *info.last_active.lock().await = None;
        }
    }

    /// True when the CPU worker has been idle longer than the configured
    /// `cpu_unload_timeout` while at least one other device is alive.
    pub(crate) async fn cpu_should_unload(&self, device: &str) -> bool {
        if device != "cpu" {
            return false;
        }
        let guard = self.manager.lock().await;
        if is_alive_locked(&guard, None) <= 1 {
            return false;
        }
        match guard.workers.get(device) {
            Some(info) => match *info.last_active.lock().await {
                Some(last) => last.elapsed() > self.config.cpu_unload_timeout,
                None => false,
            },
            None => false,
        }
    }

    pub(crate) async fn other_workers_alive(&self, device: &str) -> bool {
        let guard = self.manager.lock().await;
        guard
            .workers
            .values()
            .any(|w| w.device != device && w.is_alive())
    }

    pub fn signal_shutdown(&self) {
        self.state.signal_shutdown();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state.is_shutting_down()
    }

    // ---- admission ---------------------------------------------------

    pub async fn enqueue(self: &Arc<Self>, request: RenderRequest) -> Result<EnqueueOutcome> {
        if self.is_alive(None).await == 0 {
            return Err(DispatchError::NoWorkers);
        }

        if let Some(existing) = self.cache.try_get(&request.session_id).await? {
            if existing.is_unstarted() {
                return Err(DispatchError::Pending(request.session_id.clone()));
            }
        }

        let task_id = uuid::Uuid::new_v4().to_string();
        let task = Arc::new(Task::new(task_id.clone(), request.clone()));

        self.cache
            .put(&request.session_id, task.clone(), self.config.task_ttl)
            .await
            .map_err(|_| DispatchError::AdmissionFailed)?;

        // Double the base timeout: cache insertion should fail before the
        // queue append would, keeping the cache the single source of truth.
        let lock_timeout = self.config.lock_timeout * 2;
        let mut guard = tokio::time::timeout(lock_timeout, self.manager.lock())
            .await
            .map_err(|_| DispatchError::LockTimeout(lock_timeout))?;
        guard.queue.push_back(task.clone());
        guard
            .task_index
            .insert(task_id.clone(), request.session_id.clone());
        let queue_len = guard.queue.len();

        Ok(EnqueueOutcome { task_id, queue_len })
    }

    /// Resolves a client-facing task id back to its cache entry.
    pub async fn resolve_task(&self, task_id: &str) -> Result<Option<Arc<Task>>> {
        let session_id = {
            let guard = self.manager.lock().await;
            guard.task_index.get(task_id).cloned()
        };
        match session_id {
            Some(session_id) => self.cache.try_get(&session_id).await,
            None => Ok(None),
        }
    }

    /// Finds the single task id currently holding the running flag, if any.
    /// Used by the bare `/image/stop` (no task id) global-cancel path.
    pub async fn currently_rendering_task_id(&self) -> Option<String> {
        // Snapshot the index and release the manager lock before touching
        // the cache: the lock-order rule is cache-then-manager, never the
        // reverse, so we must not hold `manager` while calling `cache`.
        let pairs: Vec<(String, String)> = {
            let guard = self.manager.lock().await;
            guard
                .task_index
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };
        for (task_id, session_id) in pairs {
            if let Ok(Some(task)) = self.cache.try_get(&session_id).await {
                if task.is_running() {
                    return Some(task_id);
                }
            }
        }
        None
    }

    // ---- selection -----------------------------------------------------

    /// Scans the queue FIFO-first for the first task eligible (or
    /// definitively ineligible, in which case it's returned with an error
    /// attached) on device `D`. A caller whose own `WorkerInfo` has been
    /// marked dead (decommissioned via `update_workers`) never gets a task:
    /// this is what lets a stale, still-looping worker drain to a stop
    /// instead of racing a freshly-spawned one for the same device tag.
    pub async fn select_next_task(&self, device: &str) -> Option<Arc<Task>> {
        let mut guard = tokio::time::timeout(self.config.lock_timeout, self.manager.lock())
            .await
            .ok()?;

        if is_alive_locked(&guard, Some(device)) == 0 {
            return None;
        }

        let mut chosen_index = None;
        let mut attach_error: Option<DispatchError> = None;

        for (idx, task) in guard.queue.iter().enumerate() {
            if task.request.use_face_correction.is_some() {
                if is_alive_locked(&guard, Some("cuda:0")) == 0 {
                    chosen_index = Some(idx);
                    attach_error = Some(DispatchError::FilterUnavailable);
                    break;
                }
                if device == "cpu" {
                    chosen_index = Some(idx);
                    attach_error = Some(DispatchError::FilterUnavailable);
                    break;
                }
                let first_cuda = first_cuda_device_locked(&guard);
                if first_cuda.as_deref() != Some(device) {
                    continue; // wait for cuda:0
                }
                chosen_index = Some(idx);
                break;
            }

            if let Some(pinned) = &task.pinned_device {
                if pinned != device {
                    if is_alive_locked(&guard, Some(pinned)) > 0 {
                        continue; // the pinned device's own worker will pick it up
                    }
                    chosen_index = Some(idx);
                    attach_error = Some(DispatchError::DeviceUnavailable(pinned.clone()));
                    break;
                }
                chosen_index = Some(idx);
                break;
            }

            if device == "cpu" && is_alive_locked(&guard, None) > 1 {
                continue; // prefer non-CPU devices when any are alive
            }

            chosen_index = Some(idx);
            break;
        }

        let idx = chosen_index?;
        let task = guard.queue.remove(idx)?;
        if let Some(err) = attach_error {
            task.set_error(err.into());
        }
        Some(task)
    }

    pub async fn queue_len(&self) -> usize {
        self.manager.lock().await.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime_adapter::MockRuntimeAdapter;

    fn request(session_id: &str) -> RenderRequest {
        RenderRequest {
            session_id: session_id.to_string(),
            render_device: None,
            use_face_correction: None,
            use_stable_diffusion_model: "sd-v1-4".into(),
            use_vae_model: None,
            stream_progress_updates: true,
            stream_image_progress: false,
            num_outputs: 1,
            show_only_filtered_image: true,
            extra: Default::default(),
        }
    }

    fn adapter_factory() -> Arc<AdapterFactory> {
        Arc::new(|device: &str| Arc::new(MockRuntimeAdapter::new(device)) as Arc<dyn RuntimeAdapter>)
    }

    fn dispatcher() -> Arc<Dispatcher> {
        Dispatcher::new(adapter_factory(), DispatcherConfig::default())
    }

    #[tokio::test]
    async fn enqueue_without_workers_is_rejected() {
        let dispatcher = dispatcher();
        let err = dispatcher.enqueue(request("s1")).await.unwrap_err();
        assert!(matches!(err, DispatchError::NoWorkers));
    }

    #[tokio::test]
    async fn enqueue_rejects_a_second_pending_task_for_the_same_session() {
        let dispatcher = dispatcher();
        dispatcher.start_worker("cpu").await.unwrap();

        dispatcher.enqueue(request("s1")).await.unwrap();
        let err = dispatcher.enqueue(request("s1")).await.unwrap_err();
        assert!(matches!(err, DispatchError::Pending(id) if id == "s1"));
    }

    #[tokio::test]
    async fn select_next_task_skips_cpu_when_a_gpu_worker_is_alive() {
        let dispatcher = dispatcher();
        dispatcher.start_worker("cpu").await.unwrap();
        dispatcher.start_worker("cuda:0").await.unwrap();

        dispatcher.enqueue(request("s1")).await.unwrap();
        assert!(dispatcher.select_next_task("cpu").await.is_none());
        let task = dispatcher.select_next_task("cuda:0").await;
        assert!(task.is_some());
    }

    #[tokio::test]
    async fn select_next_task_runs_unpinned_work_on_a_lone_cpu_worker() {
        let dispatcher = dispatcher();
        dispatcher.start_worker("cpu").await.unwrap();

        dispatcher.enqueue(request("s1")).await.unwrap();
        let task = dispatcher.select_next_task("cpu").await;
        assert!(task.is_some());
    }

    #[tokio::test]
    async fn face_correction_task_is_rejected_without_a_cuda_zero_worker() {
        let dispatcher = dispatcher();
        dispatcher.start_worker("cpu").await.unwrap();

        let mut req = request("s1");
        req.use_face_correction = Some("GFPGANv1.3".into());
        dispatcher.enqueue(req).await.unwrap();

        let task = dispatcher.select_next_task("cpu").await.unwrap();
        assert!(matches!(task.error(), Some(crate::task::TaskError::Failure(_))));
    }

    #[tokio::test]
    async fn explicit_device_pin_defers_to_the_pinned_workers_own_poll() {
        let dispatcher = dispatcher();
        dispatcher.start_worker("cpu").await.unwrap();
        dispatcher.start_worker("cuda:0").await.unwrap();

        let mut pinned = request("s1");
        pinned.render_device = Some("cuda:0".into());
        dispatcher.enqueue(pinned).await.unwrap();

        // cpu must defer to cuda:0's own worker rather than claim the pinned task.
        assert!(dispatcher.select_next_task("cpu").await.is_none());
        let picked = dispatcher.select_next_task("cuda:0").await.unwrap();
        assert_eq!(picked.request.session_id, "s1");
    }

    #[tokio::test]
    async fn resolve_task_finds_a_task_by_its_server_minted_id() {
        let dispatcher = dispatcher();
        dispatcher.start_worker("cpu").await.unwrap();

        let outcome = dispatcher.enqueue(request("s1")).await.unwrap();
        let resolved = dispatcher.resolve_task(&outcome.task_id).await.unwrap();
        assert_eq!(resolved.unwrap().request.session_id, "s1");
        assert!(dispatcher.resolve_task("unknown-id").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn a_decommissioned_worker_never_gets_handed_a_task() {
        let dispatcher = dispatcher();
        dispatcher.start_worker("cpu").await.unwrap();

        dispatcher.enqueue(request("s1")).await.unwrap();
        dispatcher.update_workers(&[]).await.unwrap();

        assert!(dispatcher.select_next_task("cpu").await.is_none());
    }
}
