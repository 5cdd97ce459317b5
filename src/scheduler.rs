//! Scheduler: decides, per enqueued process, whether to
//! fetch from cache, run locally, or dispatch to a remote helper, while
//! respecting dependencies and memory/CPU headroom.
//!
//! Placement decisions follow the same shape as
//! `RoutingDecision`/`SelectedTransport`/`PerformanceThresholds`
//! (manager/transport.rs) — cache-first, then local-if-headroom, then
//! remote-if-available, then wait — generalized from "pick a transport"
//! to "pick a placement".

use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use crate::cache::{CacheClient, CacheLookupKey};
use crate::config::SchedulerConfig;
use crate::error::{ProcessError, UbaResult};
use crate::session::{FinishedKind, ProcessInfo, ProcessRegistry, ProcessState, RunningKind};

/// `EnqueueProcessInfo`: the scheduler's view of one process
/// plus the placement hints the caller attaches.
#[derive(Debug, Clone)]
pub struct EnqueueProcessInfo {
    pub process: ProcessInfo,
    pub can_detour: bool,
    pub can_execute_remotely: bool,
    pub force_remote: bool,
    pub write_to_cache: bool,
}

/// Ready-set ordering key: cache-eligible processes first, then higher
/// weight first.
#[derive(PartialEq, Eq)]
struct ReadyKey {
    cache_eligible: bool,
    weight_milli: i64,
    id: u64,
}

impl Ord for ReadyKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.cache_eligible
            .cmp(&other.cache_eligible)
            .then(self.weight_milli.cmp(&other.weight_milli))
            .then(other.id.cmp(&self.id))
    }
}

impl PartialOrd for ReadyKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Counters exposed by the scheduler.
#[derive(Debug, Default)]
pub struct SchedulerCounters {
    pub queued: AtomicU64,
    pub active_local: AtomicU64,
    pub active_remote: AtomicU64,
    pub finished: AtomicU64,
}

type FinishedCallback = Box<dyn Fn(u64, &ProcessState) + Send + Sync>;

/// Trait abstracting "run this process somewhere" so the scheduler's
/// placement logic can be unit tested without a real detour runtime or
/// network connection.
#[async_trait::async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run_local(&self, process: &ProcessInfo) -> UbaResult<i32>;
    async fn run_remote(&self, process: &ProcessInfo) -> UbaResult<i32>;
    /// Free local weight currently available.
    fn free_local_weight(&self) -> f32;
    /// Whether at least one remote helper currently has capacity.
    fn remote_available(&self) -> bool;
    /// Current system memory load as a 0-100 percentage, driving the
    /// scheduler's `mem_wait_load_percent`/`mem_kill_load_percent`
    /// backpressure. Default of 0 keeps runners that don't report
    /// memory pressure below both thresholds.
    fn memory_load_percent(&self) -> f32 {
        0.0
    }
}

struct ActiveWeight {
    local_in_use: Mutex<f32>,
}

/// The scheduler itself: dependency-aware placement over a
/// [`ProcessRegistry`], with cache-first lookup and cooperative
/// cancellation.
pub struct Scheduler {
    registry: Arc<ProcessRegistry>,
    queue: Mutex<Vec<EnqueueProcessInfo>>,
    cache: Option<Arc<dyn CacheClient>>,
    runner: Arc<dyn ProcessRunner>,
    config: SchedulerConfig,
    counters: Arc<SchedulerCounters>,
    finished_callback: Mutex<Option<FinishedCallback>>,
    cancel: Arc<Notify>,
    cancelled: std::sync::atomic::AtomicBool,
    active_weight: ActiveWeight,
    next_lower_remoteness_id: AtomicU32,
    /// `(process_id, abort handle)` for locally-running dispatches,
    /// newest last, so memory-kill backpressure can abort the newest one.
    running_local: Mutex<Vec<(u64, tokio::task::AbortHandle)>>,
}

impl Scheduler {
    pub fn new(
        registry: Arc<ProcessRegistry>,
        cache: Option<Arc<dyn CacheClient>>,
        runner: Arc<dyn ProcessRunner>,
        config: SchedulerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            queue: Mutex::new(Vec::new()),
            cache,
            runner,
            config,
            counters: Arc::new(SchedulerCounters::default()),
            finished_callback: Mutex::new(None),
            cancel: Arc::new(Notify::new()),
            cancelled: std::sync::atomic::AtomicBool::new(false),
            active_weight: ActiveWeight {
                local_in_use: Mutex::new(0.0),
            },
            next_lower_remoteness_id: AtomicU32::new(0),
            running_local: Mutex::new(Vec::new()),
        })
    }

    pub fn set_process_finished_callback(&self, cb: impl Fn(u64, &ProcessState) + Send + Sync + 'static) {
        *self.finished_callback.lock() = Some(Box::new(cb));
    }

    pub fn counters(&self) -> Arc<SchedulerCounters> {
        Arc::clone(&self.counters)
    }

    pub fn enqueue(&self, info: EnqueueProcessInfo) {
        self.registry.enqueue(info.process.clone());
        self.counters.queued.fetch_add(1, Ordering::Relaxed);
        self.queue.lock().push(info);
    }

    /// The ready set: queued processes whose dependencies have all
    /// terminated successfully, ordered cache-eligible-first then
    /// weight-descending.
    fn ready_set(&self) -> Vec<EnqueueProcessInfo> {
        let queue = self.queue.lock();
        let mut heap: BinaryHeap<(ReadyKey, usize)> = BinaryHeap::new();
        for (idx, item) in queue.iter().enumerate() {
            if matches!(self.registry.state(item.process.id), Some(ProcessState::Queued))
                && self.registry.dependencies_satisfied(item.process.id)
            {
                heap.push((
                    ReadyKey {
                        cache_eligible: item.process.cache_bucket_id.is_some(),
                        weight_milli: (item.process.weight * 1000.0) as i64,
                        id: item.process.id,
                    },
                    idx,
                ));
            }
        }
        let mut out = Vec::new();
        while let Some((_, idx)) = heap.pop() {
            out.push(queue[idx].clone());
        }
        out
    }

    /// Runs the scheduler loop until the queue drains or it is
    /// cancelled. Each ready process follows the same loop: cache
    /// lookup, then placement, then re-enqueue on `returned`.
    pub async fn run_until_drained(self: &Arc<Self>) {
        loop {
            if self.cancelled.load(Ordering::Relaxed) {
                return;
            }
            let ready = self.ready_set();
            if ready.is_empty() {
                if self.all_terminal() {
                    return;
                }
                tokio::task::yield_now().await;
                continue;
            }

            for item in ready {
                if self.cancelled.load(Ordering::Relaxed) {
                    return;
                }
                // claim the slot synchronously so the next pass's
                // ready_set() (state != Queued) never re-selects an item
                // whose dispatch task hasn't started running yet.
                self.registry
                    .set_state(item.process.id, ProcessState::Running(RunningKind::Local));
                let this = Arc::clone(self);
                tokio::spawn(async move { this.dispatch_one(item).await });
            }
            tokio::task::yield_now().await;
        }
    }

    fn all_terminal(&self) -> bool {
        let queue = self.queue.lock();
        queue.iter().all(|item| {
            matches!(
                self.registry.state(item.process.id),
                Some(ProcessState::Finished(_))
            )
        })
    }

    async fn dispatch_one(self: &Arc<Self>, item: EnqueueProcessInfo) {
        let id = item.process.id;

        // Step 1: cache lookup.
        if let (Some(bucket), Some(cache)) = (item.process.cache_bucket_id, &self.cache) {
            let key = CacheLookupKey {
                bucket_id: bucket,
                argv: item.process.argv.clone(),
                working_dir: item.process.working_dir.clone(),
            };
            match cache.fetch_from_cache(&key).await {
                Ok(Some(_hit)) => {
                    self.registry
                        .set_state(id, ProcessState::Running(RunningKind::CacheHit));
                    self.finish(id, ProcessState::Finished(FinishedKind::Success));
                    return;
                }
                Ok(None) => {} // miss, fall through to placement
                Err(e) => warn!(id, error = %e, "cache lookup failed, falling through to placement"),
            }
        }

        // Step 2: placement. Above mem_wait_load_percent no new local
        // process may start at all (spec backpressure law); if there is
        // no remote option either, the process waits rather than being
        // forced through.
        let mem_load = self.runner.memory_load_percent();
        let mem_wait = mem_load >= self.config.mem_wait_load_percent;
        let local_free = self.runner.free_local_weight() - *self.active_weight.local_in_use.lock();
        let run_local = !item.force_remote && !mem_wait && local_free >= item.process.weight;

        if run_local {
            self.run_placement(item, true).await;
        } else if item.can_execute_remotely && self.runner.remote_available() {
            self.run_placement(item, false).await;
        } else if item.can_execute_remotely || (mem_wait && !item.force_remote) {
            // No remote capacity right now, or local is blocked by memory
            // pressure with no remote option; run_until_drained already
            // claimed this slot as Running(Local) before spawning us, so
            // hand it back to Queued or ready_set() would never select it
            // again and the drain loop would spin forever.
            self.registry.set_state(id, ProcessState::Queued);
            debug!(id, mem_load, mem_wait, "no placement available yet, will retry");
        } else {
            self.run_placement(item, true).await;
        }
    }

    /// If current memory load is at or above `mem_kill_load_percent`,
    /// aborts the newest still-running local dispatch and lets it come
    /// back through `run_local_tracked`'s `Returned` mapping so the
    /// scheduler re-enqueues it.
    fn maybe_kill_newest_for_memory(&self) {
        if self.runner.memory_load_percent() < self.config.mem_kill_load_percent {
            return;
        }
        if let Some((id, abort)) = self.running_local.lock().pop() {
            warn!(id, "memory load at or above mem_kill_load_percent, killing newest running local process");
            abort.abort();
        }
    }

    /// Runs `process` on its own task so `maybe_kill_newest_for_memory`
    /// can abort it independently of the caller's future.
    async fn run_local_tracked(self: &Arc<Self>, id: u64, process: &ProcessInfo) -> UbaResult<i32> {
        let runner = Arc::clone(&self.runner);
        let process = process.clone();
        let mut task = tokio::spawn(async move { runner.run_local(&process).await });
        self.running_local.lock().push((id, task.abort_handle()));
        let outcome = (&mut task).await;
        self.running_local.lock().retain(|(tracked_id, _)| *tracked_id != id);
        Self::join_result(outcome, id)
    }

    fn join_result(outcome: Result<UbaResult<i32>, tokio::task::JoinError>, id: u64) -> UbaResult<i32> {
        match outcome {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(ProcessError::Returned {
                process_id: id,
                reason: "killed under local memory pressure".to_string(),
            }
            .into()),
            Err(e) => Err(ProcessError::Crashed {
                process_id: id,
                reason: e.to_string(),
            }
            .into()),
        }
    }

    /// Runs a process remotely, racing a local copy once the remote
    /// attempt has been running for `race_after` and local headroom is
    /// free; whichever finishes first wins and the other is cancelled.
    async fn run_remote_raced(self: &Arc<Self>, item: &EnqueueProcessInfo) -> UbaResult<i32> {
        let id = item.process.id;
        let runner = Arc::clone(&self.runner);
        let process = item.process.clone();
        let mut remote_task = tokio::spawn(async move { runner.run_remote(&process).await });

        if self.config.race_after.is_zero() {
            return Self::join_result((&mut remote_task).await, id);
        }

        match tokio::time::timeout(self.config.race_after, &mut remote_task).await {
            Ok(outcome) => return Self::join_result(outcome, id),
            Err(_elapsed) => {}
        }

        let local_free = self.runner.free_local_weight() - *self.active_weight.local_in_use.lock();
        if local_free < item.process.weight {
            return Self::join_result((&mut remote_task).await, id);
        }

        info!(id, "remote execution exceeded race_after, racing a local copy");
        self.maybe_kill_newest_for_memory();
        *self.active_weight.local_in_use.lock() += item.process.weight;
        let runner = Arc::clone(&self.runner);
        let process = item.process.clone();
        let mut local_task = tokio::spawn(async move { runner.run_local(&process).await });
        let remote_abort = remote_task.abort_handle();
        let local_abort = local_task.abort_handle();

        let winner = tokio::select! {
            r = &mut remote_task => { local_abort.abort(); Self::join_result(r, id) }
            r = &mut local_task => { remote_abort.abort(); Self::join_result(r, id) }
        };
        *self.active_weight.local_in_use.lock() -= item.process.weight;
        winner
    }

    async fn run_placement(self: &Arc<Self>, item: EnqueueProcessInfo, local: bool) {
        let id = item.process.id;
        if local {
            self.maybe_kill_newest_for_memory();
            *self.active_weight.local_in_use.lock() += item.process.weight;
            self.counters.active_local.fetch_add(1, Ordering::Relaxed);
            self.registry.set_state(id, ProcessState::Running(RunningKind::Local));
        } else {
            self.counters.active_remote.fetch_add(1, Ordering::Relaxed);
            self.registry.set_state(id, ProcessState::Running(RunningKind::Remote));
        }

        let result = if local {
            self.run_local_tracked(id, &item.process).await
        } else {
            self.run_remote_raced(&item).await
        };

        if local {
            *self.active_weight.local_in_use.lock() -= item.process.weight;
            self.counters.active_local.fetch_sub(1, Ordering::Relaxed);
        } else {
            self.counters.active_remote.fetch_sub(1, Ordering::Relaxed);
        }

        match result {
            Ok(0) => {
                if item.write_to_cache {
                    if let (Some(bucket), Some(cache)) = (item.process.cache_bucket_id, &self.cache) {
                        let key = CacheLookupKey {
                            bucket_id: bucket,
                            argv: item.process.argv.clone(),
                            working_dir: item.process.working_dir.clone(),
                        };
                        if let Err(e) = cache.write_to_cache(&key, &item.process).await {
                            warn!(id, error = %e, "cache write failed");
                        }
                    }
                }
                self.finish(id, ProcessState::Finished(FinishedKind::Success));
            }
            Ok(code) => {
                self.finish(id, ProcessState::Finished(FinishedKind::Error(code)));
            }
            Err(crate::error::UbaError::Process(ProcessError::Returned { reason, .. })) => {
                // a returned process re-enters Queued.
                info!(id, reason, "process returned, re-enqueueing");
                self.registry.set_state(id, ProcessState::Queued);
                self.requeue_with_lower_remote_preference(id);
            }
            Err(crate::error::UbaError::Process(ProcessError::Cancelled { .. })) => {
                self.finish(id, ProcessState::Finished(FinishedKind::Cancelled));
            }
            Err(e) => {
                warn!(id, error = %e, "process placement failed");
                self.finish(id, ProcessState::Finished(FinishedKind::Error(-1)));
            }
        }
    }

    fn requeue_with_lower_remote_preference(&self, id: u64) {
        let mut queue = self.queue.lock();
        if let Some(item) = queue.iter_mut().find(|i| i.process.id == id) {
            // after one return, prefer local over remote to avoid
            // repeatedly bouncing off the same flaky helper pool.
            if self.next_lower_remoteness_id.fetch_add(1, Ordering::Relaxed) % 2 == 1 {
                item.can_execute_remotely = false;
            }
        }
    }

    fn finish(&self, id: u64, state: ProcessState) {
        self.registry.set_state(id, state.clone());
        self.counters.finished.fetch_add(1, Ordering::Relaxed);
        if let Some(cb) = self.finished_callback.lock().as_ref() {
            cb(id, &state);
        }
    }

    /// `Cancel()`: drains all queues and flags cooperative cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
        self.cancel.notify_waiters();
        self.queue.lock().clear();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}
