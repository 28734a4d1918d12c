// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Party dispatcher: execute a fiber map under a join strategy.
//!
//! For every map entry with a work function, the dispatcher resolves the
//! role instance through the slot manager (missing instances are recorded
//! and skipped), wraps the function as one-shot or periodic/continuous,
//! resolves the scheduler for the entry's tag, and spawns at the requested
//! priority. Results stream back over a channel; the join loop decides when
//! the strategy is satisfied. Afterwards every looping fiber has its stop
//! flag set and is joined, along with anything the strategy cancelled;
//! excess one-shot fibers are left to finish in the background.
//!
//! # Join strategies
//!
//! - **All** -- every one-shot fiber; succeeded iff every result succeeded
//! - **Any** -- first completion, success or not; others keep running
//! - **Race** -- first *successful* result; the rest are cancelled
//! - **Majority** -- floor(n/2)+1 successes; excess fibers finish freely
//! - **Custom** -- caller predicate over the result vector so far

use super::context::PartyContext;
use super::map::{FiberMap, FiberMapCache, SchedulerRegistry, SchedulerTag};
use crate::config::DispatcherConfig;
use crate::error::{Result, RuntimeError};
use crate::fiber::{self, Fiber, FiberScheduler};
use crate::slot::SlotManager;
use crossbeam::channel::{bounded, unbounded, Receiver, RecvTimeoutError};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How long the shutdown phase waits for each fiber to finish.
const JOIN_GRACE: Duration = Duration::from_secs(10);

/// Declarative rule combining parallel outcomes.
#[derive(Clone)]
pub enum JoinStrategy {
    All,
    Any,
    Race,
    Majority,
    /// Satisfied when the predicate over the results-so-far returns true.
    Custom(Arc<dyn Fn(&[FiberResult]) -> bool + Send + Sync>),
}

impl std::fmt::Debug for JoinStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::All => write!(f, "All"),
            Self::Any => write!(f, "Any"),
            Self::Race => write!(f, "Race"),
            Self::Majority => write!(f, "Majority"),
            Self::Custom(_) => write!(f, "Custom"),
        }
    }
}

/// Outcome of one role fiber.
#[derive(Debug, Clone)]
pub struct FiberResult {
    pub role_id: String,
    pub success: bool,
    pub execution_time_ns: u64,
    pub error: Option<String>,
}

/// Outcome of a whole dispatch.
#[derive(Debug, Clone)]
pub struct DispatchResult {
    pub results: Vec<FiberResult>,
    pub all_succeeded: bool,
    pub timed_out: bool,
    pub total_execution_time_ns: u64,
}

/// Per-role execution statistics, updated atomically by the wrappers.
#[derive(Default)]
struct RoleStats {
    executions: AtomicU64,
    total_ns: AtomicU64,
    min_ns: AtomicU64,
    max_ns: AtomicU64,
    errors: AtomicU64,
}

impl RoleStats {
    fn record(&self, elapsed_ns: u64, is_error: bool) {
        self.executions.fetch_add(1, Ordering::Relaxed);
        self.total_ns.fetch_add(elapsed_ns, Ordering::Relaxed);
        self.min_ns.fetch_min(elapsed_ns, Ordering::Relaxed);
        self.max_ns.fetch_max(elapsed_ns, Ordering::Relaxed);
        if is_error {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Snapshot of a role's statistics.
#[derive(Debug, Clone)]
pub struct FiberStats {
    pub role_id: String,
    pub total_executions: u64,
    pub total_time_ns: u64,
    pub min_time_ns: u64,
    pub max_time_ns: u64,
    pub avg_time_ns: u64,
    pub error_count: u64,
}

struct DispatcherInner {
    manager: Arc<SlotManager>,
    registry: SchedulerRegistry,
    stats: DashMap<String, Arc<RoleStats>>,
    map_cache: FiberMapCache,
}

/// Orchestrator for party dispatches. Cheap to clone.
#[derive(Clone)]
pub struct PartyDispatcher {
    inner: Arc<DispatcherInner>,
}

impl PartyDispatcher {
    pub fn new(manager: Arc<SlotManager>, default_scheduler: FiberScheduler) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                manager,
                registry: SchedulerRegistry::new(default_scheduler),
                stats: DashMap::new(),
                map_cache: FiberMapCache::new(16),
            }),
        }
    }

    pub fn registry(&self) -> &SchedulerRegistry {
        &self.inner.registry
    }

    pub fn map_cache(&self) -> &FiberMapCache {
        &self.inner.map_cache
    }

    /// Statistics for one role, if it ever executed.
    pub fn role_stats(&self, role_id: &str) -> Option<FiberStats> {
        self.inner.stats.get(role_id).map(|s| {
            let executions = s.executions.load(Ordering::Relaxed);
            let total = s.total_ns.load(Ordering::Relaxed);
            FiberStats {
                role_id: role_id.to_string(),
                total_executions: executions,
                total_time_ns: total,
                min_time_ns: s.min_ns.load(Ordering::Relaxed),
                max_time_ns: s.max_ns.load(Ordering::Relaxed),
                avg_time_ns: if executions == 0 { 0 } else { total / executions },
                error_count: s.errors.load(Ordering::Relaxed),
            }
        })
    }

    /// Run the map and block until the join strategy resolves.
    ///
    /// Looping fibers (stopped by the join) and cancelled fibers are joined
    /// before returning; excess one-shot fibers under `Any`/`Majority`/
    /// `Custom` keep running in the background and never delay the return.
    pub fn dispatch_parallel(
        &self,
        map: &FiberMap,
        ctx: &Arc<PartyContext>,
        strategy: JoinStrategy,
        cfg: &DispatcherConfig,
    ) -> Result<DispatchResult> {
        let stop = Arc::new(AtomicBool::new(false));
        let fibers = Mutex::new(Vec::new());
        Ok(self.dispatch_inner(map, ctx, &strategy, cfg, &stop, &fibers))
    }

    /// Non-blocking variant: the dispatch runs on a helper thread.
    pub fn dispatch_parallel_async(
        &self,
        map: Arc<FiberMap>,
        ctx: Arc<PartyContext>,
        strategy: JoinStrategy,
        cfg: DispatcherConfig,
    ) -> DispatchHandle {
        let stop = Arc::new(AtomicBool::new(false));
        let fibers: Arc<Mutex<Vec<SpawnedRole>>> = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = bounded(1);

        let dispatcher = self.clone();
        let thread_stop = stop.clone();
        let thread_fibers = fibers.clone();
        let spawn_result = std::thread::Builder::new()
            .name(format!("weft-dispatch-{}", map.party_type()))
            .spawn(move || {
                let result = dispatcher.dispatch_inner(
                    &map,
                    &ctx,
                    &strategy,
                    &cfg,
                    &thread_stop,
                    &thread_fibers,
                );
                let _ = tx.send(result);
            });
        if let Err(e) = spawn_result {
            log::error!("async dispatch thread spawn failed: {}", e);
        }

        DispatchHandle { rx, stop, fibers }
    }

    #[allow(clippy::too_many_lines)]
    fn dispatch_inner(
        &self,
        map: &FiberMap,
        ctx: &Arc<PartyContext>,
        strategy: &JoinStrategy,
        cfg: &DispatcherConfig,
        stop: &Arc<AtomicBool>,
        fiber_reg: &Mutex<Vec<SpawnedRole>>,
    ) -> DispatchResult {
        let started = Instant::now();
        let (results_tx, results_rx) = unbounded::<FiberResult>();
        let mut results: Vec<FiberResult> = Vec::new();
        let mut oneshot_expected = 0usize;
        let mut caps = CategoryCaps::new(cfg);

        if map.is_static() {
            // Opportunistic: callers re-dispatching a static party hit the
            // cache instead of rebuilding the map.
            self.inner.map_cache.insert(Arc::new(map.clone()));
        }

        for entry in map.entries() {
            let Some(role_fn) = entry.parallel_fn.clone() else {
                continue;
            };

            if !self.inner.manager.contains_slot(entry.instance_slot_id) {
                let err = RuntimeError::RoleInstanceMissing(entry.role_id.clone());
                log::warn!("dispatch '{}': {}", map.party_type(), err);
                if let Some(cb) = &cfg.on_fiber_error {
                    cb(&entry.role_id, &err.to_string());
                }
                results.push(FiberResult {
                    role_id: entry.role_id.clone(),
                    success: false,
                    execution_time_ns: 0,
                    error: Some(err.to_string()),
                });
                continue;
            }

            if !caps.admit(entry.scheduler_tag) {
                let msg = format!("concurrency cap reached for {:?}", entry.scheduler_tag);
                if let Some(cb) = &cfg.on_fiber_error {
                    cb(&entry.role_id, &msg);
                }
                results.push(FiberResult {
                    role_id: entry.role_id.clone(),
                    success: false,
                    execution_time_ns: 0,
                    error: Some(msg),
                });
                continue;
            }

            let scheduler = self.inner.registry.scheduler_for(entry.scheduler_tag);
            let stats = self.stats_entry(&entry.role_id);
            let looping = entry.is_looping();
            let work = build_wrapper(
                entry.role_id.clone(),
                role_fn,
                ctx.clone(),
                stats,
                results_tx.clone(),
                stop.clone(),
                cfg.on_fiber_error.clone(),
                looping.then_some(LoopKind {
                    interval_ms: entry.interval_ms,
                    continuous: entry.is_continuous,
                }),
            );
            let stack = (cfg.max_memory_per_fiber > 0).then_some(cfg.max_memory_per_fiber);
            match scheduler.spawn_deferred(work, entry.priority, stack) {
                Ok(fiber) => {
                    fiber_reg.lock().push(SpawnedRole {
                        role_id: entry.role_id.clone(),
                        fiber: fiber.clone(),
                        looping,
                    });
                    scheduler.submit(&fiber);
                    if !looping {
                        oneshot_expected += 1;
                    }
                }
                Err(e) => {
                    if let Some(cb) = &cfg.on_fiber_error {
                        cb(&entry.role_id, &e.to_string());
                    }
                    results.push(FiberResult {
                        role_id: entry.role_id.clone(),
                        success: false,
                        execution_time_ns: 0,
                        error: Some(e.to_string()),
                    });
                }
            }
        }
        drop(results_tx);

        // ---- join phase -------------------------------------------------
        let deadline = (cfg.max_execution_time_ms > 0)
            .then(|| started + Duration::from_millis(cfg.max_execution_time_ms));
        let majority_needed = oneshot_expected / 2 + 1;
        let mut received = 0usize;
        let mut successes = 0usize;
        let mut satisfied = oneshot_expected == 0;
        let mut timed_out = false;

        while !satisfied && received < oneshot_expected {
            let tick = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        timed_out = true;
                        break;
                    }
                    (d - now).min(Duration::from_millis(20))
                }
                None => Duration::from_millis(20),
            };
            match results_rx.recv_timeout(tick) {
                Ok(r) => {
                    received += 1;
                    let won = r.success;
                    if won {
                        successes += 1;
                    }
                    results.push(r);
                    satisfied = match strategy {
                        JoinStrategy::All => received == oneshot_expected,
                        JoinStrategy::Any => true,
                        JoinStrategy::Race => won,
                        JoinStrategy::Majority => successes >= majority_needed,
                        JoinStrategy::Custom(pred) => pred(&results),
                    };
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        // ---- shutdown phase ---------------------------------------------
        if timed_out {
            if let Some(cb) = &cfg.on_timeout {
                for entry in fiber_reg.lock().iter() {
                    if !is_finished(&entry.fiber) {
                        cb(&entry.role_id);
                    }
                }
            }
        }
        stop.store(true, Ordering::SeqCst);

        let cancel_rest = timed_out || matches!(strategy, JoinStrategy::Race);
        {
            let reg = fiber_reg.lock();
            for entry in reg.iter() {
                if cancel_rest && !is_finished(&entry.fiber) {
                    entry.fiber.cancel();
                }
            }
        }
        // Join only looping fibers (they observe the stop flag) and whatever
        // was cancelled above. Excess one-shot fibers under Any/Majority/
        // Custom stay unjoined: they keep running in the background and the
        // call returns as soon as the join condition held. Snapshot before
        // joining so a concurrent `DispatchHandle::cancel` is never blocked
        // on the registry lock.
        let join_list: Vec<SpawnedRole> = fiber_reg
            .lock()
            .iter()
            .filter(|e| e.looping || cancel_rest)
            .cloned()
            .collect();
        for entry in &join_list {
            if !entry.fiber.wait_done(Some(JOIN_GRACE)) {
                log::warn!(
                    "role '{}' did not finish within the join grace",
                    entry.role_id
                );
            }
        }
        while let Ok(r) = results_rx.try_recv() {
            results.push(r);
        }

        // Roles that never produced a result (hung past the grace) are
        // reported as timed out.
        if timed_out {
            let reg = fiber_reg.lock();
            for entry in reg.iter() {
                if !results.iter().any(|r| r.role_id == entry.role_id) {
                    results.push(FiberResult {
                        role_id: entry.role_id.clone(),
                        success: false,
                        execution_time_ns: 0,
                        error: Some(RuntimeError::Timeout.to_string()),
                    });
                }
            }
        }

        let all_succeeded = !timed_out && !results.is_empty() && results.iter().all(|r| r.success);
        DispatchResult {
            results,
            all_succeeded,
            timed_out,
            total_execution_time_ns: started.elapsed().as_nanos() as u64,
        }
    }

    fn stats_entry(&self, role_id: &str) -> Arc<RoleStats> {
        self.inner
            .stats
            .entry(role_id.to_string())
            .or_insert_with(|| {
                Arc::new(RoleStats {
                    min_ns: AtomicU64::new(u64::MAX),
                    ..Default::default()
                })
            })
            .clone()
    }
}

/// One fiber spawned for a dispatch, shared with its [`DispatchHandle`].
#[derive(Clone)]
struct SpawnedRole {
    role_id: String,
    fiber: Arc<Fiber>,
    /// Periodic or continuous wrapper; stopped by the join, so always joined.
    looping: bool,
}

fn is_finished(fiber: &Fiber) -> bool {
    matches!(
        fiber.state(),
        fiber::FiberState::Done | fiber::FiberState::Error
    )
}

/// Handle to a dispatch running on a helper thread.
pub struct DispatchHandle {
    rx: Receiver<DispatchResult>,
    stop: Arc<AtomicBool>,
    fibers: Arc<Mutex<Vec<SpawnedRole>>>,
}

impl DispatchHandle {
    /// Wait for the dispatch to finish; `Timeout` if it has not by then.
    pub fn wait(&self, timeout_ms: u64) -> Result<DispatchResult> {
        self.rx
            .recv_timeout(Duration::from_millis(timeout_ms))
            .map_err(|_| RuntimeError::Timeout)
    }

    /// Stop the dispatch: looping fibers see the stop flag, everything
    /// else is cancelled.
    pub fn cancel(&self) {
        self.stop.store(true, Ordering::SeqCst);
        for entry in self.fibers.lock().iter() {
            entry.fiber.cancel();
        }
    }
}

struct LoopKind {
    interval_ms: u64,
    continuous: bool,
}

/// Per-dispatch spawn admission per scheduler-tag category.
struct CategoryCaps {
    cpu: (u32, u32),
    gpu: (u32, u32),
    io: (u32, u32),
    background: (u32, u32),
}

impl CategoryCaps {
    fn new(cfg: &DispatcherConfig) -> Self {
        Self {
            cpu: (0, cfg.max_cpu_fibers),
            gpu: (0, cfg.max_gpu_fibers),
            io: (0, cfg.max_io_fibers),
            background: (0, cfg.max_background_threads),
        }
    }

    fn admit(&mut self, tag: SchedulerTag) -> bool {
        let slot = match tag {
            SchedulerTag::GpuFiber => &mut self.gpu,
            SchedulerTag::IoFiber | SchedulerTag::NetworkThread => &mut self.io,
            SchedulerTag::BackgroundThread => &mut self.background,
            _ => &mut self.cpu,
        };
        if slot.1 > 0 && slot.0 >= slot.1 {
            return false;
        }
        slot.0 += 1;
        true
    }
}

#[allow(clippy::too_many_arguments)]
fn build_wrapper(
    role_id: String,
    role_fn: super::map::RoleFn,
    ctx: Arc<PartyContext>,
    stats: Arc<RoleStats>,
    tx: crossbeam::channel::Sender<FiberResult>,
    stop: Arc<AtomicBool>,
    on_error: Option<crate::config::FiberErrorCallback>,
    looping: Option<LoopKind>,
) -> impl FnOnce() + Send + 'static {
    move || match looping {
        None => {
            let t0 = Instant::now();
            let result = role_fn(&ctx);
            let elapsed = t0.elapsed().as_nanos() as u64;
            stats.record(elapsed, result.is_err());
            if let Err(e) = &result {
                if let Some(cb) = &on_error {
                    cb(&role_id, &e.to_string());
                }
                if *e != RuntimeError::Cancelled {
                    fiber::fail_current(e.to_string());
                }
            }
            let _ = tx.send(FiberResult {
                role_id,
                success: result.is_ok(),
                execution_time_ns: elapsed,
                error: result.err().map(|e| e.to_string()),
            });
        }
        Some(kind) => {
            let t0 = Instant::now();
            let mut errors = 0u64;
            while !stop.load(Ordering::SeqCst) && !fiber::check_cancelled() {
                let it0 = Instant::now();
                let result = role_fn(&ctx);
                stats.record(it0.elapsed().as_nanos() as u64, result.is_err());
                if let Err(e) = &result {
                    errors += 1;
                    if let Some(cb) = &on_error {
                        cb(&role_id, &e.to_string());
                    }
                }
                let pause = if kind.continuous {
                    fiber::yield_now()
                } else {
                    fiber::sleep_ms(kind.interval_ms)
                };
                if pause.is_err() {
                    break;
                }
            }
            let _ = tx.send(FiberResult {
                role_id,
                success: errors == 0,
                execution_time_ns: t0.elapsed().as_nanos() as u64,
                error: (errors > 0).then(|| format!("{} iterations failed", errors)),
            });
        }
    }
}
