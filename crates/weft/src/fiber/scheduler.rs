// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Work-stealing M:N fiber scheduler.
//!
//! # Topology
//!
//! - one global FIFO injector: new and unblocked fibers land here
//! - one LIFO deque per worker: requeued (yielded) fibers stay local
//! - thieves steal from the FIFO end of a victim's deque
//! - a park mutex/condvar sleeps idle workers; spawn and unblock wake one
//! - a dedicated I/O thread (see [`super::io`]) feeds readiness and timer
//!   wakeups through the same unblock path
//!
//! # Worker loop
//!
//! 1. pop local (LIFO)  2. pop global (FIFO)  3. steal (FIFO end of a
//! peer, round-robin victim; seeded PRNG in deterministic mode)  4. park.
//!
//! After a fiber hands the gate back the worker dispatches on its state:
//! `Ready` goes back on the local queue, `Done`/`Error` is accounted and
//! dropped, a parked fiber is left to whoever holds it for the wakeup.

use super::io::IoDriver;
use super::{
    Fiber, FiberId, Priority, S_BLOCKED, S_BLOCK_PENDING, S_DONE, S_ERROR, S_READY, S_RUNNING,
    S_SUSPENDED, S_SUSPEND_PENDING,
};
use crate::config::SchedulerConfig;
use crate::error::{Result, RuntimeError};
use crossbeam::deque::{Injector, Steal, Stealer, Worker};
use parking_lot::{Condvar, Mutex};
use std::cell::RefCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Bound on how long an idle worker sleeps before re-checking the queues;
/// closes the race between a missed notify and a fresh enqueue.
const PARK_INTERVAL: Duration = Duration::from_millis(20);

/// Grants a shutdown drain gives a fiber to observe cancellation before the
/// scheduler gives up on it.
const DRAIN_GRANT_LIMIT: u32 = 1000;

/// Counter snapshot for the whole scheduler.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchedulerStats {
    pub fibers_created: u64,
    pub fibers_completed: u64,
    pub context_switches: u64,
    pub steal_attempts: u64,
    pub steal_successes: u64,
    pub io_events: u64,
    pub active_fibers: u64,
}

pub(crate) struct SchedulerCore {
    config: SchedulerConfig,
    injector: Injector<Arc<Fiber>>,
    io: Arc<IoDriver>,
    running: AtomicBool,
    started: AtomicBool,
    worker_stop: Mutex<Vec<Arc<AtomicBool>>>,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
    park_lock: Mutex<()>,
    park_cv: Condvar,
    parked_workers: AtomicU32,
    victim_seq: AtomicU32,
    next_fiber_id: AtomicU64,
    active_fibers: AtomicU64,
    fibers_created: AtomicU64,
    fibers_completed: AtomicU64,
    context_switches: AtomicU64,
    steal_attempts: AtomicU64,
    steal_successes: AtomicU64,
}

impl SchedulerCore {
    pub(crate) fn io(&self) -> &Arc<IoDriver> {
        &self.io
    }

    fn enqueue(&self, fiber: Arc<Fiber>) {
        self.injector.push(fiber);
        self.wake_one();
    }

    fn wake_one(&self) {
        if self.parked_workers.load(Ordering::SeqCst) > 0 {
            let _guard = self.park_lock.lock();
            self.park_cv.notify_one();
        }
    }

    /// Move a parked fiber back to the run queues.
    ///
    /// Returns `true` when this call performed the transition. A fiber still
    /// in a `*Pending` state is flipped to `Ready` without enqueueing; the
    /// worker that owns the gate-back requeues it.
    pub(crate) fn unblock(&self, fiber: &Arc<Fiber>) -> bool {
        loop {
            match fiber.raw_state() {
                s @ (S_BLOCKED | S_SUSPENDED) => {
                    if fiber.cas_state(s, S_READY) {
                        self.enqueue(fiber.clone());
                        return true;
                    }
                }
                s @ (S_BLOCK_PENDING | S_SUSPEND_PENDING) => {
                    if fiber.cas_state(s, S_READY) {
                        return true;
                    }
                }
                _ => return false,
            }
        }
    }

    /// Grant the gate and dispatch on the state the fiber came back in.
    fn run_fiber(&self, local: &Worker<Arc<Fiber>>, fiber: Arc<Fiber>) {
        fiber.store_state(S_RUNNING);
        self.context_switches.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        fiber.gate.run_until_yield();
        fiber.note_switch(started.elapsed().as_nanos() as u64);

        match fiber.raw_state() {
            S_READY => local.push(fiber),
            S_DONE | S_ERROR => self.account_finished(&fiber),
            S_BLOCK_PENDING => {
                if !fiber.cas_state(S_BLOCK_PENDING, S_BLOCKED) {
                    // A wakeup landed before the park completed.
                    local.push(fiber);
                }
            }
            S_SUSPEND_PENDING => {
                if !fiber.cas_state(S_SUSPEND_PENDING, S_SUSPENDED) {
                    local.push(fiber);
                }
            }
            // Blocked/Suspended proper: the waiter holds the reference.
            _ => {}
        }
    }

    fn account_finished(&self, fiber: &Fiber) {
        if fiber.take_accounting() {
            self.active_fibers.fetch_sub(1, Ordering::SeqCst);
            self.fibers_completed.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn pop_global(&self) -> Option<Arc<Fiber>> {
        loop {
            match self.injector.steal() {
                Steal::Success(f) => return Some(f),
                Steal::Retry => continue,
                Steal::Empty => return None,
            }
        }
    }

    fn steal(
        &self,
        worker_index: usize,
        stealers: &[Stealer<Arc<Fiber>>],
        rng: &mut fastrand::Rng,
    ) -> Option<Arc<Fiber>> {
        let n = stealers.len();
        if n <= 1 {
            return None;
        }
        let start = if self.config.is_deterministic {
            rng.usize(..n)
        } else {
            self.victim_seq.fetch_add(1, Ordering::Relaxed) as usize % n
        };
        for k in 0..n {
            let victim = (start + k) % n;
            if victim == worker_index {
                continue;
            }
            self.steal_attempts.fetch_add(1, Ordering::Relaxed);
            loop {
                match stealers[victim].steal() {
                    Steal::Success(f) => {
                        self.steal_successes.fetch_add(1, Ordering::Relaxed);
                        return Some(f);
                    }
                    Steal::Retry => continue,
                    Steal::Empty => break,
                }
            }
        }
        None
    }

    fn park(&self) {
        let mut guard = self.park_lock.lock();
        self.parked_workers.fetch_add(1, Ordering::SeqCst);
        self.park_cv.wait_for(&mut guard, PARK_INTERVAL);
        self.parked_workers.fetch_sub(1, Ordering::SeqCst);
    }

    /// Drive a fiber to completion during shutdown: cancel it and keep
    /// granting until its suspension points observe the flag.
    fn finish_cancelled(&self, fiber: Arc<Fiber>) {
        fiber.cancel();
        let mut grants = 0u32;
        loop {
            match fiber.raw_state() {
                S_DONE | S_ERROR => {
                    self.account_finished(&fiber);
                    return;
                }
                _ => {
                    fiber.store_state(S_RUNNING);
                    fiber.gate.run_until_yield();
                }
            }
            grants += 1;
            if grants > DRAIN_GRANT_LIMIT {
                log::warn!("fiber {} ignored cancellation during shutdown", fiber.id());
                return;
            }
        }
    }
}

fn worker_main(
    core: Arc<SchedulerCore>,
    worker_index: usize,
    local: Worker<Arc<Fiber>>,
    stealers: Arc<Vec<Stealer<Arc<Fiber>>>>,
    stop: Arc<AtomicBool>,
) {
    CURRENT_SCHED.with(|s| *s.borrow_mut() = Arc::downgrade(&core));
    let mut rng = if core.config.is_deterministic {
        fastrand::Rng::with_seed(
            u64::from(core.config.random_seed)
                .wrapping_mul(0x9E37_79B9_7F4A_7C15)
                .wrapping_add(worker_index as u64),
        )
    } else {
        fastrand::Rng::new()
    };
    log::debug!("worker {} up", worker_index);

    while core.running.load(Ordering::SeqCst) && !stop.load(Ordering::SeqCst) {
        let next = local
            .pop()
            .or_else(|| core.pop_global())
            .or_else(|| {
                if core.config.enable_work_stealing {
                    core.steal(worker_index, &stealers, &mut rng)
                } else {
                    None
                }
            });

        match next {
            Some(fiber) => core.run_fiber(&local, fiber),
            None => core.park(),
        }
    }

    // Shutdown: everything still queued locally observes cancellation.
    while let Some(fiber) = local.pop() {
        core.finish_cancelled(fiber);
    }
    log::debug!("worker {} down", worker_index);
}

/// The carrier thread body: park on the gate, run the work, finish.
fn carrier_main(fiber: Arc<Fiber>, work: Box<dyn FnOnce() + Send>) {
    fiber.gate.wait_for_grant();
    super::set_current(Some(fiber.clone()));
    CURRENT_SCHED.with(|s| *s.borrow_mut() = fiber.sched.lock().clone());

    if !fiber.is_cancelled() {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(work)) {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "fiber panicked".to_string());
            fiber.set_error(msg);
        }
    }

    let final_state = if fiber.error().is_some() {
        S_ERROR
    } else {
        S_DONE
    };
    fiber.store_state(final_state);
    fiber.mark_finished();
    super::set_current(None);
    fiber.gate.release_to_scheduler();
}

thread_local! {
    static CURRENT_SCHED: RefCell<Weak<SchedulerCore>> = const { RefCell::new(Weak::new()) };
}

/// Handle to a running scheduler. Cheap to clone; all clones share one core.
#[derive(Clone)]
pub struct FiberScheduler {
    core: Arc<SchedulerCore>,
}

impl FiberScheduler {
    pub fn new(config: SchedulerConfig) -> Result<Self> {
        let io = Arc::new(IoDriver::new()?);
        Ok(Self {
            core: Arc::new(SchedulerCore {
                config,
                injector: Injector::new(),
                io,
                running: AtomicBool::new(false),
                started: AtomicBool::new(false),
                worker_stop: Mutex::new(Vec::new()),
                worker_handles: Mutex::new(Vec::new()),
                park_lock: Mutex::new(()),
                park_cv: Condvar::new(),
                parked_workers: AtomicU32::new(0),
                victim_seq: AtomicU32::new(0),
                next_fiber_id: AtomicU64::new(1),
                active_fibers: AtomicU64::new(0),
                fibers_created: AtomicU64::new(0),
                fibers_completed: AtomicU64::new(0),
                context_switches: AtomicU64::new(0),
                steal_attempts: AtomicU64::new(0),
                steal_successes: AtomicU64::new(0),
            }),
        })
    }

    /// The scheduler owning the calling worker or carrier thread.
    pub fn current() -> Option<Self> {
        CURRENT_SCHED
            .with(|s| s.borrow().upgrade())
            .map(|core| Self { core })
    }

    /// Spawn worker threads and the I/O thread. Idempotent.
    pub fn start(&self) {
        if self.core.started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.core.running.store(true, Ordering::SeqCst);

        let n = self.core.config.resolved_workers();
        let mut locals = Vec::with_capacity(n);
        for _ in 0..n {
            locals.push(Worker::new_lifo());
        }
        let stealers: Arc<Vec<Stealer<Arc<Fiber>>>> =
            Arc::new(locals.iter().map(Worker::stealer).collect());

        let mut stop_flags = self.core.worker_stop.lock();
        let mut handles = self.core.worker_handles.lock();
        for (i, local) in locals.into_iter().enumerate() {
            let stop = Arc::new(AtomicBool::new(false));
            stop_flags.push(stop.clone());
            let core = Arc::clone(&self.core);
            let stealers = Arc::clone(&stealers);
            let handle = std::thread::Builder::new()
                .name(format!("weft-worker-{}", i))
                .spawn(move || worker_main(core, i, local, stealers, stop));
            match handle {
                Ok(h) => handles.push(h),
                Err(e) => log::error!("worker {} spawn failed: {}", i, e),
            }
        }
        drop(handles);
        drop(stop_flags);

        self.core.io.start(Arc::downgrade(&self.core));
        log::debug!("scheduler started with {} workers", n);
    }

    /// Stop workers and the I/O thread, cancelling whatever is still queued
    /// or parked on a timer. Blocks until every thread joined.
    pub fn stop(&self) {
        if !self.core.running.swap(false, Ordering::SeqCst) {
            return;
        }
        for stop in self.core.worker_stop.lock().iter() {
            stop.store(true, Ordering::SeqCst);
        }
        {
            let _guard = self.core.park_lock.lock();
            self.core.park_cv.notify_all();
        }
        for handle in self.core.worker_handles.lock().drain(..) {
            let _ = handle.join();
        }

        for fiber in self.core.io.stop() {
            self.core.finish_cancelled(fiber);
        }
        while let Some(fiber) = self.core.pop_global() {
            self.core.finish_cancelled(fiber);
        }
        log::debug!("scheduler stopped");
    }

    pub fn is_running(&self) -> bool {
        self.core.running.load(Ordering::SeqCst)
    }

    /// Spawn a fiber at normal priority.
    pub fn spawn(&self, work: impl FnOnce() + Send + 'static) -> Result<Arc<Fiber>> {
        self.spawn_with_priority(work, Priority::Normal)
    }

    pub fn spawn_with_priority(
        &self,
        work: impl FnOnce() + Send + 'static,
        priority: Priority,
    ) -> Result<Arc<Fiber>> {
        let fiber = self.spawn_deferred(work, priority, None)?;
        self.submit(&fiber);
        Ok(fiber)
    }

    /// Create the fiber and its carrier thread without queueing it yet.
    /// Callers that must register the fiber somewhere first (scopes, the
    /// dispatcher) use this and then [`Self::submit`].
    pub(crate) fn spawn_deferred(
        &self,
        work: impl FnOnce() + Send + 'static,
        priority: Priority,
        stack_size: Option<usize>,
    ) -> Result<Arc<Fiber>> {
        let id: FiberId = self.core.next_fiber_id.fetch_add(1, Ordering::Relaxed);
        let fiber = Arc::new(Fiber::new(id, priority));
        *fiber.sched.lock() = Arc::downgrade(&self.core);

        // Structured concurrency: a fiber spawned from inside a fiber is a
        // child of the spawner.
        if let Some(parent) = super::current() {
            parent.adopt(&fiber);
        }

        let stack = stack_size.unwrap_or_else(|| self.core.config.resolved_stack_size());
        let carrier_fiber = Arc::clone(&fiber);
        let boxed: Box<dyn FnOnce() + Send> = Box::new(work);
        std::thread::Builder::new()
            .name(format!("weft-fiber-{}", id))
            .stack_size(stack)
            .spawn(move || carrier_main(carrier_fiber, boxed))
            .map_err(|e| RuntimeError::FiberCreateFailed(e.to_string()))?;

        self.core.fibers_created.fetch_add(1, Ordering::Relaxed);
        self.core.active_fibers.fetch_add(1, Ordering::SeqCst);
        Ok(fiber)
    }

    /// Queue a deferred fiber for execution.
    pub(crate) fn submit(&self, fiber: &Arc<Fiber>) {
        fiber.store_state(S_READY);
        self.core.enqueue(Arc::clone(fiber));
    }

    /// Re-queue a blocked or suspended fiber.
    pub fn unblock(&self, fiber: &Arc<Fiber>) -> bool {
        self.core.unblock(fiber)
    }

    /// Alias for [`Self::unblock`], matching the suspend/resume pairing.
    pub fn resume(&self, fiber: &Arc<Fiber>) -> bool {
        self.core.unblock(fiber)
    }

    pub fn active_fibers(&self) -> u64 {
        self.core.active_fibers.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.core.config
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            fibers_created: self.core.fibers_created.load(Ordering::Relaxed),
            fibers_completed: self.core.fibers_completed.load(Ordering::Relaxed),
            context_switches: self.core.context_switches.load(Ordering::Relaxed),
            steal_attempts: self.core.steal_attempts.load(Ordering::Relaxed),
            steal_successes: self.core.steal_successes.load(Ordering::Relaxed),
            io_events: self.core.io.io_events(),
            active_fibers: self.core.active_fibers.load(Ordering::SeqCst),
        }
    }
}

impl std::fmt::Debug for FiberScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FiberScheduler")
            .field("running", &self.is_running())
            .field("active_fibers", &self.active_fibers())
            .finish()
    }
}
