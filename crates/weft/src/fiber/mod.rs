// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Cooperative fibers and their scheduler.
//!
//! A fiber is a cooperative task with its own stack, scheduled M:N over the
//! worker pool in [`scheduler`]. The portable context mechanism is a carrier
//! thread parked behind a two-party gate: a worker "context switch" grants
//! the gate and waits for it back, so exactly one side runs at any instant.
//! Every scheduler-observable property of a register-switching fiber holds:
//! one run queue at a time, `Running` means exactly one worker owns it,
//! suspension points are the only places control changes hands.
//!
//! # States
//!
//! ```text
//! New -> Ready -> Running -> { Ready | Suspended | Blocked | Done | Error }
//!                    ^            |        |
//!                    +---- unblock/resume -+
//! ```
//!
//! Internally the two parked states have a `*Pending` precursor: the fiber
//! marks itself pending and yields the gate; the worker completes the
//! transition after the gate is back. A concurrent wakeup lands on the
//! pending value and the worker requeues instead of parking, which closes
//! the lost-wakeup window without a lock.
//!
//! # Cancellation
//!
//! Monotonic and cooperative. Cancelling a parked fiber re-queues it; the
//! suspension-point call it was parked in returns `Err(Cancelled)` and the
//! work unwinds normally. Cancellation cascades to all descendants.

pub mod io;
pub mod scheduler;

pub use scheduler::{FiberScheduler, SchedulerStats};

use crate::clock;
use crate::error::{Result, RuntimeError};
use parking_lot::{Condvar, Mutex};
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

pub type FiberId = u64;

/// Scheduling priority hint. Schedulers may honor or ignore it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Priority {
    Idle = 0,
    Low = 25,
    Normal = 50,
    High = 75,
    Critical = 100,
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

/// Externally visible fiber states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberState {
    New,
    Ready,
    Running,
    Suspended,
    Blocked,
    Done,
    Error,
}

// Raw state values. BLOCK_PENDING / SUSPEND_PENDING are internal precursors
// reported as Blocked / Suspended.
pub(crate) const S_NEW: u8 = 0;
pub(crate) const S_READY: u8 = 1;
pub(crate) const S_RUNNING: u8 = 2;
pub(crate) const S_SUSPENDED: u8 = 3;
pub(crate) const S_BLOCKED: u8 = 4;
pub(crate) const S_DONE: u8 = 5;
pub(crate) const S_ERROR: u8 = 6;
pub(crate) const S_BLOCK_PENDING: u8 = 7;
pub(crate) const S_SUSPEND_PENDING: u8 = 8;

/// Two-party handoff between a fiber's carrier thread and the worker
/// currently running it. At most one grant is ever outstanding: requeues
/// happen only after the granting worker regained the gate.
pub(crate) struct Gate {
    owner: Mutex<GateOwner>,
    cv: Condvar,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum GateOwner {
    Scheduler,
    Carrier,
}

impl Gate {
    fn new() -> Self {
        Self {
            owner: Mutex::new(GateOwner::Scheduler),
            cv: Condvar::new(),
        }
    }

    /// Worker side: hand control to the carrier, wait for it back.
    ///
    /// Tolerates a carrier still mid-park from its previous yield (possible
    /// when a wakeup raced the park): the grant waits for the park to
    /// complete first.
    pub(crate) fn run_until_yield(&self) {
        let mut owner = self.owner.lock();
        while *owner != GateOwner::Scheduler {
            self.cv.wait(&mut owner);
        }
        *owner = GateOwner::Carrier;
        self.cv.notify_all();
        while *owner != GateOwner::Scheduler {
            self.cv.wait(&mut owner);
        }
    }

    /// Carrier side: park until the first grant.
    pub(crate) fn wait_for_grant(&self) {
        let mut owner = self.owner.lock();
        while *owner != GateOwner::Carrier {
            self.cv.wait(&mut owner);
        }
    }

    /// Carrier side: give control back, park until re-granted.
    fn yield_to_scheduler(&self) {
        let mut owner = self.owner.lock();
        *owner = GateOwner::Scheduler;
        self.cv.notify_all();
        while *owner != GateOwner::Carrier {
            self.cv.wait(&mut owner);
        }
    }

    /// Carrier side, terminal: give control back and never wait again.
    pub(crate) fn release_to_scheduler(&self) {
        let mut owner = self.owner.lock();
        *owner = GateOwner::Scheduler;
        self.cv.notify_all();
    }
}

/// A cooperative task record.
///
/// The record is shared between the scheduler, the carrier thread, and any
/// waiter holding it for a later `unblock`/`resume`.
pub struct Fiber {
    id: FiberId,
    state: AtomicU8,
    priority: Priority,
    cancelled: AtomicBool,
    pub(crate) gate: Gate,
    error: Mutex<Option<String>>,
    parent: Mutex<Weak<Fiber>>,
    children: Mutex<Vec<Weak<Fiber>>>,
    pub(crate) sched: Mutex<Weak<scheduler::SchedulerCore>>,
    switch_count: AtomicU64,
    cpu_time_ns: AtomicU64,
    done: Mutex<bool>,
    done_cv: Condvar,
    /// Completion accounted exactly once, even when a finished fiber is
    /// still referenced by a timer heap or a shutdown drain.
    accounted: AtomicBool,
}

impl Fiber {
    pub(crate) fn new(id: FiberId, priority: Priority) -> Self {
        Self {
            id,
            state: AtomicU8::new(S_NEW),
            priority,
            cancelled: AtomicBool::new(false),
            gate: Gate::new(),
            error: Mutex::new(None),
            parent: Mutex::new(Weak::new()),
            children: Mutex::new(Vec::new()),
            sched: Mutex::new(Weak::new()),
            switch_count: AtomicU64::new(0),
            cpu_time_ns: AtomicU64::new(0),
            done: Mutex::new(false),
            done_cv: Condvar::new(),
            accounted: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> FiberId {
        self.id
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Externally visible state (pending precursors map to their target).
    pub fn state(&self) -> FiberState {
        match self.state.load(Ordering::SeqCst) {
            S_NEW => FiberState::New,
            S_READY => FiberState::Ready,
            S_RUNNING => FiberState::Running,
            S_SUSPENDED | S_SUSPEND_PENDING => FiberState::Suspended,
            S_BLOCKED | S_BLOCK_PENDING => FiberState::Blocked,
            S_DONE => FiberState::Done,
            _ => FiberState::Error,
        }
    }

    pub(crate) fn raw_state(&self) -> u8 {
        self.state.load(Ordering::SeqCst)
    }

    pub(crate) fn store_state(&self, s: u8) {
        self.state.store(s, Ordering::SeqCst);
    }

    pub(crate) fn cas_state(&self, from: u8, to: u8) -> bool {
        self.state
            .compare_exchange(from, to, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Error message recorded by the work function or a panic, if any.
    pub fn error(&self) -> Option<String> {
        self.error.lock().clone()
    }

    pub(crate) fn set_error(&self, msg: String) {
        let mut slot = self.error.lock();
        if slot.is_none() {
            *slot = Some(msg);
        }
    }

    pub fn switch_count(&self) -> u64 {
        self.switch_count.load(Ordering::Relaxed)
    }

    pub fn cpu_time_ns(&self) -> u64 {
        self.cpu_time_ns.load(Ordering::Relaxed)
    }

    pub(crate) fn note_switch(&self, elapsed_ns: u64) {
        self.switch_count.fetch_add(1, Ordering::Relaxed);
        self.cpu_time_ns.fetch_add(elapsed_ns, Ordering::Relaxed);
    }

    pub fn parent(&self) -> Option<Arc<Fiber>> {
        self.parent.lock().upgrade()
    }

    pub(crate) fn adopt(self: &Arc<Self>, child: &Arc<Fiber>) {
        *child.parent.lock() = Arc::downgrade(self);
        self.children.lock().push(Arc::downgrade(child));
    }

    /// Cancel this fiber and every descendant. Idempotent, monotonic.
    ///
    /// A parked fiber is re-queued so its pending suspension-point call can
    /// observe the flag and return `Err(Cancelled)`.
    pub fn cancel(self: &Arc<Self>) {
        self.cancelled.store(true, Ordering::SeqCst);
        let children: Vec<Arc<Fiber>> = {
            let guard = self.children.lock();
            guard.iter().filter_map(Weak::upgrade).collect()
        };
        for child in children {
            child.cancel();
        }
        if let Some(core) = self.sched.lock().upgrade() {
            core.unblock(self);
        }
    }

    /// Park the calling (external) thread until the fiber reaches
    /// `Done`/`Error`. Returns `false` on timeout.
    ///
    /// Must not be called from fiber context; a fiber waiting on another
    /// fiber should yield-loop instead.
    pub fn wait_done(&self, timeout: Option<Duration>) -> bool {
        let mut done = self.done.lock();
        match timeout {
            None => {
                while !*done {
                    self.done_cv.wait(&mut done);
                }
                true
            }
            Some(t) => {
                let deadline = std::time::Instant::now() + t;
                while !*done {
                    if self.done_cv.wait_until(&mut done, deadline).timed_out() {
                        return *done;
                    }
                }
                true
            }
        }
    }

    pub(crate) fn mark_finished(&self) {
        let mut done = self.done.lock();
        *done = true;
        self.done_cv.notify_all();
    }

    /// True exactly once, on the first call after the fiber finished.
    pub(crate) fn take_accounting(&self) -> bool {
        !self.accounted.swap(true, Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("priority", &self.priority)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

thread_local! {
    static CURRENT_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
}

/// The fiber the calling thread is carrying, if any.
pub fn current() -> Option<Arc<Fiber>> {
    CURRENT_FIBER.with(|c| c.borrow().clone())
}

pub(crate) fn set_current(fiber: Option<Arc<Fiber>>) {
    CURRENT_FIBER.with(|c| *c.borrow_mut() = fiber);
}

/// Whether the current fiber has been cancelled. `false` outside fiber
/// context.
pub fn check_cancelled() -> bool {
    current().is_some_and(|f| f.is_cancelled())
}

/// Record an error on the current fiber; it will finish in the `Error`
/// state. First message wins.
pub fn fail_current(msg: impl Into<String>) {
    if let Some(f) = current() {
        f.set_error(msg.into());
    }
}

/// Cooperative yield: go back to the scheduler, resume later.
///
/// Returns `Err(Cancelled)` when cancellation was observed on resume.
/// Outside fiber context this degrades to an OS-thread yield.
pub fn yield_now() -> Result<()> {
    match current() {
        None => {
            std::thread::yield_now();
            Ok(())
        }
        Some(f) => {
            f.store_state(S_READY);
            f.gate.yield_to_scheduler();
            if f.is_cancelled() {
                Err(RuntimeError::Cancelled)
            } else {
                Ok(())
            }
        }
    }
}

/// Yield that does not observe cancellation. Internal teardown paths
/// (scope wait-after-cancel) use this to keep draining.
pub(crate) fn yield_now_uncancellable() {
    match current() {
        None => std::thread::yield_now(),
        Some(f) => {
            f.store_state(S_READY);
            f.gate.yield_to_scheduler();
        }
    }
}

/// First half of a block: flip the current fiber to the block-pending
/// state *before* it is published anywhere (waiter queue, timer, io
/// registration). From this point on `unblock` lands on the pending state,
/// so a wakeup can never slip between publication and the park.
///
/// Must be paired with [`park_commit`]. Fails fast when already cancelled.
pub(crate) fn park_prepare(f: &Arc<Fiber>) -> Result<()> {
    if f.is_cancelled() {
        return Err(RuntimeError::Cancelled);
    }
    f.store_state(S_BLOCK_PENDING);
    Ok(())
}

/// Second half of a block: hand the gate back and park until re-granted.
pub(crate) fn park_commit(f: &Arc<Fiber>) -> Result<()> {
    f.gate.yield_to_scheduler();
    if f.is_cancelled() {
        Err(RuntimeError::Cancelled)
    } else {
        Ok(())
    }
}

/// Abandon a prepared park without yielding; the fiber keeps running.
///
/// If a wakeup already flipped the pending state to ready, the overwrite is
/// harmless: the fiber is running right now and requeues itself at its next
/// natural yield.
pub(crate) fn park_abort(f: &Arc<Fiber>) {
    f.store_state(S_RUNNING);
}

/// Park the current fiber as `Suspended` until `resume`.
///
/// The resumer is expected to hold the `Arc<Fiber>` handed out at spawn.
pub fn suspend_current() -> Result<()> {
    let Some(f) = current() else {
        return Err(RuntimeError::SchedulerNotFound);
    };
    if f.is_cancelled() {
        return Err(RuntimeError::Cancelled);
    }
    f.store_state(S_SUSPEND_PENDING);
    park_commit(&f)
}

/// Cooperative sleep. Registers a deadline with the I/O thread and blocks;
/// the timer fires through the same unblock path as readiness events.
///
/// Outside fiber context this is a plain thread sleep.
pub fn sleep(duration: Duration) -> Result<()> {
    match current() {
        None => {
            std::thread::sleep(duration);
            Ok(())
        }
        Some(f) => {
            let core = f
                .sched
                .lock()
                .upgrade()
                .ok_or(RuntimeError::SchedulerNotFound)?;
            let deadline = clock::monotonic_ns().saturating_add(duration.as_nanos() as u64);
            park_prepare(&f)?;
            core.io().register_timer(deadline, f.clone());
            park_commit(&f)
        }
    }
}

/// Millisecond convenience wrapper over [`sleep`].
pub fn sleep_ms(ms: u64) -> Result<()> {
    sleep(Duration::from_millis(ms))
}

/// Block the current fiber on a readable fd. Unix only.
#[cfg(unix)]
pub fn wait_readable(fd: std::os::unix::io::RawFd) -> Result<()> {
    wait_io(fd, mio::Interest::READABLE)
}

/// Block the current fiber on a writable fd. Unix only.
#[cfg(unix)]
pub fn wait_writable(fd: std::os::unix::io::RawFd) -> Result<()> {
    wait_io(fd, mio::Interest::WRITABLE)
}

#[cfg(unix)]
fn wait_io(fd: std::os::unix::io::RawFd, interest: mio::Interest) -> Result<()> {
    let Some(f) = current() else {
        return Err(RuntimeError::SchedulerNotFound);
    };
    let core = f
        .sched
        .lock()
        .upgrade()
        .ok_or(RuntimeError::SchedulerNotFound)?;
    park_prepare(&f)?;
    if let Err(e) = core.io().register_io(fd, interest, f.clone()) {
        park_abort(&f);
        return Err(e);
    }
    park_commit(&f)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_mapping_hides_pending() {
        let f = Fiber::new(1, Priority::Normal);
        f.store_state(S_BLOCK_PENDING);
        assert_eq!(f.state(), FiberState::Blocked);
        f.store_state(S_SUSPEND_PENDING);
        assert_eq!(f.state(), FiberState::Suspended);
    }

    #[test]
    fn test_cancel_is_idempotent_and_cascades() {
        let parent = Arc::new(Fiber::new(1, Priority::Normal));
        let child = Arc::new(Fiber::new(2, Priority::Normal));
        parent.adopt(&child);

        parent.cancel();
        parent.cancel();
        assert!(parent.is_cancelled());
        assert!(child.is_cancelled());
    }

    #[test]
    fn test_first_error_wins() {
        let f = Fiber::new(1, Priority::Normal);
        f.set_error("first".into());
        f.set_error("second".into());
        assert_eq!(f.error().as_deref(), Some("first"));
    }

    #[test]
    fn test_yield_outside_fiber_context() {
        assert!(current().is_none());
        yield_now().expect("plain-thread yield succeeds");
        assert!(!check_cancelled());
    }

    #[test]
    fn test_wait_done_timeout() {
        let f = Fiber::new(1, Priority::Normal);
        assert!(!f.wait_done(Some(Duration::from_millis(5))));
        f.mark_finished();
        assert!(f.wait_done(Some(Duration::from_millis(5))));
        assert!(f.wait_done(None));
    }
}
