// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Dedicated I/O thread: readiness events and timers.
//!
//! One thread owns a `mio::Poll`. Fibers blocked on an fd or a deadline are
//! registered here; when the event fires, the thread calls the scheduler's
//! unblock path, which re-queues the fiber. Timers and readiness share that
//! single path: the poll timeout is simply the nearest timer deadline.

use super::scheduler::SchedulerCore;
use super::Fiber;
use crate::clock;
use crate::error::{Result, RuntimeError};
use dashmap::DashMap;
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

/// Token reserved for the cross-thread waker.
const WAKE_TOKEN: Token = Token(usize::MAX);

/// Poll timeout when no timer is pending; bounds shutdown latency.
const IDLE_POLL: Duration = Duration::from_millis(100);

#[cfg(unix)]
type RawFd = std::os::unix::io::RawFd;
#[cfg(not(unix))]
type RawFd = i32;

struct TimerEntry {
    deadline_ns: u64,
    fiber: Arc<Fiber>,
}

// BinaryHeap is a max-heap; order by reversed deadline for a min-heap.
impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline_ns == other.deadline_ns
    }
}
impl Eq for TimerEntry {}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other.deadline_ns.cmp(&self.deadline_ns)
    }
}

struct IoRegistration {
    #[cfg(unix)]
    fd: RawFd,
    fiber: Arc<Fiber>,
}

/// Readiness + timer driver owned by the scheduler.
pub(crate) struct IoDriver {
    registry: mio::Registry,
    waker: Arc<Waker>,
    /// Taken by the I/O thread at start.
    poll: Mutex<Option<Poll>>,
    timers: Mutex<BinaryHeap<TimerEntry>>,
    registrations: Arc<DashMap<usize, IoRegistration>>,
    next_token: AtomicUsize,
    running: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
    io_events: AtomicU64,
}

impl IoDriver {
    pub(crate) fn new() -> Result<Self> {
        let poll = Poll::new()
            .map_err(|e| RuntimeError::FiberCreateFailed(format!("io poll: {}", e)))?;
        let registry = poll
            .registry()
            .try_clone()
            .map_err(|e| RuntimeError::FiberCreateFailed(format!("io registry: {}", e)))?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)
            .map_err(|e| RuntimeError::FiberCreateFailed(format!("io waker: {}", e)))?;
        Ok(Self {
            registry,
            waker: Arc::new(waker),
            poll: Mutex::new(Some(poll)),
            timers: Mutex::new(BinaryHeap::new()),
            registrations: Arc::new(DashMap::new()),
            next_token: AtomicUsize::new(0),
            running: AtomicBool::new(false),
            handle: Mutex::new(None),
            io_events: AtomicU64::new(0),
        })
    }

    /// Spawn the I/O thread. No-op when already started or the poll was
    /// already consumed.
    pub(crate) fn start(self: &Arc<Self>, core: Weak<SchedulerCore>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(poll) = self.poll.lock().take() else {
            return;
        };
        let driver = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("weft-io".into())
            .spawn(move || driver.run(poll, core));
        match handle {
            Ok(h) => *self.handle.lock() = Some(h),
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                log::error!("io thread spawn failed: {}", e);
            }
        }
    }

    /// Stop the thread and hand back every fiber still parked on a timer.
    pub(crate) fn stop(&self) -> Vec<Arc<Fiber>> {
        if self.running.swap(false, Ordering::SeqCst) {
            let _ = self.waker.wake();
            if let Some(h) = self.handle.lock().take() {
                let _ = h.join();
            }
        }
        let mut parked: Vec<Arc<Fiber>> = self
            .timers
            .lock()
            .drain()
            .map(|t| t.fiber)
            .collect();
        for entry in self.registrations.iter() {
            parked.push(entry.value().fiber.clone());
        }
        self.registrations.clear();
        parked
    }

    /// Arm a deadline for `fiber`; it is unblocked when the deadline passes.
    pub(crate) fn register_timer(&self, deadline_ns: u64, fiber: Arc<Fiber>) {
        self.timers.lock().push(TimerEntry { deadline_ns, fiber });
        // Recompute the poll timeout.
        let _ = self.waker.wake();
    }

    /// Register interest in an fd; the fiber is unblocked on the first
    /// matching readiness event and the registration is consumed.
    #[cfg(unix)]
    pub(crate) fn register_io(
        &self,
        fd: RawFd,
        interest: Interest,
        fiber: Arc<Fiber>,
    ) -> Result<()> {
        use mio::unix::SourceFd;
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.registry
            .register(&mut SourceFd(&fd), Token(token), interest)
            .map_err(|e| RuntimeError::FiberCreateFailed(format!("io register: {}", e)))?;
        self.registrations
            .insert(token, IoRegistration { fd, fiber });
        Ok(())
    }

    #[cfg(not(unix))]
    pub(crate) fn register_io(
        &self,
        _fd: RawFd,
        _interest: Interest,
        _fiber: Arc<Fiber>,
    ) -> Result<()> {
        Err(RuntimeError::SchedulerNotFound)
    }

    pub(crate) fn io_events(&self) -> u64 {
        self.io_events.load(Ordering::Relaxed)
    }

    fn run(self: Arc<Self>, mut poll: Poll, core: Weak<SchedulerCore>) {
        let mut events = Events::with_capacity(128);
        log::debug!("io thread up");

        while self.running.load(Ordering::SeqCst) {
            let timeout = self
                .timers
                .lock()
                .peek()
                .map(|t| clock::until(t.deadline_ns).unwrap_or(Duration::ZERO))
                .unwrap_or(IDLE_POLL)
                .min(IDLE_POLL);

            if let Err(e) = poll.poll(&mut events, Some(timeout)) {
                if e.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                log::error!("io poll failed: {}", e);
                break;
            }

            for event in events.iter() {
                if event.token() == WAKE_TOKEN {
                    continue;
                }
                if let Some((_, reg)) = self.registrations.remove(&event.token().0) {
                    self.io_events.fetch_add(1, Ordering::Relaxed);
                    #[cfg(unix)]
                    {
                        use mio::unix::SourceFd;
                        let _ = poll.registry().deregister(&mut SourceFd(&reg.fd));
                    }
                    if let Some(core) = core.upgrade() {
                        core.unblock(&reg.fiber);
                    }
                }
            }

            self.fire_elapsed_timers(&core);
        }
        log::debug!("io thread down");
    }

    fn fire_elapsed_timers(&self, core: &Weak<SchedulerCore>) {
        let now = clock::monotonic_ns();
        loop {
            let fiber = {
                let mut timers = self.timers.lock();
                match timers.peek() {
                    Some(t) if t.deadline_ns <= now => timers.pop().map(|t| t.fiber),
                    _ => None,
                }
            };
            match fiber {
                Some(f) => {
                    if let Some(core) = core.upgrade() {
                        core.unblock(&f);
                    }
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::Priority;

    #[test]
    fn test_timer_heap_is_min_ordered() {
        let driver = IoDriver::new().expect("poll available");
        driver.register_timer(300, Arc::new(Fiber::new(3, Priority::Normal)));
        driver.register_timer(100, Arc::new(Fiber::new(1, Priority::Normal)));
        driver.register_timer(200, Arc::new(Fiber::new(2, Priority::Normal)));

        let timers = driver.timers.lock();
        assert_eq!(timers.peek().map(|t| t.deadline_ns), Some(100));
    }

    #[test]
    fn test_stop_returns_parked_fibers() {
        let driver = Arc::new(IoDriver::new().expect("poll available"));
        let f = Arc::new(Fiber::new(9, Priority::Normal));
        driver.register_timer(u64::MAX, f.clone());

        let parked = driver.stop();
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].id(), 9);
    }

    #[test]
    fn test_start_stop_cycle() {
        let driver = Arc::new(IoDriver::new().expect("poll available"));
        driver.start(Weak::new());
        std::thread::sleep(Duration::from_millis(10));
        let parked = driver.stop();
        assert!(parked.is_empty());
    }
}
