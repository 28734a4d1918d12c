// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Structured concurrency scopes.
//!
//! An [`AsyncScope`] owns the fibers spawned through it: destroying the
//! scope cancels and waits for every one of them, so no fiber outlives the
//! scope that created it. Nested scopes link their cancellation tokens;
//! cancelling a parent cancels its children transitively, never the other
//! way around.
//!
//! Spawned work is wrapped so that it (i) returns immediately when the
//! scope was cancelled before it started and (ii) removes itself from the
//! scope's fiber list on exit, whatever the exit path. The first error any
//! fiber reports is captured as the scope's `first_error`.

use crate::channel::Channel;
use crate::error::{Result, RuntimeError};
use crate::fiber::{self, Fiber, FiberScheduler, Priority};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Cancellation flag shared by a scope and its descendants.
///
/// Monotonic: once set it stays set. Cancelling a token cancels every
/// linked child token.
pub struct CancellationToken {
    cancelled: AtomicBool,
    children: Mutex<Vec<Weak<CancellationToken>>>,
}

impl CancellationToken {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            cancelled: AtomicBool::new(false),
            children: Mutex::new(Vec::new()),
        })
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        let children: Vec<Arc<CancellationToken>> = {
            let guard = self.children.lock();
            guard.iter().filter_map(Weak::upgrade).collect()
        };
        for child in children {
            child.cancel();
        }
    }

    fn link_child(&self, child: &Arc<CancellationToken>) {
        self.children.lock().push(Arc::downgrade(child));
        if self.is_cancelled() {
            child.cancel();
        }
    }
}

struct ScopeInner {
    scheduler: FiberScheduler,
    fibers: Mutex<Vec<Arc<Fiber>>>,
    empty_cv: Condvar,
    token: Arc<CancellationToken>,
    parent: Weak<ScopeInner>,
    children: Mutex<Vec<Weak<ScopeInner>>>,
    has_error: AtomicBool,
    first_error: Mutex<Option<String>>,
    disposed: AtomicBool,
    total_spawned: AtomicU64,
    total_completed: AtomicU64,
    total_failed: AtomicU64,
}

impl ScopeInner {
    fn cancel(&self) {
        self.token.cancel();
        let fibers: Vec<Arc<Fiber>> = self.fibers.lock().clone();
        for f in fibers {
            f.cancel();
        }
        let children: Vec<Arc<ScopeInner>> = {
            let guard = self.children.lock();
            guard.iter().filter_map(Weak::upgrade).collect()
        };
        for child in children {
            child.cancel();
        }
    }

    fn remove_fiber(&self, id: u64) {
        let mut fibers = self.fibers.lock();
        fibers.retain(|f| f.id() != id);
        if fibers.is_empty() {
            self.empty_cv.notify_all();
        }
    }

    fn record_outcome(&self, result: &Result<()>) {
        match result {
            Ok(()) | Err(RuntimeError::Cancelled) => {
                self.total_completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.total_failed.fetch_add(1, Ordering::Relaxed);
                self.has_error.store(true, Ordering::SeqCst);
                let mut first = self.first_error.lock();
                if first.is_none() {
                    *first = Some(e.to_string());
                }
            }
        }
    }
}

/// Lifetime container for a group of fibers.
pub struct AsyncScope {
    inner: Arc<ScopeInner>,
}

impl AsyncScope {
    /// Root scope on the given scheduler.
    pub fn new(scheduler: FiberScheduler) -> Self {
        Self::build(scheduler, None)
    }

    /// Child scope whose cancellation token is linked to this scope's.
    pub fn nested(&self) -> Self {
        Self::build(self.inner.scheduler.clone(), Some(&self.inner))
    }

    fn build(scheduler: FiberScheduler, parent: Option<&Arc<ScopeInner>>) -> Self {
        let token = CancellationToken::new();
        let inner = Arc::new(ScopeInner {
            scheduler,
            fibers: Mutex::new(Vec::new()),
            empty_cv: Condvar::new(),
            token: token.clone(),
            parent: parent.map(Arc::downgrade).unwrap_or_default(),
            children: Mutex::new(Vec::new()),
            has_error: AtomicBool::new(false),
            first_error: Mutex::new(None),
            disposed: AtomicBool::new(false),
            total_spawned: AtomicU64::new(0),
            total_completed: AtomicU64::new(0),
            total_failed: AtomicU64::new(0),
        });
        if let Some(parent) = parent {
            parent.token.link_child(&token);
            parent.children.lock().push(Arc::downgrade(&inner));
        }
        Self { inner }
    }

    /// Spawn a fiber owned by this scope at normal priority.
    pub fn spawn(
        &self,
        work: impl FnOnce() -> Result<()> + Send + 'static,
    ) -> Result<Arc<Fiber>> {
        self.spawn_with_priority(work, Priority::Normal)
    }

    pub fn spawn_with_priority(
        &self,
        work: impl FnOnce() -> Result<()> + Send + 'static,
        priority: Priority,
    ) -> Result<Arc<Fiber>> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(RuntimeError::Cancelled);
        }
        let inner = Arc::clone(&self.inner);
        let fiber = self.inner.scheduler.spawn_deferred(
            move || {
                let result = if inner.token.is_cancelled() {
                    Err(RuntimeError::Cancelled)
                } else {
                    work()
                };
                inner.record_outcome(&result);
                if let Err(e) = &result {
                    if *e != RuntimeError::Cancelled {
                        fiber::fail_current(e.to_string());
                    }
                }
                if let Some(me) = fiber::current() {
                    inner.remove_fiber(me.id());
                }
            },
            priority,
            None,
        )?;

        self.inner.fibers.lock().push(fiber.clone());
        self.inner.total_spawned.fetch_add(1, Ordering::Relaxed);
        self.inner.scheduler.submit(&fiber);
        Ok(fiber)
    }

    /// Wait until every fiber spawned through this scope has finished.
    ///
    /// Yields when called from a fiber, waits on a condvar otherwise.
    /// Keeps waiting through cancellation so teardown can rely on it.
    pub fn wait_all(&self) {
        if fiber::current().is_some() {
            while !self.inner.fibers.lock().is_empty() {
                fiber::yield_now_uncancellable();
            }
        } else {
            let mut fibers = self.inner.fibers.lock();
            while !fibers.is_empty() {
                self.inner.empty_cv.wait(&mut fibers);
            }
        }
    }

    /// Bounded wait; `false` on timeout. Does not cancel anything.
    pub fn wait_all_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        if fiber::current().is_some() {
            while !self.inner.fibers.lock().is_empty() {
                if Instant::now() >= deadline {
                    return self.inner.fibers.lock().is_empty();
                }
                fiber::yield_now_uncancellable();
            }
            true
        } else {
            let mut fibers = self.inner.fibers.lock();
            while !fibers.is_empty() {
                if self.inner.empty_cv.wait_until(&mut fibers, deadline).timed_out() {
                    return fibers.is_empty();
                }
            }
            true
        }
    }

    /// Cancel the scope: the token, every current fiber, every child scope.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    pub fn cancellation_token(&self) -> Arc<CancellationToken> {
        self.inner.token.clone()
    }

    /// Whether this scope was created with [`Self::nested`] and its parent
    /// is still alive.
    pub fn is_nested(&self) -> bool {
        self.inner.parent.upgrade().is_some()
    }

    /// Cancel, wait for every fiber, mark disposed. Idempotent: repeated
    /// calls block until the scope is empty and return.
    pub fn destroy(&self) {
        self.inner.disposed.store(true, Ordering::SeqCst);
        self.inner.cancel();
        self.wait_all();
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    pub fn has_error(&self) -> bool {
        self.inner.has_error.load(Ordering::SeqCst)
    }

    /// First non-cancellation error reported by a fiber in this scope.
    pub fn first_error(&self) -> Option<String> {
        self.inner.first_error.lock().clone()
    }

    /// Live fiber count.
    pub fn len(&self) -> usize {
        self.inner.fibers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.fibers.lock().is_empty()
    }

    /// (spawned, completed, failed) totals.
    pub fn totals(&self) -> (u64, u64, u64) {
        (
            self.inner.total_spawned.load(Ordering::Relaxed),
            self.inner.total_completed.load(Ordering::Relaxed),
            self.inner.total_failed.load(Ordering::Relaxed),
        )
    }

    // ===================================================================
    // Convenience patterns
    // ===================================================================

    /// Spawn every task, wait for all of them.
    pub fn parallel_for(
        &self,
        tasks: Vec<Box<dyn FnOnce() -> Result<()> + Send>>,
    ) -> Result<()> {
        for task in tasks {
            self.spawn(task)?;
        }
        self.wait_all();
        Ok(())
    }

    /// Run every task; the first to succeed wins and the rest are
    /// cancelled. Returns the winner's index and value.
    pub fn race<T: Send + 'static>(
        &self,
        tasks: Vec<Box<dyn FnOnce() -> Result<T> + Send>>,
    ) -> Result<(usize, T)> {
        let winner_index = Arc::new(AtomicUsize::new(usize::MAX));
        let winner_value: Arc<Mutex<Option<T>>> = Arc::new(Mutex::new(None));

        for (i, task) in tasks.into_iter().enumerate() {
            let index = Arc::clone(&winner_index);
            let value = Arc::clone(&winner_value);
            let inner = Arc::clone(&self.inner);
            self.spawn(move || match task() {
                Ok(v) => {
                    if index
                        .compare_exchange(usize::MAX, i, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                    {
                        *value.lock() = Some(v);
                        inner.cancel();
                    }
                    Ok(())
                }
                Err(e) => Err(e),
            })?;
        }
        self.wait_all();

        let index = winner_index.load(Ordering::SeqCst);
        let value = winner_value.lock().take();
        match value {
            Some(v) if index != usize::MAX => Ok((index, v)),
            _ => Err(RuntimeError::JoinStrategyUnsatisfied),
        }
    }

    /// One fiber per input; results are folded in completion order as they
    /// arrive.
    pub fn map_reduce<I, O, A>(
        &self,
        inputs: Vec<I>,
        mapper: Arc<dyn Fn(I) -> O + Send + Sync>,
        mut reducer: impl FnMut(A, O) -> A,
        initial: A,
    ) -> Result<A>
    where
        I: Send + 'static,
        O: Send + 'static,
    {
        let results: Channel<O> = Channel::unbounded();
        let n = inputs.len();
        for input in inputs {
            let mapper = Arc::clone(&mapper);
            let tx = results.clone();
            self.spawn(move || {
                let out = mapper(input);
                tx.send(out)
            })?;
        }

        let mut acc = initial;
        for _ in 0..n {
            let v = results.recv()?;
            acc = reducer(acc, v);
        }
        self.wait_all();
        Ok(acc)
    }
}

impl Drop for AsyncScope {
    fn drop(&mut self) {
        if !self.inner.disposed.load(Ordering::SeqCst) {
            self.destroy();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;

    fn scheduler() -> FiberScheduler {
        let s = FiberScheduler::new(SchedulerConfig {
            num_workers: 2,
            ..Default::default()
        })
        .expect("scheduler");
        s.start();
        s
    }

    #[test]
    fn test_wait_all_until_empty() {
        let s = scheduler();
        {
            let scope = AsyncScope::new(s.clone());
            let hits = Arc::new(AtomicUsize::new(0));
            for _ in 0..8 {
                let h = hits.clone();
                scope
                    .spawn(move || {
                        h.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .expect("spawn");
            }
            scope.wait_all();
            assert!(scope.is_empty());
            assert_eq!(hits.load(Ordering::SeqCst), 8);
            assert_eq!(scope.totals().0, 8);
        }
        s.stop();
    }

    #[test]
    fn test_cancel_reaches_spawned_fibers() {
        let s = scheduler();
        {
            let scope = AsyncScope::new(s.clone());
            for _ in 0..4 {
                scope
                    .spawn(|| loop {
                        fiber::yield_now()?;
                    })
                    .expect("spawn");
            }
            std::thread::sleep(Duration::from_millis(20));
            scope.cancel();
            assert!(scope.wait_all_timeout(Duration::from_secs(10)));
            assert!(scope.is_empty());
        }
        s.stop();
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let s = scheduler();
        let scope = AsyncScope::new(s.clone());
        scope
            .spawn(|| loop {
                fiber::yield_now()?;
            })
            .expect("spawn");
        scope.destroy();
        scope.destroy();
        assert!(scope.is_disposed());
        assert!(scope.is_empty());
        assert!(scope.spawn(|| Ok(())).is_err());
        s.stop();
    }

    #[test]
    fn test_first_error_captured() {
        let s = scheduler();
        {
            let scope = AsyncScope::new(s.clone());
            scope
                .spawn(|| Err(RuntimeError::OutOfMemory))
                .expect("spawn");
            scope.wait_all();
            assert!(scope.has_error());
            assert_eq!(scope.first_error().as_deref(), Some("out of pool memory"));
            assert_eq!(scope.totals().2, 1);
        }
        s.stop();
    }

    #[test]
    fn test_nested_cancellation_flows_down() {
        let s = scheduler();
        {
            let parent = AsyncScope::new(s.clone());
            let child = parent.nested();
            let grandchild = child.nested();

            parent.cancel();
            assert!(child.is_cancelled());
            assert!(grandchild.is_cancelled());

            // Cancelled scopes reject fresh work at the wrapper.
            let f = child.spawn(|| Ok(())).expect("spawn allowed");
            assert!(f.wait_done(Some(Duration::from_secs(5))));
            child.wait_all();
            assert_eq!(child.totals(), (1, 1, 0));
        }
        s.stop();
    }

    #[test]
    fn test_child_cancel_leaves_parent_alone() {
        let s = scheduler();
        {
            let parent = AsyncScope::new(s.clone());
            let child = parent.nested();
            assert!(child.is_nested());
            assert!(!parent.is_nested());

            child.cancel();
            assert!(child.is_cancelled());
            assert!(!parent.is_cancelled());
        }
        s.stop();
    }

    #[test]
    fn test_parallel_for() {
        let s = scheduler();
        {
            let scope = AsyncScope::new(s.clone());
            let sum = Arc::new(AtomicUsize::new(0));
            let tasks: Vec<Box<dyn FnOnce() -> Result<()> + Send>> = (1..=5)
                .map(|i| {
                    let sum = sum.clone();
                    Box::new(move || {
                        sum.fetch_add(i, Ordering::SeqCst);
                        Ok(())
                    }) as Box<dyn FnOnce() -> Result<()> + Send>
                })
                .collect();
            scope.parallel_for(tasks).expect("spawn");
            assert_eq!(sum.load(Ordering::SeqCst), 15);
        }
        s.stop();
    }

    #[test]
    fn test_race_first_success_wins() {
        let s = scheduler();
        {
            let scope = AsyncScope::new(s.clone());
            let tasks: Vec<Box<dyn FnOnce() -> Result<&'static str> + Send>> = vec![
                Box::new(|| {
                    fiber::sleep(Duration::from_millis(200))?;
                    Ok("slow")
                }),
                Box::new(|| {
                    fiber::sleep(Duration::from_millis(5))?;
                    Ok("fast")
                }),
            ];
            let started = Instant::now();
            let (index, value) = scope.race(tasks).expect("one winner");
            assert_eq!(index, 1);
            assert_eq!(value, "fast");
            assert!(started.elapsed() < Duration::from_millis(150));
        }
        s.stop();
    }

    #[test]
    fn test_race_all_failures() {
        let s = scheduler();
        {
            let scope = AsyncScope::new(s.clone());
            let tasks: Vec<Box<dyn FnOnce() -> Result<i32> + Send>> = vec![
                Box::new(|| Err(RuntimeError::OutOfMemory)),
                Box::new(|| Err(RuntimeError::Timeout)),
            ];
            assert_eq!(
                scope.race(tasks).unwrap_err(),
                RuntimeError::JoinStrategyUnsatisfied
            );
        }
        s.stop();
    }

    #[test]
    fn test_map_reduce() {
        let s = scheduler();
        {
            let scope = AsyncScope::new(s.clone());
            let total = scope
                .map_reduce(
                    vec![1, 2, 3, 4, 5],
                    Arc::new(|x: i32| x * x),
                    |acc: i32, v| acc + v,
                    0,
                )
                .expect("mappers run");
            assert_eq!(total, 55);
        }
        s.stop();
    }
}
