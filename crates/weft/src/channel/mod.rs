// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Fiber-aware FIFO channels.
//!
//! Bounded or unbounded typed queues with blocking, non-blocking, and
//! timeout send/receive. Blocking inside a fiber suspends the fiber (the
//! channel keeps the fiber in a waiter queue and the counterpart operation
//! re-queues it through the scheduler); on a plain thread the same
//! operation waits on a condvar. A closed channel fails further sends but
//! drains buffered items to receivers before reporting `ChannelClosed`.
//!
//! A channel send that returns before a receive returns happens-before that
//! receive (the state mutex orders them).

use crate::clock;
use crate::error::{Result, RuntimeError};
use crate::fiber::{self, Fiber};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Failed non-blocking send, handing the value back.
#[derive(Debug)]
pub enum TrySendError<T> {
    Full(T),
    Closed(T),
}

impl<T> TrySendError<T> {
    /// The rejected value.
    pub fn into_inner(self) -> T {
        match self {
            Self::Full(v) | Self::Closed(v) => v,
        }
    }

    /// The matching taxonomy error.
    pub fn error(&self) -> RuntimeError {
        match self {
            Self::Full(_) => RuntimeError::ChannelFull,
            Self::Closed(_) => RuntimeError::ChannelClosed,
        }
    }
}

struct ChanState<T> {
    queue: VecDeque<T>,
    closed: bool,
    waiting_senders: VecDeque<Arc<Fiber>>,
    waiting_receivers: VecDeque<Arc<Fiber>>,
    total_sends: u64,
    total_recvs: u64,
    total_blocks: u64,
}

struct ChanInner<T> {
    capacity: Option<usize>,
    state: Mutex<ChanState<T>>,
    send_cv: Condvar,
    recv_cv: Condvar,
}

/// Typed FIFO channel. Cheap to clone; clones share the queue.
pub struct Channel<T> {
    inner: Arc<ChanInner<T>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send> Channel<T> {
    /// Bounded channel; sends block once `capacity` items are queued.
    pub fn bounded(capacity: usize) -> Self {
        Self::build(Some(capacity.max(1)))
    }

    /// Unbounded channel; sends never block on capacity.
    pub fn unbounded() -> Self {
        Self::build(None)
    }

    fn build(capacity: Option<usize>) -> Self {
        Self {
            inner: Arc::new(ChanInner {
                capacity,
                state: Mutex::new(ChanState {
                    queue: VecDeque::new(),
                    closed: false,
                    waiting_senders: VecDeque::new(),
                    waiting_receivers: VecDeque::new(),
                    total_sends: 0,
                    total_recvs: 0,
                    total_blocks: 0,
                }),
                send_cv: Condvar::new(),
                recv_cv: Condvar::new(),
            }),
        }
    }

    /// Blocking send. Fails with `ChannelClosed` once closed; observes
    /// cancellation when called from a fiber.
    pub fn send(&self, value: T) -> Result<()> {
        self.send_deadline(value, None)
    }

    /// Send with a timeout; `Timeout` after the deadline.
    pub fn send_timeout(&self, value: T, timeout: Duration) -> Result<()> {
        self.send_deadline(value, Some(Instant::now() + timeout))
    }

    fn send_deadline(&self, value: T, deadline: Option<Instant>) -> Result<()> {
        loop {
            let mut st = self.inner.state.lock();
            if st.closed {
                return Err(RuntimeError::ChannelClosed);
            }
            if self.inner.capacity.is_none_or(|c| st.queue.len() < c) {
                st.queue.push_back(value);
                st.total_sends += 1;
                wake_one(&mut st.waiting_receivers);
                self.inner.recv_cv.notify_one();
                return Ok(());
            }

            if let Some(d) = deadline {
                if Instant::now() >= d {
                    return Err(RuntimeError::Timeout);
                }
            }

            match fiber::current() {
                Some(f) => {
                    // Pending state first, publication second: a wakeup can
                    // never land between them.
                    fiber::park_prepare(&f)?;
                    st.waiting_senders.push_back(f.clone());
                    st.total_blocks += 1;
                    if let Some(d) = deadline {
                        arm_fiber_timer(&f, d);
                    }
                    drop(st);
                    let parked = fiber::park_commit(&f);
                    self.remove_waiter(&f);
                    parked?;
                }
                None => {
                    st.total_blocks += 1;
                    match deadline {
                        Some(d) => {
                            self.inner.send_cv.wait_until(&mut st, d);
                        }
                        None => self.inner.send_cv.wait(&mut st),
                    }
                }
            }
            // Loop: another sender may have taken the slot we were woken for.
        }
    }

    /// Non-blocking send.
    pub fn try_send(&self, value: T) -> std::result::Result<(), TrySendError<T>> {
        let mut st = self.inner.state.lock();
        if st.closed {
            return Err(TrySendError::Closed(value));
        }
        if self.inner.capacity.is_some_and(|c| st.queue.len() >= c) {
            return Err(TrySendError::Full(value));
        }
        st.queue.push_back(value);
        st.total_sends += 1;
        wake_one(&mut st.waiting_receivers);
        self.inner.recv_cv.notify_one();
        Ok(())
    }

    /// Blocking receive. Drains buffered items after close, then reports
    /// `ChannelClosed`.
    pub fn recv(&self) -> Result<T> {
        self.recv_deadline(None)
    }

    /// Receive with a timeout; `Timeout` after the deadline.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<T> {
        self.recv_deadline(Some(Instant::now() + timeout))
    }

    fn recv_deadline(&self, deadline: Option<Instant>) -> Result<T> {
        loop {
            let mut st = self.inner.state.lock();
            if let Some(v) = st.queue.pop_front() {
                st.total_recvs += 1;
                wake_one(&mut st.waiting_senders);
                self.inner.send_cv.notify_one();
                return Ok(v);
            }
            if st.closed {
                return Err(RuntimeError::ChannelClosed);
            }

            if let Some(d) = deadline {
                if Instant::now() >= d {
                    return Err(RuntimeError::Timeout);
                }
            }

            match fiber::current() {
                Some(f) => {
                    fiber::park_prepare(&f)?;
                    st.waiting_receivers.push_back(f.clone());
                    st.total_blocks += 1;
                    if let Some(d) = deadline {
                        arm_fiber_timer(&f, d);
                    }
                    drop(st);
                    let parked = fiber::park_commit(&f);
                    self.remove_waiter(&f);
                    parked?;
                }
                None => {
                    st.total_blocks += 1;
                    match deadline {
                        Some(d) => {
                            self.inner.recv_cv.wait_until(&mut st, d);
                        }
                        None => self.inner.recv_cv.wait(&mut st),
                    }
                }
            }
        }
    }

    /// Non-blocking receive.
    pub fn try_recv(&self) -> Result<T> {
        let mut st = self.inner.state.lock();
        if let Some(v) = st.queue.pop_front() {
            st.total_recvs += 1;
            wake_one(&mut st.waiting_senders);
            self.inner.send_cv.notify_one();
            return Ok(v);
        }
        if st.closed {
            Err(RuntimeError::ChannelClosed)
        } else {
            Err(RuntimeError::ChannelEmpty)
        }
    }

    /// Close the channel: further sends fail, buffered items still drain.
    pub fn close(&self) {
        let mut st = self.inner.state.lock();
        if st.closed {
            return;
        }
        st.closed = true;
        wake_all(&mut st.waiting_senders);
        wake_all(&mut st.waiting_receivers);
        self.inner.send_cv.notify_all();
        self.inner.recv_cv.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> Option<usize> {
        self.inner.capacity
    }

    /// (sends, receives, blocks) totals since creation.
    pub fn totals(&self) -> (u64, u64, u64) {
        let st = self.inner.state.lock();
        (st.total_sends, st.total_recvs, st.total_blocks)
    }

    fn enroll_receiver(&self, f: &Arc<Fiber>) {
        self.inner.state.lock().waiting_receivers.push_back(f.clone());
    }

    fn enroll_sender(&self, f: &Arc<Fiber>) {
        self.inner.state.lock().waiting_senders.push_back(f.clone());
    }

    /// Drop every enrollment of `f` from both waiter queues.
    ///
    /// A waiter whose park ended some other way (timer, cancellation, a
    /// different select case) must purge itself, otherwise its stale entry
    /// would absorb a wake meant for a real waiter. In case a wake was
    /// already absorbed, it is passed on: spurious wakeups are cheap, lost
    /// ones are not.
    fn remove_waiter(&self, f: &Arc<Fiber>) {
        let mut st = self.inner.state.lock();
        st.waiting_senders.retain(|w| w.id() != f.id());
        st.waiting_receivers.retain(|w| w.id() != f.id());

        let has_items = !st.queue.is_empty();
        let can_send = st.closed || self.inner.capacity.is_none_or(|c| st.queue.len() < c);
        if has_items {
            wake_one(&mut st.waiting_receivers);
            self.inner.recv_cv.notify_one();
        }
        if can_send {
            wake_one(&mut st.waiting_senders);
            self.inner.send_cv.notify_one();
        }
    }
}

/// Wake the first waiter that is actually still parked; stale entries
/// (cancelled or already woken fibers) are skipped and dropped.
fn wake_one(waiters: &mut VecDeque<Arc<Fiber>>) {
    while let Some(f) = waiters.pop_front() {
        if let Some(core) = f.sched.lock().upgrade() {
            if core.unblock(&f) {
                return;
            }
        }
    }
}

fn wake_all(waiters: &mut VecDeque<Arc<Fiber>>) {
    while let Some(f) = waiters.pop_front() {
        if let Some(core) = f.sched.lock().upgrade() {
            core.unblock(&f);
        }
    }
}

/// Arm the scheduler timer so a deadline can interrupt a fiber park.
fn arm_fiber_timer(f: &Arc<Fiber>, deadline: Instant) {
    if let Some(core) = f.sched.lock().upgrade() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let deadline_ns = clock::monotonic_ns().saturating_add(remaining.as_nanos() as u64);
        core.io().register_timer(deadline_ns, f.clone());
    }
}

// =======================================================================
// Select
// =======================================================================

/// One case of a [`select`] call.
pub enum SelectOp<'a, T> {
    /// Receive from the channel.
    Recv(&'a Channel<T>),
    /// Send the value (consumed only if this case fires).
    Send(&'a Channel<T>, Option<T>),
}

/// Result of a [`select`]: which case fired, and the received value for a
/// `Recv` case.
#[derive(Debug)]
pub struct SelectOutcome<T> {
    pub index: usize,
    pub value: Option<T>,
}

enum TryPass<T> {
    Ready(SelectOutcome<T>),
    AllClosed,
    Pending,
}

fn try_cases<T: Send>(ops: &mut [SelectOp<'_, T>], order: &[usize]) -> TryPass<T> {
    let mut closed = 0usize;
    for &i in order {
        match &mut ops[i] {
            SelectOp::Recv(ch) => match ch.try_recv() {
                Ok(v) => {
                    return TryPass::Ready(SelectOutcome {
                        index: i,
                        value: Some(v),
                    })
                }
                Err(RuntimeError::ChannelClosed) => closed += 1,
                Err(_) => {}
            },
            SelectOp::Send(ch, slot) => {
                if let Some(v) = slot.take() {
                    match ch.try_send(v) {
                        Ok(()) => {
                            return TryPass::Ready(SelectOutcome {
                                index: i,
                                value: None,
                            })
                        }
                        Err(e) => {
                            if matches!(e, TrySendError::Closed(_)) {
                                closed += 1;
                            }
                            *slot = Some(e.into_inner());
                        }
                    }
                } else {
                    closed += 1; // spent send case counts as unusable
                }
            }
        }
    }
    if closed == order.len() {
        TryPass::AllClosed
    } else {
        TryPass::Pending
    }
}

fn purge_enrollments<T: Send>(ops: &[SelectOp<'_, T>], f: &Arc<Fiber>) {
    for op in ops {
        match op {
            SelectOp::Recv(ch) | SelectOp::Send(ch, _) => ch.remove_waiter(f),
        }
    }
}

/// Wait until one of the cases is ready and perform it.
///
/// Case scan order is a seeded permutation when `seed` is given (the
/// deterministic-mode contract), otherwise random. With every channel
/// closed the call reports `ChannelClosed`. Inside a fiber the caller
/// parks on all involved channels at once; on a plain thread readiness is
/// polled.
pub fn select<T: Send>(ops: &mut [SelectOp<'_, T>], seed: Option<u64>) -> Result<SelectOutcome<T>> {
    if ops.is_empty() {
        return Err(RuntimeError::ChannelEmpty);
    }
    let mut rng = match seed {
        Some(s) => fastrand::Rng::with_seed(s),
        None => fastrand::Rng::new(),
    };
    let mut order: Vec<usize> = (0..ops.len()).collect();

    loop {
        rng.shuffle(&mut order);
        match try_cases(ops, &order) {
            TryPass::Ready(outcome) => return Ok(outcome),
            TryPass::AllClosed => return Err(RuntimeError::ChannelClosed),
            TryPass::Pending => {}
        }

        match fiber::current() {
            Some(f) => {
                fiber::park_prepare(&f)?;
                for op in ops.iter() {
                    match op {
                        SelectOp::Recv(ch) => ch.enroll_receiver(&f),
                        SelectOp::Send(ch, _) => ch.enroll_sender(&f),
                    }
                }
                // Re-scan after enrolling: an event that landed between the
                // first scan and the enrollments found no waiter to wake.
                match try_cases(ops, &order) {
                    TryPass::Ready(outcome) => {
                        fiber::park_abort(&f);
                        purge_enrollments(ops, &f);
                        return Ok(outcome);
                    }
                    TryPass::AllClosed => {
                        fiber::park_abort(&f);
                        purge_enrollments(ops, &f);
                        return Err(RuntimeError::ChannelClosed);
                    }
                    TryPass::Pending => {}
                }
                let parked = fiber::park_commit(&f);
                purge_enrollments(ops, &f);
                parked?;
            }
            None => std::thread::sleep(Duration::from_millis(1)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::fiber::FiberScheduler;

    #[test]
    fn test_fifo_order() {
        let ch = Channel::unbounded();
        ch.send(1).expect("open");
        ch.send(2).expect("open");
        ch.send(3).expect("open");
        assert_eq!(ch.recv().expect("queued"), 1);
        assert_eq!(ch.recv().expect("queued"), 2);
        assert_eq!(ch.recv().expect("queued"), 3);
        assert_eq!(ch.totals(), (3, 3, 0));
    }

    #[test]
    fn test_try_variants() {
        let ch = Channel::bounded(1);
        assert_eq!(ch.try_recv().unwrap_err(), RuntimeError::ChannelEmpty);
        ch.try_send(7).expect("has room");
        match ch.try_send(8) {
            Err(TrySendError::Full(v)) => assert_eq!(v, 8),
            other => panic!("expected Full, got {:?}", other.err().map(|e| e.error())),
        }
        assert_eq!(ch.try_recv().expect("queued"), 7);
    }

    #[test]
    fn test_close_drains_then_reports() {
        let ch = Channel::unbounded();
        ch.send(1).expect("open");
        ch.send(2).expect("open");
        ch.close();

        assert_eq!(ch.send(3).unwrap_err(), RuntimeError::ChannelClosed);
        assert_eq!(ch.recv().expect("drains"), 1);
        assert_eq!(ch.recv().expect("drains"), 2);
        assert_eq!(ch.recv().unwrap_err(), RuntimeError::ChannelClosed);
    }

    #[test]
    fn test_thread_recv_timeout() {
        let ch: Channel<i32> = Channel::unbounded();
        let started = Instant::now();
        assert_eq!(
            ch.recv_timeout(Duration::from_millis(20)).unwrap_err(),
            RuntimeError::Timeout
        );
        assert!(started.elapsed() >= Duration::from_millis(19));
    }

    #[test]
    fn test_thread_blocking_handoff() {
        let ch = Channel::bounded(1);
        let tx = ch.clone();
        let producer = std::thread::spawn(move || {
            for i in 0..100 {
                tx.send(i).expect("open");
            }
        });
        let mut got = Vec::new();
        for _ in 0..100 {
            got.push(ch.recv().expect("open"));
        }
        producer.join().expect("producer");
        assert_eq!(got, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_fiber_blocking_send_recv() {
        let s = FiberScheduler::new(SchedulerConfig {
            num_workers: 2,
            ..Default::default()
        })
        .expect("scheduler");
        s.start();

        let ch = Channel::bounded(2);
        let tx = ch.clone();
        let producer = s
            .spawn(move || {
                for i in 0..50 {
                    tx.send(i).expect("open");
                }
            })
            .expect("spawn");

        let rx = ch.clone();
        let sum = Arc::new(std::sync::atomic::AtomicI64::new(0));
        let sum2 = sum.clone();
        let consumer = s
            .spawn(move || {
                for _ in 0..50 {
                    let v = rx.recv().expect("open");
                    sum2.fetch_add(i64::from(v), std::sync::atomic::Ordering::SeqCst);
                }
            })
            .expect("spawn");

        assert!(producer.wait_done(Some(Duration::from_secs(10))));
        assert!(consumer.wait_done(Some(Duration::from_secs(10))));
        assert_eq!(
            sum.load(std::sync::atomic::Ordering::SeqCst),
            (0..50).sum::<i64>()
        );
        s.stop();
    }

    #[test]
    fn test_fiber_recv_timeout() {
        let s = FiberScheduler::new(SchedulerConfig {
            num_workers: 1,
            ..Default::default()
        })
        .expect("scheduler");
        s.start();

        let ch: Channel<i32> = Channel::unbounded();
        let f = s
            .spawn(move || {
                let err = ch.recv_timeout(Duration::from_millis(30)).unwrap_err();
                assert_eq!(err, RuntimeError::Timeout);
            })
            .expect("spawn");
        assert!(f.wait_done(Some(Duration::from_secs(5))));
        s.stop();
    }

    #[test]
    fn test_select_prefers_ready_case() {
        let a: Channel<i32> = Channel::unbounded();
        let b: Channel<i32> = Channel::unbounded();
        b.send(42).expect("open");

        let mut ops = [SelectOp::Recv(&a), SelectOp::Recv(&b)];
        let outcome = select(&mut ops, Some(7)).expect("b is ready");
        assert_eq!(outcome.index, 1);
        assert_eq!(outcome.value, Some(42));
    }

    #[test]
    fn test_select_send_case() {
        let full: Channel<i32> = Channel::bounded(1);
        full.send(0).expect("open");
        let open: Channel<i32> = Channel::bounded(1);

        let mut ops = [
            SelectOp::Send(&full, Some(1)),
            SelectOp::Send(&open, Some(2)),
        ];
        let outcome = select(&mut ops, Some(3)).expect("open has room");
        assert_eq!(outcome.index, 1);
        assert_eq!(open.try_recv().expect("sent"), 2);
    }

    #[test]
    fn test_select_all_closed() {
        let a: Channel<i32> = Channel::unbounded();
        a.close();
        let mut ops = [SelectOp::Recv(&a)];
        assert_eq!(
            select(&mut ops, None).unwrap_err(),
            RuntimeError::ChannelClosed
        );
    }
}
