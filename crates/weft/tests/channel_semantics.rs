// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Channel semantics across fibers: blocking handoff, close-drain, select.

use std::sync::Arc;
use std::time::Duration;
use weft::{fiber, select, Channel, FiberScheduler, RuntimeError, SchedulerConfig, SelectOp};

fn scheduler(workers: u32) -> FiberScheduler {
    let s = FiberScheduler::new(SchedulerConfig {
        num_workers: workers,
        ..Default::default()
    })
    .expect("scheduler");
    s.start();
    s
}

#[test]
fn bounded_channel_backpressure_between_fibers() {
    let s = scheduler(2);
    let ch: Channel<u32> = Channel::bounded(4);

    let tx = ch.clone();
    let producer = s
        .spawn(move || {
            for i in 0..200 {
                tx.send(i).expect("open");
            }
            tx.close();
        })
        .expect("spawn");

    let rx = ch.clone();
    let collected: Arc<parking_lot::Mutex<Vec<u32>>> = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = collected.clone();
    let consumer = s
        .spawn(move || loop {
            match rx.recv() {
                Ok(v) => sink.lock().push(v),
                Err(RuntimeError::ChannelClosed) => break,
                Err(e) => panic!("unexpected channel error: {}", e),
            }
        })
        .expect("spawn");

    assert!(producer.wait_done(Some(Duration::from_secs(10))));
    assert!(consumer.wait_done(Some(Duration::from_secs(10))));

    let values = collected.lock().clone();
    assert_eq!(values, (0..200).collect::<Vec<_>>(), "FIFO order preserved");
    s.stop();
}

#[test]
fn send_to_closed_channel_fails_but_drain_works() {
    let ch: Channel<i32> = Channel::unbounded();
    ch.send(1).expect("open");
    ch.close();

    assert_eq!(ch.send(2).unwrap_err(), RuntimeError::ChannelClosed);
    assert_eq!(ch.recv().expect("buffered item drains"), 1);
    assert_eq!(ch.recv().unwrap_err(), RuntimeError::ChannelClosed);
}

#[test]
fn close_wakes_blocked_fiber_receiver() {
    let s = scheduler(2);
    let ch: Channel<i32> = Channel::unbounded();

    let rx = ch.clone();
    let f = s
        .spawn(move || {
            assert_eq!(rx.recv().unwrap_err(), RuntimeError::ChannelClosed);
        })
        .expect("spawn");

    std::thread::sleep(Duration::from_millis(20));
    ch.close();
    assert!(f.wait_done(Some(Duration::from_secs(5))));
    s.stop();
}

#[test]
fn select_blocks_until_a_case_is_ready() {
    let s = scheduler(2);
    let a: Channel<i32> = Channel::unbounded();
    let b: Channel<i32> = Channel::unbounded();

    let b_tx = b.clone();
    let waker = s
        .spawn(move || {
            fiber::sleep(Duration::from_millis(20)).expect("not cancelled");
            b_tx.send(99).expect("open");
        })
        .expect("spawn");

    let a2 = a.clone();
    let b2 = b.clone();
    let selector = s
        .spawn(move || {
            let mut ops = [SelectOp::Recv(&a2), SelectOp::Recv(&b2)];
            let outcome = select(&mut ops, Some(11)).expect("b eventually ready");
            assert_eq!(outcome.index, 1);
            assert_eq!(outcome.value, Some(99));
        })
        .expect("spawn");

    assert!(waker.wait_done(Some(Duration::from_secs(5))));
    assert!(selector.wait_done(Some(Duration::from_secs(5))));
    s.stop();
}

#[test]
fn timeout_send_on_full_channel() {
    let ch: Channel<i32> = Channel::bounded(1);
    ch.send(1).expect("open");
    assert_eq!(
        ch.send_timeout(2, Duration::from_millis(20)).unwrap_err(),
        RuntimeError::Timeout
    );
}
