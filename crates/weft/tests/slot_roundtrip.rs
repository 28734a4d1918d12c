// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! End-to-end slot lifecycle: claim, write, read, release, reuse.

use weft::{RuntimeError, SlotManager, TypeTag};

#[test]
fn basic_slot_roundtrip() {
    let manager = SlotManager::new(10, 1024);

    let h = manager.claim(TypeTag::Int).expect("claim");
    manager.write(&h, &42i32.to_le_bytes()).expect("write");

    let mut buf = [0u8; 4];
    let n = manager.read(&h, &mut buf).expect("read");
    assert_eq!(n, 4);
    assert_eq!(i32::from_le_bytes(buf), 42);

    manager.release(&h).expect("release");
    assert_eq!(
        manager.read(&h, &mut buf).unwrap_err(),
        RuntimeError::SlotNotFound
    );
}

#[test]
fn read_returns_last_written_value() {
    let manager = SlotManager::new(4, 256);
    let h = manager.claim(TypeTag::Long).expect("claim");

    for v in [1i64, -7, i64::MAX, 0] {
        manager.write(&h, &v.to_le_bytes()).expect("write");
        let mut buf = [0u8; 8];
        manager.read(&h, &mut buf).expect("read");
        assert_eq!(i64::from_le_bytes(buf), v);
    }
}

#[test]
fn stale_handle_rejected_after_reuse() {
    let manager = SlotManager::new(1, 64);

    let h1 = manager.claim(TypeTag::Int).expect("claim");
    manager.release(&h1).expect("release");
    let h2 = manager.claim(TypeTag::Int).expect("claim");

    // The single-entry table reuses the slot id; only the generation moves.
    assert_eq!(h1.slot_id(), h2.slot_id());
    assert!(h1.generation() < h2.generation());

    assert_eq!(
        manager.write(&h1, &0i32.to_le_bytes()).unwrap_err(),
        RuntimeError::StaleGeneration
    );

    // The live handle is unaffected.
    manager.write(&h2, &7i32.to_le_bytes()).expect("write");
}

#[test]
fn single_slot_manager_churns_unboundedly() {
    let manager = SlotManager::new(1, 64);
    for i in 0..10_000u32 {
        let h = manager.claim(TypeTag::Int).expect("claim");
        manager.write(&h, &i.to_le_bytes()).expect("write");
        let mut buf = [0u8; 4];
        manager.read(&h, &mut buf).expect("read");
        assert_eq!(u32::from_le_bytes(buf), i);
        manager.release(&h).expect("release");
    }
    assert_eq!(manager.active_count(), 0);
}

#[test]
fn table_exhaustion_and_recovery() {
    let manager = SlotManager::new(3, 256);
    let handles: Vec<_> = (0..3)
        .map(|_| manager.claim(TypeTag::Int).expect("claim"))
        .collect();
    assert_eq!(
        manager.claim(TypeTag::Int).unwrap_err(),
        RuntimeError::OutOfSlots
    );

    manager.release(&handles[1]).expect("release");
    manager.claim(TypeTag::Int).expect("freed capacity is usable");
}

#[test]
fn zero_size_write_reads_back_empty() {
    let manager = SlotManager::new(2, 128);
    let h = manager.claim(TypeTag::Str).expect("claim");
    manager.write(&h, &[]).expect("zero-size write");

    let mut buf = [0xAAu8; 16];
    assert_eq!(manager.read(&h, &mut buf).expect("read"), 0);
}

#[test]
fn type_checks_on_every_operation() {
    let manager = SlotManager::new(4, 256);
    let h = manager.claim(TypeTag::Float).expect("claim");

    let wrong_type = manager.claim(TypeTag::Double).expect("claim");
    manager.release(&wrong_type).expect("release");

    assert!(manager.validate_type(&h, TypeTag::Float));
    assert!(!manager.validate_type(&h, TypeTag::Double));
}
