// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Capability-gated slot access: token binding, violations, wiping.

use weft::{RuntimeError, SecurityLevel, SlotManager, TypeTag};

#[test]
fn secure_write_read_roundtrip() {
    let manager = SlotManager::new_secure(10, 1024, true, SecurityLevel::Hardware);
    let (h, cap) = manager
        .claim_secure(TypeTag::Int, Some(SecurityLevel::Hardware))
        .expect("secure claim");

    manager
        .write_secure(&h, &2025i32.to_le_bytes(), &cap)
        .expect("genuine capability");

    let mut buf = [0u8; 4];
    let n = manager.read_secure(&h, &mut buf, &cap).expect("read");
    assert_eq!(n, 4);
    assert_eq!(i32::from_le_bytes(buf), 2025);
}

#[test]
fn capability_is_slot_bound() {
    let manager = SlotManager::new_secure(10, 1024, true, SecurityLevel::Hardware);
    let (h1, cap1) = manager.claim_secure(TypeTag::Int, None).expect("claim");
    let (h2, _cap2) = manager.claim_secure(TypeTag::Int, None).expect("claim");
    assert_ne!(h1.slot_id(), h2.slot_id());

    let violations_before = manager.security_violations();

    // A capability issued for h1 must not open h2, and the attempt counts
    // as a violation.
    let mut buf = [0u8; 4];
    assert_eq!(
        manager.read_secure(&h2, &mut buf, &cap1).unwrap_err(),
        RuntimeError::InvalidToken
    );
    assert_eq!(
        manager.write_secure(&h2, &[1], &cap1).unwrap_err(),
        RuntimeError::InvalidToken
    );
    assert_eq!(manager.security_violations(), violations_before + 2);

    // Both genuine capabilities still work.
    manager
        .write_secure(&h1, &5i32.to_le_bytes(), &cap1)
        .expect("cap1 on h1");
}

#[test]
fn secure_release_invalidates_handle() {
    let manager = SlotManager::new_secure(4, 256, true, SecurityLevel::Encrypted);
    let (h, cap) = manager
        .claim_secure(TypeTag::Long, Some(SecurityLevel::Encrypted))
        .expect("secure claim");

    manager
        .write_secure(&h, &99i64.to_le_bytes(), &cap)
        .expect("write");
    manager.release_secure(&h, &cap).expect("release");

    let mut buf = [0u8; 8];
    assert_eq!(
        manager.read_secure(&h, &mut buf, &cap).unwrap_err(),
        RuntimeError::SlotNotFound
    );
}

#[test]
fn plain_ops_refused_on_gated_slots() {
    let manager = SlotManager::new_secure(4, 256, true, SecurityLevel::Basic);
    let (h, _cap) = manager.claim_secure(TypeTag::Int, None).expect("claim");

    assert_eq!(
        manager.write(&h, &[1]).unwrap_err(),
        RuntimeError::PermissionDenied
    );
    assert_eq!(
        manager.release(&h).unwrap_err(),
        RuntimeError::PermissionDenied
    );
}

#[test]
fn revoked_token_cannot_be_used() {
    let manager = SlotManager::new_secure(4, 256, true, SecurityLevel::Basic);
    let (h, cap) = manager.claim_secure(TypeTag::Int, None).expect("claim");

    manager.revoke_token(&h).expect("revoke");
    assert_eq!(
        manager.write_secure(&h, &[1], &cap).unwrap_err(),
        RuntimeError::InvalidToken
    );
}

#[test]
fn refreshed_capability_replaces_old() {
    let manager = SlotManager::new_secure(4, 256, true, SecurityLevel::Basic);
    let (h, cap) = manager.claim_secure(TypeTag::Int, None).expect("claim");

    let fresh = manager.refresh_token(&h, &cap).expect("refresh");
    assert!(fresh.token().generation() > cap.token().generation());
    manager
        .write_secure(&h, &[7], &fresh)
        .expect("fresh capability");
}

#[test]
fn expiry_boundary_is_inclusive() {
    use weft::{SecurityConfig, SecurityContext};
    let ctx = SecurityContext::new(SecurityConfig::default());
    let (cap, _material) = ctx.generate(1, SecurityLevel::Basic).expect("entropy");

    // now == expiry is still valid; one past is not.
    assert!(!cap.is_expired(cap.expires_at_ns()));
    assert!(cap.is_expired(cap.expires_at_ns() + 1));
}

#[test]
fn audit_trail_records_violations() {
    let manager = SlotManager::new_secure(4, 256, true, SecurityLevel::Basic);
    let (_h1, cap1) = manager.claim_secure(TypeTag::Int, None).expect("claim");
    let (h2, _cap2) = manager.claim_secure(TypeTag::Int, None).expect("claim");

    let _ = manager.write_secure(&h2, &[1], &cap1);

    let ctx = manager.security_context().expect("armed");
    let events = ctx.audit().recent();
    assert!(
        events.iter().any(|e| e.event == "token_slot_mismatch"),
        "expected a slot-mismatch audit event, got {:?}",
        events.iter().map(|e| e.event.clone()).collect::<Vec<_>>()
    );
    assert!(ctx.stats().security_violations >= 1);
}

#[test]
fn secure_scope_releases_everything() {
    use std::sync::Arc;
    use weft::SecureSlotScope;

    let manager = Arc::new(SlotManager::new_secure(8, 512, true, SecurityLevel::Basic));
    {
        let mut scope = SecureSlotScope::new(manager.clone());
        for _ in 0..4 {
            scope.claim(TypeTag::Int, None).expect("claim");
        }
        assert_eq!(manager.active_count(), 4);
    }
    assert_eq!(manager.active_count(), 0);
}
