// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Typed slot manager: handle issuance, generation tracking, capability
//! enforcement.
//!
//! The manager owns a fixed slot table backed by a [`SlotPool`]. Callers
//! hold opaque `(slot_id, type_tag, generation)` handles, never pointers.
//! Every operation re-checks existence, generation, and type; a slot id may
//! be reused after release, but the generation bump makes any retained
//! handle fail with `StaleGeneration`.
//!
//! With security enabled, each claim returns a freshly issued
//! [`TokenCapability`] alongside the handle, and every secure operation runs
//! the full validation chain in [`SecurityContext::validate`] before
//! touching slot memory. The plaintext capability crosses the API boundary
//! exactly once; the table keeps only the derivation material and (at the
//! Encrypted level) the AES-256-GCM sealed token.

use super::pool::{PoolIndex, PoolStats, SlotPool};
use super::types::{SlotHandle, TypeTag};
use crate::clock;
use crate::config::{SecurityConfig, ANOMALY_ACCESS_THRESHOLD, ANOMALY_WINDOW_NS};
use crate::error::{Result, RuntimeError};
use crate::security::{
    secure_wipe, SealedToken, SecurityContext, SecurityLevel, TokenCapability, TokenMaterial,
};
use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use zeroize::Zeroize;

/// Minimum per-slot block size carved out of the pool budget.
const MIN_BLOCK_SIZE: usize = 16;

/// Per-slot security state retained by the table.
struct SlotSecurity {
    level: SecurityLevel,
    /// Token derivation material; re-hashed at validation time. `None` for
    /// Insecure slots and revoked tokens.
    material: Option<TokenMaterial>,
    /// Sealed token at rest (Encrypted level only).
    sealed: Option<SealedToken>,
    token_generation: u32,
    revoked: bool,
}

impl SlotSecurity {
    /// Wipe everything recoverable, leaving the slot token-less.
    fn wipe(&mut self) {
        self.material = None; // Zeroizing drop wipes the bytes
        if let Some(sealed) = self.sealed.as_mut() {
            secure_wipe(&mut sealed.bytes);
            sealed.zeroize();
        }
        self.sealed = None;
    }
}

struct SlotEntry {
    /// 0 until the entry is claimed for the first time; stable afterwards
    /// (ids are reused across release/claim cycles).
    slot_id: u32,
    generation: u32,
    occupied: bool,
    type_tag: TypeTag,
    block: Option<PoolIndex>,
    len: usize,
    /// 0 = no expiry.
    ttl_ms: u64,
    thread_affinity: u64,
    allocated_at_ns: u64,
    /// 0 = not part of a claim scope.
    scope_id: u32,
    security: Option<SlotSecurity>,
    access_count: u32,
    window_start_ns: u64,
    last_access_ns: u64,
}

impl SlotEntry {
    fn vacant() -> Self {
        Self {
            slot_id: 0,
            generation: 0,
            occupied: false,
            type_tag: TypeTag::Int,
            block: None,
            len: 0,
            ttl_ms: 0,
            thread_affinity: 0,
            allocated_at_ns: 0,
            scope_id: 0,
            security: None,
            access_count: 0,
            window_start_ns: 0,
            last_access_ns: 0,
        }
    }

    fn expired(&self, now_ns: u64) -> bool {
        self.occupied
            && self.ttl_ms > 0
            && now_ns > self.allocated_at_ns.saturating_add(self.ttl_ms * 1_000_000)
    }
}

struct ManagerState {
    entries: Vec<SlotEntry>,
    /// slot id -> entry index; mappings persist across release so stale
    /// handles resolve to their entry and fail on the generation check.
    index: HashMap<u32, usize>,
    pool: SlotPool,
    next_slot_id: u32,
}

/// Debug snapshot of one slot entry's bookkeeping.
#[derive(Debug, Clone, Copy)]
pub struct SlotInfo {
    pub slot_id: u32,
    pub generation: u32,
    pub len: usize,
    pub ttl_ms: u64,
    /// Tag of the thread that claimed the slot.
    pub thread_affinity: u64,
    pub allocated_at_ns: u64,
    pub access_count: u32,
    pub last_access_ns: u64,
    pub security_level: Option<SecurityLevel>,
}

/// Counter snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct SlotManagerStats {
    pub total_allocations: u64,
    pub total_deallocations: u64,
    pub active_slots: u64,
    pub security_violations: u64,
    pub pool: PoolStats,
}

/// Typed, capability-gated slot allocator.
pub struct SlotManager {
    state: Mutex<ManagerState>,
    security: ArcSwapOption<SecurityContext>,
    total_allocations: AtomicU64,
    total_deallocations: AtomicU64,
    active_slots: AtomicU64,
    security_violations: AtomicU64,
}

impl SlotManager {
    /// Plain manager: `max_slots` table entries over a `pool_bytes` budget.
    ///
    /// Each slot's block is `pool_bytes / max_slots` bytes (floored at 16).
    pub fn new(max_slots: usize, pool_bytes: usize) -> Self {
        Self::build(max_slots, pool_bytes, None)
    }

    /// Manager with the security layer armed from the start.
    pub fn new_secure(
        max_slots: usize,
        pool_bytes: usize,
        enable_security: bool,
        default_level: SecurityLevel,
    ) -> Self {
        let ctx = enable_security.then(|| {
            Arc::new(SecurityContext::new(SecurityConfig {
                default_level,
                ..Default::default()
            }))
        });
        Self::build(max_slots, pool_bytes, ctx)
    }

    /// Manager with a fully custom security configuration.
    pub fn with_security_config(max_slots: usize, pool_bytes: usize, config: SecurityConfig) -> Self {
        Self::build(
            max_slots,
            pool_bytes,
            Some(Arc::new(SecurityContext::new(config))),
        )
    }

    fn build(max_slots: usize, pool_bytes: usize, ctx: Option<Arc<SecurityContext>>) -> Self {
        let max_slots = max_slots.max(1);
        let block_size = (pool_bytes / max_slots).max(MIN_BLOCK_SIZE);
        let mut entries = Vec::with_capacity(max_slots);
        entries.resize_with(max_slots, SlotEntry::vacant);
        Self {
            state: Mutex::new(ManagerState {
                entries,
                index: HashMap::with_capacity(max_slots),
                pool: SlotPool::new(block_size, max_slots, true),
                next_slot_id: 1,
            }),
            security: ArcSwapOption::from(ctx),
            total_allocations: AtomicU64::new(0),
            total_deallocations: AtomicU64::new(0),
            active_slots: AtomicU64::new(0),
            security_violations: AtomicU64::new(0),
        }
    }

    /// Arm the security layer on a live manager. No-op when already armed.
    pub fn enable_security(&self, default_level: SecurityLevel) {
        if self.security.load_full().is_none() {
            self.security.store(Some(Arc::new(SecurityContext::new(
                SecurityConfig {
                    default_level,
                    ..Default::default()
                },
            ))));
        }
    }

    /// The security context, if armed.
    pub fn security_context(&self) -> Option<Arc<SecurityContext>> {
        self.security.load_full()
    }

    // ===================================================================
    // Plain operations
    // ===================================================================

    /// Claim a slot for `type_tag`. The block is taken from the pool lazily
    /// on first write.
    pub fn claim(&self, type_tag: TypeTag) -> Result<SlotHandle> {
        let mut state = self.state.lock();
        let handle = self.claim_entry(&mut state, type_tag)?;
        Ok(handle)
    }

    /// Write `bytes` into the slot. Overwrites the previous value; a
    /// zero-length write succeeds and reads back as zero bytes.
    pub fn write(&self, handle: &SlotHandle, bytes: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let idx = lookup(&state, handle)?;
        self.reject_token_gated(&state.entries[idx])?;
        self.write_common(&mut state, idx, bytes)
    }

    /// Read the slot value into `buf`; returns the byte count copied
    /// (the stored length capped at `buf.len()`).
    pub fn read(&self, handle: &SlotHandle, buf: &mut [u8]) -> Result<usize> {
        let mut state = self.state.lock();
        let idx = lookup(&state, handle)?;
        self.reject_token_gated(&state.entries[idx])?;
        self.read_common(&mut state, idx, buf)
    }

    /// Read the whole stored value into a fresh buffer.
    pub fn read_to_vec(&self, handle: &SlotHandle) -> Result<Vec<u8>> {
        let mut state = self.state.lock();
        let idx = lookup(&state, handle)?;
        self.reject_token_gated(&state.entries[idx])?;
        let mut buf = vec![0u8; state.entries[idx].len];
        let n = self.read_common(&mut state, idx, &mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Release the slot: zero the block, return it to the pool, keep the
    /// generation so retained handles go stale.
    pub fn release(&self, handle: &SlotHandle) -> Result<()> {
        let mut state = self.state.lock();
        let idx = lookup(&state, handle)?;
        self.reject_token_gated(&state.entries[idx])?;
        self.release_entry(&mut state, idx);
        Ok(())
    }

    /// Claim a slot attached to a caller-chosen scope id (non-zero), so a
    /// whole group can be released with [`Self::release_scope`].
    pub fn claim_scoped(&self, type_tag: TypeTag, scope_id: u32) -> Result<SlotHandle> {
        if scope_id == 0 {
            return Err(RuntimeError::InvalidHandle);
        }
        let mut state = self.state.lock();
        let handle = self.claim_entry(&mut state, type_tag)?;
        let idx = state.index[&handle.slot_id];
        state.entries[idx].scope_id = scope_id;
        Ok(handle)
    }

    /// Release every live slot claimed under `scope_id`. Returns the count.
    pub fn release_scope(&self, scope_id: u32) -> usize {
        if scope_id == 0 {
            return 0;
        }
        let mut state = self.state.lock();
        let members: Vec<usize> = state
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.occupied && e.scope_id == scope_id)
            .map(|(i, _)| i)
            .collect();
        for &idx in &members {
            self.release_entry(&mut state, idx);
        }
        members.len()
    }

    // ===================================================================
    // Secure operations
    // ===================================================================

    /// Claim a slot at `level`, returning the handle and the one-time
    /// plaintext capability.
    pub fn claim_secure(
        &self,
        type_tag: TypeTag,
        level: Option<SecurityLevel>,
    ) -> Result<(SlotHandle, TokenCapability)> {
        let ctx = self.require_security()?;
        let level = level.unwrap_or(ctx.config().default_level);

        let mut state = self.state.lock();
        let handle = self.claim_entry(&mut state, type_tag)?;
        let idx = state.index[&handle.slot_id];

        let outcome = self.issue_token(&ctx, handle.slot_id, level);
        match outcome {
            Ok((capability, security)) => {
                state.entries[idx].security = Some(security);
                Ok((handle, capability))
            }
            Err(e) => {
                // Roll the claim back; the generation bump stays.
                self.release_entry(&mut state, idx);
                Err(e)
            }
        }
    }

    fn issue_token(
        &self,
        ctx: &SecurityContext,
        slot_id: u32,
        level: SecurityLevel,
    ) -> Result<(TokenCapability, SlotSecurity)> {
        if !level.needs_token() {
            let capability = TokenCapability {
                slot_id,
                token: crate::security::SecureToken {
                    data: [0u8; 32],
                    generation: 0,
                    checksum: 0,
                },
                level,
                issued_at_ns: clock::monotonic_ns(),
                expires_at_ns: 0,
                can_read: true,
                can_write: true,
                can_transfer: false,
            };
            let security = SlotSecurity {
                level,
                material: None,
                sealed: None,
                token_generation: 0,
                revoked: false,
            };
            return Ok((capability, security));
        }

        let (capability, material) = ctx.generate(slot_id, level)?;
        let sealed = if level == SecurityLevel::Encrypted && ctx.config().token_encryption {
            Some(ctx.encrypt_token(capability.token(), slot_id)?)
        } else {
            None
        };
        let security = SlotSecurity {
            level,
            material: Some(material),
            sealed,
            token_generation: capability.token().generation(),
            revoked: false,
        };
        Ok((capability, security))
    }

    /// Capability-gated write.
    pub fn write_secure(
        &self,
        handle: &SlotHandle,
        bytes: &[u8],
        capability: &TokenCapability,
    ) -> Result<()> {
        let ctx = self.require_security()?;
        let mut state = self.state.lock();
        let idx = lookup(&state, handle)?;
        self.check_capability(&ctx, &state.entries[idx], handle, capability, Access::Write)?;
        self.write_common(&mut state, idx, bytes)
    }

    /// Capability-gated read; returns the byte count copied.
    pub fn read_secure(
        &self,
        handle: &SlotHandle,
        buf: &mut [u8],
        capability: &TokenCapability,
    ) -> Result<usize> {
        let ctx = self.require_security()?;
        let mut state = self.state.lock();
        let idx = lookup(&state, handle)?;
        self.check_capability(&ctx, &state.entries[idx], handle, capability, Access::Read)?;
        self.read_common(&mut state, idx, buf)
    }

    /// Capability-gated release. Wipes the stored token material before the
    /// block goes back to the pool.
    pub fn release_secure(&self, handle: &SlotHandle, capability: &TokenCapability) -> Result<()> {
        let ctx = self.require_security()?;
        let mut state = self.state.lock();
        let idx = lookup(&state, handle)?;
        self.check_capability(&ctx, &state.entries[idx], handle, capability, Access::Release)?;
        self.release_entry(&mut state, idx);
        Ok(())
    }

    /// Re-issue the capability for a still-valid token, resetting its TTL.
    pub fn refresh_token(
        &self,
        handle: &SlotHandle,
        capability: &TokenCapability,
    ) -> Result<TokenCapability> {
        let ctx = self.require_security()?;
        let mut state = self.state.lock();
        let idx = lookup(&state, handle)?;
        self.check_capability(&ctx, &state.entries[idx], handle, capability, Access::Validate)?;

        let level = state.entries[idx]
            .security
            .as_ref()
            .map(|s| s.level)
            .unwrap_or(SecurityLevel::Insecure);
        let (fresh, security) = self.issue_token(&ctx, handle.slot_id, level)?;
        if let Some(old) = state.entries[idx].security.as_mut() {
            old.wipe();
        }
        state.entries[idx].security = Some(security);
        ctx.audit().record(handle.slot_id, "token_refreshed", "");
        Ok(fresh)
    }

    /// Invalidate the slot's token. Subsequent secure operations fail with
    /// `InvalidToken` until the slot is released and reclaimed.
    pub fn revoke_token(&self, handle: &SlotHandle) -> Result<()> {
        let ctx = self.require_security()?;
        let mut state = self.state.lock();
        let idx = lookup(&state, handle)?;
        let entry = &mut state.entries[idx];
        match entry.security.as_mut() {
            Some(sec) => {
                sec.revoked = true;
                sec.wipe();
                ctx.audit().record(handle.slot_id, "token_revoked", "");
                Ok(())
            }
            None => Err(RuntimeError::PermissionDenied),
        }
    }

    /// Run the validation chain without touching slot memory.
    pub fn validate_token(&self, handle: &SlotHandle, capability: &TokenCapability) -> Result<()> {
        let ctx = self.require_security()?;
        let state = self.state.lock();
        let idx = lookup(&state, handle)?;
        self.check_capability(&ctx, &state.entries[idx], handle, capability, Access::Validate)
    }

    // ===================================================================
    // TTL management
    // ===================================================================

    /// Set the slot's TTL; 0 clears it.
    pub fn set_ttl(&self, handle: &SlotHandle, ttl_ms: u64) -> Result<()> {
        let mut state = self.state.lock();
        let idx = lookup(&state, handle)?;
        state.entries[idx].ttl_ms = ttl_ms;
        Ok(())
    }

    /// Restart the slot's TTL window from now.
    pub fn refresh_ttl(&self, handle: &SlotHandle) -> Result<()> {
        let mut state = self.state.lock();
        let idx = lookup(&state, handle)?;
        state.entries[idx].allocated_at_ns = clock::monotonic_ns();
        Ok(())
    }

    /// Release every slot whose TTL elapsed. Returns the count released.
    pub fn cleanup_expired(&self) -> usize {
        let mut state = self.state.lock();
        let now = clock::monotonic_ns();
        let expired: Vec<usize> = state
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.expired(now))
            .map(|(i, _)| i)
            .collect();
        for &idx in &expired {
            log::debug!("slot {}: ttl elapsed, releasing", state.entries[idx].slot_id);
            self.release_entry(&mut state, idx);
        }
        expired.len()
    }

    // ===================================================================
    // Queries & statistics
    // ===================================================================

    /// Whether the handle refers to a live slot (right id, generation, type).
    pub fn is_valid(&self, handle: &SlotHandle) -> bool {
        let state = self.state.lock();
        lookup(&state, handle).is_ok()
    }

    /// Debug view of a live slot's bookkeeping.
    pub fn slot_info(&self, handle: &SlotHandle) -> Option<SlotInfo> {
        let state = self.state.lock();
        let idx = lookup(&state, handle).ok()?;
        let entry = &state.entries[idx];
        Some(SlotInfo {
            slot_id: entry.slot_id,
            generation: entry.generation,
            len: entry.len,
            ttl_ms: entry.ttl_ms,
            thread_affinity: entry.thread_affinity,
            allocated_at_ns: entry.allocated_at_ns,
            access_count: entry.access_count,
            last_access_ns: entry.last_access_ns,
            security_level: entry.security.as_ref().map(|s| s.level),
        })
    }

    /// Whether a live slot holds `expected` (false for dead handles too).
    pub fn validate_type(&self, handle: &SlotHandle, expected: TypeTag) -> bool {
        handle.type_tag() == expected && self.is_valid(handle)
    }

    /// Whether any live slot carries this id (regardless of generation).
    pub fn contains_slot(&self, slot_id: u32) -> bool {
        let state = self.state.lock();
        state
            .index
            .get(&slot_id)
            .is_some_and(|&idx| state.entries[idx].occupied)
    }

    pub fn active_count(&self) -> u64 {
        self.active_slots.load(Ordering::Relaxed)
    }

    /// Fraction of the slot table in use.
    pub fn utilization(&self) -> f64 {
        let state = self.state.lock();
        if state.entries.is_empty() {
            0.0
        } else {
            self.active_slots.load(Ordering::Relaxed) as f64 / state.entries.len() as f64
        }
    }

    /// Violations observed by this manager (invalid tokens, hardware
    /// mismatches, replays presented through its API).
    pub fn security_violations(&self) -> u64 {
        self.security_violations.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> SlotManagerStats {
        let state = self.state.lock();
        SlotManagerStats {
            total_allocations: self.total_allocations.load(Ordering::Relaxed),
            total_deallocations: self.total_deallocations.load(Ordering::Relaxed),
            active_slots: self.active_slots.load(Ordering::Relaxed),
            security_violations: self.security_violations.load(Ordering::Relaxed),
            pool: state.pool.stats(),
        }
    }

    /// Dump counters through the logging facade.
    pub fn log_stats(&self) {
        let s = self.stats();
        log::debug!(
            "slot manager: active={} allocs={} frees={} violations={}",
            s.active_slots,
            s.total_allocations,
            s.total_deallocations,
            s.security_violations
        );
    }

    // ===================================================================
    // Internals
    // ===================================================================

    fn require_security(&self) -> Result<Arc<SecurityContext>> {
        self.security
            .load_full()
            .ok_or(RuntimeError::ContextNotInitialized)
    }

    /// Plain ops are refused on token-gated slots.
    fn reject_token_gated(&self, entry: &SlotEntry) -> Result<()> {
        match entry.security.as_ref() {
            Some(sec) if sec.level.needs_token() => Err(RuntimeError::PermissionDenied),
            _ => Ok(()),
        }
    }

    fn check_capability(
        &self,
        ctx: &SecurityContext,
        entry: &SlotEntry,
        handle: &SlotHandle,
        capability: &TokenCapability,
        access: Access,
    ) -> Result<()> {
        let sec = entry
            .security
            .as_ref()
            .ok_or(RuntimeError::PermissionDenied)?;
        if !sec.level.needs_token() {
            return Ok(());
        }
        if sec.revoked {
            self.security_violations.fetch_add(1, Ordering::Relaxed);
            return Err(RuntimeError::InvalidToken);
        }
        if ctx.config().replay_protection
            && capability.token().generation() != sec.token_generation
        {
            self.security_violations.fetch_add(1, Ordering::Relaxed);
            ctx.audit().record(handle.slot_id(), "token_replay", "");
            return Err(RuntimeError::ReplayAttack);
        }

        let material = sec.material.as_ref().ok_or(RuntimeError::InvalidToken)?;
        if let Err(e) = ctx.validate(handle.slot_id(), capability, material) {
            if matches!(
                e,
                RuntimeError::InvalidToken | RuntimeError::HardwareMismatch
            ) {
                self.security_violations.fetch_add(1, Ordering::Relaxed);
            }
            return Err(e);
        }

        let allowed = match access {
            Access::Read => capability.can_read(),
            Access::Write => capability.can_write(),
            Access::Release | Access::Validate => true,
        };
        if allowed {
            Ok(())
        } else {
            Err(RuntimeError::PermissionDenied)
        }
    }

    fn claim_entry(&self, state: &mut ManagerState, type_tag: TypeTag) -> Result<SlotHandle> {
        let idx = state
            .entries
            .iter()
            .position(|e| !e.occupied)
            .ok_or(RuntimeError::OutOfSlots)?;

        let slot_id = if state.entries[idx].slot_id == 0 {
            let id = state.next_slot_id;
            state.next_slot_id += 1;
            state.index.insert(id, idx);
            id
        } else {
            // Reuse the entry's id; the generation bump below makes every
            // handle issued before the release stale.
            state.entries[idx].slot_id
        };

        let entry = &mut state.entries[idx];
        entry.slot_id = slot_id;
        entry.generation += 1;
        entry.occupied = true;
        entry.type_tag = type_tag;
        entry.block = None;
        entry.len = 0;
        entry.ttl_ms = 0;
        entry.thread_affinity = current_thread_tag();
        entry.allocated_at_ns = clock::monotonic_ns();
        entry.scope_id = 0;
        entry.security = None;
        entry.access_count = 0;
        entry.window_start_ns = entry.allocated_at_ns;
        entry.last_access_ns = entry.allocated_at_ns;

        self.total_allocations.fetch_add(1, Ordering::Relaxed);
        self.active_slots.fetch_add(1, Ordering::Relaxed);

        Ok(SlotHandle {
            slot_id,
            type_tag,
            generation: entry.generation,
        })
    }

    fn write_common(&self, state: &mut ManagerState, idx: usize, bytes: &[u8]) -> Result<()> {
        if bytes.len() > state.pool.element_size() {
            return Err(RuntimeError::OutOfMemory);
        }

        if state.entries[idx].block.is_none() && !bytes.is_empty() {
            let block = state.pool.alloc().ok_or(RuntimeError::OutOfMemory)?;
            state.entries[idx].block = Some(block);
        }

        if let Some(block) = state.entries[idx].block {
            let slice = state
                .pool
                .get_mut(block)
                .ok_or(RuntimeError::InvalidHandle)?;
            slice.fill(0);
            slice[..bytes.len()].copy_from_slice(bytes);
        }
        state.entries[idx].len = bytes.len();
        self.touch(state, idx);
        Ok(())
    }

    fn read_common(&self, state: &mut ManagerState, idx: usize, buf: &mut [u8]) -> Result<usize> {
        let len = state.entries[idx].len;
        let n = len.min(buf.len());
        if n > 0 {
            let block = state.entries[idx]
                .block
                .ok_or(RuntimeError::InvalidHandle)?;
            let slice = state.pool.get(block).ok_or(RuntimeError::InvalidHandle)?;
            buf[..n].copy_from_slice(&slice[..n]);
        }
        self.touch(state, idx);
        Ok(n)
    }

    fn release_entry(&self, state: &mut ManagerState, idx: usize) {
        let block = state.entries[idx].block.take();
        if let Some(block) = block {
            // SlotPool::free zero-fills before the index becomes reusable.
            state.pool.free(block);
        }
        let entry = &mut state.entries[idx];
        if let Some(sec) = entry.security.as_mut() {
            sec.wipe();
        }
        entry.security = None;
        entry.occupied = false;
        entry.len = 0;
        entry.ttl_ms = 0;
        entry.scope_id = 0;
        self.total_deallocations.fetch_add(1, Ordering::Relaxed);
        self.active_slots.fetch_sub(1, Ordering::Relaxed);
    }

    /// Access accounting + the hot-slot anomaly heuristic.
    fn touch(&self, state: &mut ManagerState, idx: usize) {
        let now = clock::monotonic_ns();
        let entry = &mut state.entries[idx];
        if now.saturating_sub(entry.window_start_ns) > ANOMALY_WINDOW_NS {
            entry.window_start_ns = now;
            entry.access_count = 1;
        } else {
            entry.access_count += 1;
            if entry.access_count == ANOMALY_ACCESS_THRESHOLD + 1 {
                let slot_id = entry.slot_id;
                let count = entry.access_count;
                match self.security.load_full() {
                    Some(ctx) => ctx.audit().record(
                        slot_id,
                        "hot_slot_anomaly",
                        format!("{} accesses inside the window", count),
                    ),
                    None => log::warn!(
                        "slot {}: {} accesses inside the anomaly window",
                        slot_id,
                        count
                    ),
                }
            }
        }
        entry.last_access_ns = now;
    }
}

/// What a capability must authorize.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Access {
    Read,
    Write,
    Release,
    Validate,
}

fn lookup(state: &ManagerState, handle: &SlotHandle) -> Result<usize> {
    let idx = *state
        .index
        .get(&handle.slot_id())
        .ok_or(RuntimeError::SlotNotFound)?;
    let entry = &state.entries[idx];
    if !entry.occupied {
        return Err(RuntimeError::SlotNotFound);
    }
    if entry.generation != handle.generation() {
        return Err(RuntimeError::StaleGeneration);
    }
    if entry.type_tag != handle.type_tag() {
        return Err(RuntimeError::TypeMismatch);
    }
    Ok(idx)
}

/// Stable per-thread tag recorded as the entry's claiming affinity.
fn current_thread_tag() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    thread_local! {
        static TAG: u64 = NEXT.fetch_add(1, Ordering::Relaxed);
    }
    TAG.with(|t| *t)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_write_read_release() {
        let mgr = SlotManager::new(10, 1024);
        let h = mgr.claim(TypeTag::Int).expect("table has room");
        mgr.write(&h, &42i32.to_le_bytes()).expect("write fits");

        let mut buf = [0u8; 4];
        let n = mgr.read(&h, &mut buf).expect("live slot");
        assert_eq!(n, 4);
        assert_eq!(i32::from_le_bytes(buf), 42);

        mgr.release(&h).expect("live slot");
        assert_eq!(mgr.read(&h, &mut buf), Err(RuntimeError::SlotNotFound));
    }

    #[test]
    fn test_zero_size_write() {
        let mgr = SlotManager::new(2, 64);
        let h = mgr.claim(TypeTag::Str).expect("table has room");
        mgr.write(&h, &[]).expect("zero-size write succeeds");
        let mut buf = [0u8; 8];
        assert_eq!(mgr.read(&h, &mut buf).expect("live slot"), 0);
    }

    #[test]
    fn test_type_mismatch() {
        let mgr = SlotManager::new(2, 64);
        let h = mgr.claim(TypeTag::Int).expect("table has room");
        let wrong = SlotHandle {
            slot_id: h.slot_id(),
            type_tag: TypeTag::Double,
            generation: h.generation(),
        };
        let mut buf = [0u8; 8];
        assert_eq!(mgr.read(&wrong, &mut buf), Err(RuntimeError::TypeMismatch));
    }

    #[test]
    fn test_stale_generation_after_reuse() {
        let mgr = SlotManager::new(1, 64);
        let h1 = mgr.claim(TypeTag::Int).expect("table has room");
        mgr.release(&h1).expect("live slot");
        let h2 = mgr.claim(TypeTag::Int).expect("table has room");

        // Single-entry table: the id is reused, the generation moved on.
        assert_eq!(h1.slot_id(), h2.slot_id());
        assert!(h1.generation() < h2.generation());
        assert_eq!(
            mgr.write(&h1, &0i32.to_le_bytes()),
            Err(RuntimeError::StaleGeneration)
        );
        mgr.write(&h2, &7i32.to_le_bytes()).expect("fresh handle");
    }

    #[test]
    fn test_single_slot_churn() {
        let mgr = SlotManager::new(1, 64);
        for i in 0..100 {
            let h = mgr.claim(TypeTag::Int).expect("table has room");
            mgr.write(&h, &(i as i32).to_le_bytes()).expect("write");
            mgr.release(&h).expect("release");
        }
        assert_eq!(mgr.stats().total_allocations, 100);
        assert_eq!(mgr.stats().total_deallocations, 100);
        assert_eq!(mgr.active_count(), 0);
    }

    #[test]
    fn test_out_of_slots() {
        let mgr = SlotManager::new(2, 64);
        let _a = mgr.claim(TypeTag::Int).expect("room");
        let _b = mgr.claim(TypeTag::Int).expect("room");
        assert_eq!(mgr.claim(TypeTag::Int), Err(RuntimeError::OutOfSlots));
    }

    #[test]
    fn test_oversized_write() {
        let mgr = SlotManager::new(4, 64); // 16-byte blocks
        let h = mgr.claim(TypeTag::Vector).expect("room");
        assert_eq!(mgr.write(&h, &[0u8; 64]), Err(RuntimeError::OutOfMemory));
    }

    #[test]
    fn test_secure_roundtrip() {
        let mgr = SlotManager::new_secure(10, 1024, true, SecurityLevel::Hardware);
        let (h, cap) = mgr
            .claim_secure(TypeTag::Int, Some(SecurityLevel::Hardware))
            .expect("secure claim");

        mgr.write_secure(&h, &2025i32.to_le_bytes(), &cap)
            .expect("valid capability");
        let mut buf = [0u8; 4];
        let n = mgr.read_secure(&h, &mut buf, &cap).expect("valid capability");
        assert_eq!(n, 4);
        assert_eq!(i32::from_le_bytes(buf), 2025);

        mgr.release_secure(&h, &cap).expect("valid capability");
        assert_eq!(
            mgr.read_secure(&h, &mut buf, &cap),
            Err(RuntimeError::SlotNotFound)
        );
    }

    #[test]
    fn test_forged_capability_counts_violation() {
        let mgr = SlotManager::new_secure(10, 1024, true, SecurityLevel::Hardware);
        let (h, cap) = mgr
            .claim_secure(TypeTag::Int, None)
            .expect("secure claim");

        let mut forged = cap.clone();
        forged.slot_id = h.slot_id() + 1;
        assert_eq!(
            mgr.write_secure(&h, &0i32.to_le_bytes(), &forged),
            Err(RuntimeError::InvalidToken)
        );
        assert_eq!(mgr.security_violations(), 1);

        // The genuine capability still works.
        mgr.write_secure(&h, &1i32.to_le_bytes(), &cap)
            .expect("genuine capability");
    }

    #[test]
    fn test_plain_ops_rejected_on_secured_slot() {
        let mgr = SlotManager::new_secure(4, 256, true, SecurityLevel::Basic);
        let (h, _cap) = mgr.claim_secure(TypeTag::Int, None).expect("secure claim");
        assert_eq!(
            mgr.write(&h, &1i32.to_le_bytes()),
            Err(RuntimeError::PermissionDenied)
        );
        let mut buf = [0u8; 4];
        assert_eq!(mgr.read(&h, &mut buf), Err(RuntimeError::PermissionDenied));
    }

    #[test]
    fn test_insecure_level_needs_no_token() {
        let mgr = SlotManager::new_secure(4, 256, true, SecurityLevel::Basic);
        let (h, cap) = mgr
            .claim_secure(TypeTag::Int, Some(SecurityLevel::Insecure))
            .expect("secure claim");
        // Both paths work on an Insecure slot.
        mgr.write(&h, &5i32.to_le_bytes()).expect("plain ok");
        mgr.write_secure(&h, &6i32.to_le_bytes(), &cap).expect("secure ok");
    }

    #[test]
    fn test_secure_claim_without_context() {
        let mgr = SlotManager::new(4, 256);
        assert_eq!(
            mgr.claim_secure(TypeTag::Int, None).unwrap_err(),
            RuntimeError::ContextNotInitialized
        );
    }

    #[test]
    fn test_revoke_token() {
        let mgr = SlotManager::new_secure(4, 256, true, SecurityLevel::Basic);
        let (h, cap) = mgr.claim_secure(TypeTag::Int, None).expect("secure claim");
        mgr.revoke_token(&h).expect("live slot");
        assert_eq!(
            mgr.write_secure(&h, &1i32.to_le_bytes(), &cap),
            Err(RuntimeError::InvalidToken)
        );
    }

    #[test]
    fn test_refresh_token_supersedes_old() {
        let mgr = SlotManager::with_security_config(
            4,
            256,
            SecurityConfig {
                replay_protection: true,
                ..Default::default()
            },
        );
        let (h, cap) = mgr.claim_secure(TypeTag::Int, None).expect("secure claim");
        let fresh = mgr.refresh_token(&h, &cap).expect("valid capability");

        mgr.write_secure(&h, &1i32.to_le_bytes(), &fresh)
            .expect("fresh capability");
        assert_eq!(
            mgr.write_secure(&h, &1i32.to_le_bytes(), &cap),
            Err(RuntimeError::ReplayAttack)
        );
    }

    #[test]
    fn test_ttl_cleanup() {
        let mgr = SlotManager::new(4, 256);
        let h = mgr.claim(TypeTag::Int).expect("room");
        mgr.set_ttl(&h, 0).expect("live slot");
        assert_eq!(mgr.cleanup_expired(), 0); // 0 = no expiry

        // A 0ms-elapsed TTL of 0 never expires; use an already-past window.
        let h2 = mgr.claim(TypeTag::Int).expect("room");
        mgr.set_ttl(&h2, 1).expect("live slot");
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(mgr.cleanup_expired(), 1);
        assert!(!mgr.is_valid(&h2));
        assert!(mgr.is_valid(&h));
    }

    #[test]
    fn test_enable_security_on_live_manager() {
        let mgr = SlotManager::new(4, 256);
        mgr.enable_security(SecurityLevel::Basic);
        let (_h, _cap) = mgr.claim_secure(TypeTag::Int, None).expect("armed");
    }

    #[test]
    fn test_rejection_latency_is_position_independent() {
        // Guards against an early-exit byte loop creeping into the token
        // compare. A smoke check, not a statistical side-channel harness.
        let mgr = SlotManager::new_secure(4, 256, true, SecurityLevel::Basic);
        let (h, cap) = mgr.claim_secure(TypeTag::Int, None).expect("secure claim");

        let time_rejections = |byte: usize| {
            let mut c = cap.clone();
            c.token.data[byte] ^= 1;
            let start = std::time::Instant::now();
            for _ in 0..200 {
                assert_eq!(
                    mgr.validate_token(&h, &c),
                    Err(RuntimeError::InvalidToken)
                );
            }
            start.elapsed()
        };

        // Warm both paths, then measure.
        let _ = time_rejections(0);
        let _ = time_rejections(31);
        let first = time_rejections(0);
        let last = time_rejections(31);

        let ratio = first.as_secs_f64().max(1e-9) / last.as_secs_f64().max(1e-9);
        assert!(
            (0.02..50.0).contains(&ratio),
            "rejection latency wildly position-dependent: {:?} vs {:?}",
            first,
            last
        );
    }

    #[test]
    fn test_validate_type_and_contains() {
        let mgr = SlotManager::new(4, 256);
        let h = mgr.claim(TypeTag::Bool).expect("room");
        assert!(mgr.validate_type(&h, TypeTag::Bool));
        assert!(!mgr.validate_type(&h, TypeTag::Int));
        assert!(mgr.contains_slot(h.slot_id()));
        mgr.release(&h).expect("live slot");
        assert!(!mgr.contains_slot(h.slot_id()));
    }

    #[test]
    fn test_scoped_claims_release_together() {
        let mgr = SlotManager::new(8, 512);
        let a = mgr.claim_scoped(TypeTag::Int, 7).expect("room");
        let b = mgr.claim_scoped(TypeTag::Int, 7).expect("room");
        let other = mgr.claim_scoped(TypeTag::Int, 8).expect("room");
        let plain = mgr.claim(TypeTag::Int).expect("room");

        assert_eq!(mgr.release_scope(7), 2);
        assert!(!mgr.is_valid(&a));
        assert!(!mgr.is_valid(&b));
        assert!(mgr.is_valid(&other));
        assert!(mgr.is_valid(&plain));

        assert_eq!(mgr.release_scope(7), 0);
        assert_eq!(mgr.release_scope(0), 0);
        assert!(mgr.claim_scoped(TypeTag::Int, 0).is_err());
    }

    #[test]
    fn test_read_to_vec_returns_stored_len() {
        let mgr = SlotManager::new(4, 256);
        let h = mgr.claim(TypeTag::Vector).expect("room");
        mgr.write(&h, &[1, 2, 3]).expect("write");
        assert_eq!(mgr.read_to_vec(&h).expect("read"), vec![1, 2, 3]);
    }

    #[test]
    fn test_slot_info_tracks_accesses() {
        let mgr = SlotManager::new(4, 256);
        let h = mgr.claim(TypeTag::Int).expect("room");
        mgr.write(&h, &1i32.to_le_bytes()).expect("write");
        let mut buf = [0u8; 4];
        mgr.read(&h, &mut buf).expect("read");

        let info = mgr.slot_info(&h).expect("live slot");
        assert_eq!(info.slot_id, h.slot_id());
        assert_eq!(info.generation, h.generation());
        assert_eq!(info.len, 4);
        assert_eq!(info.access_count, 2);
        assert!(info.thread_affinity != 0);
        assert!(info.security_level.is_none());

        mgr.release(&h).expect("release");
        assert!(mgr.slot_info(&h).is_none());
    }
}
