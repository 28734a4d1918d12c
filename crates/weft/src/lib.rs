// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # Weft - Slot-based memory and structured fiber runtime
//!
//! The runtime core of a slot-based language: a typed, capability-gated
//! memory subsystem, an M:N cooperative fiber scheduler with work stealing
//! and structured concurrency, and a party dispatcher executing declarative
//! role workloads under join strategies.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use weft::{Result, SlotManager, TypeTag};
//!
//! fn main() -> Result<()> {
//!     let manager = SlotManager::new(64, 4096);
//!     let handle = manager.claim(TypeTag::Int)?;
//!     manager.write(&handle, &42i32.to_le_bytes())?;
//!
//!     let mut buf = [0u8; 4];
//!     manager.read(&handle, &mut buf)?;
//!     manager.release(&handle)?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------------+
//! |                        Party Dispatcher                             |
//! |   FiberMap -> role wrappers -> join strategy -> role statistics     |
//! +---------------------------------------------------------------------+
//! |                 Async Scope  |  Channel                             |
//! |   structured lifetimes, cancellation | fiber-aware FIFO, select     |
//! +---------------------------------------------------------------------+
//! |                        Fiber Scheduler                              |
//! |   global injector | per-worker deques | stealing | io/timer thread  |
//! +---------------------------------------------------------------------+
//! |                Slot Manager  |  Security Context                    |
//! |   typed handles, generations | tokens, fingerprint, audit           |
//! +---------------------------------------------------------------------+
//! |                           Slot Pool                                 |
//! |   occupancy bitset | LIFO free stack | cache-line layout            |
//! +---------------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`SlotManager`] | Typed slot allocation behind opaque handles |
//! | [`SlotHandle`] | `(slot_id, type_tag, generation)` triple; stale handles fail |
//! | [`TokenCapability`] | Slot-bound secure token with TTL and permissions |
//! | [`FiberScheduler`] | Work-stealing M:N executor of cooperative fibers |
//! | [`AsyncScope`] | Scope whose destruction cancels and joins its fibers |
//! | [`Channel`] | Fiber-aware FIFO with blocking/timeout/select |
//! | [`PartyDispatcher`] | Runs a fiber map under a declarative join |
//!
//! ## Guarantees
//!
//! - Handles, never pointers: every slot access re-validates id, type, and
//!   generation, so ABA on slot reuse is structurally impossible.
//! - Secure-path failures are constant-time on token bytes and never leak
//!   storage: sensitive bytes are wiped before any error return.
//! - Structured concurrency: no fiber outlives the scope that spawned it.
//! - Errors never cross fiber boundaries; a failing fiber parks its message
//!   in its own record and the scope captures the first one.

pub mod channel;
pub mod clock;
pub mod config;
pub mod error;
/// Cooperative fibers, the scheduler, and the I/O thread.
pub mod fiber;
pub mod party;
pub mod scope;
/// Token security: fingerprinting, capabilities, audit.
pub mod security;
pub mod slot;

pub use channel::{select, Channel, SelectOp, SelectOutcome, TrySendError};
pub use config::{DispatcherConfig, SchedulerConfig, SecurityConfig};
pub use error::{Result, RuntimeError};
pub use fiber::{Fiber, FiberScheduler, FiberState, Priority, SchedulerStats};
pub use party::{
    DispatchHandle, DispatchResult, FiberMap, FiberMapEntry, FiberResult, JoinStrategy,
    PartyContext, PartyDispatcher, SchedulerTag,
};
pub use scope::{AsyncScope, CancellationToken};
pub use security::{
    AuditEvent, AuditSink, HardwareFingerprint, SecurityContext, SecurityLevel, TokenCapability,
};
pub use slot::{SecureSlotScope, SlotHandle, SlotManager, SlotValue, TypeTag};

/// Runtime version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
