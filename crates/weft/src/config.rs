// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Weft Global Configuration - Single Source of Truth
//!
//! This module centralizes the runtime constants and the three configuration
//! structs (scheduler, dispatcher, security). **NEVER hardcode elsewhere!**
//!
//! Every recognized option and its effect:
//!
//! | Struct | Option | Effect |
//! |--------|--------|--------|
//! | [`SchedulerConfig`] | `num_workers` | worker thread count; 0 means online-CPU count |
//! | [`SchedulerConfig`] | `is_deterministic` | seeded victim selection for reproducible runs |
//! | [`SchedulerConfig`] | `random_seed` | PRNG seed used in deterministic mode |
//! | [`SchedulerConfig`] | `stack_size_hint` | per-fiber stack bytes, rounded up to a page |
//! | [`SchedulerConfig`] | `enable_work_stealing` | allow idle workers to steal from peers |
//! | [`DispatcherConfig`] | `max_*_fibers` | per-category concurrency caps |
//! | [`DispatcherConfig`] | `max_memory_per_fiber` | stack budget handed to spawned role fibers |
//! | [`DispatcherConfig`] | `max_execution_time_ms` | dispatch deadline; 0 disables |
//! | [`DispatcherConfig`] | `on_fiber_error` / `on_timeout` | host callbacks |
//! | [`SecurityConfig`] | `default_level` | level applied when a claim does not name one |
//! | [`SecurityConfig`] | `token_ttl_ms` | base TTL; higher levels shorten it |
//! | [`SecurityConfig`] | `max_validation_failures` | anomaly threshold |
//! | [`SecurityConfig`] | feature flags | hardware binding, token encryption, timing protection, audit logging, replay protection |

use crate::security::SecurityLevel;
use std::sync::Arc;

// =======================================================================
// Compile-time constants
// =======================================================================

/// Default per-fiber stack size (64 KiB).
pub const FIBER_STACK_SIZE: usize = 64 * 1024;

/// Cache line size assumed by the cache-optimized slot pool layout.
pub const CACHE_LINE_SIZE: usize = 64;

/// Base token TTL (5 minutes). Higher security levels shorten it.
pub const DEFAULT_TOKEN_TTL_MS: u64 = 300_000;

/// Validation failures tolerated before the context reports an anomaly.
pub const DEFAULT_MAX_VALIDATION_FAILURES: u64 = 10;

/// Accesses to a single slot within [`ANOMALY_WINDOW_NS`] that trip the
/// hot-slot anomaly heuristic.
pub const ANOMALY_ACCESS_THRESHOLD: u32 = 1000;

/// Window for the hot-slot anomaly heuristic (1 second).
pub const ANOMALY_WINDOW_NS: u64 = 1_000_000_000;

// =======================================================================
// Scheduler
// =======================================================================

/// Fiber scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Worker thread count. `0` resolves to the online CPU count.
    pub num_workers: u32,
    /// Deterministic mode: victim selection and select ordering come from a
    /// PRNG seeded with [`Self::random_seed`].
    pub is_deterministic: bool,
    /// Seed for deterministic mode. Ignored otherwise.
    pub random_seed: u32,
    /// Per-fiber stack size hint in bytes. Rounded up to a 4 KiB page,
    /// never below 16 KiB.
    pub stack_size_hint: usize,
    /// Idle workers steal from the FIFO end of peer queues when enabled.
    pub enable_work_stealing: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            num_workers: 0,
            is_deterministic: false,
            random_seed: 0,
            stack_size_hint: FIBER_STACK_SIZE,
            enable_work_stealing: true,
        }
    }
}

impl SchedulerConfig {
    /// Resolve `num_workers`, mapping 0 to the online CPU count.
    pub fn resolved_workers(&self) -> usize {
        if self.num_workers > 0 {
            self.num_workers as usize
        } else {
            std::thread::available_parallelism()
                .map(std::num::NonZeroUsize::get)
                .unwrap_or(1)
        }
    }

    /// Stack size actually handed to carrier threads: hint rounded up to a
    /// page, floored at 16 KiB.
    pub fn resolved_stack_size(&self) -> usize {
        let hint = self.stack_size_hint.max(16 * 1024);
        (hint + 4095) & !4095
    }
}

// =======================================================================
// Dispatcher
// =======================================================================

/// Callback invoked when a role fiber reports an error.
pub type FiberErrorCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;
/// Callback invoked when a role misses the dispatch deadline.
pub type TimeoutCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Party dispatcher configuration.
#[derive(Clone, Default)]
pub struct DispatcherConfig {
    /// Concurrency cap for CPU-tagged fibers (0 = unlimited).
    pub max_cpu_fibers: u32,
    /// Concurrency cap for GPU-tagged fibers (0 = unlimited).
    pub max_gpu_fibers: u32,
    /// Concurrency cap for I/O-tagged fibers (0 = unlimited).
    pub max_io_fibers: u32,
    /// Concurrency cap for background-tagged fibers (0 = unlimited).
    pub max_background_threads: u32,
    /// Stack budget per spawned role fiber, in bytes (0 = scheduler default).
    pub max_memory_per_fiber: usize,
    /// Dispatch deadline in milliseconds (0 = no deadline).
    pub max_execution_time_ms: u64,
    /// Invoked with `(role_id, error)` when a role fiber fails.
    pub on_fiber_error: Option<FiberErrorCallback>,
    /// Invoked with `role_id` for every role still outstanding at the deadline.
    pub on_timeout: Option<TimeoutCallback>,
}

impl std::fmt::Debug for DispatcherConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatcherConfig")
            .field("max_cpu_fibers", &self.max_cpu_fibers)
            .field("max_gpu_fibers", &self.max_gpu_fibers)
            .field("max_io_fibers", &self.max_io_fibers)
            .field("max_background_threads", &self.max_background_threads)
            .field("max_memory_per_fiber", &self.max_memory_per_fiber)
            .field("max_execution_time_ms", &self.max_execution_time_ms)
            .field("on_fiber_error", &self.on_fiber_error.is_some())
            .field("on_timeout", &self.on_timeout.is_some())
            .finish()
    }
}

// =======================================================================
// Security
// =======================================================================

/// Security context configuration and feature flags.
#[derive(Debug, Clone)]
pub struct SecurityConfig {
    /// Level applied when `claim_secure` does not name one explicitly.
    pub default_level: SecurityLevel,
    /// Base token TTL in milliseconds. Hardware tokens live half as long,
    /// encrypted tokens one fifth.
    pub token_ttl_ms: u64,
    /// Validation-failure count that trips [`detect_anomalies`].
    ///
    /// [`detect_anomalies`]: crate::security::SecurityContext::detect_anomalies
    pub max_validation_failures: u64,
    /// Re-probe and compare the hardware fingerprint at level >= Hardware.
    pub hardware_binding: bool,
    /// Store tokens AES-256-GCM sealed at rest at the Encrypted level.
    pub token_encryption: bool,
    /// Constant-time comparison of all token bytes.
    pub timing_protection: bool,
    /// Emit audit events to the configured sink.
    pub audit_logging: bool,
    /// Reject capabilities whose token generation was superseded.
    pub replay_protection: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            default_level: SecurityLevel::Basic,
            token_ttl_ms: DEFAULT_TOKEN_TTL_MS,
            max_validation_failures: DEFAULT_MAX_VALIDATION_FAILURES,
            hardware_binding: true,
            token_encryption: true,
            timing_protection: true,
            audit_logging: true,
            replay_protection: false,
        }
    }
}

impl SecurityConfig {
    /// Effective TTL in milliseconds for a token at `level`.
    pub fn ttl_for(&self, level: SecurityLevel) -> u64 {
        match level {
            SecurityLevel::Insecure => 0,
            SecurityLevel::Basic => self.token_ttl_ms,
            SecurityLevel::Hardware => self.token_ttl_ms / 2,
            SecurityLevel::Encrypted => self.token_ttl_ms / 5,
        }
    }
}
