// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Runtime error taxonomy.
//!
//! One crate-wide error enum covering resource exhaustion, handle/type
//! violations, security failures, concurrency outcomes, and dispatch
//! failures. Errors are plain values: they are returned at API boundaries
//! and never thrown across fiber boundaries (a failing fiber records its
//! message and transitions to the `Error` state instead).

use std::fmt;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// All errors the runtime core can report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    // Resource
    /// The backing pool has no free block for the requested size.
    OutOfMemory,
    /// The slot table is full.
    OutOfSlots,
    /// A fiber stack could not be allocated.
    OutOfStack,

    // Handle / type
    /// The handle is malformed or refers to a manager it was not issued by.
    InvalidHandle,
    /// No live slot matches the handle's slot id.
    SlotNotFound,
    /// The slot exists but holds a different type than the handle claims.
    TypeMismatch,
    /// The slot id matches a live slot, but the handle predates a reuse.
    StaleGeneration,

    // Security
    /// Token bytes, binding, or checksum failed validation.
    InvalidToken,
    /// The capability's TTL has elapsed.
    TokenExpired,
    /// The capability lacks the permission, or the operation requires one.
    PermissionDenied,
    /// The host fingerprint no longer matches the one the token was bound to.
    HardwareMismatch,
    /// An AEAD or digest operation failed.
    CryptographyFailed,
    /// A previously superseded token was presented.
    ReplayAttack,
    /// The system CSPRNG could not produce the requested bytes.
    InsufficientEntropy,
    /// A secure operation was attempted without an initialized context.
    ContextNotInitialized,

    // Concurrency
    /// The fiber observed cancellation at a suspension point.
    Cancelled,
    /// A deadline elapsed before the operation could complete.
    Timeout,
    /// The channel was closed and drained.
    ChannelClosed,
    /// Non-blocking send on a full bounded channel.
    ChannelFull,
    /// Non-blocking receive on an empty channel.
    ChannelEmpty,

    // Scheduler
    /// No scheduler is registered for the requested tag.
    SchedulerNotFound,
    /// The carrier thread for a fiber could not be created.
    FiberCreateFailed(String),

    // Dispatch
    /// A fiber-map entry referenced a slot with no live instance.
    RoleInstanceMissing(String),
    /// The join strategy could not be satisfied by the completed results.
    JoinStrategyUnsatisfied,
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "out of pool memory"),
            Self::OutOfSlots => write!(f, "slot table full"),
            Self::OutOfStack => write!(f, "fiber stack allocation failed"),
            Self::InvalidHandle => write!(f, "invalid slot handle"),
            Self::SlotNotFound => write!(f, "slot not found"),
            Self::TypeMismatch => write!(f, "slot type mismatch"),
            Self::StaleGeneration => write!(f, "stale handle generation"),
            Self::InvalidToken => write!(f, "invalid security token"),
            Self::TokenExpired => write!(f, "security token expired"),
            Self::PermissionDenied => write!(f, "permission denied"),
            Self::HardwareMismatch => write!(f, "hardware fingerprint mismatch"),
            Self::CryptographyFailed => write!(f, "cryptographic operation failed"),
            Self::ReplayAttack => write!(f, "superseded token presented (replay)"),
            Self::InsufficientEntropy => write!(f, "insufficient entropy"),
            Self::ContextNotInitialized => write!(f, "security context not initialized"),
            Self::Cancelled => write!(f, "operation cancelled"),
            Self::Timeout => write!(f, "operation timed out"),
            Self::ChannelClosed => write!(f, "channel closed"),
            Self::ChannelFull => write!(f, "channel full"),
            Self::ChannelEmpty => write!(f, "channel empty"),
            Self::SchedulerNotFound => write!(f, "scheduler not found for tag"),
            Self::FiberCreateFailed(msg) => write!(f, "fiber creation failed: {}", msg),
            Self::RoleInstanceMissing(role) => {
                write!(f, "role instance missing for '{}'", role)
            }
            Self::JoinStrategyUnsatisfied => write!(f, "join strategy unsatisfied"),
        }
    }
}

impl std::error::Error for RuntimeError {}
