// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Party orchestration: fiber maps, role contexts, parallel dispatch.
//!
//! A *party* is a named set of roles. The compiler (or host) hands the
//! runtime a [`FiberMap`] describing which work function each role runs,
//! where (scheduler tag), and how (priority, cadence); the
//! [`PartyDispatcher`] executes the whole map in parallel and combines the
//! outcomes under a [`JoinStrategy`].

pub mod context;
pub mod dispatch;
pub mod map;

pub use context::{PartyContext, PartyContextBuilder, RoleBinding, SharedField};
pub use dispatch::{
    DispatchHandle, DispatchResult, FiberResult, FiberStats, JoinStrategy, PartyDispatcher,
};
pub use map::{
    FiberMap, FiberMapBuilder, FiberMapCache, FiberMapEntry, RoleFn, SchedulerRegistry,
    SchedulerTag,
};
