// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Fiber maps: the declarative table a party dispatch executes.
//!
//! A map is immutable after construction. Its cache key is a deterministic
//! hash over the party type, the ordered role ids, and the scheduler tags,
//! so a statically known party resolves to the same cached map every time.

use super::context::PartyContext;
use crate::error::Result;
use crate::fiber::{FiberScheduler, Priority};
use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::Arc;

/// Work function attached to a role. Receives the party context; sibling
/// roles and shared fields are reached through its capability API.
pub type RoleFn = Arc<dyn Fn(&PartyContext) -> Result<()> + Send + Sync>;

/// Symbolic placement hint, resolved against the scheduler registry at
/// dispatch time. Unknown or unregistered tags fall back to the default
/// CPU scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SchedulerTag {
    MainThread,
    CpuFiber,
    GpuFiber,
    IoFiber,
    BackgroundThread,
    ComputeThread,
    NetworkThread,
    Custom1,
    Custom2,
    Custom3,
    /// Let the runtime decide.
    Any,
}

/// One role's row in a fiber map.
#[derive(Clone)]
pub struct FiberMapEntry {
    pub role_id: String,
    /// Slot holding the role instance; resolved through the slot manager.
    pub instance_slot_id: u32,
    /// `None` marks a passive role: it gets no fiber.
    pub parallel_fn: Option<RoleFn>,
    pub scheduler_tag: SchedulerTag,
    pub priority: Priority,
    /// Pause between invocations for periodic roles. Ignored when
    /// `is_continuous` (the wrapper yields instead of sleeping).
    pub interval_ms: u64,
    pub is_continuous: bool,
}

impl FiberMapEntry {
    /// Whether the wrapper loops (periodic or continuous) rather than
    /// running once.
    pub fn is_looping(&self) -> bool {
        self.is_continuous || self.interval_ms > 0
    }
}

impl std::fmt::Debug for FiberMapEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FiberMapEntry")
            .field("role_id", &self.role_id)
            .field("instance_slot_id", &self.instance_slot_id)
            .field("has_fn", &self.parallel_fn.is_some())
            .field("scheduler_tag", &self.scheduler_tag)
            .field("priority", &self.priority)
            .field("interval_ms", &self.interval_ms)
            .field("is_continuous", &self.is_continuous)
            .finish()
    }
}

/// Immutable role table for one party type.
#[derive(Debug, Clone)]
pub struct FiberMap {
    party_type: String,
    entries: Vec<FiberMapEntry>,
    cache_key: u64,
    is_static: bool,
}

impl FiberMap {
    pub fn builder(party_type: impl Into<String>) -> FiberMapBuilder {
        FiberMapBuilder {
            party_type: party_type.into(),
            entries: Vec::new(),
            is_static: false,
        }
    }

    pub fn party_type(&self) -> &str {
        &self.party_type
    }

    pub fn entries(&self) -> &[FiberMapEntry] {
        &self.entries
    }

    pub fn cache_key(&self) -> u64 {
        self.cache_key
    }

    /// Whether the map may be cached across dispatches.
    pub fn is_static(&self) -> bool {
        self.is_static
    }

    /// Debug dump through the logging facade.
    pub fn log_entries(&self) {
        log::debug!(
            "fiber map '{}' (key {:#x}, {} entries)",
            self.party_type,
            self.cache_key,
            self.entries.len()
        );
        for e in &self.entries {
            log::debug!(
                "  {} slot={} tag={:?} prio={:?} interval={}ms continuous={}",
                e.role_id,
                e.instance_slot_id,
                e.scheduler_tag,
                e.priority,
                e.interval_ms,
                e.is_continuous
            );
        }
    }
}

/// Builder for [`FiberMap`].
pub struct FiberMapBuilder {
    party_type: String,
    entries: Vec<FiberMapEntry>,
    is_static: bool,
}

impl FiberMapBuilder {
    pub fn entry(mut self, entry: FiberMapEntry) -> Self {
        self.entries.push(entry);
        self
    }

    /// Mark the map cacheable across dispatches.
    pub fn static_map(mut self) -> Self {
        self.is_static = true;
        self
    }

    pub fn build(self) -> FiberMap {
        let cache_key = compute_cache_key(&self.party_type, &self.entries);
        FiberMap {
            party_type: self.party_type,
            entries: self.entries,
            cache_key,
            is_static: self.is_static,
        }
    }
}

/// Deterministic hash over (party type, ordered role ids, scheduler tags).
fn compute_cache_key(party_type: &str, entries: &[FiberMapEntry]) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    party_type.hash(&mut hasher);
    for e in entries {
        e.role_id.hash(&mut hasher);
        (e.scheduler_tag as u8).hash(&mut hasher);
    }
    hasher.finish()
}

/// LRU cache for static fiber maps, keyed by [`FiberMap::cache_key`].
pub struct FiberMapCache {
    inner: Mutex<LruCache<u64, Arc<FiberMap>>>,
}

impl FiberMapCache {
    pub fn new(max_entries: usize) -> Self {
        let cap = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(cap)),
        }
    }

    /// Insert a static map. Non-static maps are refused (`false`).
    pub fn insert(&self, map: Arc<FiberMap>) -> bool {
        if !map.is_static() {
            return false;
        }
        self.inner.lock().put(map.cache_key(), map);
        true
    }

    pub fn get(&self, cache_key: u64) -> Option<Arc<FiberMap>> {
        self.inner.lock().get(&cache_key).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}

/// Runtime registry mapping scheduler tags to schedulers.
///
/// Tags with no registration resolve to the default CPU scheduler.
#[derive(Clone)]
pub struct SchedulerRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    default: FiberScheduler,
    by_tag: DashMap<SchedulerTag, (String, FiberScheduler)>,
}

impl SchedulerRegistry {
    pub fn new(default: FiberScheduler) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                default,
                by_tag: DashMap::new(),
            }),
        }
    }

    /// Register a scheduler for a tag. Returns `false` when the tag was
    /// already taken (first registration wins).
    pub fn register(
        &self,
        tag: SchedulerTag,
        name: impl Into<String>,
        scheduler: FiberScheduler,
    ) -> bool {
        if self.inner.by_tag.contains_key(&tag) {
            return false;
        }
        self.inner
            .by_tag
            .insert(tag, (name.into(), scheduler))
            .is_none()
    }

    /// Resolve a tag; `Any` and unregistered tags get the default.
    pub fn scheduler_for(&self, tag: SchedulerTag) -> FiberScheduler {
        if tag == SchedulerTag::Any {
            return self.inner.default.clone();
        }
        self.inner
            .by_tag
            .get(&tag)
            .map(|entry| entry.value().1.clone())
            .unwrap_or_else(|| self.inner.default.clone())
    }

    pub fn name_for(&self, tag: SchedulerTag) -> Option<String> {
        self.inner.by_tag.get(&tag).map(|e| e.value().0.clone())
    }

    pub fn default_scheduler(&self) -> FiberScheduler {
        self.inner.default.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(role: &str, slot: u32, tag: SchedulerTag) -> FiberMapEntry {
        FiberMapEntry {
            role_id: role.into(),
            instance_slot_id: slot,
            parallel_fn: None,
            scheduler_tag: tag,
            priority: Priority::Normal,
            interval_ms: 0,
            is_continuous: false,
        }
    }

    #[test]
    fn test_cache_key_is_deterministic() {
        let a = FiberMap::builder("RaidParty")
            .entry(entry("tank", 1, SchedulerTag::CpuFiber))
            .entry(entry("healer", 2, SchedulerTag::IoFiber))
            .build();
        let b = FiberMap::builder("RaidParty")
            .entry(entry("tank", 9, SchedulerTag::CpuFiber))
            .entry(entry("healer", 7, SchedulerTag::IoFiber))
            .build();
        // Slot ids do not participate; type, role order, and tags do.
        assert_eq!(a.cache_key(), b.cache_key());

        let reordered = FiberMap::builder("RaidParty")
            .entry(entry("healer", 2, SchedulerTag::IoFiber))
            .entry(entry("tank", 1, SchedulerTag::CpuFiber))
            .build();
        assert_ne!(a.cache_key(), reordered.cache_key());
    }

    #[test]
    fn test_cache_accepts_only_static_maps() {
        let cache = FiberMapCache::new(4);
        let dynamic = Arc::new(
            FiberMap::builder("P")
                .entry(entry("a", 1, SchedulerTag::Any))
                .build(),
        );
        assert!(!cache.insert(dynamic));

        let static_map = Arc::new(
            FiberMap::builder("P")
                .entry(entry("a", 1, SchedulerTag::Any))
                .static_map()
                .build(),
        );
        let key = static_map.cache_key();
        assert!(cache.insert(static_map));
        assert!(cache.get(key).is_some());
    }

    #[test]
    fn test_cache_evicts_lru() {
        let cache = FiberMapCache::new(1);
        let m1 = Arc::new(FiberMap::builder("A").static_map().build());
        let m2 = Arc::new(FiberMap::builder("B").static_map().build());
        let k1 = m1.cache_key();
        cache.insert(m1);
        cache.insert(m2);
        assert!(cache.get(k1).is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_looping_classification() {
        let mut e = entry("a", 1, SchedulerTag::Any);
        assert!(!e.is_looping());
        e.interval_ms = 16;
        assert!(e.is_looping());
        e.interval_ms = 0;
        e.is_continuous = true;
        assert!(e.is_looping());
    }
}
