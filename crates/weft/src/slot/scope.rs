// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Scope-based release of secure slots.
//!
//! A [`SecureSlotScope`] collects `(handle, capability)` pairs and releases
//! them in reverse acquisition order when the scope drops, whatever the exit
//! path. Capability token bytes are wiped before each release.

use super::manager::SlotManager;
use super::types::{SlotHandle, TypeTag};
use crate::error::Result;
use crate::security::{SecurityLevel, TokenCapability};
use std::sync::Arc;

/// Drop guard owning a stack of secure slots.
pub struct SecureSlotScope {
    manager: Arc<SlotManager>,
    slots: Vec<(SlotHandle, TokenCapability)>,
}

impl SecureSlotScope {
    pub fn new(manager: Arc<SlotManager>) -> Self {
        Self {
            manager,
            slots: Vec::new(),
        }
    }

    /// Claim a secure slot owned by this scope. The capability stays inside
    /// the scope; callers interact through [`Self::write`] / [`Self::read`].
    pub fn claim(&mut self, type_tag: TypeTag, level: Option<SecurityLevel>) -> Result<SlotHandle> {
        let (handle, capability) = self.manager.claim_secure(type_tag, level)?;
        self.slots.push((handle, capability));
        Ok(handle)
    }

    /// Adopt a slot claimed elsewhere; it will be released with the scope.
    pub fn adopt(&mut self, handle: SlotHandle, capability: TokenCapability) {
        self.slots.push((handle, capability));
    }

    pub fn write(&self, handle: &SlotHandle, bytes: &[u8]) -> Result<()> {
        let cap = self.capability_for(handle)?;
        self.manager.write_secure(handle, bytes, cap)
    }

    pub fn read(&self, handle: &SlotHandle, buf: &mut [u8]) -> Result<usize> {
        let cap = self.capability_for(handle)?;
        self.manager.read_secure(handle, buf, cap)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn capability_for(&self, handle: &SlotHandle) -> Result<&TokenCapability> {
        self.slots
            .iter()
            .find(|(h, _)| h == handle)
            .map(|(_, c)| c)
            .ok_or(crate::error::RuntimeError::InvalidHandle)
    }
}

impl Drop for SecureSlotScope {
    fn drop(&mut self) {
        // Reverse acquisition order, like unwinding a stack of claims.
        while let Some((handle, mut capability)) = self.slots.pop() {
            if let Err(e) = self.manager.release_secure(&handle, &capability) {
                log::warn!("scope release of slot {} failed: {}", handle.slot_id(), e);
            }
            capability.wipe();
        }
    }
}
