// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Party context: the state role work functions see.
//!
//! Roles reference each other through capability lookups over a flat
//! name-to-slot map, resolved through the slot manager on demand. No role
//! ever holds a pointer to a sibling, so the ownership graph stays acyclic
//! even when the role graph is not.

use crate::slot::SlotHandle;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// One role's binding inside a party.
#[derive(Debug, Clone)]
pub struct RoleBinding {
    pub slot_name: String,
    pub slot_id: u32,
    pub handle: SlotHandle,
    pub abilities: Vec<String>,
}

impl RoleBinding {
    pub fn has_ability(&self, ability: &str) -> bool {
        self.abilities.iter().any(|a| a == ability)
    }
}

/// A shared party field backed by a slot.
#[derive(Debug, Clone)]
pub struct SharedField {
    pub name: String,
    pub slot_id: u32,
    pub handle: SlotHandle,
}

/// Runtime state handed to role work functions.
///
/// Role and shared-field tables are immutable after construction; mutable
/// party state goes through the context lock or the atomics.
pub struct PartyContext {
    party_name: String,
    roles: Vec<RoleBinding>,
    shared: Vec<SharedField>,
    in_combat: AtomicBool,
    lock: Mutex<()>,
}

impl PartyContext {
    pub fn builder(party_name: impl Into<String>) -> PartyContextBuilder {
        PartyContextBuilder {
            party_name: party_name.into(),
            roles: Vec::new(),
            shared: Vec::new(),
        }
    }

    pub fn party_name(&self) -> &str {
        &self.party_name
    }

    /// Look up a role by slot name, requiring `ability` when non-empty.
    ///
    /// Returns `None` both for unknown names and for roles lacking the
    /// ability, so callers cannot distinguish absence from denial.
    pub fn get_role(&self, slot_name: &str, required_ability: &str) -> Option<&RoleBinding> {
        self.roles
            .iter()
            .find(|r| r.slot_name == slot_name)
            .filter(|r| required_ability.is_empty() || r.has_ability(required_ability))
    }

    /// Every role implementing `ability`.
    pub fn find_roles(&self, ability: &str) -> Vec<&RoleBinding> {
        self.roles
            .iter()
            .filter(|r| r.has_ability(ability))
            .collect()
    }

    pub fn roles(&self) -> &[RoleBinding] {
        &self.roles
    }

    /// Shared field by name.
    pub fn get_shared(&self, field_name: &str) -> Option<&SharedField> {
        self.shared.iter().find(|f| f.name == field_name)
    }

    pub fn in_combat(&self) -> bool {
        self.in_combat.load(Ordering::SeqCst)
    }

    pub fn set_in_combat(&self, value: bool) {
        self.in_combat.store(value, Ordering::SeqCst);
    }

    /// Run `f` under the context lock. For multi-field updates roles must
    /// not interleave.
    pub fn with_lock<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.lock.lock();
        f()
    }
}

impl std::fmt::Debug for PartyContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartyContext")
            .field("party_name", &self.party_name)
            .field("roles", &self.roles.len())
            .field("shared", &self.shared.len())
            .field("in_combat", &self.in_combat())
            .finish()
    }
}

/// Builder for [`PartyContext`].
pub struct PartyContextBuilder {
    party_name: String,
    roles: Vec<RoleBinding>,
    shared: Vec<SharedField>,
}

impl PartyContextBuilder {
    pub fn role(
        mut self,
        slot_name: impl Into<String>,
        handle: SlotHandle,
        abilities: Vec<String>,
    ) -> Self {
        self.roles.push(RoleBinding {
            slot_name: slot_name.into(),
            slot_id: handle.slot_id(),
            handle,
            abilities,
        });
        self
    }

    pub fn shared_field(mut self, name: impl Into<String>, handle: SlotHandle) -> Self {
        self.shared.push(SharedField {
            name: name.into(),
            slot_id: handle.slot_id(),
            handle,
        });
        self
    }

    pub fn build(self) -> PartyContext {
        PartyContext {
            party_name: self.party_name,
            roles: self.roles,
            shared: self.shared,
            in_combat: AtomicBool::new(false),
            lock: Mutex::new(()),
        }
    }
}
