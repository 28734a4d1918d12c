// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Capability-token security layer for slot access.
//!
//! The slot manager delegates here for everything cryptographic: hardware
//! fingerprinting, token generation and validation, AEAD sealing of tokens
//! at rest, constant-time comparison, and the audit trail.
//!
//! # Architecture
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                       SlotManager                            |
//! |   claim_secure / write_secure / read_secure / release_secure |
//! +--------------------------------------------------------------+
//! |                     SecurityContext                          |
//! |   master key (mlocked) | fingerprint | counters | audit      |
//! +--------------------------------------------------------------+
//! |                 ring (SHA-256, AES-256-GCM, CSPRNG)          |
//! +--------------------------------------------------------------+
//! ```
//!
//! Validation never leaks a timing signal: all token-byte comparisons go
//! through `ring::constant_time`.

mod audit;
mod context;
mod fingerprint;
mod token;

pub use audit::{AuditEvent, AuditLog, AuditSink, LogSink};
pub use context::{secure_wipe, SecurityContext, SecurityStats};
pub use fingerprint::HardwareFingerprint;
pub use token::{SealedToken, SecureToken, TokenCapability, TokenMaterial, TOKEN_MATERIAL_LEN};

/// Security levels, ordered weakest to strongest.
///
/// An `Insecure` slot never requires a token; every other level does.
/// Token TTL shortens monotonically as the level rises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SecurityLevel {
    /// No runtime checks; plain slot access.
    Insecure,
    /// Token validation without hardware binding.
    Basic,
    /// Token bound to the host fingerprint, re-verified on every access.
    Hardware,
    /// Hardware binding plus AES-256-GCM sealed token storage.
    Encrypted,
}

impl SecurityLevel {
    /// Whether slots at this level require a capability on every access.
    pub fn needs_token(self) -> bool {
        self != Self::Insecure
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels_are_ordered() {
        assert!(SecurityLevel::Insecure < SecurityLevel::Basic);
        assert!(SecurityLevel::Basic < SecurityLevel::Hardware);
        assert!(SecurityLevel::Hardware < SecurityLevel::Encrypted);
    }

    #[test]
    fn test_only_insecure_skips_tokens() {
        assert!(!SecurityLevel::Insecure.needs_token());
        assert!(SecurityLevel::Basic.needs_token());
        assert!(SecurityLevel::Encrypted.needs_token());
    }
}
