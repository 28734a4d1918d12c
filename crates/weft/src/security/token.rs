// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Secure tokens and the capabilities that carry them.
//!
//! A [`SecureToken`] is 256 bits of SHA-256 output plus a generation counter
//! and an integrity checksum. The caller-facing [`TokenCapability`] pairs a
//! token with its slot binding, TTL window, and permissions. Tokens at rest
//! live inside the slot table as a [`SealedToken`] (AES-256-GCM) when the
//! Encrypted level is in force.

use super::SecurityLevel;
use ring::constant_time::verify_slices_are_equal;
use zeroize::{Zeroize, Zeroizing};

/// Length of the material a token is derived from:
/// fingerprint (32) | slot id (4) | issue time (8) | random (20).
pub const TOKEN_MATERIAL_LEN: usize = 64;

/// Token derivation material. Zeroized on drop; the slot table keeps it for
/// re-derivation at validation time and wipes it on release.
pub type TokenMaterial = Zeroizing<[u8; TOKEN_MATERIAL_LEN]>;

/// Serialized token length: 32 data + 4 generation + 4 checksum.
pub(crate) const TOKEN_WIRE_LEN: usize = 40;

/// 256-bit slot access token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecureToken {
    pub(crate) data: [u8; 32],
    pub(crate) generation: u32,
    pub(crate) checksum: u32,
}

impl SecureToken {
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Fixed serialization used for sealing and constant-time comparison.
    pub(crate) fn to_bytes(&self) -> [u8; TOKEN_WIRE_LEN] {
        let mut out = [0u8; TOKEN_WIRE_LEN];
        out[..32].copy_from_slice(&self.data);
        out[32..36].copy_from_slice(&self.generation.to_le_bytes());
        out[36..40].copy_from_slice(&self.checksum.to_le_bytes());
        out
    }

    pub(crate) fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != TOKEN_WIRE_LEN {
            return None;
        }
        let mut data = [0u8; 32];
        data.copy_from_slice(&bytes[..32]);
        Some(Self {
            data,
            generation: u32::from_le_bytes(bytes[32..36].try_into().ok()?),
            checksum: u32::from_le_bytes(bytes[36..40].try_into().ok()?),
        })
    }

    /// Constant-time comparison of the full serialized token.
    pub fn ct_eq(&self, other: &Self) -> bool {
        verify_slices_are_equal(&self.to_bytes(), &other.to_bytes()).is_ok()
    }
}

impl Zeroize for SecureToken {
    fn zeroize(&mut self) {
        self.data.zeroize();
        self.generation = 0;
        self.checksum = 0;
    }
}

/// Proof of authorization for one slot: token + TTL window + permissions.
///
/// The plaintext capability is handed to the caller exactly once, at claim
/// time. The runtime keeps only the sealed form and the derivation material.
#[derive(Debug, Clone)]
pub struct TokenCapability {
    pub(crate) slot_id: u32,
    pub(crate) token: SecureToken,
    pub(crate) level: SecurityLevel,
    pub(crate) issued_at_ns: u64,
    /// 0 means no expiry.
    pub(crate) expires_at_ns: u64,
    pub(crate) can_read: bool,
    pub(crate) can_write: bool,
    pub(crate) can_transfer: bool,
}

impl TokenCapability {
    pub fn slot_id(&self) -> u32 {
        self.slot_id
    }

    pub fn level(&self) -> SecurityLevel {
        self.level
    }

    pub fn token(&self) -> &SecureToken {
        &self.token
    }

    pub fn issued_at_ns(&self) -> u64 {
        self.issued_at_ns
    }

    pub fn expires_at_ns(&self) -> u64 {
        self.expires_at_ns
    }

    pub fn can_read(&self) -> bool {
        self.can_read
    }

    pub fn can_write(&self) -> bool {
        self.can_write
    }

    pub fn can_transfer(&self) -> bool {
        self.can_transfer
    }

    /// Expiry boundary: `now == expires_at` is still valid, `now >` is not.
    pub fn is_expired(&self, now_ns: u64) -> bool {
        self.expires_at_ns > 0 && now_ns > self.expires_at_ns
    }

    /// Zero the token bytes in place.
    pub fn wipe(&mut self) {
        self.token.zeroize();
    }
}

/// AES-256-GCM sealed token as stored in the slot table.
///
/// `bytes` is ciphertext + 16-byte auth tag appended by the AEAD.
#[derive(Debug, Clone)]
pub struct SealedToken {
    pub(crate) nonce: [u8; 12],
    pub(crate) bytes: Vec<u8>,
    pub(crate) key_version: u32,
}

impl Zeroize for SealedToken {
    fn zeroize(&mut self) {
        self.nonce.zeroize();
        self.bytes.zeroize();
        self.key_version = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(fill: u8) -> SecureToken {
        SecureToken {
            data: [fill; 32],
            generation: 7,
            checksum: 0xDEAD_BEEF,
        }
    }

    #[test]
    fn test_wire_roundtrip() {
        let t = token(0x42);
        let bytes = t.to_bytes();
        let back = SecureToken::from_bytes(&bytes).expect("well-formed wire token");
        assert_eq!(t, back);
        assert!(SecureToken::from_bytes(&bytes[..10]).is_none());
    }

    #[test]
    fn test_ct_eq_covers_all_fields() {
        let a = token(1);
        assert!(a.ct_eq(&a));

        let mut b = a.clone();
        b.data[31] ^= 1;
        assert!(!a.ct_eq(&b));

        let mut c = a.clone();
        c.generation += 1;
        assert!(!a.ct_eq(&c));
    }

    #[test]
    fn test_zeroize_clears_token() {
        let mut t = token(0xFF);
        t.zeroize();
        assert_eq!(t.data, [0u8; 32]);
        assert_eq!(t.generation, 0);
        assert_eq!(t.checksum, 0);
    }

    #[test]
    fn test_expiry_boundary() {
        let cap = TokenCapability {
            slot_id: 1,
            token: token(0),
            level: SecurityLevel::Basic,
            issued_at_ns: 100,
            expires_at_ns: 1_000,
            can_read: true,
            can_write: true,
            can_transfer: false,
        };
        assert!(!cap.is_expired(999));
        assert!(!cap.is_expired(1_000)); // now == expiry is NOT expired
        assert!(cap.is_expired(1_001));

        let no_expiry = TokenCapability {
            expires_at_ns: 0,
            ..cap
        };
        assert!(!no_expiry.is_expired(u64::MAX));
    }
}
