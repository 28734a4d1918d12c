// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Security context: master key, token issuance, validation chain.
//!
//! The master key is SHA-256 of the hardware fingerprint mixed with a
//! compile-time constant, held in mlocked memory and zeroized on drop.
//! The fingerprint itself is hot-swappable (re-probe via
//! [`SecurityContext::update_hardware`]) behind an `ArcSwap`.
//!
//! # Validation chain
//!
//! 1. TTL (`now <= expires_at` passes)
//! 2. slot-id binding
//! 3. fingerprint re-probe + constant-time compare (level >= Hardware)
//! 4. token checksum (`fingerprint.hash32() ^ generation`)
//! 5. re-derive the expected token from the stored material, constant-time
//!    compare with the presented one
//!
//! Every failure bumps the counters and emits an audit event; the caller
//! gets an ordinary typed error. Nothing here ever aborts.

use super::audit::AuditLog;
use super::fingerprint::HardwareFingerprint;
use super::token::{
    SealedToken, SecureToken, TokenCapability, TokenMaterial, TOKEN_MATERIAL_LEN, TOKEN_WIRE_LEN,
};
use super::SecurityLevel;
use crate::clock;
use crate::config::SecurityConfig;
use crate::error::{Result, RuntimeError};
use arc_swap::ArcSwap;
use ring::aead::{Aad, BoundKey, Nonce, NonceSequence, OpeningKey, SealingKey, UnboundKey, AES_256_GCM};
use ring::constant_time::verify_slices_are_equal;
use ring::digest::{digest, SHA256};
use ring::error::Unspecified;
use ring::rand::{SecureRandom, SystemRandom};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use zeroize::{Zeroize, Zeroizing};

/// Compile-time key-derivation constant mixed into the master key.
const KEY_DERIVATION_SALT: &[u8; 16] = b"WEFT-MASTER-KD-1";

/// Current sealing key version stamped into sealed tokens.
const KEY_VERSION: u32 = 1;

/// Volatile zeroization followed by a full fence.
///
/// Used on every path that releases storage which held token bytes, so the
/// wipe cannot be reordered past the release.
pub fn secure_wipe(buf: &mut [u8]) {
    buf.zeroize();
    std::sync::atomic::fence(Ordering::SeqCst);
}

/// 256-bit master key in mlocked memory.
struct MasterKey {
    bytes: Box<[u8; 32]>,
}

impl MasterKey {
    /// Derive from the fingerprint XOR the compile-time constant, hashed.
    fn derive(fp: &HardwareFingerprint) -> Self {
        let fp_bytes = fp.to_bytes();
        let mut material = Zeroizing::new([0u8; 32]);
        for (i, out) in material.iter_mut().enumerate() {
            *out = fp_bytes[i] ^ KEY_DERIVATION_SALT[i % KEY_DERIVATION_SALT.len()];
        }

        let d = digest(&SHA256, &material[..]);
        let mut bytes = Box::new([0u8; 32]);
        bytes.copy_from_slice(d.as_ref());

        #[cfg(unix)]
        {
            // SAFETY: bytes is a live heap allocation of exactly 32 bytes;
            // mlock only pins the pages, it never writes. A failure (e.g.
            // RLIMIT_MEMLOCK) degrades protection but not correctness.
            let rc = unsafe { libc::mlock(bytes.as_ptr().cast(), bytes.len()) };
            if rc != 0 {
                log::debug!("mlock of master key failed; continuing unlocked");
            }
        }

        Self { bytes }
    }
}

impl Drop for MasterKey {
    fn drop(&mut self) {
        secure_wipe(&mut self.bytes[..]);
        #[cfg(unix)]
        {
            // SAFETY: same allocation and length that were mlocked in derive.
            unsafe { libc::munlock(self.bytes.as_ptr().cast(), self.bytes.len()) };
        }
    }
}

/// Single-use nonce sequence for ring's `BoundKey` API.
///
/// Nonces are generated externally (one per seal); the sequence hands the
/// same nonce out once and refuses any further use.
struct OneShotNonce {
    nonce: Option<[u8; 12]>,
}

impl OneShotNonce {
    fn new(nonce: [u8; 12]) -> Self {
        Self { nonce: Some(nonce) }
    }
}

impl NonceSequence for OneShotNonce {
    fn advance(&mut self) -> std::result::Result<Nonce, Unspecified> {
        let bytes = self.nonce.take().ok_or(Unspecified)?;
        Nonce::try_assume_unique_for_key(&bytes)
    }
}

/// Monotonic context counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SecurityStats {
    pub tokens_issued: u64,
    pub tokens_validated: u64,
    pub validation_failures: u64,
    pub security_violations: u64,
}

/// Token issuance and validation authority.
pub struct SecurityContext {
    fingerprint: ArcSwap<HardwareFingerprint>,
    master_key: MasterKey,
    config: SecurityConfig,
    rng: SystemRandom,
    audit: AuditLog,
    tokens_issued: AtomicU64,
    tokens_validated: AtomicU64,
    validation_failures: AtomicU64,
    security_violations: AtomicU64,
}

impl SecurityContext {
    /// Probe the host, derive the master key, and arm the audit trail.
    pub fn new(config: SecurityConfig) -> Self {
        let fingerprint = HardwareFingerprint::generate();
        let master_key = MasterKey::derive(&fingerprint);
        let audit = AuditLog::new(config.audit_logging);
        Self {
            fingerprint: ArcSwap::from_pointee(fingerprint),
            master_key,
            config,
            rng: SystemRandom::new(),
            audit,
            tokens_issued: AtomicU64::new(0),
            tokens_validated: AtomicU64::new(0),
            validation_failures: AtomicU64::new(0),
            security_violations: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &SecurityConfig {
        &self.config
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Current fingerprint snapshot.
    pub fn fingerprint(&self) -> HardwareFingerprint {
        **self.fingerprint.load()
    }

    /// Re-probe the host and swap the stored fingerprint.
    pub fn update_hardware(&self) {
        self.fingerprint
            .store(Arc::new(HardwareFingerprint::generate()));
    }

    /// Test hook: install an arbitrary fingerprint as the binding.
    #[cfg(test)]
    pub(crate) fn swap_fingerprint(&self, fp: HardwareFingerprint) {
        self.fingerprint.store(Arc::new(fp));
    }

    /// Issue a capability for `slot_id` at `level`, returning both the
    /// plaintext capability and the derivation material the slot table must
    /// retain for later validation.
    pub fn generate(
        &self,
        slot_id: u32,
        level: SecurityLevel,
    ) -> Result<(TokenCapability, TokenMaterial)> {
        let now = clock::monotonic_ns();
        let ttl_ms = self.config.ttl_for(level);
        let expires_at_ns = if ttl_ms == 0 {
            0
        } else {
            now.saturating_add(ttl_ms.saturating_mul(1_000_000))
        };

        let fp = self.fingerprint.load();
        let mut material: TokenMaterial = Zeroizing::new([0u8; TOKEN_MATERIAL_LEN]);
        material[..32].copy_from_slice(&fp.to_bytes());
        material[32..36].copy_from_slice(&slot_id.to_le_bytes());
        material[36..44].copy_from_slice(&now.to_le_bytes());
        self.rng
            .fill(&mut material[44..])
            .map_err(|_| RuntimeError::InsufficientEntropy)?;

        let mut data = [0u8; 32];
        data.copy_from_slice(digest(&SHA256, &material[..]).as_ref());

        let generation = (self.tokens_issued.fetch_add(1, Ordering::Relaxed) + 1) as u32;
        let checksum = fp.hash32() ^ generation;

        let capability = TokenCapability {
            slot_id,
            token: SecureToken {
                data,
                generation,
                checksum,
            },
            level,
            issued_at_ns: now,
            expires_at_ns,
            can_read: true,
            can_write: true,
            can_transfer: false,
        };
        Ok((capability, material))
    }

    /// Run the full validation chain for a presented capability.
    ///
    /// `material` is the derivation material stored in the slot table at
    /// claim time; the expected token is re-derived from it rather than
    /// freshly generated (fresh randomness could never match).
    pub fn validate(
        &self,
        slot_id: u32,
        capability: &TokenCapability,
        material: &TokenMaterial,
    ) -> Result<()> {
        self.tokens_validated.fetch_add(1, Ordering::Relaxed);
        let now = clock::monotonic_ns();

        if capability.is_expired(now) {
            self.validation_failures.fetch_add(1, Ordering::Relaxed);
            self.audit.record(slot_id, "token_expired", "");
            return Err(RuntimeError::TokenExpired);
        }

        if capability.slot_id != slot_id {
            self.fail_violation(slot_id, "token_slot_mismatch");
            return Err(RuntimeError::InvalidToken);
        }

        if capability.level >= SecurityLevel::Hardware && self.config.hardware_binding {
            let bound = self.fingerprint.load();
            let probed = HardwareFingerprint::generate();
            if !bound.ct_eq(&probed) {
                self.security_violations.fetch_add(1, Ordering::Relaxed);
                self.audit.record(slot_id, "hardware_mismatch", "");
                return Err(RuntimeError::HardwareMismatch);
            }
        }

        let expected_checksum = self.fingerprint.load().hash32() ^ capability.token.generation;
        if capability.token.checksum != expected_checksum {
            self.fail_violation(slot_id, "token_checksum");
            return Err(RuntimeError::InvalidToken);
        }

        let mut expected = [0u8; 32];
        expected.copy_from_slice(digest(&SHA256, &material[..]).as_ref());
        if verify_slices_are_equal(&expected, &capability.token.data).is_err() {
            self.fail_violation(slot_id, "token_mismatch");
            return Err(RuntimeError::InvalidToken);
        }

        Ok(())
    }

    fn fail_violation(&self, slot_id: u32, event: &str) {
        self.validation_failures.fetch_add(1, Ordering::Relaxed);
        self.security_violations.fetch_add(1, Ordering::Relaxed);
        self.audit.record(slot_id, event, "");
    }

    /// Seal a token under the master key (AES-256-GCM, fresh 96-bit nonce).
    ///
    /// The slot id rides along as AAD, binding the sealed bytes to their
    /// table entry.
    pub fn encrypt_token(&self, token: &SecureToken, slot_id: u32) -> Result<SealedToken> {
        let unbound = UnboundKey::new(&AES_256_GCM, &self.master_key.bytes[..])
            .map_err(|_| RuntimeError::CryptographyFailed)?;

        let mut nonce = [0u8; 12];
        self.rng
            .fill(&mut nonce)
            .map_err(|_| RuntimeError::InsufficientEntropy)?;

        let mut sealing_key = SealingKey::new(unbound, OneShotNonce::new(nonce));
        let mut in_out = token.to_bytes().to_vec();
        sealing_key
            .seal_in_place_append_tag(Aad::from(slot_id.to_le_bytes()), &mut in_out)
            .map_err(|_| RuntimeError::CryptographyFailed)?;

        Ok(SealedToken {
            nonce,
            bytes: in_out,
            key_version: KEY_VERSION,
        })
    }

    /// Unseal a stored token. AEAD failure (tampering, wrong slot, wrong
    /// key version) reports `CryptographyFailed`.
    pub fn decrypt_token(&self, sealed: &SealedToken, slot_id: u32) -> Result<SecureToken> {
        if sealed.key_version != KEY_VERSION {
            return Err(RuntimeError::CryptographyFailed);
        }
        let unbound = UnboundKey::new(&AES_256_GCM, &self.master_key.bytes[..])
            .map_err(|_| RuntimeError::CryptographyFailed)?;

        let mut opening_key = OpeningKey::new(unbound, OneShotNonce::new(sealed.nonce));
        let mut in_out = sealed.bytes.clone();
        let plain = opening_key
            .open_in_place(Aad::from(slot_id.to_le_bytes()), &mut in_out)
            .map_err(|_| RuntimeError::CryptographyFailed)?;

        let token = SecureToken::from_bytes(&plain[..TOKEN_WIRE_LEN])
            .ok_or(RuntimeError::CryptographyFailed);
        secure_wipe(&mut in_out);
        token
    }

    /// Fill `buf` from the system CSPRNG.
    pub fn random_bytes(&self, buf: &mut [u8]) -> Result<()> {
        self.rng
            .fill(buf)
            .map_err(|_| RuntimeError::InsufficientEntropy)
    }

    /// Counter snapshot.
    pub fn stats(&self) -> SecurityStats {
        SecurityStats {
            tokens_issued: self.tokens_issued.load(Ordering::Relaxed),
            tokens_validated: self.tokens_validated.load(Ordering::Relaxed),
            validation_failures: self.validation_failures.load(Ordering::Relaxed),
            security_violations: self.security_violations.load(Ordering::Relaxed),
        }
    }

    /// Whether the failure counters crossed the configured anomaly threshold.
    pub fn detect_anomalies(&self) -> bool {
        self.validation_failures.load(Ordering::Relaxed) > self.config.max_validation_failures
    }

    /// Dump counters through the logging facade.
    pub fn log_stats(&self) {
        let s = self.stats();
        log::debug!(
            "security: issued={} validated={} failures={} violations={}",
            s.tokens_issued,
            s.tokens_validated,
            s.validation_failures,
            s.security_violations
        );
    }
}
