// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Hardware fingerprinting for host-bound tokens.
//!
//! The fingerprint folds the CPU identity, the motherboard serial, and the
//! MAC of the first non-loopback interface into fixed 64-bit probes. A probe
//! that cannot be read degrades to zero instead of failing initialization;
//! `platform_hash` (pid ^ uid) keeps the fingerprint entropy-bearing even
//! when every hardware probe is unavailable.

use ring::constant_time::verify_slices_are_equal;
use std::hash::{Hash, Hasher};

/// Serialized fingerprint length: 3 x u64 probes + 2 x u32.
pub(crate) const FINGERPRINT_LEN: usize = 32;

/// Host identity snapshot used to bind tokens at level >= Hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HardwareFingerprint {
    cpu_id: u64,
    board_id: u64,
    mac_address: u64,
    platform_hash: u32,
    checksum: u32,
}

impl HardwareFingerprint {
    /// Probe the host. Never fails; unavailable probes read as zero.
    pub fn generate() -> Self {
        let cpu_id = probe_cpu_id();
        let board_id = probe_board_id();
        let mac_address = probe_mac_address();
        let platform_hash = std::process::id() ^ current_uid();

        let mut fp = Self {
            cpu_id,
            board_id,
            mac_address,
            platform_hash,
            checksum: 0,
        };
        fp.checksum = fp.compute_checksum();
        fp
    }

    /// Cyclic XOR-rotate over every byte preceding the checksum field.
    fn compute_checksum(&self) -> u32 {
        let bytes = self.to_bytes();
        let mut checksum = 0u32;
        for &b in &bytes[..FINGERPRINT_LEN - 4] {
            checksum ^= u32::from(b);
            checksum = checksum.rotate_left(1);
        }
        checksum
    }

    /// Whether the stored checksum matches the probe fields.
    pub fn verify_checksum(&self) -> bool {
        self.checksum == self.compute_checksum()
    }

    /// Fixed serialization: probes little-endian, checksum last.
    pub fn to_bytes(&self) -> [u8; FINGERPRINT_LEN] {
        let mut out = [0u8; FINGERPRINT_LEN];
        out[0..8].copy_from_slice(&self.cpu_id.to_le_bytes());
        out[8..16].copy_from_slice(&self.board_id.to_le_bytes());
        out[16..24].copy_from_slice(&self.mac_address.to_le_bytes());
        out[24..28].copy_from_slice(&self.platform_hash.to_le_bytes());
        out[28..32].copy_from_slice(&self.checksum.to_le_bytes());
        out
    }

    /// 32-bit FNV-1a over the serialized fingerprint. Feeds the token
    /// checksum formula; not a security boundary by itself.
    pub fn hash32(&self) -> u32 {
        let mut h: u32 = 0x811c_9dc5;
        for &b in &self.to_bytes() {
            h ^= u32::from(b);
            h = h.wrapping_mul(0x0100_0193);
        }
        h
    }

    /// Constant-time byte-for-byte comparison.
    pub fn ct_eq(&self, other: &Self) -> bool {
        verify_slices_are_equal(&self.to_bytes(), &other.to_bytes()).is_ok()
    }

    #[cfg(test)]
    pub(crate) fn for_testing(cpu_id: u64, board_id: u64, mac_address: u64) -> Self {
        let mut fp = Self {
            cpu_id,
            board_id,
            mac_address,
            platform_hash: 0x5157,
            checksum: 0,
        };
        fp.checksum = fp.compute_checksum();
        fp
    }
}

fn hash_str(s: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    s.hash(&mut hasher);
    hasher.finish()
}

#[cfg(unix)]
fn current_uid() -> u32 {
    // SAFETY: getuid has no preconditions and cannot fail.
    unsafe { libc::getuid() }
}

#[cfg(not(unix))]
fn current_uid() -> u32 {
    0
}

/// CPU identity: stable lines of /proc/cpuinfo, hashed.
///
/// Frequency and bogomips lines vary between reads and are excluded so the
/// probe stays stable for the lifetime of the process.
#[cfg(target_os = "linux")]
fn probe_cpu_id() -> u64 {
    let Ok(info) = std::fs::read_to_string("/proc/cpuinfo") else {
        return 0;
    };
    let stable: String = info
        .lines()
        .filter(|l| {
            l.starts_with("vendor_id")
                || l.starts_with("cpu family")
                || l.starts_with("model")
                || l.starts_with("stepping")
        })
        .collect::<Vec<_>>()
        .join("\n");
    if stable.is_empty() {
        0
    } else {
        hash_str(&stable)
    }
}

#[cfg(not(target_os = "linux"))]
fn probe_cpu_id() -> u64 {
    0
}

/// Motherboard identity from DMI sysfs. Often root-only; degrades to zero.
#[cfg(target_os = "linux")]
fn probe_board_id() -> u64 {
    for path in [
        "/sys/class/dmi/id/board_serial",
        "/sys/class/dmi/id/product_uuid",
        "/sys/class/dmi/id/product_serial",
    ] {
        if let Ok(s) = std::fs::read_to_string(path) {
            let s = s.trim();
            if !s.is_empty() {
                return hash_str(s);
            }
        }
    }
    0
}

#[cfg(not(target_os = "linux"))]
fn probe_board_id() -> u64 {
    0
}

/// MAC of the first non-loopback interface, folded into a u64.
fn probe_mac_address() -> u64 {
    let Ok(ifaces) = local_ip_address::list_afinet_netifas() else {
        return 0;
    };
    for (name, addr) in ifaces {
        if name == "lo" || addr.is_loopback() {
            continue;
        }
        if let Some(mac) = read_mac(&name) {
            return mac;
        }
    }
    0
}

#[cfg(target_os = "linux")]
fn read_mac(iface: &str) -> Option<u64> {
    let raw = std::fs::read_to_string(format!("/sys/class/net/{}/address", iface)).ok()?;
    let mut out: u64 = 0;
    let mut octets = 0;
    for part in raw.trim().split(':') {
        let byte = u8::from_str_radix(part, 16).ok()?;
        out |= u64::from(byte) << (8 * octets);
        octets += 1;
    }
    if octets == 6 && out != 0 {
        Some(out)
    } else {
        None
    }
}

#[cfg(not(target_os = "linux"))]
fn read_mac(_iface: &str) -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_is_stable_within_process() {
        let a = HardwareFingerprint::generate();
        let b = HardwareFingerprint::generate();
        assert_eq!(a, b, "probes must not vary between reads");
        assert!(a.verify_checksum());
    }

    #[test]
    fn test_checksum_detects_tampering() {
        let mut fp = HardwareFingerprint::for_testing(1, 2, 3);
        assert!(fp.verify_checksum());
        fp.cpu_id ^= 0xFF;
        assert!(!fp.verify_checksum());
    }

    #[test]
    fn test_ct_eq_differs_on_any_field() {
        let a = HardwareFingerprint::for_testing(1, 2, 3);
        let b = HardwareFingerprint::for_testing(1, 2, 4);
        assert!(a.ct_eq(&a));
        assert!(!a.ct_eq(&b));
    }

    #[test]
    fn test_hash32_is_deterministic() {
        let a = HardwareFingerprint::for_testing(7, 8, 9);
        assert_eq!(a.hash32(), a.hash32());
    }
}
