//! Hash functions shared by every replica.
//!
//! Lock keys and ring positions must be computed identically on all
//! instances, so the functions here are fixed and have no runtime seed.

use sha2::{Digest, Sha256};

/// 32-bit FNV-1a.
pub fn fnv1a_32(data: &[u8]) -> u32 {
    const OFFSET: u32 = 0x811c9dc5;
    const PRIME: u32 = 0x01000193;

    let mut h = OFFSET;
    for &b in data {
        h ^= b as u32;
        h = h.wrapping_mul(PRIME);
    }
    h
}

/// Map a string into the signed 32-bit advisory lock key space.
///
/// PostgreSQL's two-argument `pg_advisory_xact_lock(int4, int4)` takes
/// signed integers; the FNV-1a bits are reinterpreted, not truncated.
#[inline]
pub fn lock_key(s: &str) -> i32 {
    fnv1a_32(s.as_bytes()) as i32
}

/// 64-bit MurmurHash2 (variant 64A).
pub fn murmur64a(data: &[u8], seed: u64) -> u64 {
    const M: u64 = 0xc6a4a7935bd1e995;
    const R: u32 = 47;

    let len = data.len();
    let mut h: u64 = seed ^ (len as u64).wrapping_mul(M);

    // Process 8-byte chunks
    let mut chunks = data.chunks_exact(8);
    for chunk in &mut chunks {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(chunk);
        let mut k = u64::from_le_bytes(buf);
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h ^= k;
        h = h.wrapping_mul(M);
    }

    // Handle remaining bytes
    let tail = chunks.remainder();
    if !tail.is_empty() {
        for (i, &b) in tail.iter().enumerate().rev() {
            h ^= (b as u64) << (8 * i);
        }
        h = h.wrapping_mul(M);
    }

    // Final mixing
    h ^= h >> R;
    h = h.wrapping_mul(M);
    h ^= h >> R;

    h
}

/// Ring hash used for member placement and key lookup.
#[inline]
pub fn ring_hash(data: &[u8]) -> u64 {
    murmur64a(data, 0)
}

/// Lowercase hex SHA-256 digest.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fnv1a_known_vectors() {
        assert_eq!(fnv1a_32(b""), 0x811c9dc5);
        assert_eq!(fnv1a_32(b"a"), 0xe40c292c);
        assert_eq!(fnv1a_32(b"foobar"), 0xbf9cf968);
    }

    #[test]
    fn test_lock_key_reinterprets_sign() {
        // 0xe40c292c has the high bit set
        assert!(lock_key("a") < 0);
        assert_eq!(lock_key("a") as u32, 0xe40c292c);
        assert_eq!(lock_key("events"), lock_key("events"));
        assert_ne!(lock_key("events"), lock_key("instances"));
    }

    #[test]
    fn test_murmur64a_properties() {
        assert_eq!(murmur64a(b"", 0), 0);
        assert_eq!(murmur64a(b"cluster-1", 0), murmur64a(b"cluster-1", 0));
        assert_ne!(murmur64a(b"cluster-1", 0), murmur64a(b"cluster-2", 0));
        assert_ne!(murmur64a(b"cluster-1", 0), murmur64a(b"cluster-1", 1));
        // tail lengths 1..7 all mix in
        let data = b"abcdefghijklmno";
        let hashes: std::collections::HashSet<u64> =
            (8..=15).map(|n| ring_hash(&data[..n])).collect();
        assert_eq!(hashes.len(), 8);
    }

    #[test]
    fn test_sha256_empty() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
