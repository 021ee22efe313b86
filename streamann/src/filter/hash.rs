/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

const MURMUR_M: u32 = 0x5bd1_e995;
const MURMUR_R: u32 = 24;

/// MurmurHash2 of a single 4-byte key.
///
/// This is the one-block specialisation of the general algorithm: there is no tail, and the
/// length mixed into the seed is always 4.
#[inline]
pub(crate) fn murmur2_u32(key: u32, seed: u32) -> u32 {
    let mut k = key.wrapping_mul(MURMUR_M);
    k ^= k >> MURMUR_R;
    k = k.wrapping_mul(MURMUR_M);

    let mut h = seed ^ 4;
    h = h.wrapping_mul(MURMUR_M);
    h ^= k;

    h ^= h >> 13;
    h = h.wrapping_mul(MURMUR_M);
    h ^= h >> 15;
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Byte-oriented MurmurHash2 as published, restricted to inputs of length 4.
    fn murmur2_bytes(data: [u8; 4], seed: u32) -> u32 {
        let mut h = seed ^ (data.len() as u32);
        let mut k = u32::from_le_bytes(data);
        k = k.wrapping_mul(MURMUR_M);
        k ^= k >> MURMUR_R;
        k = k.wrapping_mul(MURMUR_M);
        h = h.wrapping_mul(MURMUR_M);
        h ^= k;
        h ^= h >> 13;
        h = h.wrapping_mul(MURMUR_M);
        h ^= h >> 15;
        h
    }

    #[test]
    fn test_matches_byte_oriented_form() {
        for key in [0u32, 1, 7, 0xdead_beef, u32::MAX] {
            for seed in [0u32, 1, 2, 99] {
                assert_eq!(murmur2_u32(key, seed), murmur2_bytes(key.to_le_bytes(), seed));
            }
        }
    }

    #[test]
    fn test_seed_changes_hash() {
        let a = murmur2_u32(12345, 1);
        let b = murmur2_u32(12345, 2);
        assert_ne!(a, b);
    }
}
