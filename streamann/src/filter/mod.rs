/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

//! Approximate per-query visited set.
//!
//! A [`VisitedFilter`] is a bloom filter: `k` hash functions over a bit array of
//! `2^bucket_bits` bits. A node is reported as already visited only if all `k` of its bits
//! were set before the lookup, so a node that was inserted is always recognised (no false
//! negatives). A novel node whose bits happen to be set by others is wrongly dropped; that
//! costs recall, never correctness.

mod hash;

use crate::{
    neighbor::{Candidate, LayerId},
    ANNError, ANNResult,
};

/// Largest supported bucket-count exponent. The bit array for this size takes 128 MiB.
pub const MAX_BUCKET_BITS: u32 = 30;

/// Largest supported number of hash functions.
pub const MAX_HASH_FUNCTIONS: u32 = 16;

const WORD_BITS: u32 = u64::BITS;

/// Which graph layers the visited filter deduplicates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum VisitedFilterScope {
    /// Every lookup misses. Nothing is deduplicated.
    Disabled,

    /// Only base-layer candidates are filtered. Upper-layer candidates always pass.
    #[default]
    BaseLayerOnly,

    /// Candidates of every layer are filtered. The layer is mixed into the hash seed so a
    /// visit on one layer never marks the same node on another.
    AllLayers,
}

///////////////////
// VisitedFilter //
///////////////////

/// Bloom filter used to drop candidates that were already evaluated during a query.
///
/// Each shard worker owns one filter. Because shards partition the node ids, the union of
/// all shard filters is the visited set of the query.
#[derive(Debug, Clone)]
pub struct VisitedFilter {
    words: Vec<u64>,
    mask: u32,
    bucket_bits: u32,
    num_hashes: u32,
    hash_seed: u32,
    scope: VisitedFilterScope,
    inserted: usize,
}

impl VisitedFilter {
    /// Create an empty filter with `2^bucket_bits` buckets and `num_hashes` hash functions.
    ///
    /// Hash function `j` uses seed `hash_seed + j`.
    pub fn new(
        bucket_bits: u32,
        num_hashes: u32,
        hash_seed: u32,
        scope: VisitedFilterScope,
    ) -> ANNResult<Self> {
        if bucket_bits == 0 || bucket_bits > MAX_BUCKET_BITS {
            return Err(ANNError::log_index_config_error(
                "bucket_bits",
                format!("{} is outside [1, {}]", bucket_bits, MAX_BUCKET_BITS),
            ));
        }
        if num_hashes == 0 || num_hashes > MAX_HASH_FUNCTIONS {
            return Err(ANNError::log_index_config_error(
                "num_hash_functions",
                format!("{} is outside [1, {}]", num_hashes, MAX_HASH_FUNCTIONS),
            ));
        }

        let buckets = 1usize << bucket_bits;
        Ok(Self {
            words: vec![0; buckets.div_ceil(WORD_BITS as usize)],
            mask: ((1u64 << bucket_bits) - 1) as u32,
            bucket_bits,
            num_hashes,
            hash_seed,
            scope,
            inserted: 0,
        })
    }

    /// Clear every bit. Called once at the start of each query.
    pub fn reset(&mut self) {
        self.words.fill(0);
        self.inserted = 0;
    }

    pub fn bucket_count(&self) -> usize {
        1usize << self.bucket_bits
    }

    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    pub fn scope(&self) -> VisitedFilterScope {
        self.scope
    }

    /// Number of candidates recorded as novel since the last reset.
    pub fn inserted(&self) -> usize {
        self.inserted
    }

    /// Return `true` if `layer` is subject to deduplication.
    pub fn applies_to(&self, layer: LayerId) -> bool {
        match self.scope {
            VisitedFilterScope::Disabled => false,
            VisitedFilterScope::BaseLayerOnly => layer == 0,
            VisitedFilterScope::AllLayers => true,
        }
    }

    /// Test `candidate` against the filter and record it.
    ///
    /// Returns `true` if the candidate is novel and should be forwarded for evaluation.
    /// All `k` bit positions are computed before the array is touched; the lookup counts
    /// the positions that were already set, and then sets the rest.
    pub fn test_and_set(&mut self, candidate: Candidate) -> bool {
        if !self.applies_to(candidate.layer_id) {
            return true;
        }

        let mut positions = [0u32; MAX_HASH_FUNCTIONS as usize];
        let positions = &mut positions[..self.num_hashes as usize];
        self.fill_positions(candidate, positions);

        let matches = positions.iter().filter(|&&p| self.is_set(p)).count();
        if matches == positions.len() {
            return false;
        }

        for &p in positions.iter() {
            self.set(p);
        }
        self.inserted += 1;
        true
    }

    /// Return `true` if `candidate` would be reported as visited. Does not modify the
    /// filter.
    pub fn contains(&self, candidate: Candidate) -> bool {
        if !self.applies_to(candidate.layer_id) {
            return false;
        }

        let mut positions = [0u32; MAX_HASH_FUNCTIONS as usize];
        let positions = &mut positions[..self.num_hashes as usize];
        self.fill_positions(candidate, positions);
        positions.iter().all(|&p| self.is_set(p))
    }

    /// The textbook false-positive probability `(1 - e^(-k n / m))^k` after `n` distinct
    /// insertions into `m` buckets with `k` hash functions.
    pub fn false_positive_bound(&self, n: usize) -> f64 {
        let k = self.num_hashes as f64;
        let m = self.bucket_count() as f64;
        (1.0 - (-k * n as f64 / m).exp()).powf(k)
    }

    fn fill_positions(&self, candidate: Candidate, positions: &mut [u32]) {
        let salt = match self.scope {
            VisitedFilterScope::AllLayers => {
                u32::from(candidate.layer_id).wrapping_mul(self.num_hashes)
            }
            _ => 0,
        };
        let seed = self.hash_seed.wrapping_add(salt);
        for (j, p) in positions.iter_mut().enumerate() {
            *p = hash::murmur2_u32(candidate.node_id, seed.wrapping_add(j as u32)) & self.mask;
        }
    }

    #[inline(always)]
    fn is_set(&self, position: u32) -> bool {
        let word = self.words[(position / WORD_BITS) as usize];
        word & (1u64 << (position % WORD_BITS)) != 0
    }

    #[inline(always)]
    fn set(&mut self, position: u32) {
        self.words[(position / WORD_BITS) as usize] |= 1u64 << (position % WORD_BITS);
    }
}

#[cfg(test)]
mod tests {
    use proptest::{prelude::*, test_runner::Config};
    use rand::{Rng, SeedableRng};

    use super::*;
    use crate::ANNErrorKind;

    fn base(id: u32) -> Candidate {
        Candidate::new(id, 0)
    }

    #[test]
    fn test_second_visit_is_dropped() {
        let mut filter = VisitedFilter::new(10, 3, 1, VisitedFilterScope::BaseLayerOnly).unwrap();
        assert!(!filter.contains(base(5)));
        assert!(filter.test_and_set(base(5)));
        assert!(filter.contains(base(5)));
        assert!(!filter.test_and_set(base(5)));
        assert_eq!(filter.inserted(), 1);
    }

    #[test]
    fn test_reset_clears_every_bit() {
        let mut filter = VisitedFilter::new(8, 2, 1, VisitedFilterScope::BaseLayerOnly).unwrap();
        for id in 0..100 {
            filter.test_and_set(base(id));
        }
        filter.reset();
        assert_eq!(filter.inserted(), 0);
        assert!(filter.words.iter().all(|&w| w == 0));
        assert!(filter.test_and_set(base(3)));
    }

    #[test]
    fn test_disabled_always_misses() {
        let mut filter = VisitedFilter::new(4, 3, 1, VisitedFilterScope::Disabled).unwrap();
        for _ in 0..3 {
            assert!(filter.test_and_set(base(9)));
            assert!(!filter.contains(base(9)));
        }
    }

    #[test]
    fn test_base_layer_only_passes_upper_layers() {
        let mut filter = VisitedFilter::new(10, 3, 1, VisitedFilterScope::BaseLayerOnly).unwrap();
        let upper = Candidate::new(42, 2);
        assert!(filter.test_and_set(upper));
        assert!(filter.test_and_set(upper));

        // Upper-layer traffic left the base-layer state untouched.
        assert!(filter.test_and_set(base(42)));
    }

    #[test]
    fn test_all_layers_keeps_layers_apart() {
        let mut filter = VisitedFilter::new(16, 3, 1, VisitedFilterScope::AllLayers).unwrap();
        assert!(filter.test_and_set(Candidate::new(42, 1)));
        assert!(!filter.test_and_set(Candidate::new(42, 1)));
        assert!(filter.test_and_set(base(42)));
    }

    #[test]
    fn test_invalid_parameters() {
        let err = VisitedFilter::new(0, 3, 1, VisitedFilterScope::BaseLayerOnly).unwrap_err();
        assert_eq!(err.kind(), ANNErrorKind::IndexConfigError);
        assert!(VisitedFilter::new(MAX_BUCKET_BITS + 1, 3, 1, Default::default()).is_err());
        assert!(VisitedFilter::new(8, 0, 1, Default::default()).is_err());
        assert!(VisitedFilter::new(8, MAX_HASH_FUNCTIONS + 1, 1, Default::default()).is_err());
    }

    #[test]
    fn test_false_positive_rate_within_bound() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);
        let inserted = 2000;
        let probes = 20_000;
        let trials = 5;

        let mut false_positives = 0usize;
        let mut bound = 0.0;
        for trial in 0..trials {
            let mut filter =
                VisitedFilter::new(16, 3, 1 + trial, VisitedFilterScope::BaseLayerOnly).unwrap();
            bound = filter.false_positive_bound(inserted);

            // Inserted ids come from the lower half of the id space, probes from the upper
            // half, so every probe is a genuinely novel node.
            for _ in 0..inserted {
                filter.test_and_set(base(rng.random_range(0..u32::MAX / 2)));
            }
            false_positives += (0..probes)
                .filter(|_| filter.contains(base(rng.random_range(u32::MAX / 2..u32::MAX))))
                .count();
        }

        let rate = false_positives as f64 / (probes * trials as usize) as f64;
        assert!(
            rate <= 2.0 * bound + 1e-3,
            "observed false-positive rate {rate} exceeds bound {bound}"
        );
    }

    proptest! {
        #![proptest_config(Config {
            cases: 64,
            ..Default::default()
        })]
        #[test]
        // Every id recorded during a query is reported as visited for the rest of it.
        fn no_false_negatives(
            ids in proptest::collection::vec(any::<u32>(), 1..400),
            bucket_bits in 4u32..20,
            num_hashes in 1u32..6,
            seed in any::<u32>(),
        ) {
            let mut filter =
                VisitedFilter::new(bucket_bits, num_hashes, seed, VisitedFilterScope::BaseLayerOnly)
                    .unwrap();
            for (i, &id) in ids.iter().enumerate() {
                filter.test_and_set(base(id));
                for &seen in &ids[..=i] {
                    prop_assert!(filter.contains(base(seen)));
                    prop_assert!(!filter.test_and_set(base(seen)));
                }
            }
        }
    }
}
