/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

pub mod defaults;

use std::num::NonZeroUsize;

use thiserror::Error;

use crate::filter::{VisitedFilterScope, MAX_BUCKET_BITS, MAX_HASH_FUNCTIONS};

//////////////////
// SearchConfig //
//////////////////

/// Validated parameters shared by every stage of a search pipeline.
///
/// Use [`Builder`] to construct one.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchConfig {
    max_ef: NonZeroUsize,
    candidate_queue_capacity: NonZeroUsize,
    batch_size: NonZeroUsize,
    pipeline_depth: NonZeroUsize,
    bucket_bits: u32,
    num_hash_functions: u32,
    hash_seed: u32,
    visited_filter: VisitedFilterScope,
    burst_size: NonZeroUsize,
    channel_capacity: NonZeroUsize,
}

impl SearchConfig {
    fn try_from_builder(builder: Builder) -> Result<Self, ConfigError> {
        let nonzero = |param: &'static str, val: usize| -> Result<NonZeroUsize, ConfigErrorInner> {
            NonZeroUsize::new(val).ok_or(ConfigErrorInner::Zero(param))
        };

        let max_ef = nonzero("max_ef", builder.max_ef)?;
        let candidate_queue_capacity =
            nonzero("candidate_queue_capacity", builder.candidate_queue_capacity)?;
        let batch_size = nonzero("batch_size", builder.batch_size)?;
        let pipeline_depth = nonzero("pipeline_depth", builder.pipeline_depth)?;
        let burst_size = nonzero("burst_size", builder.burst_size)?;
        let channel_capacity = nonzero("channel_capacity", builder.channel_capacity)?;

        if builder.bucket_bits == 0 || builder.bucket_bits > MAX_BUCKET_BITS {
            return Err(ConfigErrorInner::BucketBits(builder.bucket_bits).into());
        }
        if builder.num_hash_functions == 0 || builder.num_hash_functions > MAX_HASH_FUNCTIONS {
            return Err(ConfigErrorInner::HashFunctions(builder.num_hash_functions).into());
        }
        if batch_size > candidate_queue_capacity {
            return Err(ConfigErrorInner::BatchSize(
                batch_size.get(),
                candidate_queue_capacity.get(),
            )
            .into());
        }

        // Every in-flight batch may hold one slot in each channel, plus the end-of-query
        // marker and shutdown token.
        if channel_capacity.get() < pipeline_depth.get() + 2 {
            return Err(ConfigErrorInner::ChannelCapacity(
                channel_capacity.get(),
                pipeline_depth.get(),
            )
            .into());
        }

        Ok(Self {
            max_ef,
            candidate_queue_capacity,
            batch_size,
            pipeline_depth,
            bucket_bits: builder.bucket_bits,
            num_hash_functions: builder.num_hash_functions,
            hash_seed: builder.hash_seed,
            visited_filter: builder.visited_filter,
            burst_size,
            channel_capacity,
        })
    }

    /// Build a config with every parameter at its default value.
    pub fn with_defaults() -> Self {
        Self {
            max_ef: defaults::MAX_EF,
            candidate_queue_capacity: defaults::CANDIDATE_QUEUE_CAPACITY,
            batch_size: defaults::BATCH_SIZE,
            pipeline_depth: defaults::PIPELINE_DEPTH,
            bucket_bits: defaults::BUCKET_BITS,
            num_hash_functions: defaults::NUM_HASH_FUNCTIONS,
            hash_seed: defaults::HASH_SEED,
            visited_filter: defaults::VISITED_FILTER,
            burst_size: defaults::BURST_SIZE,
            channel_capacity: defaults::CHANNEL_CAPACITY,
        }
    }

    /// Upper bound on the `ef` of any query. Fixes the result queue allocation.
    pub fn max_ef(&self) -> usize {
        self.max_ef.get()
    }

    pub fn candidate_queue_capacity(&self) -> usize {
        self.candidate_queue_capacity.get()
    }

    /// Maximum number of candidates expanded together.
    pub fn batch_size(&self) -> usize {
        self.batch_size.get()
    }

    /// Maximum number of expansion batches in flight per query.
    pub fn pipeline_depth(&self) -> usize {
        self.pipeline_depth.get()
    }

    pub fn bucket_bits(&self) -> u32 {
        self.bucket_bits
    }

    pub fn num_hash_functions(&self) -> u32 {
        self.num_hash_functions
    }

    pub fn hash_seed(&self) -> u32 {
        self.hash_seed
    }

    pub fn visited_filter(&self) -> VisitedFilterScope {
        self.visited_filter
    }

    pub fn burst_size(&self) -> usize {
        self.burst_size.get()
    }

    pub fn channel_capacity(&self) -> usize {
        self.channel_capacity.get()
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Errors that can occur when building a [`SearchConfig`].
///
/// See [`Builder::build`] for possible failure modes.
#[derive(Debug, Clone, Error)]
#[error(transparent)]
pub struct ConfigError {
    #[from]
    inner: ConfigErrorInner,
}

impl From<ConfigError> for crate::ANNError {
    fn from(error: ConfigError) -> Self {
        crate::ANNError::new(crate::ANNErrorKind::IndexConfigError, error)
    }
}

#[derive(Debug, Clone, Error)]
enum ConfigErrorInner {
    #[error("parameter \"{0}\" invalid because it cannot be zero")]
    Zero(&'static str),
    #[error("parameter \"bucket_bits\" ({}) must be in [1, {}]", .0, MAX_BUCKET_BITS)]
    BucketBits(u32),
    #[error(
        "parameter \"num_hash_functions\" ({}) must be in [1, {}]",
        .0,
        MAX_HASH_FUNCTIONS
    )]
    HashFunctions(u32),
    #[error(
        "parameter \"batch_size\" ({0}) must not be greater than \"candidate_queue_capacity\" ({1})"
    )]
    BatchSize(usize, usize),
    #[error(
        "parameter \"channel_capacity\" ({0}) must be at least \"pipeline_depth\" ({1}) plus 2"
    )]
    ChannelCapacity(usize, usize),
}

/////////////
// Builder //
/////////////

/// Builder for [`SearchConfig`]. Unset parameters take the values in [`defaults`].
#[derive(Debug, Clone)]
pub struct Builder {
    max_ef: usize,
    candidate_queue_capacity: usize,
    batch_size: usize,
    pipeline_depth: usize,
    bucket_bits: u32,
    num_hash_functions: u32,
    hash_seed: u32,
    visited_filter: VisitedFilterScope,
    burst_size: usize,
    channel_capacity: usize,
}

impl Builder {
    pub fn new() -> Self {
        Self {
            max_ef: defaults::MAX_EF.get(),
            candidate_queue_capacity: defaults::CANDIDATE_QUEUE_CAPACITY.get(),
            batch_size: defaults::BATCH_SIZE.get(),
            pipeline_depth: defaults::PIPELINE_DEPTH.get(),
            bucket_bits: defaults::BUCKET_BITS,
            num_hash_functions: defaults::NUM_HASH_FUNCTIONS,
            hash_seed: defaults::HASH_SEED,
            visited_filter: defaults::VISITED_FILTER,
            burst_size: defaults::BURST_SIZE.get(),
            channel_capacity: defaults::CHANNEL_CAPACITY.get(),
        }
    }

    /// Construct a new builder with default values.
    ///
    /// A closure `f` can be used to chain additional builder methods inline.
    pub fn new_with<F>(f: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut this = Self::new();
        f(&mut this);
        this
    }

    pub fn max_ef(&mut self, max_ef: usize) -> &mut Self {
        self.max_ef = max_ef;
        self
    }

    pub fn candidate_queue_capacity(&mut self, capacity: usize) -> &mut Self {
        self.candidate_queue_capacity = capacity;
        self
    }

    /// Configure how many candidates are popped per expansion.
    ///
    /// Must be non-zero and not exceed the candidate queue capacity.
    pub fn batch_size(&mut self, batch_size: usize) -> &mut Self {
        self.batch_size = batch_size;
        self
    }

    pub fn pipeline_depth(&mut self, depth: usize) -> &mut Self {
        self.pipeline_depth = depth;
        self
    }

    /// Configure the visited filter to use `2^bits` buckets per shard.
    pub fn bucket_bits(&mut self, bits: u32) -> &mut Self {
        self.bucket_bits = bits;
        self
    }

    /// Choose [`Self::bucket_bits`] from the shard count using
    /// [`defaults::bucket_bits_for_shards`].
    pub fn bucket_bits_for_shards(&mut self, num_shards: usize) -> &mut Self {
        self.bucket_bits = defaults::bucket_bits_for_shards(num_shards);
        self
    }

    pub fn num_hash_functions(&mut self, k: u32) -> &mut Self {
        self.num_hash_functions = k;
        self
    }

    pub fn hash_seed(&mut self, seed: u32) -> &mut Self {
        self.hash_seed = seed;
        self
    }

    pub fn visited_filter(&mut self, scope: VisitedFilterScope) -> &mut Self {
        self.visited_filter = scope;
        self
    }

    pub fn burst_size(&mut self, burst_size: usize) -> &mut Self {
        self.burst_size = burst_size;
        self
    }

    pub fn channel_capacity(&mut self, capacity: usize) -> &mut Self {
        self.channel_capacity = capacity;
        self
    }

    /// Attempt to build the config. Fails if:
    ///
    /// * Any size parameter is zero.
    /// * `bucket_bits` or `num_hash_functions` is outside the range supported by
    ///   [`crate::filter::VisitedFilter`].
    /// * `batch_size` exceeds `candidate_queue_capacity`.
    /// * `channel_capacity` is less than `pipeline_depth + 2`.
    pub fn build(self) -> Result<SearchConfig, ConfigError> {
        SearchConfig::try_from_builder(self)
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ANNError, ANNErrorKind};

    /// Utility to help check error messages.
    macro_rules! check_msg {
        ($msg:ident, $expected:literal $(,)?) => {
            assert_eq!($msg, $expected, "failed with: {}", $msg,);
        };
    }

    #[test]
    fn test_defaults() {
        let config = Builder::new().build().unwrap();
        assert_eq!(config, SearchConfig::default());
        assert_eq!(config.max_ef(), 256);
        assert_eq!(config.batch_size(), 2);
        assert_eq!(config.pipeline_depth(), 4);
        assert_eq!(config.bucket_bits(), 18);
        assert_eq!(config.num_hash_functions(), 3);
        assert_eq!(config.hash_seed(), 1);
        assert_eq!(config.visited_filter(), VisitedFilterScope::BaseLayerOnly);
    }

    #[test]
    fn test_setters() {
        let config = Builder::new_with(|b| {
            b.max_ef(10)
                .candidate_queue_capacity(32)
                .batch_size(4)
                .pipeline_depth(2)
                .bucket_bits_for_shards(4)
                .num_hash_functions(2)
                .hash_seed(7)
                .visited_filter(VisitedFilterScope::AllLayers)
                .burst_size(8)
                .channel_capacity(4);
        })
        .build()
        .unwrap();

        assert_eq!(config.max_ef(), 10);
        assert_eq!(config.candidate_queue_capacity(), 32);
        assert_eq!(config.batch_size(), 4);
        assert_eq!(config.pipeline_depth(), 2);
        assert_eq!(config.bucket_bits(), 16);
        assert_eq!(config.num_hash_functions(), 2);
        assert_eq!(config.hash_seed(), 7);
        assert_eq!(config.visited_filter(), VisitedFilterScope::AllLayers);
        assert_eq!(config.burst_size(), 8);
        assert_eq!(config.channel_capacity(), 4);
    }

    #[test]
    fn test_bucket_bits_for_shards() {
        assert_eq!(defaults::bucket_bits_for_shards(1), 18);
        assert_eq!(defaults::bucket_bits_for_shards(2), 17);
        assert_eq!(defaults::bucket_bits_for_shards(3), 17);
        assert_eq!(defaults::bucket_bits_for_shards(4), 16);
        assert_eq!(defaults::bucket_bits_for_shards(64), 16);
    }

    #[test]
    fn test_errors() {
        let msg = Builder::new_with(|b| {
            b.batch_size(0);
        })
        .build()
        .unwrap_err()
        .to_string();
        check_msg!(msg, "parameter \"batch_size\" invalid because it cannot be zero");

        let msg = Builder::new_with(|b| {
            b.bucket_bits(31);
        })
        .build()
        .unwrap_err()
        .to_string();
        check_msg!(msg, "parameter \"bucket_bits\" (31) must be in [1, 30]");

        let msg = Builder::new_with(|b| {
            b.num_hash_functions(0);
        })
        .build()
        .unwrap_err()
        .to_string();
        check_msg!(msg, "parameter \"num_hash_functions\" (0) must be in [1, 16]");

        let msg = Builder::new_with(|b| {
            b.batch_size(9).candidate_queue_capacity(8);
        })
        .build()
        .unwrap_err()
        .to_string();
        check_msg!(
            msg,
            "parameter \"batch_size\" (9) must not be greater than \"candidate_queue_capacity\" (8)"
        );

        let msg = Builder::new_with(|b| {
            b.pipeline_depth(8).channel_capacity(9);
        })
        .build()
        .unwrap_err()
        .to_string();
        check_msg!(
            msg,
            "parameter \"channel_capacity\" (9) must be at least \"pipeline_depth\" (8) plus 2"
        );
    }

    #[test]
    fn test_into_ann_error() {
        let err = Builder::new_with(|b| {
            b.max_ef(0);
        })
        .build()
        .unwrap_err();
        let err: ANNError = err.into();
        assert_eq!(err.kind(), ANNErrorKind::IndexConfigError);
    }
}
