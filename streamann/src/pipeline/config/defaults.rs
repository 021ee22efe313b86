/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

use std::num::NonZeroUsize;

use crate::filter::VisitedFilterScope;

/// Largest result-set size a query may request.
pub const MAX_EF: NonZeroUsize = NonZeroUsize::new(256).unwrap();

/// Room for the best unexpanded candidates of one query.
pub const CANDIDATE_QUEUE_CAPACITY: NonZeroUsize = NonZeroUsize::new(256).unwrap();

/// Candidates popped per expansion batch.
pub const BATCH_SIZE: NonZeroUsize = NonZeroUsize::new(2).unwrap();

/// Expansion batches in flight at once.
pub const PIPELINE_DEPTH: NonZeroUsize = NonZeroUsize::new(4).unwrap();

/// Bucket-count exponent for a single shard.
pub const BUCKET_BITS: u32 = 18;

pub const NUM_HASH_FUNCTIONS: u32 = 3;

pub const HASH_SEED: u32 = 1;

pub const VISITED_FILTER: VisitedFilterScope = VisitedFilterScope::BaseLayerOnly;

/// Surviving candidates handed to distance computation at once. This also bounds the
/// number of outstanding vector fetches per shard.
pub const BURST_SIZE: NonZeroUsize = NonZeroUsize::new(16).unwrap();

pub const CHANNEL_CAPACITY: NonZeroUsize = NonZeroUsize::new(64).unwrap();

/// Bucket-count exponent that keeps the total filter size roughly constant as the node
/// ids are spread over more shards.
pub const fn bucket_bits_for_shards(num_shards: usize) -> u32 {
    match num_shards {
        0 | 1 => 18,
        2 | 3 => 17,
        _ => 16,
    }
}
