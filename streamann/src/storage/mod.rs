/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

//! Read-only graph and vector storage, partitioned into independent shards.

mod builder;
pub use builder::IndexBuilder;

pub mod format;
pub use format::{GraphFile, GraphKind, GraphMetadata, VectorFile};

mod graph;
pub use graph::{adjacency_stride, AdjacencyList, AdjacencyRecords, UpperLayers};

mod index;
pub use index::{ShardedIndex, INDEX_FILE, LABELS_FILE, VECTORS_FILE};

mod vectors;
pub use vectors::VectorShard;

mod writer;
pub use writer::IndexWriter;

use std::num::NonZeroUsize;

use crate::{neighbor::NodeId, ANNError, ANNResult};

/// Alignment in bytes of every on-disk record and every padded vector row.
pub const RECORD_ALIGNMENT: usize = 64;

/////////////////
// ShardLayout //
/////////////////

/// Maps node ids onto `N` shards.
///
/// Node `id` lives in shard `id % N` at local slot `id / N`. When `N` is a power of two
/// this selects shards by the low bits of the id. The mapping is a pure function of the
/// id and the shard count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardLayout {
    num_shards: NonZeroUsize,
}

impl ShardLayout {
    pub fn new(num_shards: usize) -> ANNResult<Self> {
        let num_shards = NonZeroUsize::new(num_shards)
            .ok_or_else(|| ANNError::log_index_config_error("num_shards", "it cannot be zero"))?;
        Ok(Self { num_shards })
    }

    pub fn num_shards(&self) -> usize {
        self.num_shards.get()
    }

    #[inline]
    pub fn shard_of(&self, id: NodeId) -> usize {
        id as usize % self.num_shards
    }

    #[inline]
    pub fn local_index(&self, id: NodeId) -> usize {
        id as usize / self.num_shards
    }

    /// Inverse of (`shard_of`, `local_index`).
    #[inline]
    pub fn global_id(&self, shard: usize, local: usize) -> NodeId {
        (local * self.num_shards.get() + shard) as NodeId
    }

    /// Number of ids in `0..total` that map to `shard`.
    pub fn shard_len(&self, shard: usize, total: usize) -> usize {
        if shard >= total {
            0
        } else {
            (total - shard).div_ceil(self.num_shards.get())
        }
    }
}
