/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

use byteorder::{ByteOrder, LittleEndian};

use super::RECORD_ALIGNMENT;
use crate::{
    neighbor::{LayerId, NodeId},
    ANNError, ANNResult,
};

const COUNT_BYTES: usize = std::mem::size_of::<u32>();
const ID_BYTES: usize = std::mem::size_of::<NodeId>();

/// Byte stride of one adjacency record holding up to `max_degree` neighbors.
///
/// A record is a `u32` neighbor count followed by `max_degree` packed `u32` ids, padded
/// to [`RECORD_ALIGNMENT`] bytes.
pub const fn adjacency_stride(max_degree: usize) -> usize {
    (COUNT_BYTES + ID_BYTES * max_degree).div_ceil(RECORD_ALIGNMENT) * RECORD_ALIGNMENT
}

/// Encode one adjacency record into `record`, which must be exactly one stride long.
pub(crate) fn encode_adjacency(record: &mut [u8], neighbors: &[NodeId]) {
    record.fill(0);
    LittleEndian::write_u32(&mut record[..COUNT_BYTES], neighbors.len() as u32);
    let ids = &mut record[COUNT_BYTES..COUNT_BYTES + ID_BYTES * neighbors.len()];
    LittleEndian::write_u32_into(neighbors, ids);
}

///////////////////
// AdjacencyList //
///////////////////

/// A borrowed view of one decoded adjacency record.
#[derive(Debug, Clone, Copy)]
pub struct AdjacencyList<'a> {
    ids: &'a [u8],
}

impl<'a> AdjacencyList<'a> {
    /// Decode the record at the front of `record`, rejecting counts above `max_degree`.
    fn decode(record: &'a [u8], max_degree: usize) -> ANNResult<Self> {
        let count = LittleEndian::read_u32(&record[..COUNT_BYTES]) as usize;
        if count > max_degree {
            return Err(ANNError::log_index_corruption(format!(
                "adjacency count {} exceeds max degree {}",
                count, max_degree
            )));
        }
        Ok(Self {
            ids: &record[COUNT_BYTES..COUNT_BYTES + ID_BYTES * count],
        })
    }

    pub fn len(&self) -> usize {
        self.ids.len() / ID_BYTES
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn iter(&self) -> impl ExactSizeIterator<Item = NodeId> + 'a {
        self.ids.chunks_exact(ID_BYTES).map(LittleEndian::read_u32)
    }

    pub fn to_vec(&self) -> Vec<NodeId> {
        self.iter().collect()
    }
}

//////////////////////
// AdjacencyRecords //
//////////////////////

/// Fixed-stride adjacency records, addressed by position.
#[derive(Debug, Clone)]
pub struct AdjacencyRecords {
    bytes: Vec<u8>,
    stride: usize,
    max_degree: usize,
}

impl AdjacencyRecords {
    /// Wrap `bytes`, which must hold a whole number of records of `max_degree`.
    pub(crate) fn new(bytes: Vec<u8>, max_degree: usize) -> ANNResult<Self> {
        let stride = adjacency_stride(max_degree);
        if bytes.len() % stride != 0 {
            return Err(ANNError::log_invalid_file_format(format!(
                "adjacency region of {}B is not a multiple of the {}B record stride",
                bytes.len(),
                stride
            )));
        }
        Ok(Self {
            bytes,
            stride,
            max_degree,
        })
    }

    /// Create `len` empty records.
    pub(crate) fn zeroed(len: usize, max_degree: usize) -> Self {
        let stride = adjacency_stride(max_degree);
        Self {
            bytes: vec![0; len * stride],
            stride,
            max_degree,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len() / self.stride
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn max_degree(&self) -> usize {
        self.max_degree
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Decode record `index`.
    pub fn get(&self, index: usize) -> ANNResult<AdjacencyList<'_>> {
        let start = index * self.stride;
        match self.bytes.get(start..start + self.stride) {
            Some(record) => AdjacencyList::decode(record, self.max_degree),
            None => Err(ANNError::log_index_corruption(format!(
                "adjacency record {} is outside of {} records",
                index,
                self.len()
            ))),
        }
    }

    /// Overwrite record `index`.
    pub(crate) fn set(&mut self, index: usize, neighbors: &[NodeId]) -> ANNResult<()> {
        if neighbors.len() > self.max_degree {
            return Err(ANNError::log_index_config_error(
                "adjacency list",
                format!(
                    "{} neighbors exceed max degree {}",
                    neighbors.len(),
                    self.max_degree
                ),
            ));
        }
        let start = index * self.stride;
        let stride = self.stride;
        let record = self.bytes.get_mut(start..start + stride).ok_or_else(|| {
            ANNError::log_index_config_error("adjacency record", format!("{} is out of range", index))
        })?;
        encode_adjacency(record, neighbors);
        Ok(())
    }
}

/////////////////
// UpperLayers //
/////////////////

/// Adjacency lists of the layers above the base layer.
///
/// Upper-layer lists are addressed indirectly: each node stores a byte offset into a
/// shared region, and the list for layer `l` sits at `offset + (l - 1) * stride`. Only
/// nodes whose level is at least `l` have a list for that layer.
#[derive(Debug, Clone)]
pub struct UpperLayers {
    levels: Vec<LayerId>,
    offsets: Vec<u64>,
    region: Vec<u8>,
    stride: usize,
    max_degree: usize,
}

impl UpperLayers {
    pub(crate) fn new(
        levels: Vec<LayerId>,
        offsets: Vec<u64>,
        region: Vec<u8>,
        max_degree: usize,
    ) -> ANNResult<Self> {
        if levels.len() != offsets.len() {
            return Err(ANNError::log_invalid_file_format(format!(
                "{} node levels but {} upper-layer offsets",
                levels.len(),
                offsets.len()
            )));
        }

        let stride = adjacency_stride(max_degree);
        for (node, (&level, &offset)) in levels.iter().zip(offsets.iter()).enumerate() {
            if level == 0 {
                continue;
            }
            let end = offset as usize + usize::from(level) * stride;
            if end > region.len() {
                return Err(ANNError::log_index_corruption(format!(
                    "upper-layer lists of node {} end at byte {}, past the {}B region",
                    node,
                    end,
                    region.len()
                )));
            }
        }

        Ok(Self {
            levels,
            offsets,
            region,
            stride,
            max_degree,
        })
    }

    /// The highest layer that holds a list for `node`.
    pub fn level(&self, node: NodeId) -> Option<LayerId> {
        self.levels.get(node as usize).copied()
    }

    pub fn max_degree(&self) -> usize {
        self.max_degree
    }

    pub(crate) fn levels(&self) -> &[LayerId] {
        &self.levels
    }

    pub(crate) fn offsets(&self) -> &[u64] {
        &self.offsets
    }

    pub(crate) fn region(&self) -> &[u8] {
        &self.region
    }

    /// Decode the list of `node` on `layer`, where `layer >= 1`.
    pub fn get(&self, node: NodeId, layer: LayerId) -> ANNResult<AdjacencyList<'_>> {
        let level = self.level(node).ok_or_else(|| {
            ANNError::log_index_corruption(format!("node {} has no upper-layer entry", node))
        })?;
        if layer == 0 || layer > level {
            return Err(ANNError::log_index_corruption(format!(
                "node {} with level {} has no list on layer {}",
                node, level, layer
            )));
        }

        let start = self.offsets[node as usize] as usize + usize::from(layer - 1) * self.stride;
        let record = &self.region[start..start + self.stride];
        AdjacencyList::decode(record, self.max_degree)
    }
}
