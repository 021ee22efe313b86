/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

use super::{
    adjacency_stride,
    format::{GraphFile, GraphKind, GraphMetadata, VectorFile, MAX_LEVEL},
    graph::{encode_adjacency, AdjacencyRecords, UpperLayers},
    ShardedIndex,
};
use crate::{
    distance::padded_dim,
    neighbor::{LayerId, NodeId},
    ANNError, ANNResult,
};

/// Assemble an index from explicit vectors and adjacency lists.
///
/// Node ids are assigned densely in insertion order. Max degrees default to the longest
/// list supplied per layer kind. For hierarchical graphs the entry point defaults to the
/// first node on the highest layer.
#[derive(Debug, Clone)]
pub struct IndexBuilder {
    kind: GraphKind,
    dim: usize,
    vectors: Vec<Vec<f32>>,
    base: Vec<Vec<NodeId>>,

    /// `upper[node][l - 1]` is the list of `node` on layer `l`.
    upper: Vec<Vec<Vec<NodeId>>>,
    entry_point: Option<NodeId>,
    max_degree_base: Option<usize>,
    max_degree_upper: Option<usize>,
}

impl IndexBuilder {
    /// Start a single-layer graph of `dim`-dimensional vectors.
    pub fn flat(dim: usize) -> Self {
        Self::new(GraphKind::Flat, dim)
    }

    /// Start a multi-layer graph of `dim`-dimensional vectors.
    pub fn hierarchical(dim: usize) -> Self {
        Self::new(GraphKind::Hierarchical, dim)
    }

    fn new(kind: GraphKind, dim: usize) -> Self {
        Self {
            kind,
            dim,
            vectors: Vec::new(),
            base: Vec::new(),
            upper: Vec::new(),
            entry_point: None,
            max_degree_base: None,
            max_degree_upper: None,
        }
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    /// Append a node with its base-layer neighbors and return its id.
    pub fn add_node(&mut self, vector: &[f32], neighbors: &[NodeId]) -> ANNResult<NodeId> {
        if vector.len() != self.dim {
            return Err(ANNError::log_dimension_mismatch_error(
                self.dim,
                vector.len(),
            ));
        }
        let id = NodeId::try_from(self.vectors.len())?;
        self.vectors.push(vector.to_vec());
        self.base.push(neighbors.to_vec());
        self.upper.push(Vec::new());
        Ok(id)
    }

    /// Replace the base-layer neighbors of `node`.
    pub fn set_neighbors(&mut self, node: NodeId, neighbors: &[NodeId]) -> ANNResult<()> {
        let slot = self.base.get_mut(node as usize).ok_or_else(|| {
            ANNError::log_index_config_error("node", format!("{} has not been added", node))
        })?;
        *slot = neighbors.to_vec();
        Ok(())
    }

    /// Set the list of `node` on `layer >= 1`, raising the node's level if needed.
    pub fn set_upper_neighbors(
        &mut self,
        node: NodeId,
        layer: LayerId,
        neighbors: &[NodeId],
    ) -> ANNResult<()> {
        if self.kind != GraphKind::Hierarchical {
            return Err(ANNError::log_index_config_error(
                "layer",
                "a flat graph has no upper layers",
            ));
        }
        if layer == 0 || usize::from(layer) > MAX_LEVEL {
            return Err(ANNError::log_index_config_error(
                "layer",
                format!("{} is outside [1, {}]", layer, MAX_LEVEL),
            ));
        }
        let lists = self.upper.get_mut(node as usize).ok_or_else(|| {
            ANNError::log_index_config_error("node", format!("{} has not been added", node))
        })?;
        let layer = usize::from(layer);
        if lists.len() < layer {
            lists.resize(layer, Vec::new());
        }
        lists[layer - 1] = neighbors.to_vec();
        Ok(())
    }

    pub fn entry_point(&mut self, node: NodeId) -> &mut Self {
        self.entry_point = Some(node);
        self
    }

    pub fn max_degree_base(&mut self, max_degree: usize) -> &mut Self {
        self.max_degree_base = Some(max_degree);
        self
    }

    pub fn max_degree_upper(&mut self, max_degree: usize) -> &mut Self {
        self.max_degree_upper = Some(max_degree);
        self
    }

    /// Encode the graph and vectors into their file representations.
    pub fn into_files(self) -> ANNResult<(GraphFile, VectorFile)> {
        let num_vectors = self.vectors.len();
        let max_level = self.upper.iter().map(Vec::len).max().unwrap_or(0);
        let levels: Vec<LayerId> = self.upper.iter().map(|l| l.len() as LayerId).collect();

        let entry_point = match self.entry_point {
            Some(entry) => entry,
            None => levels
                .iter()
                .position(|&l| usize::from(l) == max_level)
                .unwrap_or(0) as NodeId,
        };

        let longest_base = self.base.iter().map(Vec::len).max().unwrap_or(0);
        let longest_upper = self.upper.iter().flatten().map(Vec::len).max().unwrap_or(0);
        let max_degree_base = self.max_degree_base.unwrap_or(longest_base.max(1));
        let max_degree_upper = match self.kind {
            GraphKind::Flat => 0,
            GraphKind::Hierarchical => self.max_degree_upper.unwrap_or(longest_upper.max(1)),
        };

        let metadata = GraphMetadata {
            kind: self.kind,
            num_vectors,
            max_level: max_level as LayerId,
            entry_point,
            max_degree_upper,
            max_degree_base,
        };
        metadata.validate()?;
        if self.kind == GraphKind::Hierarchical && usize::from(levels[entry_point as usize]) < max_level
        {
            return Err(ANNError::log_index_config_error(
                "entry_point",
                format!("node {} does not reach the top layer {}", entry_point, max_level),
            ));
        }

        let mut base = AdjacencyRecords::zeroed(num_vectors, max_degree_base);
        for (node, neighbors) in self.base.iter().enumerate() {
            check_ids(neighbors, num_vectors)?;
            base.set(node, neighbors)?;
        }

        let upper = match self.kind {
            GraphKind::Flat => None,
            GraphKind::Hierarchical => {
                let stride = adjacency_stride(max_degree_upper);
                let mut offsets = Vec::with_capacity(num_vectors);
                let mut region = Vec::new();
                for lists in &self.upper {
                    offsets.push(region.len() as u64);
                    for neighbors in lists {
                        check_ids(neighbors, num_vectors)?;
                        if neighbors.len() > max_degree_upper {
                            return Err(ANNError::log_index_config_error(
                                "upper adjacency list",
                                format!(
                                    "{} neighbors exceed max degree {}",
                                    neighbors.len(),
                                    max_degree_upper
                                ),
                            ));
                        }
                        let start = region.len();
                        region.resize(start + stride, 0);
                        encode_adjacency(&mut region[start..], neighbors);
                    }
                }
                Some(UpperLayers::new(levels, offsets, region, max_degree_upper)?)
            }
        };

        let row = padded_dim(self.dim);
        let mut data = vec![0.0f32; num_vectors * row];
        for (node, vector) in self.vectors.iter().enumerate() {
            data[node * row..node * row + self.dim].copy_from_slice(vector);
        }

        Ok((
            GraphFile {
                metadata,
                base,
                upper,
            },
            VectorFile {
                num_vectors,
                dim: self.dim,
                data,
            },
        ))
    }

    /// Encode and partition the index across `num_shards` shards.
    pub fn build(self, num_shards: usize) -> ANNResult<ShardedIndex> {
        let (graph, vectors) = self.into_files()?;
        ShardedIndex::from_files(graph, vectors, num_shards)
    }
}

fn check_ids(neighbors: &[NodeId], num_vectors: usize) -> ANNResult<()> {
    match neighbors.iter().find(|&&id| id as usize >= num_vectors) {
        Some(id) => Err(ANNError::log_index_config_error(
            "neighbor id",
            format!("{} is out of range for {} vectors", id, num_vectors),
        )),
        None => Ok(()),
    }
}
