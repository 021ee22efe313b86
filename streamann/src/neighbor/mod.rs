/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

// Exports
mod queue;
pub use queue::{BoundedPriorityQueue, CollectLargest, CollectSmallest, Order};

/// Identifier of a node in the graph.
pub type NodeId = u32;

/// Layer of a hierarchical graph. Layer `0` is the base layer.
pub type LayerId = u8;

///////////////
// Candidate //
///////////////

/// A node queued for expansion or evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Candidate {
    /// The id of the node.
    pub node_id: NodeId,

    /// The layer whose adjacency list this candidate refers to.
    pub layer_id: LayerId,
}

impl Candidate {
    pub fn new(node_id: NodeId, layer_id: LayerId) -> Self {
        Self { node_id, layer_id }
    }

    /// Attach a computed distance to this candidate.
    pub fn scored(self, distance: f32) -> ScoredResult {
        ScoredResult {
            node_id: self.node_id,
            layer_id: self.layer_id,
            distance,
        }
    }
}

//////////////////
// ScoredResult //
//////////////////

/// A candidate with a computed distance to the query.
///
/// Equality compares every field, including the distance. Ordering is left to the
/// [`Order`] used by a [`BoundedPriorityQueue`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredResult {
    /// The id of the node.
    pub node_id: NodeId,

    /// The layer this distance was computed for.
    pub layer_id: LayerId,

    /// The squared Euclidean distance from the query to the node.
    pub distance: f32,
}

impl ScoredResult {
    pub fn new(node_id: NodeId, layer_id: LayerId, distance: f32) -> Self {
        Self {
            node_id,
            layer_id,
            distance,
        }
    }

    /// Drop the distance, returning the underlying candidate.
    pub fn candidate(&self) -> Candidate {
        Candidate::new(self.node_id, self.layer_id)
    }

    /// Return the contents of `self` as an `(id, distance)` tuple.
    pub fn as_tuple(self) -> (NodeId, f32) {
        (self.node_id, self.distance)
    }
}
