/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

//! Values exchanged between pipeline stages.

use std::{fmt, sync::Arc};

use tokio::sync::mpsc;

use crate::{
    neighbor::{Candidate, NodeId, ScoredResult},
    ANNError, ANNResult,
};

/// Identifies one query for its lifetime inside a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueryId(pub u64);

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "q{}", self.0)
    }
}

/// Read-only state of a query, shared by every stage that touches it.
#[derive(Debug, Clone)]
pub struct QueryContext {
    pub id: QueryId,
    pub ef: usize,

    /// The query vector, zero-padded to the index's padded dimension.
    pub vector: Arc<[f32]>,
}

/// Every channel in the pipeline carries tokens.
///
/// A stage forwards `EndOfQuery` only after it has forwarded all data of that query, and
/// `Shutdown` only after everything before it.
#[derive(Debug)]
pub enum Token<T> {
    Data(T),
    EndOfQuery(QueryEnd),
    Shutdown,
}

/// Payload of the end-of-query sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryEnd {
    pub id: QueryId,

    /// Number of candidates the scheduler expanded for this query.
    pub hops: usize,
}

/// Work item handed to the scheduler.
#[derive(Debug)]
pub(crate) enum Control {
    Search {
        ctx: QueryContext,
        entry_point: NodeId,
    },
    Shutdown,
}

/// Header stamped by the scheduler on every expansion batch and carried through all
/// stages until the batch is turned into feedback.
#[derive(Debug, Clone)]
pub(crate) struct RoundHeader {
    pub ctx: QueryContext,

    /// Per-pipeline batch sequence number. Used to check that shard outputs are joined
    /// for the same batch.
    pub seq: u64,

    /// The expanded candidates are scored along with their neighbors.
    pub seed: bool,

    /// Latest result-queue threshold known to the scheduler. Base-layer results at or
    /// above it are dropped by the shards.
    pub threshold: f32,
}

/// Scheduler -> fetcher.
#[derive(Debug)]
pub(crate) struct Expansion {
    pub header: RoundHeader,
    pub candidates: Vec<Candidate>,
}

/// Fetcher -> shard filter. Only candidates owned by the receiving shard.
#[derive(Debug)]
pub(crate) struct ShardTask {
    pub header: RoundHeader,
    pub candidates: Vec<Candidate>,
}

/// Filter -> distance, per batch: `Begin`, zero or more `Burst`s, then `End`.
#[derive(Debug)]
pub(crate) enum Filtered {
    Begin(RoundHeader),
    Burst(Vec<Candidate>),
    End { survivors: usize },
}

/// Distance -> collector.
#[derive(Debug)]
pub(crate) struct ShardScores {
    pub header: RoundHeader,
    pub scored: Vec<ScoredResult>,

    /// Distances computed, including those pruned by the threshold.
    pub evaluated: usize,
}

/// Collector -> scheduler. Exactly one per expansion batch.
#[derive(Debug)]
pub(crate) struct Feedback {
    pub seq: u64,
    pub seed: bool,

    /// Base-layer results accepted into the result queue, in insertion order.
    pub inserted: Vec<ScoredResult>,

    /// Upper-layer results, unfiltered.
    pub upper: Vec<ScoredResult>,

    /// Worst distance kept after the batch, `+inf` while the result queue is not full.
    pub threshold: f32,
}

/// Counters reported with every result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryStats {
    /// Candidates expanded.
    pub hops: usize,

    /// Distances computed.
    pub evaluated: usize,

    /// Result-queue insertions.
    pub inserted: usize,
}

/// The answer to one query.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchOutput {
    pub query_id: QueryId,

    /// Result ids, best first.
    pub ids: Vec<NodeId>,

    /// Squared distances matching `ids`.
    pub distances: Vec<f32>,
    pub stats: QueryStats,
}

impl SearchOutput {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn iter(&self) -> impl ExactSizeIterator<Item = (NodeId, f32)> + '_ {
        self.ids.iter().copied().zip(self.distances.iter().copied())
    }
}

/// Send `value` or fail with [`crate::ANNErrorKind::PipelineShutdown`] if the receiving
/// stage is gone.
pub(crate) async fn send<T>(tx: &mpsc::Sender<T>, value: T, stage: &str) -> ANNResult<()> {
    tx.send(value)
        .await
        .map_err(|_| ANNError::log_pipeline_shutdown(format!("{} lost its output channel", stage)))
}
