/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

//! Streaming search pipeline.
//!
//! A pipeline is a set of tokio tasks joined by bounded channels:
//!
//! ```text
//!              +-----------+     +---------+     +--------+   +----------+
//! queries ---> | scheduler | --> | fetcher | -+> | filter |-->| distance |--+
//!              +-----------+     +---------+  |  +--------+   +----------+  |
//!                    ^                        +> ... one pair per shard ...  +--> collector --> results
//!                    |                                                              |
//!                    +------------------------ feedback ----------------------------+
//! ```
//!
//! The feedback channel from the collector back to the scheduler is the only cycle.
//! Every other channel carries [`Token`]s, so each query is closed by an end-of-query
//! sentinel that flows through every stage, and a shutdown sentinel stops the pipeline.

pub mod config;
pub use config::{Builder, ConfigError, SearchConfig};

mod collector;
mod engine;
pub use engine::SearchEngine;

mod fetcher;

mod message;
pub use message::{QueryEnd, QueryId, QueryStats, SearchOutput, Token};

mod scheduler;
mod shard;

use std::sync::Arc;

use tokio::{sync::mpsc, task::JoinHandle};
use tracing::info;

use self::{
    collector::Collector,
    fetcher::Fetcher,
    message::{send, Control, QueryContext},
    scheduler::Scheduler,
    shard::{DistanceStage, FilterStage},
};
use crate::{
    filter::VisitedFilter,
    neighbor::NodeId,
    storage::ShardedIndex,
    tracing::{spawn_stage, stage_span},
    ANNError, ANNErrorKind, ANNResult,
};

///////////
// Query //
///////////

/// One nearest-neighbor request.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    vector: Vec<f32>,
    ef: usize,
    entry_point: Option<NodeId>,
}

impl Query {
    /// Search for the `ef` nearest neighbors of `vector`, starting from the index's entry
    /// point.
    pub fn new(vector: impl Into<Vec<f32>>, ef: usize) -> Self {
        Self {
            vector: vector.into(),
            ef,
            entry_point: None,
        }
    }

    /// Start the traversal from `entry_point` instead.
    pub fn with_entry_point(mut self, entry_point: NodeId) -> Self {
        self.entry_point = Some(entry_point);
        self
    }

    pub fn vector(&self) -> &[f32] {
        &self.vector
    }

    pub fn ef(&self) -> usize {
        self.ef
    }

    pub fn entry_point(&self) -> Option<NodeId> {
        self.entry_point
    }
}

////////////////////
// SearchPipeline //
////////////////////

/// A running search pipeline over a shared index.
///
/// Queries are answered in submission order. Dropping the pipeline without calling
/// [`Self::shutdown`] closes its input, and the stage tasks then exit on their own.
pub struct SearchPipeline {
    index: Arc<ShardedIndex>,
    config: SearchConfig,
    control: mpsc::Sender<Control>,
    results: mpsc::Receiver<SearchOutput>,
    tasks: Vec<JoinHandle<ANNResult<()>>>,
    next_id: u64,
}

impl SearchPipeline {
    /// Start the stage tasks on the current tokio runtime.
    ///
    /// Spawns one scheduler, one fetcher and one collector, plus a filter and a distance
    /// task for every shard of `index`.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime.
    pub fn spawn(index: Arc<ShardedIndex>, config: SearchConfig) -> ANNResult<Self> {
        let capacity = config.channel_capacity();
        let num_shards = index.num_shards();

        let (control_tx, control_rx) = mpsc::channel(capacity);
        let (feedback_tx, feedback_rx) = mpsc::channel(capacity);
        let (expansion_tx, expansion_rx) = mpsc::channel(capacity);
        let (result_tx, result_rx) = mpsc::channel(capacity);

        // Build all filters first so a bad configuration spawns nothing.
        let filters = (0..num_shards)
            .map(|_| {
                VisitedFilter::new(
                    config.bucket_bits(),
                    config.num_hash_functions(),
                    config.hash_seed(),
                    config.visited_filter(),
                )
            })
            .collect::<ANNResult<Vec<_>>>()?;

        let mut tasks = Vec::with_capacity(3 + 2 * num_shards);
        let mut shard_inputs = Vec::with_capacity(num_shards);
        let mut shard_outputs = Vec::with_capacity(num_shards);
        for (shard, filter) in filters.into_iter().enumerate() {
            let (task_tx, task_rx) = mpsc::channel(capacity);
            let (filtered_tx, filtered_rx) = mpsc::channel(capacity);
            let (scores_tx, scores_rx) = mpsc::channel(capacity);

            let filter = FilterStage::new(shard, filter, config.burst_size(), task_rx, filtered_tx);
            tasks.push(spawn_stage(stage_span("filter", Some(shard)), filter.run()));

            let distance = DistanceStage::new(shard, index.clone(), filtered_rx, scores_tx);
            tasks.push(spawn_stage(
                stage_span("distance", Some(shard)),
                distance.run(),
            ));

            shard_inputs.push(task_tx);
            shard_outputs.push(scores_rx);
        }

        let scheduler = Scheduler::new(
            index.clone(),
            &config,
            control_rx,
            feedback_rx,
            expansion_tx,
        );
        tasks.push(spawn_stage(stage_span("scheduler", None), scheduler.run()));

        let fetcher = Fetcher::new(index.clone(), expansion_rx, shard_inputs);
        tasks.push(spawn_stage(stage_span("fetcher", None), fetcher.run()));

        let collector = Collector::new(config.max_ef(), shard_outputs, feedback_tx, result_tx);
        tasks.push(spawn_stage(stage_span("collector", None), collector.run()));

        info!(
            shards = num_shards,
            batch_size = config.batch_size(),
            pipeline_depth = config.pipeline_depth(),
            bucket_bits = config.bucket_bits(),
            visited_filter = ?config.visited_filter(),
            "search pipeline started"
        );

        Ok(Self {
            index,
            config,
            control: control_tx,
            results: result_rx,
            tasks,
            next_id: 0,
        })
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    pub fn index(&self) -> &Arc<ShardedIndex> {
        &self.index
    }

    /// Validate `query` and assign its id.
    fn prepare(&mut self, query: Query) -> ANNResult<(QueryId, Control)> {
        let dim = self.index.dim();
        if query.vector.len() != dim {
            return Err(ANNError::log_dimension_mismatch_error(
                dim,
                query.vector.len(),
            ));
        }
        if query.ef == 0 || query.ef > self.config.max_ef() {
            return Err(ANNError::log_index_config_error(
                "ef",
                format!("{} is outside [1, {}]", query.ef, self.config.max_ef()),
            ));
        }
        let entry_point = query.entry_point.unwrap_or(self.index.entry_point());
        if entry_point as usize >= self.index.num_vectors() {
            return Err(ANNError::log_index_config_error(
                "entry_point",
                format!(
                    "{} is out of range for {} vectors",
                    entry_point,
                    self.index.num_vectors()
                ),
            ));
        }

        let mut vector = vec![0.0; self.index.padded_dim()];
        vector[..dim].copy_from_slice(&query.vector);

        let id = QueryId(self.next_id);
        self.next_id += 1;
        let control = Control::Search {
            ctx: QueryContext {
                id,
                ef: query.ef,
                vector: vector.into(),
            },
            entry_point,
        };
        Ok((id, control))
    }

    /// Queue one query. Its answer is returned by [`Self::next_result`].
    ///
    /// Results must be drained concurrently when submitting more queries than the channel
    /// capacity, otherwise the pipeline stalls on its full output.
    pub async fn submit(&mut self, query: Query) -> ANNResult<QueryId> {
        let (id, control) = self.prepare(query)?;
        send(&self.control, control, "pipeline").await?;
        Ok(id)
    }

    /// Wait for the next answer. Returns `None` once the pipeline has stopped.
    pub async fn next_result(&mut self) -> Option<SearchOutput> {
        self.results.recv().await
    }

    /// Answer a single query.
    pub async fn search(&mut self, query: Query) -> ANNResult<SearchOutput> {
        let mut outputs = self.search_batch(vec![query]).await?;
        outputs
            .pop()
            .ok_or_else(|| ANNError::log_pipeline_shutdown("no output for the query"))
    }

    /// Answer `queries`, returning one output per query in submission order.
    ///
    /// All queries are validated before any is submitted.
    pub async fn search_batch(&mut self, queries: Vec<Query>) -> ANNResult<Vec<SearchOutput>> {
        let (expected, controls): (Vec<QueryId>, Vec<Control>) = queries
            .into_iter()
            .map(|q| self.prepare(q))
            .collect::<ANNResult<Vec<_>>>()?
            .into_iter()
            .unzip();

        let control = self.control.clone();
        let submit = async move {
            for c in controls {
                send(&control, c, "pipeline").await?;
            }
            Ok::<_, ANNError>(())
        };

        let results = &mut self.results;
        let receive = async {
            let mut outputs = Vec::with_capacity(expected.len());
            for &id in &expected {
                let output = results.recv().await.ok_or_else(|| {
                    ANNError::log_pipeline_shutdown(
                        "pipeline stopped before answering every query",
                    )
                })?;
                if output.query_id != id {
                    return Err(ANNError::message(
                        ANNErrorKind::PipelineShutdown,
                        format!("expected the answer to {}, got {}", id, output.query_id),
                    ));
                }
                outputs.push(output);
            }
            Ok(outputs)
        };

        let ((), outputs) = tokio::try_join!(submit, receive)?;
        Ok(outputs)
    }

    /// Stop the pipeline and wait for every stage.
    ///
    /// Answers not yet read are discarded. Returns the first root-cause stage error, if
    /// any stage failed.
    pub async fn shutdown(mut self) -> ANNResult<()> {
        // The scheduler may already be gone if a stage failed.
        let _ = self.control.send(Control::Shutdown).await;
        drop(self.control);
        while self.results.recv().await.is_some() {}

        let mut first: Option<ANNError> = None;
        for task in self.tasks {
            if let Err(err) = task.await? {
                first = match first {
                    Some(prev)
                        if prev.kind() != ANNErrorKind::PipelineShutdown
                            || err.kind() == ANNErrorKind::PipelineShutdown =>
                    {
                        Some(prev)
                    }
                    _ => Some(err),
                };
            }
        }

        info!("search pipeline stopped");
        match first {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
