/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

//! The two stages every shard worker runs: visited filtering and distance computation.

use std::{mem, sync::Arc};

use tokio::sync::mpsc;
use tracing::trace;

use super::message::{send, Filtered, QueryId, ShardScores, ShardTask, Token};
use crate::{
    distance::squared_l2, filter::VisitedFilter, neighbor::Candidate, storage::ShardedIndex,
    ANNError, ANNErrorKind, ANNResult,
};

/////////////////
// FilterStage //
/////////////////

/// Drops candidates this shard has already seen during the current query.
///
/// The filter is owned exclusively by this stage and cleared when the first batch of a
/// new query arrives. Survivors are forwarded in bursts of at most `burst_size`.
pub(crate) struct FilterStage {
    shard: usize,
    filter: VisitedFilter,
    burst_size: usize,
    current: Option<QueryId>,
    input: mpsc::Receiver<Token<ShardTask>>,
    output: mpsc::Sender<Token<Filtered>>,
}

impl FilterStage {
    pub(crate) fn new(
        shard: usize,
        filter: VisitedFilter,
        burst_size: usize,
        input: mpsc::Receiver<Token<ShardTask>>,
        output: mpsc::Sender<Token<Filtered>>,
    ) -> Self {
        Self {
            shard,
            filter,
            burst_size,
            current: None,
            input,
            output,
        }
    }

    pub(crate) async fn run(mut self) -> ANNResult<()> {
        while let Some(token) = self.input.recv().await {
            match token {
                Token::Data(task) => self.filter_task(task).await?,
                Token::EndOfQuery(end) => {
                    trace!(query = %end.id, visited = self.filter.inserted(), "filter drained");
                    send(&self.output, Token::EndOfQuery(end), "filter").await?;
                }
                Token::Shutdown => {
                    send(&self.output, Token::Shutdown, "filter").await?;
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    async fn filter_task(&mut self, task: ShardTask) -> ANNResult<()> {
        let ShardTask { header, candidates } = task;
        if self.current != Some(header.ctx.id) {
            self.filter.reset();
            self.current = Some(header.ctx.id);
        }

        send(&self.output, Token::Data(Filtered::Begin(header)), "filter").await?;

        let mut survivors = 0;
        let mut burst = Vec::with_capacity(self.burst_size);
        for candidate in candidates {
            if !self.filter.test_and_set(candidate) {
                continue;
            }
            survivors += 1;
            burst.push(candidate);
            if burst.len() == self.burst_size {
                let full = mem::replace(&mut burst, Vec::with_capacity(self.burst_size));
                send(&self.output, Token::Data(Filtered::Burst(full)), "filter").await?;
            }
        }
        if !burst.is_empty() {
            send(&self.output, Token::Data(Filtered::Burst(burst)), "filter").await?;
        }

        trace!(shard = self.shard, survivors, "filtered");
        send(
            &self.output,
            Token::Data(Filtered::End { survivors }),
            "filter",
        )
        .await
    }
}

///////////////////
// DistanceStage //
///////////////////

/// Scores surviving candidates against the query vector.
///
/// Vectors of a burst are gathered from the shard before any distance is computed.
/// Base-layer results at or above the batch threshold are counted but not forwarded.
pub(crate) struct DistanceStage {
    shard: usize,
    index: Arc<ShardedIndex>,
    input: mpsc::Receiver<Token<Filtered>>,
    output: mpsc::Sender<Token<ShardScores>>,
    round: Option<ShardScores>,
    locals: Vec<usize>,
    rows: Vec<f32>,
}

impl DistanceStage {
    pub(crate) fn new(
        shard: usize,
        index: Arc<ShardedIndex>,
        input: mpsc::Receiver<Token<Filtered>>,
        output: mpsc::Sender<Token<ShardScores>>,
    ) -> Self {
        Self {
            shard,
            index,
            input,
            output,
            round: None,
            locals: Vec::new(),
            rows: Vec::new(),
        }
    }

    pub(crate) async fn run(mut self) -> ANNResult<()> {
        while let Some(token) = self.input.recv().await {
            match token {
                Token::Data(Filtered::Begin(header)) => {
                    if self.round.is_some() {
                        return Err(protocol_error("batch started before the previous ended"));
                    }
                    self.round = Some(ShardScores {
                        header,
                        scored: Vec::new(),
                        evaluated: 0,
                    });
                }
                Token::Data(Filtered::Burst(burst)) => {
                    let round = self
                        .round
                        .as_mut()
                        .ok_or_else(|| protocol_error("burst outside of a batch"))?;
                    score_burst(
                        &self.index,
                        self.shard,
                        round,
                        &burst,
                        &mut self.locals,
                        &mut self.rows,
                    )?;
                }
                Token::Data(Filtered::End { survivors }) => {
                    let round = self
                        .round
                        .take()
                        .ok_or_else(|| protocol_error("batch ended before it started"))?;
                    if round.evaluated != survivors {
                        return Err(protocol_error(format!(
                            "{} survivors announced but {} scored",
                            survivors, round.evaluated
                        )));
                    }
                    send(&self.output, Token::Data(round), "distance").await?;
                }
                Token::EndOfQuery(end) => {
                    send(&self.output, Token::EndOfQuery(end), "distance").await?;
                }
                Token::Shutdown => {
                    send(&self.output, Token::Shutdown, "distance").await?;
                    return Ok(());
                }
            }
        }
        Ok(())
    }
}

fn score_burst(
    index: &ShardedIndex,
    shard: usize,
    round: &mut ShardScores,
    burst: &[Candidate],
    locals: &mut Vec<usize>,
    rows: &mut Vec<f32>,
) -> ANNResult<()> {
    let layout = index.layout();
    let vectors = index.vector_shard(shard);
    let query = &round.header.ctx.vector;
    if query.len() != vectors.padded_dim() {
        return Err(ANNError::log_dimension_mismatch_error(
            vectors.padded_dim(),
            query.len(),
        ));
    }

    locals.clear();
    for candidate in burst {
        if layout.shard_of(candidate.node_id) != shard {
            return Err(ANNError::log_index_corruption(format!(
                "node {} routed to shard {}",
                candidate.node_id, shard
            )));
        }
        locals.push(layout.local_index(candidate.node_id));
    }
    vectors.gather_into(locals, rows)?;

    let threshold = round.header.threshold;
    for (candidate, row) in burst.iter().zip(rows.chunks_exact(vectors.padded_dim())) {
        let distance = squared_l2(query, row);
        round.evaluated += 1;
        if candidate.layer_id == 0 && distance >= threshold {
            continue;
        }
        round.scored.push(candidate.scored(distance));
    }
    Ok(())
}

#[track_caller]
fn protocol_error<D: std::fmt::Display>(message: D) -> ANNError {
    ANNError::message(ANNErrorKind::PipelineShutdown, message.to_string())
}
