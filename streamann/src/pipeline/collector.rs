/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

use tokio::sync::mpsc;
use tracing::debug;

use super::message::{
    send, Feedback, QueryEnd, QueryId, QueryStats, SearchOutput, ShardScores, Token,
};
use crate::{neighbor::BoundedPriorityQueue, ANNError, ANNErrorKind, ANNResult};

const STAGE: &str = "collector";

/// What the collector saw after reading one token from every shard.
enum Joined {
    Round(Vec<ShardScores>),
    EndOfQuery(QueryEnd),
    Shutdown,
}

/// Joins shard outputs batch by batch, maintains the result queue and publishes the
/// pruning threshold.
pub(crate) struct Collector {
    results: BoundedPriorityQueue,
    current: Option<QueryId>,
    stats: QueryStats,
    inputs: Vec<mpsc::Receiver<Token<ShardScores>>>,
    feedback: mpsc::Sender<Feedback>,
    output: mpsc::Sender<SearchOutput>,
}

impl Collector {
    pub(crate) fn new(
        max_ef: usize,
        inputs: Vec<mpsc::Receiver<Token<ShardScores>>>,
        feedback: mpsc::Sender<Feedback>,
        output: mpsc::Sender<SearchOutput>,
    ) -> Self {
        Self {
            results: BoundedPriorityQueue::new(max_ef),
            current: None,
            stats: QueryStats::default(),
            inputs,
            feedback,
            output,
        }
    }

    pub(crate) async fn run(mut self) -> ANNResult<()> {
        loop {
            let mut tokens = Vec::with_capacity(self.inputs.len());
            for input in self.inputs.iter_mut() {
                match input.recv().await {
                    Some(token) => tokens.push(token),
                    None => return Ok(()),
                }
            }

            match join(tokens)? {
                Joined::Round(parts) => self.absorb(parts).await?,
                Joined::EndOfQuery(end) => self.finish(end).await?,
                Joined::Shutdown => return Ok(()),
            }
        }
    }

    /// Fold one batch into the result queue and answer the scheduler.
    async fn absorb(&mut self, parts: Vec<ShardScores>) -> ANNResult<()> {
        let (seq, seed, ctx) = match parts.first() {
            Some(first) => (
                first.header.seq,
                first.header.seed,
                first.header.ctx.clone(),
            ),
            None => return Ok(()),
        };

        if self.current != Some(ctx.id) {
            self.results.reconfigure(ctx.ef)?;
            self.current = Some(ctx.id);
            self.stats = QueryStats::default();
        }

        let mut inserted = Vec::new();
        let mut upper = Vec::new();
        for part in parts {
            self.stats.evaluated += part.evaluated;
            for result in part.scored {
                if result.layer_id > 0 {
                    upper.push(result);
                } else if self.results.insert_unique(result) {
                    inserted.push(result);
                }
            }
        }
        self.stats.inserted += inserted.len();

        self.results.sort();
        let feedback = Feedback {
            seq,
            seed,
            inserted,
            upper,
            threshold: self.results.worst_distance(),
        };
        send(&self.feedback, feedback, STAGE).await
    }

    /// Flush the result queue of the finished query.
    async fn finish(&mut self, end: QueryEnd) -> ANNResult<()> {
        let mut output = SearchOutput {
            query_id: end.id,
            ids: Vec::new(),
            distances: Vec::new(),
            stats: QueryStats {
                hops: end.hops,
                ..QueryStats::default()
            },
        };

        if self.current == Some(end.id) {
            output.stats.evaluated = self.stats.evaluated;
            output.stats.inserted = self.stats.inserted;
            (output.ids, output.distances) =
                self.results.best_first().map(|r| r.as_tuple()).unzip();
        }
        self.results.reset();
        self.current = None;

        debug!(
            query = %end.id,
            results = output.len(),
            hops = output.stats.hops,
            evaluated = output.stats.evaluated,
            "query complete"
        );
        send(&self.output, output, STAGE).await
    }
}

/// Check that every shard produced the same kind of token for the same batch.
fn join(tokens: Vec<Token<ShardScores>>) -> ANNResult<Joined> {
    let mut tokens = tokens.into_iter();
    let joined = match tokens.next() {
        Some(Token::Data(first)) => {
            let seq = first.header.seq;
            let mut parts = vec![first];
            for token in tokens {
                match token {
                    Token::Data(part) if part.header.seq == seq => parts.push(part),
                    _ => return Err(desync(format!("batch {}", seq))),
                }
            }
            Joined::Round(parts)
        }
        Some(Token::EndOfQuery(end)) => {
            if !tokens.all(|t| matches!(t, Token::EndOfQuery(e) if e == end)) {
                return Err(desync(format!("end of query {}", end.id)));
            }
            Joined::EndOfQuery(end)
        }
        Some(Token::Shutdown) => {
            if !tokens.all(|t| matches!(t, Token::Shutdown)) {
                return Err(desync("shutdown"));
            }
            Joined::Shutdown
        }
        None => Joined::Round(Vec::new()),
    };
    Ok(joined)
}

#[track_caller]
fn desync<D: std::fmt::Display>(what: D) -> ANNError {
    let err = ANNError::message(
        ANNErrorKind::PipelineShutdown,
        format!("shards disagree while joining {}", what),
    );
    tracing::error!(error = %err, "collector out of step");
    err
}
