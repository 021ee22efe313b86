/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::{
    config::SearchConfig,
    message::{send, Control, Expansion, Feedback, QueryContext, QueryEnd, RoundHeader, Token},
};
use crate::{
    neighbor::{BoundedPriorityQueue, Candidate, LayerId, NodeId, ScoredResult},
    storage::ShardedIndex,
    ANNError, ANNErrorKind, ANNResult,
};

const STAGE: &str = "scheduler";

/// Drives greedy best-first traversal for one query at a time.
///
/// The scheduler owns the candidate queue. It keeps at most `pipeline_depth` expansion
/// batches in flight and consumes exactly one [`Feedback`] per batch. A query is done when
/// nothing is in flight and the best remaining candidate is worse than the threshold.
pub(crate) struct Scheduler {
    index: Arc<ShardedIndex>,
    batch_size: usize,
    pipeline_depth: usize,
    candidates: BoundedPriorityQueue,
    control: mpsc::Receiver<Control>,
    feedback: mpsc::Receiver<Feedback>,
    output: mpsc::Sender<Token<Expansion>>,

    /// Sequence number of the next batch to dispatch.
    seq: u64,

    /// Sequence number of the next feedback to arrive.
    acked: u64,
}

impl Scheduler {
    pub(crate) fn new(
        index: Arc<ShardedIndex>,
        config: &SearchConfig,
        control: mpsc::Receiver<Control>,
        feedback: mpsc::Receiver<Feedback>,
        output: mpsc::Sender<Token<Expansion>>,
    ) -> Self {
        Self {
            index,
            batch_size: config.batch_size(),
            pipeline_depth: config.pipeline_depth(),
            candidates: BoundedPriorityQueue::new(config.candidate_queue_capacity()),
            control,
            feedback,
            output,
            seq: 0,
            acked: 0,
        }
    }

    pub(crate) async fn run(mut self) -> ANNResult<()> {
        while let Some(control) = self.control.recv().await {
            match control {
                Control::Search { ctx, entry_point } => {
                    let id = ctx.id;
                    let hops = self.search(ctx, entry_point).await?;
                    debug!(query = %id, hops, "traversal finished");
                    send(
                        &self.output,
                        Token::EndOfQuery(QueryEnd { id, hops }),
                        STAGE,
                    )
                    .await?;
                }
                Control::Shutdown => {
                    send(&self.output, Token::Shutdown, STAGE).await?;
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Run one query to completion and return the number of expanded candidates.
    async fn search(&mut self, ctx: QueryContext, entry_point: NodeId) -> ANNResult<usize> {
        let mut hops = 0;
        let mut current = ScoredResult::new(entry_point, 0, f32::INFINITY);
        let mut seed = true;

        for layer in (1..=self.index.level(entry_point)?).rev() {
            current = self
                .descend(&ctx, current, layer, &mut seed, &mut hops)
                .await?;
        }

        self.search_base(&ctx, current.node_id, &mut hops).await?;
        Ok(hops)
    }

    /// Greedy walk on an upper layer: move to the closest neighbor while it improves.
    async fn descend(
        &mut self,
        ctx: &QueryContext,
        mut current: ScoredResult,
        layer: LayerId,
        seed: &mut bool,
        hops: &mut usize,
    ) -> ANNResult<ScoredResult> {
        current.layer_id = layer;
        loop {
            self.dispatch(ctx, *seed, f32::INFINITY, vec![current.candidate()])
                .await?;
            *hops += 1;

            let feedback = self.await_feedback().await?;
            if std::mem::take(seed) {
                if let Some(own) = feedback
                    .upper
                    .iter()
                    .find(|r| r.node_id == current.node_id)
                {
                    current.distance = own.distance;
                }
            }

            let closest = feedback
                .upper
                .iter()
                .filter(|r| r.node_id != current.node_id)
                .fold(None::<ScoredResult>, |best, r| match best {
                    Some(b) if b.distance <= r.distance => Some(b),
                    _ => Some(*r),
                });

            match closest {
                Some(next) if next.distance < current.distance => {
                    trace!(
                        query = %ctx.id,
                        layer,
                        from = current.node_id,
                        to = next.node_id,
                        "descent step"
                    );
                    current = next;
                }
                _ => return Ok(current),
            }
        }
    }

    /// Best-first search on the base layer starting from `start`.
    async fn search_base(
        &mut self,
        ctx: &QueryContext,
        start: NodeId,
        hops: &mut usize,
    ) -> ANNResult<()> {
        self.candidates.reset();

        // The seed batch scores `start` itself, so it competes for the result set without
        // passing through the candidate queue.
        let mut threshold = f32::INFINITY;
        self.dispatch(ctx, true, threshold, vec![Candidate::new(start, 0)])
            .await?;
        *hops += 1;
        let mut inflight = 1;

        while inflight > 0 {
            let feedback = self.await_feedback().await?;
            inflight -= 1;
            threshold = feedback.threshold;

            for result in feedback.inserted {
                if feedback.seed && result.node_id == start {
                    continue;
                }
                self.candidates.insert(result);
            }

            while inflight < self.pipeline_depth {
                let batch = self.next_batch(threshold);
                if batch.is_empty() {
                    break;
                }
                *hops += batch.len();
                self.dispatch(ctx, false, threshold, batch).await?;
                inflight += 1;
            }
        }
        Ok(())
    }

    /// Pop up to `batch_size` candidates whose distance does not exceed `threshold`.
    fn next_batch(&mut self, threshold: f32) -> Vec<Candidate> {
        let mut batch = Vec::with_capacity(self.batch_size);
        while batch.len() < self.batch_size {
            match self.candidates.peek_best() {
                Some(best) if best.distance.is_finite() && best.distance <= threshold => {
                    self.candidates.pop_best();
                    batch.push(best.candidate());
                }
                _ => break,
            }
        }
        batch
    }

    async fn dispatch(
        &mut self,
        ctx: &QueryContext,
        seed: bool,
        threshold: f32,
        candidates: Vec<Candidate>,
    ) -> ANNResult<()> {
        let header = RoundHeader {
            ctx: ctx.clone(),
            seq: self.seq,
            seed,
            threshold,
        };
        self.seq += 1;
        trace!(
            query = %ctx.id,
            seq = header.seq,
            layer = candidates.first().map_or(0, |c| c.layer_id),
            len = candidates.len(),
            "dispatch"
        );
        send(
            &self.output,
            Token::Data(Expansion { header, candidates }),
            STAGE,
        )
        .await
    }

    async fn await_feedback(&mut self) -> ANNResult<Feedback> {
        let feedback = self.feedback.recv().await.ok_or_else(|| {
            ANNError::log_pipeline_shutdown("scheduler lost its feedback channel")
        })?;

        if feedback.seq != self.acked {
            return Err(ANNError::message(
                ANNErrorKind::PipelineShutdown,
                format!(
                    "feedback for batch {} arrived while expecting batch {}",
                    feedback.seq, self.acked
                ),
            ));
        }
        self.acked += 1;
        Ok(feedback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        pipeline::{config::Builder, message::QueryId},
        storage::IndexBuilder,
    };

    struct Harness {
        control: mpsc::Sender<Control>,
        feedback: mpsc::Sender<Feedback>,
        expansions: mpsc::Receiver<Token<Expansion>>,
        task: tokio::task::JoinHandle<ANNResult<()>>,
    }

    fn harness(index: ShardedIndex, batch_size: usize, depth: usize) -> Harness {
        let config = Builder::new_with(|b| {
            b.batch_size(batch_size).pipeline_depth(depth);
        })
        .build()
        .unwrap();

        let (control, control_rx) = mpsc::channel(16);
        let (feedback, feedback_rx) = mpsc::channel(16);
        let (output, expansions) = mpsc::channel(16);
        let scheduler = Scheduler::new(Arc::new(index), &config, control_rx, feedback_rx, output);
        Harness {
            control,
            feedback,
            expansions,
            task: tokio::spawn(scheduler.run()),
        }
    }

    fn star_index(n: u32) -> ShardedIndex {
        let mut builder = IndexBuilder::flat(1);
        let spokes: Vec<NodeId> = (1..n).collect();
        builder.add_node(&[0.0], &spokes).unwrap();
        for i in 1..n {
            builder.add_node(&[i as f32], &[0]).unwrap();
        }
        builder.build(1).unwrap()
    }

    fn context(ef: usize) -> QueryContext {
        QueryContext {
            id: QueryId(7),
            ef,
            vector: vec![0.0; 16].into(),
        }
    }

    async fn expect_data(rx: &mut mpsc::Receiver<Token<Expansion>>) -> Expansion {
        match rx.recv().await {
            Some(Token::Data(expansion)) => expansion,
            other => panic!("expected an expansion, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_seed_only_query_finishes() {
        let mut h = harness(star_index(4), 2, 2);
        h.control
            .send(Control::Search {
                ctx: context(1),
                entry_point: 0,
            })
            .await
            .unwrap();

        let seed = expect_data(&mut h.expansions).await;
        assert!(seed.header.seed);
        assert_eq!(seed.header.threshold, f32::INFINITY);
        assert_eq!(seed.candidates, vec![Candidate::new(0, 0)]);

        // Only the seed itself was kept.
        h.feedback
            .send(Feedback {
                seq: seed.header.seq,
                seed: true,
                inserted: vec![ScoredResult::new(0, 0, 0.0)],
                upper: Vec::new(),
                threshold: 0.0,
            })
            .await
            .unwrap();

        match h.expansions.recv().await {
            Some(Token::EndOfQuery(end)) => assert_eq!(end.hops, 1),
            other => panic!("expected end of query, got {:?}", other),
        }

        h.control.send(Control::Shutdown).await.unwrap();
        assert!(matches!(h.expansions.recv().await, Some(Token::Shutdown)));
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_depth_and_threshold_are_respected() {
        let mut h = harness(star_index(8), 1, 2);
        h.control
            .send(Control::Search {
                ctx: context(4),
                entry_point: 0,
            })
            .await
            .unwrap();

        let seed = expect_data(&mut h.expansions).await;
        let inserted: Vec<_> = (1..8)
            .map(|i| ScoredResult::new(i, 0, i as f32))
            .collect();
        h.feedback
            .send(Feedback {
                seq: seed.header.seq,
                seed: true,
                inserted,
                upper: Vec::new(),
                threshold: 2.0,
            })
            .await
            .unwrap();

        // Two batches fit in flight. Both are within the threshold.
        let first = expect_data(&mut h.expansions).await;
        let second = expect_data(&mut h.expansions).await;
        assert_eq!(first.candidates, vec![Candidate::new(1, 0)]);
        assert_eq!(second.candidates, vec![Candidate::new(2, 0)]);
        assert_eq!(second.header.threshold, 2.0);
        assert!(h.expansions.try_recv().is_err());

        for batch in [first, second] {
            h.feedback
                .send(Feedback {
                    seq: batch.header.seq,
                    seed: false,
                    inserted: Vec::new(),
                    upper: Vec::new(),
                    threshold: 2.0,
                })
                .await
                .unwrap();
        }

        // Candidate 3 is worse than the threshold, so the query ends.
        match h.expansions.recv().await {
            Some(Token::EndOfQuery(end)) => assert_eq!(end.hops, 3),
            other => panic!("expected end of query, got {:?}", other),
        }

        drop(h.control);
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_lost_feedback_is_an_error() {
        let mut h = harness(star_index(2), 1, 1);
        h.control
            .send(Control::Search {
                ctx: context(1),
                entry_point: 0,
            })
            .await
            .unwrap();
        expect_data(&mut h.expansions).await;
        drop(h.feedback);

        let err = h.task.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ANNErrorKind::PipelineShutdown);
    }
}
