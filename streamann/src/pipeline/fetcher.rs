/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::trace;

use super::message::{send, Expansion, ShardTask, Token};
use crate::{neighbor::Candidate, storage::ShardedIndex, ANNResult};

const STAGE: &str = "fetcher";

/// Resolves expanded candidates to their neighbors and routes each neighbor to the shard
/// that owns it.
///
/// Every expansion produces exactly one [`ShardTask`] per shard, possibly empty, so that
/// the collector can join shard outputs batch by batch.
pub(crate) struct Fetcher {
    index: Arc<ShardedIndex>,
    input: mpsc::Receiver<Token<Expansion>>,
    shards: Vec<mpsc::Sender<Token<ShardTask>>>,
}

impl Fetcher {
    pub(crate) fn new(
        index: Arc<ShardedIndex>,
        input: mpsc::Receiver<Token<Expansion>>,
        shards: Vec<mpsc::Sender<Token<ShardTask>>>,
    ) -> Self {
        Self {
            index,
            input,
            shards,
        }
    }

    pub(crate) async fn run(mut self) -> ANNResult<()> {
        while let Some(token) = self.input.recv().await {
            match token {
                Token::Data(expansion) => self.fan_out(expansion).await?,
                Token::EndOfQuery(end) => {
                    for shard in &self.shards {
                        send(shard, Token::EndOfQuery(end), STAGE).await?;
                    }
                }
                Token::Shutdown => {
                    for shard in &self.shards {
                        send(shard, Token::Shutdown, STAGE).await?;
                    }
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    async fn fan_out(&self, expansion: Expansion) -> ANNResult<()> {
        let Expansion { header, candidates } = expansion;
        let layout = self.index.layout();
        let mut routed = vec![Vec::new(); self.shards.len()];

        for candidate in candidates {
            if header.seed {
                routed[layout.shard_of(candidate.node_id)].push(candidate);
            }
            for id in self.index.neighbors(candidate)?.iter() {
                self.index.check_node(id)?;
                routed[layout.shard_of(id)].push(Candidate::new(id, candidate.layer_id));
            }
        }

        trace!(
            query = %header.ctx.id,
            seq = header.seq,
            routed = routed.iter().map(Vec::len).sum::<usize>(),
            "fan out"
        );
        for (shard, candidates) in self.shards.iter().zip(routed) {
            let task = ShardTask {
                header: header.clone(),
                candidates,
            };
            send(shard, Token::Data(task), STAGE).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        pipeline::message::{QueryContext, QueryEnd, QueryId, RoundHeader},
        storage::IndexBuilder,
        ANNErrorKind,
    };

    fn header(seed: bool) -> RoundHeader {
        RoundHeader {
            ctx: QueryContext {
                id: QueryId(0),
                ef: 1,
                vector: vec![0.0; 16].into(),
            },
            seq: 0,
            seed,
            threshold: f32::INFINITY,
        }
    }

    fn spawn(
        num_shards: usize,
    ) -> (
        mpsc::Sender<Token<Expansion>>,
        Vec<mpsc::Receiver<Token<ShardTask>>>,
        tokio::task::JoinHandle<ANNResult<()>>,
    ) {
        let mut builder = IndexBuilder::flat(1);
        builder.add_node(&[0.0], &[1, 2, 3, 4]).unwrap();
        for i in 1..5 {
            builder.add_node(&[i as f32], &[]).unwrap();
        }
        let index = Arc::new(builder.build(num_shards).unwrap());

        let (tx, rx) = mpsc::channel(8);
        let (senders, receivers): (Vec<_>, Vec<_>) =
            (0..num_shards).map(|_| mpsc::channel(8)).unzip();
        let task = tokio::spawn(Fetcher::new(index, rx, senders).run());
        (tx, receivers, task)
    }

    #[tokio::test]
    async fn test_routes_by_shard() {
        let (tx, mut shards, task) = spawn(2);
        tx.send(Token::Data(Expansion {
            header: header(true),
            candidates: vec![Candidate::new(0, 0)],
        }))
        .await
        .unwrap();

        let mut seen = Vec::new();
        for (s, rx) in shards.iter_mut().enumerate() {
            match rx.recv().await {
                Some(Token::Data(task)) => {
                    for c in &task.candidates {
                        assert_eq!(c.node_id as usize % 2, s);
                        seen.push(c.node_id);
                    }
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        seen.sort();
        assert_eq!(seen, vec![0, 1, 2, 3, 4], "the seed is routed with its neighbors");

        // Broadcast of sentinels.
        tx.send(Token::EndOfQuery(QueryEnd {
            id: QueryId(0),
            hops: 1,
        }))
        .await
        .unwrap();
        tx.send(Token::Shutdown).await.unwrap();
        for rx in shards.iter_mut() {
            assert!(matches!(rx.recv().await, Some(Token::EndOfQuery(_))));
            assert!(matches!(rx.recv().await, Some(Token::Shutdown)));
        }
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_empty_tasks_are_still_sent() {
        let (tx, mut shards, task) = spawn(3);
        tx.send(Token::Data(Expansion {
            header: header(false),
            candidates: vec![Candidate::new(4, 0)],
        }))
        .await
        .unwrap();

        for rx in shards.iter_mut() {
            match rx.recv().await {
                Some(Token::Data(task)) => assert!(task.candidates.is_empty()),
                other => panic!("unexpected {:?}", other),
            }
        }
        drop(tx);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_out_of_range_expansion_fails() {
        let (tx, _shards, task) = spawn(1);
        tx.send(Token::Data(Expansion {
            header: header(false),
            candidates: vec![Candidate::new(99, 0)],
        }))
        .await
        .unwrap();

        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ANNErrorKind::IndexCorruption);
    }
}
