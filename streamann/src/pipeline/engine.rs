/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

use std::sync::Arc;

use futures_util::future::try_join_all;
use tracing::info;

use super::{config::SearchConfig, Query, SearchOutput, SearchPipeline};
use crate::{storage::ShardedIndex, ANNError, ANNResult};

/// Several independent pipelines over one shared index.
///
/// Each batch is split round-robin across the pipelines, which then run concurrently.
/// Query ids in the outputs are local to the pipeline that answered them.
pub struct SearchEngine {
    pipelines: Vec<SearchPipeline>,
}

impl SearchEngine {
    /// Start `num_pipelines` pipelines on the current tokio runtime.
    pub fn spawn(
        index: Arc<ShardedIndex>,
        config: SearchConfig,
        num_pipelines: usize,
    ) -> ANNResult<Self> {
        if num_pipelines == 0 {
            return Err(ANNError::log_index_config_error(
                "num_pipelines",
                "it cannot be zero",
            ));
        }
        let pipelines = (0..num_pipelines)
            .map(|_| SearchPipeline::spawn(index.clone(), config.clone()))
            .collect::<ANNResult<Vec<_>>>()?;
        info!(num_pipelines, "search engine started");
        Ok(Self { pipelines })
    }

    pub fn num_pipelines(&self) -> usize {
        self.pipelines.len()
    }

    /// Answer `queries`, returning one output per query in the order given.
    pub async fn search_batch(&mut self, queries: Vec<Query>) -> ANNResult<Vec<SearchOutput>> {
        let num_queries = queries.len();
        let num_pipelines = self.pipelines.len();

        let mut parts: Vec<Vec<Query>> = (0..num_pipelines).map(|_| Vec::new()).collect();
        for (i, query) in queries.into_iter().enumerate() {
            parts[i % num_pipelines].push(query);
        }

        let answered = try_join_all(
            self.pipelines
                .iter_mut()
                .zip(parts)
                .map(|(pipeline, part)| pipeline.search_batch(part)),
        )
        .await?;

        let mut answered: Vec<_> = answered.into_iter().map(Vec::into_iter).collect();
        (0..num_queries)
            .map(|i| {
                answered[i % num_pipelines].next().ok_or_else(|| {
                    ANNError::log_pipeline_shutdown(format!("query {} was not answered", i))
                })
            })
            .collect()
    }

    /// Stop every pipeline, returning the first error.
    pub async fn shutdown(self) -> ANNResult<()> {
        try_join_all(self.pipelines.into_iter().map(SearchPipeline::shutdown)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::{pipeline::Builder, storage::IndexBuilder};

    fn grid_index() -> Arc<ShardedIndex> {
        // 10x10 grid, 4-connected.
        let mut builder = IndexBuilder::flat(2);
        for y in 0..10u32 {
            for x in 0..10u32 {
                let mut neighbors = Vec::new();
                if x > 0 {
                    neighbors.push(y * 10 + x - 1);
                }
                if x < 9 {
                    neighbors.push(y * 10 + x + 1);
                }
                if y > 0 {
                    neighbors.push((y - 1) * 10 + x);
                }
                if y < 9 {
                    neighbors.push((y + 1) * 10 + x);
                }
                builder.add_node(&[x as f32, y as f32], &neighbors).unwrap();
            }
        }
        Arc::new(builder.build(2).unwrap())
    }

    #[rstest]
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_round_robin_preserves_order(#[values(1, 3)] num_pipelines: usize) {
        let config = Builder::new().build().unwrap();
        let mut engine = SearchEngine::spawn(grid_index(), config, num_pipelines).unwrap();
        assert_eq!(engine.num_pipelines(), num_pipelines);

        let queries: Vec<_> = (0..100u32)
            .map(|id| Query::new([(id % 10) as f32 + 0.1, (id / 10) as f32 + 0.1], 1))
            .collect();
        let outputs = engine.search_batch(queries).await.unwrap();
        for (id, output) in outputs.iter().enumerate() {
            assert_eq!(output.ids, vec![id as u32]);
        }
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_zero_pipelines_rejected() {
        let config = Builder::new().build().unwrap();
        assert!(SearchEngine::spawn(grid_index(), config, 0).is_err());
    }
}
