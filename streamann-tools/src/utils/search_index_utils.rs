/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */
use std::{fs::File, io::BufWriter, path::Path, sync::Arc, time::Instant};

use serde::Serialize;
use streamann::{
    pipeline::{config::defaults, Builder},
    ANNError, Query, SearchConfig, SearchEngine, SearchOutput, ShardedIndex,
};
use tracing::info;

use crate::utils::{index_dir, CMDResult, CMDToolError, Dataset, GraphType, TruthSet};

/// Fraction of the top `k` ground truth ids found in the top `k` results, averaged over all
/// queries.
///
/// With `k == 1` this is the fraction of queries whose best result is the true nearest
/// neighbor. Queries that returned fewer than `k` results count their missing slots as
/// misses.
pub fn calculate_recall(results: &[Vec<u32>], truth: &TruthSet, k: usize) -> CMDResult<f64> {
    if k == 0 || k > truth.k() {
        return Err(CMDToolError {
            details: format!("recall depth {} must be in [1, {}]", k, truth.k()),
        });
    }
    if results.len() > truth.num_queries() {
        return Err(CMDToolError {
            details: format!(
                "{} results but only {} ground truth rows",
                results.len(),
                truth.num_queries()
            ),
        });
    }
    if results.is_empty() {
        return Ok(0.0);
    }

    let found: usize = results
        .iter()
        .enumerate()
        .map(|(i, ids)| {
            let gt = &truth.neighbors(i)[..k];
            ids.iter().take(k).filter(|id| gt.contains(id)).count()
        })
        .sum();
    Ok(found as f64 / (results.len() * k) as f64)
}

/// Replace internal node ids with the external labels of `labels.bin`.
pub fn translate_ids(ids: &mut [u32], labels: &[u32]) -> CMDResult<()> {
    for id in ids.iter_mut() {
        *id = *labels.get(*id as usize).ok_or_else(|| CMDToolError {
            details: format!("node {} has no label ({} labels)", id, labels.len()),
        })?;
    }
    Ok(())
}

/// Build the search configuration used by the command line tools.
///
/// `bucket_bits` falls back to the per-shard default. The channel capacity grows with the
/// pipeline depth.
pub fn tool_config(
    ef: usize,
    batch_size: usize,
    pipeline_depth: usize,
    num_shards: usize,
    bucket_bits: Option<u32>,
) -> CMDResult<SearchConfig> {
    let builder = Builder::new_with(|b| {
        b.max_ef(ef.max(defaults::MAX_EF.get()))
            .batch_size(batch_size)
            .pipeline_depth(pipeline_depth)
            .channel_capacity(
                defaults::CHANNEL_CAPACITY
                    .get()
                    .max(pipeline_depth.saturating_add(2)),
            );
        match bucket_bits {
            Some(bits) => b.bucket_bits(bits),
            None => b.bucket_bits_for_shards(num_shards),
        };
    });
    builder.build().map_err(|err| ANNError::from(err).into())
}

pub struct SearchIndexParameters<'a> {
    pub dataset: Dataset,
    pub graph_type: GraphType,
    pub max_degree: usize,
    pub ef: usize,
    pub query_num: Option<usize>,
    pub batch_size: usize,
    pub pipeline_depth: usize,
    pub num_shards: usize,
    pub num_pipelines: usize,
    pub bucket_bits: Option<u32>,
    pub index_dir: &'a Path,
    pub query_file: &'a Path,
    pub gt_file: &'a Path,
    pub summary_path: Option<&'a Path>,
}

/// Results of one `search_index` run, also written as JSON to the summary path.
#[derive(Debug, Clone, Serialize)]
pub struct SearchSummary {
    pub dataset: Dataset,
    pub graph_type: GraphType,
    pub max_degree: usize,
    pub ef: usize,
    pub num_queries: usize,
    pub batch_size: usize,
    pub pipeline_depth: usize,
    pub num_shards: usize,
    pub num_pipelines: usize,
    pub bucket_bits: u32,
    pub recall_at_1: f64,
    pub recall_at_10: f64,
    pub qps: f64,
    pub mean_hops: f64,
    pub mean_evaluated: f64,
    pub elapsed_secs: f64,
}

pub fn search_index(params: SearchIndexParameters) -> CMDResult<SearchSummary> {
    let dir = index_dir(
        params.index_dir,
        params.graph_type,
        params.dataset,
        params.max_degree,
    );
    let index = Arc::new(ShardedIndex::load(
        &dir,
        params.graph_type.kind(),
        params.num_shards,
    )?);
    let labels = ShardedIndex::load_labels(&dir)?;
    if index.dim() != params.dataset.dim() {
        return Err(CMDToolError {
            details: format!(
                "index dimension {} does not match {} ({})",
                index.dim(),
                params.dataset,
                params.dataset.dim()
            ),
        });
    }

    let query_bytes = std::fs::read(params.query_file).map_err(|err| CMDToolError {
        details: format!("reading {}: {}", params.query_file.display(), err),
    })?;
    let vectors = params.dataset.query_format().parse(
        &query_bytes,
        params.dataset.dim(),
        params.query_num,
    )?;
    let truth = TruthSet::load(params.gt_file, params.dataset.ground_truth_format())?;
    info!("Loaded {} queries from {}", vectors.len(), params.query_file.display());

    let config = tool_config(
        params.ef,
        params.batch_size,
        params.pipeline_depth,
        params.num_shards,
        params.bucket_bits,
    )?;
    let bucket_bits = config.bucket_bits();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let ef = params.ef;
    let num_pipelines = params.num_pipelines;
    let (outputs, elapsed) = runtime.block_on(async move {
        let mut engine = SearchEngine::spawn(index, config, num_pipelines)?;
        let queries = vectors.into_iter().map(|v| Query::new(v, ef)).collect();

        let timer = Instant::now();
        let outputs = engine.search_batch(queries).await;
        let elapsed = timer.elapsed();

        // A failed stage reports its own error from shutdown.
        match (outputs, engine.shutdown().await) {
            (Ok(outputs), Ok(())) => Ok((outputs, elapsed)),
            (_, Err(err)) | (Err(err), Ok(())) => Err::<_, ANNError>(err),
        }
    })?;

    let num_queries = outputs.len();
    let mut results: Vec<Vec<u32>> = outputs.iter().map(|o| o.ids.clone()).collect();
    if let Some(labels) = &labels {
        for ids in results.iter_mut() {
            translate_ids(ids, labels)?;
        }
    }

    let elapsed_secs = elapsed.as_secs_f64();
    let summary = SearchSummary {
        dataset: params.dataset,
        graph_type: params.graph_type,
        max_degree: params.max_degree,
        ef: params.ef,
        num_queries,
        batch_size: params.batch_size,
        pipeline_depth: params.pipeline_depth,
        num_shards: params.num_shards,
        num_pipelines: params.num_pipelines,
        bucket_bits,
        recall_at_1: calculate_recall(&results, &truth, 1)?,
        recall_at_10: calculate_recall(&results, &truth, truth.k().min(10))?,
        qps: if elapsed_secs > 0.0 {
            num_queries as f64 / elapsed_secs
        } else {
            0.0
        },
        mean_hops: mean(&outputs, |o| o.stats.hops),
        mean_evaluated: mean(&outputs, |o| o.stats.evaluated),
        elapsed_secs,
    };

    println!("Recall@1={:.4}", summary.recall_at_1);
    println!("Recall@10={:.4}", summary.recall_at_10);
    println!("QPS={:.1}", summary.qps);
    println!(
        "Average hops={:.2}, average evaluated={:.2}",
        summary.mean_hops, summary.mean_evaluated
    );

    if let Some(path) = params.summary_path {
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut writer, &summary)?;
        info!("Wrote summary to {}", path.display());
    }
    Ok(summary)
}

fn mean<F>(outputs: &[SearchOutput], f: F) -> f64
where
    F: Fn(&SearchOutput) -> usize,
{
    if outputs.is_empty() {
        return 0.0;
    }
    outputs.iter().map(f).sum::<usize>() as f64 / outputs.len() as f64
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use streamann::storage::{IndexBuilder, IndexWriter};

    use super::*;

    fn truth(rows: &[&[u32]]) -> TruthSet {
        let k = rows[0].len();
        TruthSet::new(rows.iter().flat_map(|r| r.iter().copied()).collect(), k).unwrap()
    }

    #[test]
    fn test_recall() {
        let gt = truth(&[&[1, 2, 3], &[4, 5, 6]]);
        let results = vec![vec![1, 3, 9], vec![5, 4, 6]];
        assert_eq!(calculate_recall(&results, &gt, 1).unwrap(), 0.5);
        assert_eq!(calculate_recall(&results, &gt, 3).unwrap(), 5.0 / 6.0);

        // Short result lists count the missing slots as misses.
        let results = vec![vec![1], vec![4]];
        assert_eq!(calculate_recall(&results, &gt, 3).unwrap(), 2.0 / 6.0);

        assert!(calculate_recall(&results, &gt, 0).is_err());
        assert!(calculate_recall(&results, &gt, 4).is_err());
    }

    #[test]
    fn test_translate_ids() {
        let mut ids = vec![2, 0];
        translate_ids(&mut ids, &[10, 11, 12]).unwrap();
        assert_eq!(ids, vec![12, 10]);
        assert!(translate_ids(&mut [3], &[10, 11, 12]).is_err());
    }

    #[test]
    fn test_tool_config() {
        let config = tool_config(10, 4, 100, 2, None).unwrap();
        assert_eq!(config.bucket_bits(), 17);
        assert_eq!(config.channel_capacity(), 102);
        assert_eq!(config.max_ef(), defaults::MAX_EF.get());

        assert_eq!(tool_config(10, 2, 4, 1, Some(12)).unwrap().bucket_bits(), 12);
        assert!(tool_config(10, 0, 4, 1, None).is_err());
    }

    fn write_bin<T: Copy>(
        path: &Path,
        rows: usize,
        cols: usize,
        data: &[T],
        to_le: fn(T) -> [u8; 4],
    ) {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(rows as i32).to_le_bytes());
        bytes.extend_from_slice(&(cols as i32).to_le_bytes());
        for &value in data {
            bytes.extend_from_slice(&to_le(value));
        }
        std::fs::write(path, bytes).unwrap();
    }

    #[test]
    fn test_search_index_end_to_end() {
        let _guard = crate::utils::init_test_subscriber();
        let root = tempfile::tempdir().unwrap();
        let dataset = Dataset::Deep1M;
        let dim = dataset.dim();
        let num_points = 40;
        let num_queries = 5;

        let mut rng = StdRng::seed_from_u64(0x5eed);
        let points: Vec<Vec<f32>> = (0..num_points)
            .map(|_| (0..dim).map(|_| rng.random::<f32>()).collect())
            .collect();

        // A complete graph, so every search is exact.
        let mut builder = IndexBuilder::flat(dim);
        for (i, point) in points.iter().enumerate() {
            let neighbors: Vec<u32> = (0..num_points as u32)
                .filter(|&j| j != i as u32)
                .collect();
            builder.add_node(point, &neighbors).unwrap();
        }
        let (graph, vectors) = builder.into_files().unwrap();
        let writer =
            IndexWriter::new(index_dir(root.path(), GraphType::Nsg, dataset, 39)).unwrap();
        writer.write_graph(&graph).unwrap();
        writer.write_vectors(&vectors).unwrap();

        // Queries are perturbed copies of the first points.
        let queries: Vec<Vec<f32>> = points[..num_queries]
            .iter()
            .map(|p| p.iter().map(|x| x + 0.001).collect())
            .collect();
        let query_file = root.path().join("query.fbin");
        let flat: Vec<f32> = queries.iter().flatten().copied().collect();
        write_bin(&query_file, num_queries, dim, &flat, f32::to_le_bytes);

        let mut gt = Vec::new();
        for query in &queries {
            let mut order: Vec<(f32, u32)> = points
                .iter()
                .enumerate()
                .map(|(i, p)| {
                    let d = p.iter().zip(query).map(|(a, b)| (a - b) * (a - b)).sum();
                    (d, i as u32)
                })
                .collect();
            order.sort_by(|a, b| a.0.total_cmp(&b.0));
            gt.extend(order.iter().take(10).map(|&(_, i)| i));
        }
        let gt_file = root.path().join("gt.ibin");
        write_bin(&gt_file, num_queries, 10, &gt, u32::to_le_bytes);

        let summary_path = root.path().join("summary.json");
        let summary = search_index(SearchIndexParameters {
            dataset,
            graph_type: GraphType::Nsg,
            max_degree: 39,
            ef: 10,
            query_num: None,
            batch_size: 2,
            pipeline_depth: 4,
            num_shards: 2,
            num_pipelines: 2,
            bucket_bits: None,
            index_dir: root.path(),
            query_file: &query_file,
            gt_file: &gt_file,
            summary_path: Some(&summary_path),
        })
        .unwrap();

        assert_eq!(summary.num_queries, num_queries);
        assert_eq!(summary.recall_at_1, 1.0);
        assert_eq!(summary.recall_at_10, 1.0);
        assert!(summary.mean_hops >= 1.0);

        let json: serde_json::Value =
            serde_json::from_reader(File::open(&summary_path).unwrap()).unwrap();
        assert_eq!(json["dataset"], "Deep1M");
        assert_eq!(json["graph_type"], "NSG");
        assert_eq!(json["num_queries"], num_queries);
    }

    #[test]
    fn test_missing_index_fails() {
        let root = tempfile::tempdir().unwrap();
        let missing = root.path().join("missing");
        let result = search_index(SearchIndexParameters {
            dataset: Dataset::Sift1M,
            graph_type: GraphType::Hnsw,
            max_degree: 32,
            ef: 64,
            query_num: Some(1),
            batch_size: 2,
            pipeline_depth: 4,
            num_shards: 1,
            num_pipelines: 1,
            bucket_bits: None,
            index_dir: root.path(),
            query_file: &missing,
            gt_file: &missing,
            summary_path: None,
        });
        assert!(result.is_err());
    }
}
