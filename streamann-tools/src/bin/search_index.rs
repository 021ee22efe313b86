/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */
use std::path::PathBuf;

use clap::Parser;
use streamann_tools::utils::{
    init_subscriber, search_index, CMDResult, Dataset, GraphType, SearchIndexParameters,
};

fn main() -> CMDResult<()> {
    init_subscriber();

    let args = SearchIndexArgs::parse();
    let result = search_index(SearchIndexParameters {
        dataset: args.dataset,
        graph_type: args.graph_type,
        max_degree: args.max_degree,
        ef: args.ef,
        query_num: args.query_num,
        batch_size: args.batch_size,
        pipeline_depth: args.pipeline_depth,
        num_shards: args.num_shards,
        num_pipelines: args.num_pipelines,
        bucket_bits: args.bucket_bits,
        index_dir: &args.index_dir,
        query_file: &args.query_file,
        gt_file: &args.gt_file,
        summary_path: args.summary_path.as_deref(),
    });

    match result {
        Ok(_) => {
            println!("Index search completed successfully");
            Ok(())
        }
        Err(err) => {
            eprintln!("Error: {:?}", err);
            Err(err)
        }
    }
}

#[derive(Debug, Parser)]
struct SearchIndexArgs {
    /// Dataset the index was built from
    #[arg(long = "dataset", required = true)]
    pub dataset: Dataset,

    /// Graph type <HNSW/NSG>
    #[arg(long = "graph_type", required = true)]
    pub graph_type: GraphType,

    /// Maximum base-layer degree the index was built with
    #[arg(long = "max_degree", required = true)]
    pub max_degree: usize,

    /// Size of the result set of every query
    #[arg(long = "ef", default_value = "64")]
    pub ef: usize,

    /// Number of queries to run, all of the query file when absent
    #[arg(long = "query_num")]
    pub query_num: Option<usize>,

    /// Candidates expanded per pipeline batch
    #[arg(long = "batch_size", default_value = "2")]
    pub batch_size: usize,

    /// Batches in flight per query
    #[arg(long = "pipeline_depth", default_value = "4")]
    pub pipeline_depth: usize,

    /// Number of graph and vector shards
    #[arg(long = "num_shards", default_value = "1")]
    pub num_shards: usize,

    /// Independent pipelines sharing the index
    #[arg(long = "num_pipelines", default_value = "1")]
    pub num_pipelines: usize,

    /// Visited filter buckets per shard as a power of two, chosen from the shard count when
    /// absent
    #[arg(long = "bucket_bits")]
    pub bucket_bits: Option<u32>,

    /// Directory holding <graph_type>_<dataset>_MD<max_degree> index directories
    #[arg(long = "index_dir", required = true)]
    pub index_dir: PathBuf,

    /// Query file in the dataset's native format
    #[arg(long = "query_file", required = true)]
    pub query_file: PathBuf,

    /// Ground truth file for the queryset
    #[arg(long = "gt_file", required = true)]
    pub gt_file: PathBuf,

    /// Path for a JSON summary of the run
    #[arg(long = "summary_path")]
    pub summary_path: Option<PathBuf>,
}
