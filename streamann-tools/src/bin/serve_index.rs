/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */
use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use streamann::{SearchEngine, ShardedIndex};
use streamann_tools::utils::{
    index_dir, init_subscriber, serve_connection, tool_config, CMDResult, Dataset, GraphType,
};
use tokio::net::TcpListener;
use tracing::info;

fn main() -> CMDResult<()> {
    init_subscriber();

    let args = ServeIndexArgs::parse();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    match runtime.block_on(serve(args)) {
        Ok(answered) => {
            println!("Served {} queries", answered);
            Ok(())
        }
        Err(err) => {
            eprintln!("Error: {:?}", err);
            Err(err)
        }
    }
}

async fn serve(args: ServeIndexArgs) -> CMDResult<usize> {
    let dir = index_dir(&args.index_dir, args.graph_type, args.dataset, args.max_degree);
    let index = Arc::new(ShardedIndex::load(
        &dir,
        args.graph_type.kind(),
        args.num_shards,
    )?);
    let labels = ShardedIndex::load_labels(&dir)?;
    let dim = index.dim();

    let config = tool_config(
        args.ef,
        args.batch_size,
        args.pipeline_depth,
        args.num_shards,
        args.bucket_bits,
    )?;
    let mut engine = SearchEngine::spawn(index, config, args.num_pipelines)?;

    let listener = TcpListener::bind(&args.listen).await?;
    info!("Listening on {}", listener.local_addr()?);
    let (stream, peer) = listener.accept().await?;
    stream.set_nodelay(true)?;
    info!("Accepted client {}", peer);

    let served = serve_connection(stream, &mut engine, dim, args.ef, labels.as_deref()).await;
    let shutdown = engine.shutdown().await;
    let answered = served?;
    shutdown?;
    Ok(answered)
}

#[derive(Debug, Parser)]
struct ServeIndexArgs {
    /// Dataset the index was built from
    #[arg(long = "dataset", required = true)]
    pub dataset: Dataset,

    /// Graph type <HNSW/NSG>
    #[arg(long = "graph_type", required = true)]
    pub graph_type: GraphType,

    /// Maximum base-layer degree the index was built with
    #[arg(long = "max_degree", required = true)]
    pub max_degree: usize,

    /// Size of the result set returned for every query
    #[arg(long = "ef", default_value = "64")]
    pub ef: usize,

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

    /// Visited filter buckets per shard as a power of two
    #[arg(long = "bucket_bits")]
    pub bucket_bits: Option<u32>,

    /// Directory holding <graph_type>_<dataset>_MD<max_degree> index directories
    #[arg(long = "index_dir", required = true)]
    pub index_dir: PathBuf,

    /// Address to accept the client on
    #[arg(long = "listen", default_value = "0.0.0.0:8888")]
    pub listen: String,
}
