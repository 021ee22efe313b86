/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

use std::{fs::File, io::BufReader, path::Path, time::Instant};

use tracing::info;

use super::{
    format::{read_labels, GraphFile, GraphKind, GraphMetadata, VectorFile},
    graph::{AdjacencyList, AdjacencyRecords, UpperLayers},
    vectors::VectorShard,
    writer::IndexWriter,
    ShardLayout,
};
use crate::{
    distance::padded_dim,
    error::ErrorContext,
    neighbor::{Candidate, LayerId, NodeId},
    ANNError, ANNResult,
};

/// File name of the graph inside an index directory.
pub const INDEX_FILE: &str = "index.bin";

/// File name of the vectors inside an index directory.
pub const VECTORS_FILE: &str = "vectors.bin";

/// File name of the optional internal-id to external-label table.
pub const LABELS_FILE: &str = "labels.bin";

//////////////////
// ShardedIndex //
//////////////////

/// A graph and its vectors, split across `N` shards by [`ShardLayout`].
///
/// Shard `s` holds the base-layer adjacency records and vectors of every node that maps
/// to it, densely packed by local index. Upper-layer lists are small and stay in a single
/// region addressed by global id.
#[derive(Debug)]
pub struct ShardedIndex {
    metadata: GraphMetadata,
    layout: ShardLayout,
    dim: usize,
    base: Vec<AdjacencyRecords>,
    upper: Option<UpperLayers>,
    vectors: Vec<VectorShard>,
}

impl ShardedIndex {
    /// Partition decoded files across `num_shards` shards.
    pub fn from_files(graph: GraphFile, vectors: VectorFile, num_shards: usize) -> ANNResult<Self> {
        let layout = ShardLayout::new(num_shards)?;
        let GraphFile {
            metadata,
            base,
            upper,
        } = graph;

        if vectors.num_vectors != metadata.num_vectors {
            return Err(ANNError::log_index_config_error(
                "vector file",
                format!(
                    "it holds {} vectors but the graph has {} nodes",
                    vectors.num_vectors, metadata.num_vectors
                ),
            ));
        }

        let n = metadata.num_vectors;
        let row = padded_dim(vectors.dim);
        if vectors.data.len() != n * row {
            return Err(ANNError::log_invalid_file_format(format!(
                "expected {} padded floats, found {}",
                n * row,
                vectors.data.len()
            )));
        }
        let mut base_shards = Vec::with_capacity(num_shards);
        let mut vector_shards = Vec::with_capacity(num_shards);
        for shard in 0..num_shards {
            let len = layout.shard_len(shard, n);
            let mut records = AdjacencyRecords::zeroed(len, metadata.max_degree_base);
            let mut data = Vec::with_capacity(len * row);
            for local in 0..len {
                let id = layout.global_id(shard, local);
                records.set(local, &base.get(id as usize)?.to_vec())?;
                let start = id as usize * row;
                data.extend_from_slice(&vectors.data[start..start + row]);
            }
            base_shards.push(records);
            vector_shards.push(VectorShard::new(data, vectors.dim)?);
        }

        Ok(Self {
            metadata,
            layout,
            dim: vectors.dim,
            base: base_shards,
            upper,
            vectors: vector_shards,
        })
    }

    /// Load `index.bin` and `vectors.bin` from `dir`.
    pub fn load(dir: &Path, kind: GraphKind, num_shards: usize) -> ANNResult<Self> {
        let timer = Instant::now();

        let graph_path = dir.join(super::INDEX_FILE);
        let mut reader = BufReader::new(
            File::open(&graph_path).with_context(|| format!("opening {}", graph_path.display()))?,
        );
        let graph = GraphFile::read(&mut reader, kind)
            .with_context(|| format!("reading {}", graph_path.display()))?;

        let vectors_path = dir.join(super::VECTORS_FILE);
        let mut reader = BufReader::new(
            File::open(&vectors_path)
                .with_context(|| format!("opening {}", vectors_path.display()))?,
        );
        let vectors = VectorFile::read(&mut reader)
            .with_context(|| format!("reading {}", vectors_path.display()))?;

        let index = Self::from_files(graph, vectors, num_shards)?;
        info!(
            "Loaded {:?} index: #pts = {}, dim = {}, max_level = {}, entry = {}, shards = {}, took {} ms",
            kind,
            index.num_vectors(),
            index.dim(),
            index.max_level(),
            index.entry_point(),
            num_shards,
            timer.elapsed().as_millis()
        );
        Ok(index)
    }

    /// Write decoded files to `dir` in the layout read by [`Self::load`].
    pub fn save(dir: &Path, graph: &GraphFile, vectors: &VectorFile) -> ANNResult<()> {
        let writer = IndexWriter::new(dir)?;
        let graph_bytes = writer.write_graph(graph)?;
        let vector_bytes = writer.write_vectors(vectors)?;
        info!(
            "Saved index to {}: graph {}B, vectors {}B",
            dir.display(),
            graph_bytes,
            vector_bytes
        );
        Ok(())
    }

    /// Read `labels.bin` from `dir` if it exists.
    pub fn load_labels(dir: &Path) -> ANNResult<Option<Vec<u32>>> {
        let path = dir.join(super::LABELS_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let mut reader = BufReader::new(
            File::open(&path).with_context(|| format!("opening {}", path.display()))?,
        );
        let labels =
            read_labels(&mut reader).with_context(|| format!("reading {}", path.display()))?;
        Ok(Some(labels))
    }

    //-----------//
    // Accessors //
    //-----------//

    pub fn metadata(&self) -> &GraphMetadata {
        &self.metadata
    }

    pub fn layout(&self) -> ShardLayout {
        self.layout
    }

    pub fn num_shards(&self) -> usize {
        self.layout.num_shards()
    }

    pub fn num_vectors(&self) -> usize {
        self.metadata.num_vectors
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn padded_dim(&self) -> usize {
        padded_dim(self.dim)
    }

    pub fn entry_point(&self) -> NodeId {
        self.metadata.entry_point
    }

    pub fn max_level(&self) -> LayerId {
        self.metadata.max_level
    }

    pub fn max_degree(&self, layer: LayerId) -> usize {
        if layer == 0 {
            self.metadata.max_degree_base
        } else {
            self.metadata.max_degree_upper
        }
    }

    /// Highest layer `id` appears on. Always 0 for flat graphs.
    pub fn level(&self, id: NodeId) -> ANNResult<LayerId> {
        self.check_node(id)?;
        Ok(self
            .upper
            .as_ref()
            .and_then(|upper| upper.level(id))
            .unwrap_or(0))
    }

    /// Return an error unless `id` names a node of this index.
    pub fn check_node(&self, id: NodeId) -> ANNResult<()> {
        if (id as usize) < self.num_vectors() {
            Ok(())
        } else {
            Err(ANNError::log_index_corruption(format!(
                "node id {} is out of range for {} vectors",
                id,
                self.num_vectors()
            )))
        }
    }

    /// Resolve the adjacency list of `candidate`.
    ///
    /// Base-layer lists come from the candidate's shard at a fixed stride; upper-layer
    /// lists are looked up through the per-node offset table.
    pub fn neighbors(&self, candidate: Candidate) -> ANNResult<AdjacencyList<'_>> {
        self.check_node(candidate.node_id)?;
        match (candidate.layer_id, &self.upper) {
            (0, _) => {
                let shard = self.layout.shard_of(candidate.node_id);
                self.base[shard].get(self.layout.local_index(candidate.node_id))
            }
            (layer, Some(upper)) => upper.get(candidate.node_id, layer),
            (layer, None) => Err(ANNError::log_index_corruption(format!(
                "layer {} requested from a flat graph",
                layer
            ))),
        }
    }

    /// The vector storage of `shard`.
    pub fn vector_shard(&self, shard: usize) -> &VectorShard {
        &self.vectors[shard]
    }

    /// The padded vector of `id`.
    pub fn vector(&self, id: NodeId) -> ANNResult<&[f32]> {
        self.check_node(id)?;
        self.vectors[self.layout.shard_of(id)].get(self.layout.local_index(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{storage::IndexBuilder, ANNErrorKind};

    fn line_builder() -> IndexBuilder {
        let mut builder = IndexBuilder::flat(2);
        for i in 0..5u32 {
            let mut neighbors = Vec::new();
            if i > 0 {
                neighbors.push(i - 1);
            }
            if i < 4 {
                neighbors.push(i + 1);
            }
            builder.add_node(&[i as f32, 0.0], &neighbors).unwrap();
        }
        builder
    }

    #[test]
    fn test_sharding_preserves_lookups() {
        for num_shards in [1, 2, 3, 4] {
            let index = line_builder().build(num_shards).unwrap();
            assert_eq!(index.num_shards(), num_shards);
            assert_eq!(index.num_vectors(), 5);

            for id in 0..5u32 {
                assert_eq!(index.vector(id).unwrap()[0], id as f32);
                assert_eq!(index.vector(id).unwrap().len(), 16);
                let neighbors = index.neighbors(Candidate::new(id, 0)).unwrap().to_vec();
                assert!(neighbors.iter().all(|n| n.abs_diff(id) == 1));
            }
        }
    }

    #[test]
    fn test_out_of_range_is_corruption() {
        let index = line_builder().build(2).unwrap();
        let err = index.neighbors(Candidate::new(5, 0)).unwrap_err();
        assert_eq!(err.kind(), ANNErrorKind::IndexCorruption);

        let err = index.neighbors(Candidate::new(1, 1)).unwrap_err();
        assert_eq!(err.kind(), ANNErrorKind::IndexCorruption);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let (graph, vectors) = line_builder().into_files().unwrap();
        ShardedIndex::save(dir.path(), &graph, &vectors).unwrap();

        let index = ShardedIndex::load(dir.path(), GraphKind::Flat, 2).unwrap();
        assert_eq!(index.dim(), 2);
        assert_eq!(index.entry_point(), 0);
        assert_eq!(
            index.neighbors(Candidate::new(2, 0)).unwrap().to_vec(),
            vec![1, 3]
        );
    }

    #[test]
    fn test_mismatched_vector_count() {
        let (graph, mut vectors) = line_builder().into_files().unwrap();
        vectors.num_vectors = 4;
        vectors.data.truncate(4 * 16);
        let err = ShardedIndex::from_files(graph, vectors, 1).unwrap_err();
        assert_eq!(err.kind(), ANNErrorKind::IndexConfigError);
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = ShardedIndex::load(dir.path(), GraphKind::Flat, 1).unwrap_err();
        assert_eq!(err.kind(), ANNErrorKind::IOError);
    }
}
