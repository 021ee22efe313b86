/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

use std::{
    fs::File,
    io::BufWriter,
    path::{Path, PathBuf},
};

use tracing::debug;

use super::{
    format::{write_labels, GraphFile, VectorFile},
    INDEX_FILE, LABELS_FILE, VECTORS_FILE,
};
use crate::{error::ErrorContext, ANNResult};

/// Writes the files of one index directory.
#[derive(Debug, Clone)]
pub struct IndexWriter {
    dir: PathBuf,
}

impl IndexWriter {
    /// Create `dir` and any missing parents.
    pub fn new(dir: impl Into<PathBuf>) -> ANNResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `index.bin`. Returns the number of bytes written.
    pub fn write_graph(&self, graph: &GraphFile) -> ANNResult<usize> {
        let path = self.dir.join(INDEX_FILE);
        let mut writer = self.create(&path)?;
        let written = graph
            .write(&mut writer)
            .with_context(|| format!("writing {}", path.display()))?;
        debug!(path = %path.display(), bytes = written, "wrote graph");
        Ok(written)
    }

    /// Write `vectors.bin`. Returns the number of bytes written.
    pub fn write_vectors(&self, vectors: &VectorFile) -> ANNResult<usize> {
        let path = self.dir.join(VECTORS_FILE);
        let mut writer = self.create(&path)?;
        let written = vectors
            .write(&mut writer)
            .with_context(|| format!("writing {}", path.display()))?;
        debug!(path = %path.display(), bytes = written, "wrote vectors");
        Ok(written)
    }

    /// Write `labels.bin`, the external label of every internal id.
    pub fn write_labels(&self, labels: &[u32]) -> ANNResult<()> {
        let path = self.dir.join(LABELS_FILE);
        let mut writer = self.create(&path)?;
        write_labels(&mut writer, labels).with_context(|| format!("writing {}", path.display()))
    }

    fn create(&self, path: &Path) -> ANNResult<BufWriter<File>> {
        let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
        Ok(BufWriter::new(file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{GraphKind, IndexBuilder, ShardedIndex};

    #[test]
    fn test_writes_loadable_directory() {
        let root = tempfile::tempdir().unwrap();
        let writer = IndexWriter::new(root.path().join("HNSW_SIFT1M_MD4")).unwrap();

        let mut builder = IndexBuilder::hierarchical(2);
        for i in 0..3u32 {
            builder.add_node(&[i as f32, 1.0], &[(i + 1) % 3]).unwrap();
        }
        builder.set_upper_neighbors(1, 1, &[]).unwrap();
        let (graph, vectors) = builder.into_files().unwrap();

        assert!(writer.write_graph(&graph).unwrap() > 0);
        assert_eq!(writer.write_vectors(&vectors).unwrap(), 8 + 3 * 16 * 4);
        writer.write_labels(&[7, 8, 9]).unwrap();

        let index = ShardedIndex::load(writer.dir(), GraphKind::Hierarchical, 2).unwrap();
        assert_eq!(index.entry_point(), 1);
        assert_eq!(index.max_level(), 1);
        assert_eq!(
            ShardedIndex::load_labels(writer.dir()).unwrap(),
            Some(vec![7, 8, 9])
        );
    }

    #[test]
    fn test_labels_are_optional() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(ShardedIndex::load_labels(dir.path()).unwrap(), None);
    }
}
