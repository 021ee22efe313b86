/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

use std::{
    fmt,
    path::{Path, PathBuf},
};

use byteorder::{ByteOrder, LittleEndian};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use streamann::storage::GraphKind;

use crate::utils::{CMDResult, CMDToolError};

/// The benchmark datasets the host driver knows how to load.
#[derive(Copy, Clone, PartialEq, Eq, Debug, ValueEnum, Serialize, Deserialize)]
pub enum Dataset {
    #[value(name = "SIFT1M")]
    #[serde(rename = "SIFT1M")]
    Sift1M,

    #[value(name = "SIFT10M")]
    #[serde(rename = "SIFT10M")]
    Sift10M,

    #[value(name = "Deep1M")]
    #[serde(rename = "Deep1M")]
    Deep1M,

    #[value(name = "Deep10M")]
    #[serde(rename = "Deep10M")]
    Deep10M,

    #[value(name = "GLOVE")]
    #[serde(rename = "GLOVE")]
    Glove,

    #[value(name = "SBERT1M")]
    #[serde(rename = "SBERT1M")]
    Sbert1M,

    #[value(name = "SPACEV1M")]
    #[serde(rename = "SPACEV1M")]
    Spacev1M,

    #[value(name = "SPACEV10M")]
    #[serde(rename = "SPACEV10M")]
    Spacev10M,
}

impl Dataset {
    pub fn name(self) -> &'static str {
        match self {
            Self::Sift1M => "SIFT1M",
            Self::Sift10M => "SIFT10M",
            Self::Deep1M => "Deep1M",
            Self::Deep10M => "Deep10M",
            Self::Glove => "GLOVE",
            Self::Sbert1M => "SBERT1M",
            Self::Spacev1M => "SPACEV1M",
            Self::Spacev10M => "SPACEV10M",
        }
    }

    pub fn dim(self) -> usize {
        match self {
            Self::Sift1M | Self::Sift10M => 128,
            Self::Deep1M | Self::Deep10M => 96,
            Self::Glove => 300,
            Self::Sbert1M => 384,
            Self::Spacev1M | Self::Spacev10M => 100,
        }
    }

    pub fn query_format(self) -> QueryFormat {
        match self {
            Self::Sift1M | Self::Sift10M => QueryFormat::Bvecs,
            Self::Deep1M | Self::Deep10M | Self::Glove => QueryFormat::Fbin,
            Self::Sbert1M => QueryFormat::RawF32,
            Self::Spacev1M | Self::Spacev10M => QueryFormat::I8Bin,
        }
    }

    pub fn ground_truth_format(self) -> GroundTruthFormat {
        match self {
            Self::Sift1M | Self::Sift10M => GroundTruthFormat::Ivecs,
            _ => GroundTruthFormat::Ibin,
        }
    }
}

impl fmt::Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, ValueEnum, Serialize, Deserialize)]
pub enum GraphType {
    #[value(name = "HNSW")]
    #[serde(rename = "HNSW")]
    Hnsw,

    #[value(name = "NSG")]
    #[serde(rename = "NSG")]
    Nsg,
}

impl GraphType {
    pub fn name(self) -> &'static str {
        match self {
            Self::Hnsw => "HNSW",
            Self::Nsg => "NSG",
        }
    }

    pub fn kind(self) -> GraphKind {
        match self {
            Self::Hnsw => GraphKind::Hierarchical,
            Self::Nsg => GraphKind::Flat,
        }
    }
}

impl fmt::Display for GraphType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Directory of one index: `<root>/<graph_type>_<dataset>_MD<max_degree>`.
pub fn index_dir(
    root: &Path,
    graph_type: GraphType,
    dataset: Dataset,
    max_degree: usize,
) -> PathBuf {
    root.join(format!("{}_{}_MD{}", graph_type, dataset, max_degree))
}

/// On-disk layout of a query file.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum QueryFormat {
    /// Rows of an `i32` dimension followed by that many `u8` values.
    Bvecs,

    /// `i32` count and dimension, then `f32` rows.
    Fbin,

    /// `f32` rows with no header.
    RawF32,

    /// `i32` count and dimension, then `i8` rows.
    I8Bin,
}

impl QueryFormat {
    /// Decode up to `limit` queries of dimension `dim` from `bytes`.
    pub fn parse(
        self,
        bytes: &[u8],
        dim: usize,
        limit: Option<usize>,
    ) -> CMDResult<Vec<Vec<f32>>> {
        let (count, body) = match self {
            Self::Bvecs => (bytes.len() / (4 + dim), bytes),
            Self::RawF32 => (bytes.len() / (4 * dim), bytes),
            Self::Fbin | Self::I8Bin => {
                let (count, file_dim, body) = bin_header(bytes)?;
                if file_dim != dim {
                    return Err(dim_error(dim, file_dim));
                }
                (count, body)
            }
        };

        let row = match self {
            Self::Bvecs => 4 + dim,
            Self::Fbin | Self::RawF32 => 4 * dim,
            Self::I8Bin => dim,
        };
        if body.len() != count * row {
            return Err(CMDToolError {
                details: format!(
                    "query file holds {} bytes, expected {} rows of {} bytes",
                    body.len(),
                    count,
                    row
                ),
            });
        }

        let wanted = limit.unwrap_or(count);
        if wanted > count {
            return Err(CMDToolError {
                details: format!("requested {} queries but the file holds {}", wanted, count),
            });
        }

        body.chunks_exact(row)
            .take(wanted)
            .map(|bytes| self.parse_row(bytes, dim))
            .collect()
    }

    fn parse_row(self, bytes: &[u8], dim: usize) -> CMDResult<Vec<f32>> {
        let vector = match self {
            Self::Bvecs => {
                let file_dim = LittleEndian::read_i32(&bytes[..4]);
                if file_dim as usize != dim {
                    return Err(dim_error(dim, file_dim as usize));
                }
                bytes[4..].iter().map(|&b| f32::from(b)).collect()
            }
            Self::Fbin | Self::RawF32 => {
                let mut vector = vec![0.0; dim];
                LittleEndian::read_f32_into(bytes, &mut vector);
                vector
            }
            Self::I8Bin => bytes.iter().map(|&b| f32::from(b as i8)).collect(),
        };
        Ok(vector)
    }
}

/// On-disk layout of a ground-truth file.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum GroundTruthFormat {
    /// Rows of an `i32` count `k` followed by `k` ids.
    Ivecs,

    /// `i32` count and `k`, then `u32` rows.
    Ibin,
}

/// Split off the `i32` count and dimension that start a `.bin` file.
pub(crate) fn bin_header(bytes: &[u8]) -> CMDResult<(usize, usize, &[u8])> {
    if bytes.len() < 8 {
        return Err(CMDToolError {
            details: format!("file of {} bytes is too short for its header", bytes.len()),
        });
    }
    let count = usize::try_from(LittleEndian::read_i32(&bytes[..4]))?;
    let dim = usize::try_from(LittleEndian::read_i32(&bytes[4..8]))?;
    Ok((count, dim, &bytes[8..]))
}

fn dim_error(expected: usize, found: usize) -> CMDToolError {
    CMDToolError {
        details: format!("query dimension {} does not match the dataset's {}", found, expected),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry() {
        assert_eq!(Dataset::Sift10M.dim(), 128);
        assert_eq!(Dataset::Deep1M.dim(), 96);
        assert_eq!(Dataset::Glove.dim(), 300);
        assert_eq!(Dataset::Sbert1M.dim(), 384);
        assert_eq!(Dataset::Spacev10M.dim(), 100);
        assert_eq!(Dataset::Sbert1M.query_format(), QueryFormat::RawF32);
        assert_eq!(Dataset::Sift1M.ground_truth_format(), GroundTruthFormat::Ivecs);
        assert_eq!(Dataset::Glove.ground_truth_format(), GroundTruthFormat::Ibin);
    }

    #[test]
    fn test_names_parse_and_reject() {
        assert_eq!(Dataset::from_str("SPACEV1M", false).unwrap(), Dataset::Spacev1M);
        assert_eq!(GraphType::from_str("NSG", false).unwrap(), GraphType::Nsg);
        assert!(Dataset::from_str("MNIST", false).is_err());
        assert!(GraphType::from_str("IVF", false).is_err());
    }

    #[test]
    fn test_index_dir() {
        let dir = index_dir(Path::new("/indexes"), GraphType::Hnsw, Dataset::Deep10M, 64);
        assert_eq!(dir, Path::new("/indexes/HNSW_Deep10M_MD64"));
    }

    #[test]
    fn test_parse_bvecs() {
        let mut bytes = Vec::new();
        for row in 0..3u8 {
            bytes.extend_from_slice(&2i32.to_le_bytes());
            bytes.extend_from_slice(&[row, 200]);
        }
        let queries = QueryFormat::Bvecs.parse(&bytes, 2, Some(2)).unwrap();
        assert_eq!(queries, vec![vec![0.0, 200.0], vec![1.0, 200.0]]);

        assert!(QueryFormat::Bvecs.parse(&bytes, 2, Some(4)).is_err());
        assert!(QueryFormat::Bvecs.parse(&bytes[..5], 2, None).is_err());
    }

    #[test]
    fn test_parse_headed_formats() {
        let mut fbin = Vec::new();
        fbin.extend_from_slice(&1i32.to_le_bytes());
        fbin.extend_from_slice(&2i32.to_le_bytes());
        fbin.extend_from_slice(&1.5f32.to_le_bytes());
        fbin.extend_from_slice(&(-2.0f32).to_le_bytes());
        assert_eq!(
            QueryFormat::Fbin.parse(&fbin, 2, None).unwrap(),
            vec![vec![1.5, -2.0]]
        );
        assert!(QueryFormat::Fbin.parse(&fbin, 3, None).is_err());

        assert_eq!(
            QueryFormat::RawF32.parse(&fbin[8..], 1, None).unwrap(),
            vec![vec![1.5], vec![-2.0]]
        );

        let mut i8bin = Vec::new();
        i8bin.extend_from_slice(&1i32.to_le_bytes());
        i8bin.extend_from_slice(&3i32.to_le_bytes());
        i8bin.extend_from_slice(&[0xFF, 0x01, 0x80]);
        assert_eq!(
            QueryFormat::I8Bin.parse(&i8bin, 3, None).unwrap(),
            vec![vec![-1.0, 1.0, -128.0]]
        );
    }
}
