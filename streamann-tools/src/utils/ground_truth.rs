/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

use std::path::Path;

use tracing::info;

use crate::utils::{bin_header, CMDResult, CMDToolError, GroundTruthFormat};

/// The exact nearest neighbors of every query, `k` per query, best first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TruthSet {
    ids: Vec<u32>,
    k: usize,
}

impl TruthSet {
    pub fn new(ids: Vec<u32>, k: usize) -> CMDResult<Self> {
        if k == 0 || ids.len() % k != 0 {
            return Err(CMDToolError {
                details: format!("{} ground truth ids do not form rows of {}", ids.len(), k),
            });
        }
        Ok(Self { ids, k })
    }

    pub fn num_queries(&self) -> usize {
        self.ids.len() / self.k
    }

    pub fn k(&self) -> usize {
        self.k
    }

    /// The ground truth row of query `i`.
    pub fn neighbors(&self, i: usize) -> &[u32] {
        &self.ids[i * self.k..(i + 1) * self.k]
    }

    pub fn load(path: &Path, format: GroundTruthFormat) -> CMDResult<Self> {
        let bytes = std::fs::read(path).map_err(|err| CMDToolError {
            details: format!("reading {}: {}", path.display(), err),
        })?;
        let truth = Self::parse(&bytes, format)?;
        info!(
            "Loaded ground truth {}: {} queries x {}",
            path.display(),
            truth.num_queries(),
            truth.k()
        );
        Ok(truth)
    }

    pub fn parse(bytes: &[u8], format: GroundTruthFormat) -> CMDResult<Self> {
        match format {
            GroundTruthFormat::Ibin => {
                let (count, k, body) = bin_header(bytes)?;
                if body.len() != count * k * 4 {
                    return Err(CMDToolError {
                        details: format!(
                            "ground truth body holds {} bytes, expected {} x {} ids",
                            body.len(),
                            count,
                            k
                        ),
                    });
                }
                Self::new(words(body)?, k)
            }
            GroundTruthFormat::Ivecs => {
                let words = words(bytes)?;
                let k = match words.first() {
                    Some(&k) if k > 0 => k as usize,
                    _ => {
                        return Err(CMDToolError {
                            details: "ground truth file has no leading row width".to_string(),
                        })
                    }
                };
                if words.len() % (k + 1) != 0 {
                    return Err(CMDToolError {
                        details: format!("{} words do not form rows of {}", words.len(), k + 1),
                    });
                }

                let mut ids = Vec::with_capacity(words.len() / (k + 1) * k);
                for row in words.chunks_exact(k + 1) {
                    if row[0] as usize != k {
                        return Err(CMDToolError {
                            details: format!("row width {} differs from {}", row[0], k),
                        });
                    }
                    ids.extend_from_slice(&row[1..]);
                }
                Self::new(ids, k)
            }
        }
    }
}

fn words(bytes: &[u8]) -> CMDResult<Vec<u32>> {
    if bytes.len() % 4 != 0 {
        return Err(CMDToolError {
            details: format!("{} bytes is not a whole number of ids", bytes.len()),
        });
    }
    Ok(bytemuck::allocation::pod_collect_to_vec::<u8, u32>(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn le(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[test]
    fn test_parse_ivecs() {
        let bytes = le(&[3, 10, 11, 12, 3, 20, 21, 22]);
        let truth = TruthSet::parse(&bytes, GroundTruthFormat::Ivecs).unwrap();
        assert_eq!(truth.num_queries(), 2);
        assert_eq!(truth.k(), 3);
        assert_eq!(truth.neighbors(1), &[20, 21, 22]);

        let bad = le(&[3, 10, 11, 12, 2, 20, 21, 22]);
        assert!(TruthSet::parse(&bad, GroundTruthFormat::Ivecs).is_err());
    }

    #[test]
    fn test_parse_ibin() {
        let bytes = le(&[2, 2, 5, 6, 7, 8]);
        let truth = TruthSet::parse(&bytes, GroundTruthFormat::Ibin).unwrap();
        assert_eq!(truth.neighbors(0), &[5, 6]);
        assert_eq!(truth.neighbors(1), &[7, 8]);

        assert!(TruthSet::parse(&bytes[..20], GroundTruthFormat::Ibin).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gt.ibin");
        std::fs::write(&path, le(&[1, 1, 42])).unwrap();
        let truth = TruthSet::load(&path, GroundTruthFormat::Ibin).unwrap();
        assert_eq!(truth.neighbors(0), &[42]);

        assert!(TruthSet::load(&dir.path().join("missing"), GroundTruthFormat::Ibin).is_err());
    }
}
