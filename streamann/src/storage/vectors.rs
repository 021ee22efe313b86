/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

use crate::{distance::padded_dim, ANNError, ANNResult};

/// Zero-padded vectors of one shard, stored contiguously and addressed by local index.
#[derive(Debug, Clone)]
pub struct VectorShard {
    data: Vec<f32>,
    dim: usize,
    padded_dim: usize,
}

impl VectorShard {
    /// Wrap `data`, which holds a whole number of vectors padded to `padded_dim(dim)`.
    pub(crate) fn new(data: Vec<f32>, dim: usize) -> ANNResult<Self> {
        let padded_dim = padded_dim(dim);
        if padded_dim == 0 || data.len() % padded_dim != 0 {
            return Err(ANNError::log_invalid_file_format(format!(
                "{} floats do not form whole vectors of padded dimension {}",
                data.len(),
                padded_dim
            )));
        }
        Ok(Self {
            data,
            dim,
            padded_dim,
        })
    }

    pub fn len(&self) -> usize {
        self.data.len() / self.padded_dim
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn padded_dim(&self) -> usize {
        self.padded_dim
    }

    /// Return the padded vector at `local`.
    pub fn get(&self, local: usize) -> ANNResult<&[f32]> {
        let start = local * self.padded_dim;
        self.data
            .get(start..start + self.padded_dim)
            .ok_or_else(|| {
                ANNError::log_index_corruption(format!(
                    "vector slot {} is outside of {} vectors",
                    local,
                    self.len()
                ))
            })
    }

    /// Copy the vectors at `locals` into `out`, one padded row per index.
    ///
    /// This is a batched read: all rows of a burst are gathered before any distance is
    /// computed.
    pub fn gather_into(&self, locals: &[usize], out: &mut Vec<f32>) -> ANNResult<()> {
        out.clear();
        out.reserve(locals.len() * self.padded_dim);
        for &local in locals {
            out.extend_from_slice(self.get(local)?);
        }
        Ok(())
    }
}
