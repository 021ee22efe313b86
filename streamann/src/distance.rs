/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

//! Squared Euclidean distance over padded vectors.
//!
//! Vectors are stored zero-padded to a multiple of [`LANES`] components. Padding
//! contributes nothing to the distance, so the padded and unpadded forms compare equal.

/// Number of `f32` components processed per step. One step covers one 64-byte row.
pub const LANES: usize = 16;

/// Round `dim` up to the next multiple of [`LANES`].
pub const fn padded_dim(dim: usize) -> usize {
    dim.div_ceil(LANES) * LANES
}

/// Compute the squared Euclidean distance between `a` and `b`.
///
/// Each row of [`LANES`] components is squared and summed with a pairwise tree reduction
/// before being added to the running total. Any tail shorter than a row is reduced the
/// same way with zero fill.
///
/// # Panics
///
/// Panics if `a` and `b` have different lengths.
pub fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    assert_eq!(a.len(), b.len(), "vectors must have equal length");

    let mut total = 0.0f32;
    let mut rows_a = a.chunks_exact(LANES);
    let mut rows_b = b.chunks_exact(LANES);
    for (row_a, row_b) in rows_a.by_ref().zip(rows_b.by_ref()) {
        let mut lanes = [0.0f32; LANES];
        for (lane, (&x, &y)) in lanes.iter_mut().zip(row_a.iter().zip(row_b)) {
            let diff = x - y;
            *lane = diff * diff;
        }
        total += tree_reduce(lanes);
    }

    let (tail_a, tail_b) = (rows_a.remainder(), rows_b.remainder());
    if !tail_a.is_empty() {
        let mut lanes = [0.0f32; LANES];
        for (lane, (&x, &y)) in lanes.iter_mut().zip(tail_a.iter().zip(tail_b)) {
            let diff = x - y;
            *lane = diff * diff;
        }
        total += tree_reduce(lanes);
    }

    total
}

#[inline(always)]
fn tree_reduce(mut lanes: [f32; LANES]) -> f32 {
    let mut width = LANES / 2;
    while width > 0 {
        for i in 0..width {
            lanes[i] += lanes[i + width];
        }
        width /= 2;
    }
    lanes[0]
}
