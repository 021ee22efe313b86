/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

pub mod distance;
pub mod error;
pub mod filter;
pub mod neighbor;
pub mod storage;
pub mod tracing;

// Search pipeline and its wire front-end.
pub mod pipeline;
pub mod wire;

// Top level exports.
pub use error::ann_error::{ANNError, ANNErrorKind, ANNResult};
pub use pipeline::{Query, SearchConfig, SearchEngine, SearchOutput, SearchPipeline};
pub use storage::ShardedIndex;

#[cfg(test)]
mod test;
