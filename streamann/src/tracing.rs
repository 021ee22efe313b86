/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

//! Logging helpers shared by the pipeline stages.

use std::future::Future;

use tokio::task::JoinHandle;
use tracing::{debug, error, info_span, Instrument, Span};

use crate::{ANNErrorKind, ANNResult};

/// Span for one stage task. Shard-local stages carry their shard index.
pub fn stage_span(stage: &'static str, shard: Option<usize>) -> Span {
    info_span!("stage", name = stage, shard)
}

/// Spawn `stage` on the current runtime inside `span`.
///
/// A stage that returns an error logs it once before the error reaches the join handle.
/// `PipelineShutdown` errors are logged at debug level because they usually follow the
/// failure of another stage.
pub(crate) fn spawn_stage<F>(span: Span, stage: F) -> JoinHandle<ANNResult<()>>
where
    F: Future<Output = ANNResult<()>> + Send + 'static,
{
    tokio::spawn(
        async move {
            let result = stage.await;
            match &result {
                Ok(()) => debug!("stage finished"),
                Err(err) if err.kind() == ANNErrorKind::PipelineShutdown => {
                    debug!(error = %err, "stage stopped")
                }
                Err(err) => error!(error = %err, "stage failed"),
            }
            result
        }
        .instrument(span),
    )
}
