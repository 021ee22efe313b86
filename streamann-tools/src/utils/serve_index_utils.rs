/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */
use streamann::{
    wire::{ResultRecord, WireReader, WireWriter, NO_RESULT},
    Query, SearchEngine,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

use crate::utils::{CMDResult, CMDToolError};

/// Answer query batches read from `stream` until the client sends a terminate header or
/// closes the connection. Returns the number of queries answered.
///
/// Every query is searched with `ef` and answered with exactly `ef` entries. When `labels`
/// is given, result ids are translated to external labels.
pub async fn serve_connection<S>(
    stream: S,
    engine: &mut SearchEngine,
    dim: usize,
    ef: usize,
    labels: Option<&[u32]>,
) -> CMDResult<usize>
where
    S: AsyncRead + AsyncWrite,
{
    let (read, write) = tokio::io::split(stream);
    let mut reader = WireReader::new(read, dim);
    let mut writer = WireWriter::new(write);

    let mut answered = 0;
    while let Some(batch) = reader.read_batch().await? {
        let batch_len = batch.len();
        let queries = batch.into_iter().map(|v| Query::new(v, ef)).collect();
        let outputs = engine.search_batch(queries).await?;

        let records = outputs
            .iter()
            .map(|output| {
                let mut record = ResultRecord::from_output(output, ef);
                if let Some(labels) = labels {
                    relabel(&mut record, labels)?;
                }
                Ok(record)
            })
            .collect::<CMDResult<Vec<_>>>()?;
        writer.write_results(&records).await?;

        answered += batch_len;
        debug!(batch = batch_len, answered, "answered batch");
    }
    info!("Client finished after {} queries", answered);
    Ok(answered)
}

fn relabel(record: &mut ResultRecord, labels: &[u32]) -> CMDResult<()> {
    for id in record.ids.iter_mut().filter(|id| **id != NO_RESULT) {
        *id = *labels.get(*id as usize).ok_or_else(|| CMDToolError {
            details: format!("node {} has no label ({} labels)", id, labels.len()),
        })?;
    }
    Ok(())
}
