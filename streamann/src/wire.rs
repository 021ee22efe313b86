/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

//! Query and result wire protocol.
//!
//! All data moves in 64-byte little-endian packets:
//!
//! * A batch starts with a header packet whose first 4 bytes are an `i32` batch size. A
//!   value `<= 0` terminates the stream.
//! * Each query vector follows as `ceil(dim / 16)` packets of `f32`, zero-padded.
//! * Each result is a header packet holding `ef` as `i32`, then `ceil(ef / 16)` packets of
//!   `u32` ids and `ceil(ef / 16)` packets of `f32` distances.

use byteorder::{ByteOrder, LittleEndian};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{
    neighbor::{BoundedPriorityQueue, CollectSmallest, NodeId, ScoredResult},
    pipeline::SearchOutput,
    ANNError, ANNResult,
};

pub const PACKET_BYTES: usize = 64;

/// Number of 4-byte words in one packet.
pub const WORDS_PER_PACKET: usize = PACKET_BYTES / 4;

/// Id used to pad a result that holds fewer than `ef` entries.
pub const NO_RESULT: NodeId = NodeId::MAX;

/// Largest batch or result size accepted from a peer.
pub const MAX_RECORDS: usize = 1 << 20;

/// Packets needed for `count` words.
pub const fn packets_for(count: usize) -> usize {
    count.div_ceil(WORDS_PER_PACKET)
}

/////////////////
// BatchHeader //
/////////////////

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchHeader {
    /// This many query vectors follow.
    Queries(usize),
    Terminate,
}

impl BatchHeader {
    pub fn encode(&self) -> ANNResult<[u8; PACKET_BYTES]> {
        let mut packet = [0u8; PACKET_BYTES];
        let value = match *self {
            Self::Queries(n) => i32::try_from(n)?,
            Self::Terminate => -1,
        };
        LittleEndian::write_i32(&mut packet[..4], value);
        Ok(packet)
    }

    pub fn decode(packet: &[u8; PACKET_BYTES]) -> Self {
        match LittleEndian::read_i32(&packet[..4]) {
            n if n <= 0 => Self::Terminate,
            n => Self::Queries(n as usize),
        }
    }
}

//////////////////
// ResultRecord //
//////////////////

/// The answer to one query as it travels on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRecord {
    pub ids: Vec<NodeId>,
    pub distances: Vec<f32>,
}

impl ResultRecord {
    /// Take the first `ef` entries of `output`, padding with [`NO_RESULT`] if it holds
    /// fewer.
    pub fn from_output(output: &SearchOutput, ef: usize) -> Self {
        let mut ids: Vec<NodeId> = output.ids.iter().copied().take(ef).collect();
        let mut distances: Vec<f32> = output.distances.iter().copied().take(ef).collect();
        ids.resize(ef, NO_RESULT);
        distances.resize(ef, f32::INFINITY);
        Self { ids, distances }
    }

    pub fn ef(&self) -> usize {
        self.ids.len()
    }

    /// Iterate over the entries that are not padding.
    pub fn entries(&self) -> impl Iterator<Item = (NodeId, f32)> + '_ {
        self.ids
            .iter()
            .copied()
            .zip(self.distances.iter().copied())
            .filter(|&(id, _)| id != NO_RESULT)
    }

    fn encode_into(&self, out: &mut Vec<u8>) -> ANNResult<()> {
        if self.ids.len() != self.distances.len() {
            return Err(ANNError::log_dimension_mismatch_error(
                self.ids.len(),
                self.distances.len(),
            ));
        }
        let ef = self.ef();
        let mut header = [0u8; PACKET_BYTES];
        LittleEndian::write_i32(&mut header[..4], i32::try_from(ef)?);
        out.extend_from_slice(&header);

        let body = packets_for(ef) * PACKET_BYTES;
        let start = out.len();
        out.resize(start + 2 * body, 0);
        LittleEndian::write_u32_into(&self.ids, &mut out[start..start + 4 * ef]);
        LittleEndian::write_f32_into(
            &self.distances,
            &mut out[start + body..start + body + 4 * ef],
        );
        Ok(())
    }
}

/// Merge the top lists of several shards by ascending distance and keep the best `k`.
///
/// Padding entries are ignored. Ties keep the entry from the earlier list.
pub fn merge_results(lists: &[ResultRecord], k: usize) -> ResultRecord {
    if k == 0 {
        return ResultRecord {
            ids: Vec::new(),
            distances: Vec::new(),
        };
    }
    let mut queue = BoundedPriorityQueue::<CollectSmallest>::new(k);
    for list in lists {
        for (id, distance) in list.entries() {
            queue.insert(ScoredResult::new(id, 0, distance));
        }
    }
    let (ids, distances) = queue.best_first().map(|r| r.as_tuple()).unzip();
    ResultRecord { ids, distances }
}

fn encode_vector(vector: &[f32], out: &mut Vec<u8>) {
    let start = out.len();
    out.resize(start + packets_for(vector.len()) * PACKET_BYTES, 0);
    LittleEndian::write_f32_into(vector, &mut out[start..start + 4 * vector.len()]);
}

fn check_count(count: usize, what: &str) -> ANNResult<()> {
    if count > MAX_RECORDS {
        return Err(ANNError::log_invalid_file_format(format!(
            "{} of {} exceeds the limit of {}",
            what, count, MAX_RECORDS
        )));
    }
    Ok(())
}

////////////////////////////
// WireReader, WireWriter //
////////////////////////////

/// Reads batches and results from an async byte stream.
pub struct WireReader<R> {
    inner: R,
    dim: usize,
    buffer: Vec<u8>,
}

impl<R: AsyncRead + Unpin> WireReader<R> {
    /// `dim` is the query dimension used to size vector records.
    pub fn new(inner: R, dim: usize) -> Self {
        Self {
            inner,
            dim,
            buffer: Vec::new(),
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Read the next batch of query vectors. Returns `None` on a terminate header or when
    /// the stream ends at a batch boundary.
    pub async fn read_batch(&mut self) -> ANNResult<Option<Vec<Vec<f32>>>> {
        let mut header = [0u8; PACKET_BYTES];
        match self.inner.read_exact(&mut header).await {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(err.into()),
        }
        let count = match BatchHeader::decode(&header) {
            BatchHeader::Terminate => return Ok(None),
            BatchHeader::Queries(count) => count,
        };
        check_count(count, "batch size")?;

        // One record at a time, so memory follows the queries actually received.
        self.buffer.resize(packets_for(self.dim) * PACKET_BYTES, 0);
        let mut queries = Vec::new();
        for _ in 0..count {
            self.inner.read_exact(&mut self.buffer).await?;
            let mut vector = vec![0.0f32; self.dim];
            LittleEndian::read_f32_into(&self.buffer[..4 * self.dim], &mut vector);
            queries.push(vector);
        }
        Ok(Some(queries))
    }

    /// Read one result record.
    pub async fn read_result(&mut self) -> ANNResult<ResultRecord> {
        let mut header = [0u8; PACKET_BYTES];
        self.inner.read_exact(&mut header).await?;
        let ef = LittleEndian::read_i32(&header[..4]);
        let ef = usize::try_from(ef)?;
        check_count(ef, "result size")?;

        let body = packets_for(ef) * PACKET_BYTES;
        self.buffer.resize(2 * body, 0);
        self.inner.read_exact(&mut self.buffer).await?;

        let mut ids = vec![0; ef];
        let mut distances = vec![0.0; ef];
        LittleEndian::read_u32_into(&self.buffer[..4 * ef], &mut ids);
        LittleEndian::read_f32_into(&self.buffer[body..body + 4 * ef], &mut distances);
        Ok(ResultRecord { ids, distances })
    }
}

/// Writes batches and results to an async byte stream.
pub struct WireWriter<W> {
    inner: W,
    buffer: Vec<u8>,
}

impl<W: AsyncWrite + Unpin> WireWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            buffer: Vec::new(),
        }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    /// Write a batch header followed by every query. All queries must share one dimension.
    pub async fn write_batch(&mut self, queries: &[Vec<f32>]) -> ANNResult<()> {
        self.buffer.clear();
        self.buffer
            .extend_from_slice(&BatchHeader::Queries(queries.len()).encode()?);
        if let Some(first) = queries.first() {
            for query in queries {
                if query.len() != first.len() {
                    return Err(ANNError::log_dimension_mismatch_error(
                        first.len(),
                        query.len(),
                    ));
                }
                encode_vector(query, &mut self.buffer);
            }
        }
        self.inner.write_all(&self.buffer).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn write_terminate(&mut self) -> ANNResult<()> {
        self.inner
            .write_all(&BatchHeader::Terminate.encode()?)
            .await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Write the results of one batch.
    pub async fn write_results(&mut self, results: &[ResultRecord]) -> ANNResult<()> {
        self.buffer.clear();
        for result in results {
            result.encode_into(&mut self.buffer)?;
        }
        self.inner.write_all(&self.buffer).await?;
        self.inner.flush().await?;
        Ok(())
    }
}
