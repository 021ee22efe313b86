/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

//! Binary layouts of the graph and vector files.
//!
//! All integers are little-endian.
//!
//! Graph file (`index.bin`):
//! ```text
//! hierarchical header: i32 num_vectors, i32 max_level, i32 entry_point,
//!                      i32 max_degree_upper, i32 max_degree_base
//! flat header:         i32 num_vectors, i32 entry_point, i32 max_degree_base
//!
//! num_vectors base records        (u32 count, max_degree_base u32 ids, 64B aligned)
//!
//! hierarchical only:
//!   num_vectors x i32             node level
//!   num_vectors x u64             byte offset of the node's first upper-layer record
//!   u64                           upper region length in bytes
//!   upper region                  records of max_degree_upper, one per layer 1..=level
//! ```
//!
//! Vector file (`vectors.bin`):
//! ```text
//! i32 num_vectors, i32 dim
//! num_vectors x padded_dim(dim) f32
//! ```

use std::io::{self, Read, Write};

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};

use super::graph::{adjacency_stride, AdjacencyRecords, UpperLayers};
use crate::{
    distance::padded_dim,
    error::ErrorContext,
    neighbor::{LayerId, NodeId},
    ANNError, ANNErrorKind, ANNResult,
};

/// Highest layer a hierarchical graph may declare.
pub const MAX_LEVEL: usize = 32;

/// Whether a graph carries upper layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphKind {
    /// Multi-layer graph (HNSW).
    Hierarchical,

    /// Single-layer graph (NSG).
    Flat,
}

///////////////////
// GraphMetadata //
///////////////////

/// The fixed header at the front of a graph file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraphMetadata {
    pub kind: GraphKind,
    pub num_vectors: usize,

    /// Highest layer id. Always `0` for flat graphs.
    pub max_level: LayerId,
    pub entry_point: NodeId,
    pub max_degree_upper: usize,
    pub max_degree_base: usize,
}

impl GraphMetadata {
    /// Check the header values against each other.
    pub fn validate(&self) -> ANNResult<()> {
        if self.num_vectors == 0 {
            return Err(ANNError::log_index_config_error(
                "num_vectors",
                "the graph has no vectors",
            ));
        }
        if self.num_vectors > NodeId::MAX as usize {
            return Err(ANNError::log_index_config_error(
                "num_vectors",
                format!("{} exceeds the id space", self.num_vectors),
            ));
        }
        if self.entry_point as usize >= self.num_vectors {
            return Err(ANNError::log_index_config_error(
                "entry_point",
                format!(
                    "{} is out of range for {} vectors",
                    self.entry_point, self.num_vectors
                ),
            ));
        }
        if self.max_degree_base == 0 {
            return Err(ANNError::log_index_config_error(
                "max_degree_base",
                "it cannot be zero",
            ));
        }
        match self.kind {
            GraphKind::Flat if self.max_level != 0 => Err(ANNError::log_index_config_error(
                "max_level",
                "a flat graph has no upper layers",
            )),
            GraphKind::Hierarchical if self.max_level > 0 && self.max_degree_upper == 0 => {
                Err(ANNError::log_index_config_error(
                    "max_degree_upper",
                    "it cannot be zero when upper layers exist",
                ))
            }
            _ => Ok(()),
        }
    }

    fn read<R: Read>(reader: &mut R, kind: GraphKind) -> ANNResult<Self> {
        let mut field = |name: &'static str| -> ANNResult<usize> {
            let value = reader.read_i32::<LittleEndian>().map_err(truncated)?;
            usize::try_from(value).map_err(|_| {
                ANNError::log_index_config_error(name, format!("{} is negative", value))
            })
        };

        let num_vectors = field("num_vectors")?;
        let (max_level, entry_point, max_degree_upper) = match kind {
            GraphKind::Hierarchical => {
                let max_level = field("max_level")?;
                let entry_point = field("entry_point")?;
                let max_degree_upper = field("max_degree_upper")?;
                (max_level, entry_point, max_degree_upper)
            }
            GraphKind::Flat => (0, field("entry_point")?, 0),
        };
        let max_degree_base = field("max_degree_base")?;

        if max_level > MAX_LEVEL {
            return Err(ANNError::log_index_config_error(
                "max_level",
                format!("{} exceeds {}", max_level, MAX_LEVEL),
            ));
        }

        let metadata = Self {
            kind,
            num_vectors,
            max_level: max_level as LayerId,
            entry_point: NodeId::try_from(entry_point)?,
            max_degree_upper,
            max_degree_base,
        };
        metadata.validate()?;
        Ok(metadata)
    }

    fn write<W: Write>(&self, writer: &mut W) -> ANNResult<usize> {
        let mut fields = vec![self.num_vectors];
        if self.kind == GraphKind::Hierarchical {
            fields.push(self.max_level.into());
        }
        fields.push(self.entry_point as usize);
        if self.kind == GraphKind::Hierarchical {
            fields.push(self.max_degree_upper);
        }
        fields.push(self.max_degree_base);

        for &field in &fields {
            writer.write_i32::<LittleEndian>(i32::try_from(field)?)?;
        }
        Ok(fields.len() * std::mem::size_of::<i32>())
    }
}

///////////////
// GraphFile //
///////////////

/// The decoded contents of a graph file, with adjacency records in global id order.
#[derive(Debug, Clone)]
pub struct GraphFile {
    pub metadata: GraphMetadata,
    pub base: AdjacencyRecords,
    pub upper: Option<UpperLayers>,
}

impl GraphFile {
    /// Read a graph of `kind` from `reader`, rejecting truncated or trailing data.
    pub fn read<R: Read>(reader: &mut R, kind: GraphKind) -> ANNResult<Self> {
        let metadata = GraphMetadata::read(reader, kind)?;

        let base_len = checked_len(
            metadata.num_vectors,
            adjacency_stride(metadata.max_degree_base),
            "base adjacency",
        )?;
        let base = AdjacencyRecords::new(read_bytes(reader, base_len)?, metadata.max_degree_base)?;

        let upper = match kind {
            GraphKind::Flat => None,
            GraphKind::Hierarchical => Some(Self::read_upper(reader, &metadata)?),
        };

        ensure_exhausted(reader)?;
        Ok(Self {
            metadata,
            base,
            upper,
        })
    }

    fn read_upper<R: Read>(reader: &mut R, metadata: &GraphMetadata) -> ANNResult<UpperLayers> {
        let n = metadata.num_vectors;

        let level_bytes = read_bytes(reader, checked_len(n, 4, "node levels")?)?;
        let mut levels = Vec::with_capacity(n);
        for (node, raw) in level_bytes.chunks_exact(4).enumerate() {
            let level = LittleEndian::read_i32(raw);
            if level < 0 || level > i32::from(metadata.max_level) {
                return Err(ANNError::log_index_corruption(format!(
                    "node {} has level {}, max level is {}",
                    node, level, metadata.max_level
                )));
            }
            levels.push(level as LayerId);
        }
        let entry_level = levels[metadata.entry_point as usize];
        if entry_level < metadata.max_level {
            return Err(ANNError::log_index_config_error(
                "entry_point",
                format!(
                    "its level {} is below the graph's max level {}",
                    entry_level, metadata.max_level
                ),
            ));
        }

        let offset_bytes = read_bytes(reader, checked_len(n, 8, "upper offsets")?)?;
        let mut offsets = vec![0u64; n];
        LittleEndian::read_u64_into(&offset_bytes, &mut offsets);

        let region_len = reader.read_u64::<LittleEndian>().map_err(truncated)?;
        let region = read_bytes(reader, usize::try_from(region_len)?)?;

        UpperLayers::new(levels, offsets, region, metadata.max_degree_upper)
    }

    /// Write `self` in the layout read by [`Self::read`]. Returns the number of bytes
    /// written.
    pub fn write<W: Write>(&self, writer: &mut W) -> ANNResult<usize> {
        let mut written = self.metadata.write(writer)?;
        writer.write_all(self.base.as_bytes())?;
        written += self.base.as_bytes().len();

        if let Some(upper) = &self.upper {
            for &level in upper.levels() {
                writer.write_i32::<LittleEndian>(level.into())?;
            }
            for &offset in upper.offsets() {
                writer.write_u64::<LittleEndian>(offset)?;
            }
            writer.write_u64::<LittleEndian>(upper.region().len() as u64)?;
            writer.write_all(upper.region())?;
            written += upper.levels().len() * (4 + 8) + 8 + upper.region().len();
        }

        writer.flush()?;
        Ok(written)
    }
}

////////////////
// VectorFile //
////////////////

/// The decoded contents of a vector file, each row zero-padded to `padded_dim(dim)`.
#[derive(Debug, Clone)]
pub struct VectorFile {
    pub num_vectors: usize,
    pub dim: usize,
    pub data: Vec<f32>,
}

impl VectorFile {
    pub fn read<R: Read>(reader: &mut R) -> ANNResult<Self> {
        let num_vectors = reader.read_i32::<LittleEndian>().map_err(truncated)?;
        let dim = reader.read_i32::<LittleEndian>().map_err(truncated)?;
        if num_vectors <= 0 || dim <= 0 {
            return Err(ANNError::log_index_config_error(
                "vector file header",
                format!("num_vectors = {}, dim = {}", num_vectors, dim),
            ));
        }

        let (num_vectors, dim) = (num_vectors as usize, dim as usize);
        let len = checked_len(num_vectors, padded_dim(dim), "vector data")?;
        let bytes = read_bytes(reader, checked_len(len, 4, "vector data")?)?;
        ensure_exhausted(reader)?;

        let mut data = vec![0.0f32; len];
        LittleEndian::read_f32_into(&bytes, &mut data);

        Ok(Self {
            num_vectors,
            dim,
            data,
        })
    }

    pub fn write<W: Write>(&self, writer: &mut W) -> ANNResult<usize> {
        writer.write_i32::<LittleEndian>(i32::try_from(self.num_vectors)?)?;
        writer.write_i32::<LittleEndian>(i32::try_from(self.dim)?)?;
        for &value in &self.data {
            writer.write_f32::<LittleEndian>(value)?;
        }
        writer.flush()?;
        Ok(8 + self.data.len() * std::mem::size_of::<f32>())
    }
}

/// Read a label file: a `u32` count followed by that many `u32` external labels, one per
/// internal node id.
pub fn read_labels<R: Read>(reader: &mut R) -> ANNResult<Vec<u32>> {
    let count = reader.read_u32::<LittleEndian>().map_err(truncated)? as usize;
    let bytes = read_bytes(reader, checked_len(count, 4, "labels")?)?;
    ensure_exhausted(reader)?;

    let mut labels = vec![0u32; count];
    LittleEndian::read_u32_into(&bytes, &mut labels);
    Ok(labels)
}

pub fn write_labels<W: Write>(writer: &mut W, labels: &[u32]) -> ANNResult<()> {
    writer.write_u32::<LittleEndian>(u32::try_from(labels.len())?)?;
    for &label in labels {
        writer.write_u32::<LittleEndian>(label)?;
    }
    writer.flush()?;
    Ok(())
}

/// Read exactly `len` bytes. The buffer grows with the bytes actually present, so a
/// header that overstates the payload fails as truncated without allocating it.
fn read_bytes<R: Read>(reader: &mut R, len: usize) -> ANNResult<Vec<u8>> {
    let mut bytes = Vec::new();
    reader
        .by_ref()
        .take(u64::try_from(len)?)
        .read_to_end(&mut bytes)
        .map_err(truncated)?;
    if bytes.len() < len {
        return Err(truncated(io::ErrorKind::UnexpectedEof.into()));
    }
    Ok(bytes)
}

/// Byte length of `count` items of `item_bytes` each.
fn checked_len(count: usize, item_bytes: usize, what: &str) -> ANNResult<usize> {
    count.checked_mul(item_bytes).ok_or_else(|| {
        ANNError::log_invalid_file_format(format!(
            "{} of {} x {} bytes does not fit in memory",
            what, count, item_bytes
        ))
    })
}

fn ensure_exhausted<R: Read>(reader: &mut R) -> ANNResult<()> {
    let mut probe = [0u8; 1];
    match reader.read(&mut probe).context("checking for trailing data")? {
        0 => Ok(()),
        _ => Err(ANNError::log_invalid_file_format(
            "unexpected trailing data after the last record",
        )),
    }
}

#[track_caller]
fn truncated(err: io::Error) -> ANNError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        ANNError::new(ANNErrorKind::InvalidFileFormatError, err).context("file is truncated")
    } else {
        ANNError::log_io_error(err)
    }
}
