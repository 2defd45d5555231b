//! Delivery-chunk parsing.
//!
//! A Deliver push carries one chunk: a fixed header, an IEEE CRC-32 over
//! the entry region, and a list of entries that are either single records
//! or compressed sub-batches. Sub-batches other than "none" are returned
//! as [`SubBatchJob`]s so the caller can run decompression concurrently;
//! every job owns a pre-reserved, disjoint slot range in the chunk's
//! record table, computed with a cumulative counter before any job is
//! handed out.

use crate::error::ProtocolError;
use crate::wire::WireReader;
use bytes::Bytes;
use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;

/// Compression type codes carried in sub-batch entry headers.
pub const COMPRESSION_NONE: u8 = 0;
pub const COMPRESSION_GZIP: u8 = 1;
pub const COMPRESSION_SNAPPY: u8 = 2;
pub const COMPRESSION_LZ4: u8 = 3;
pub const COMPRESSION_ZSTD: u8 = 4;

/// A sub-batch decompression function. Runs outside the event path, so it
/// must be shareable and is free to block.
pub type DecompressFn = Arc<dyn Fn(&[u8]) -> Result<Vec<u8>, ProtocolError> + Send + Sync>;

/// Explicit decoder table passed to the chunk parser.
///
/// Gzip is pre-registered; other codecs are added by the consumer via
/// [`CompressionRegistry::register`]. An entry referencing an unregistered
/// type fails the whole chunk at parse time, before any decoding starts.
#[derive(Clone)]
pub struct CompressionRegistry {
    decoders: HashMap<u8, DecompressFn>,
}

impl CompressionRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            decoders: HashMap::new(),
        };
        registry.register(COMPRESSION_GZIP, Arc::new(gzip_decode));
        registry
    }

    pub fn register(&mut self, compression_type: u8, decode: DecompressFn) {
        self.decoders.insert(compression_type, decode);
    }

    fn get(&self, compression_type: u8) -> Option<&DecompressFn> {
        self.decoders.get(&compression_type)
    }
}

impl Default for CompressionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn gzip_decode(input: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let mut out = Vec::new();
    flate2::read::GzDecoder::new(input)
        .read_to_end(&mut out)
        .map_err(|e| ProtocolError::Decompression(e.to_string()))?;
    Ok(out)
}

/// Fixed chunk metadata surfaced with the decoded records.
#[derive(Debug, Clone, Copy)]
pub struct ChunkHeader {
    pub subscription_id: u8,
    /// Zero when the frame version predates committed-chunk tracking.
    pub committed_chunk_id: u32,
    pub timestamp: i64,
    pub offset: u64,
    pub record_count: u32,
}

/// One deferred sub-batch decompression, bound to its reserved slot range.
pub struct SubBatchJob {
    pub decode: DecompressFn,
    pub compressed: Bytes,
    pub first_slot: usize,
    pub record_count: u16,
}

/// Parse result: plain records already in place, compressed sub-batches
/// pending as jobs.
pub struct ParsedChunk {
    pub header: ChunkHeader,
    pub records: Vec<Option<Bytes>>,
    pub jobs: Vec<SubBatchJob>,
}

impl ParsedChunk {
    /// Finalizes the record table once every job has been expanded.
    pub fn into_records(self) -> Result<Vec<Bytes>, ProtocolError> {
        let expected = self.records.len() as u32;
        let mut out = Vec::with_capacity(self.records.len());
        let mut actual = 0u32;
        for slot in self.records {
            match slot {
                Some(record) => {
                    actual += 1;
                    out.push(record);
                }
                None => {
                    return Err(ProtocolError::RecordCountMismatch { expected, actual });
                }
            }
        }
        Ok(out)
    }
}

/// Parses one Deliver payload (the frame body after the envelope).
///
/// `version` is the Deliver frame version: v2 and later carry a committed
/// chunk id. CRC validation covers exactly `data_length` bytes starting at
/// the entry region and fails the whole chunk on mismatch.
pub fn parse_chunk(
    payload: Bytes,
    version: u16,
    registry: &CompressionRegistry,
    check_crc: bool,
) -> Result<ParsedChunk, ProtocolError> {
    let mut r = WireReader::new(payload);

    let subscription_id = r.u8()?;
    let committed_chunk_id = if version >= 2 { r.u32()? } else { 0 };
    r.skip(1)?; // magic/version byte
    let chunk_type = r.u8()?;
    if chunk_type != 0 {
        return Err(ProtocolError::BadChunkType(chunk_type));
    }
    let entry_count = r.u16()?;
    let record_count = r.u32()?;
    let timestamp = r.i64()?;
    r.skip(8)?; // epoch
    let offset = r.u64()?;
    let crc = r.u32()?;
    let data_length = r.u32()?;
    r.skip(8)?; // trailer length, reserved

    if check_crc {
        let region = r.peek_slice(data_length as usize)?;
        let actual = crc32fast::hash(region);
        if actual != crc {
            return Err(ProtocolError::CrcMismatch {
                expected: crc,
                actual,
            });
        }
    }

    let mut records: Vec<Option<Bytes>> = vec![None; record_count as usize];
    let mut jobs = Vec::new();
    let mut slot = 0usize;

    for _ in 0..entry_count {
        let entry_type = r.peek_u8()?;
        if entry_type & 0x80 == 0 {
            // Plain record: the type byte doubles as the top byte of the
            // i32 length prefix, so read the length from here.
            if slot >= records.len() {
                return Err(ProtocolError::RecordIndexOutOfRange);
            }
            records[slot] = Some(r.bytes()?);
            slot += 1;
        } else {
            r.skip(1)?;
            let compression = (entry_type & 0x70) >> 4;
            let batch_records = r.u16()?;
            r.skip(4)?; // uncompressed length hint
            let data = r.bytes()?;

            if slot + batch_records as usize > records.len() {
                return Err(ProtocolError::RecordIndexOutOfRange);
            }
            if compression == COMPRESSION_NONE {
                expand_sub_batch(&mut records, slot, batch_records, &data)?;
            } else {
                let decode = registry
                    .get(compression)
                    .ok_or(ProtocolError::UnsupportedCompression(compression))?
                    .clone();
                jobs.push(SubBatchJob {
                    decode,
                    compressed: data,
                    first_slot: slot,
                    record_count: batch_records,
                });
            }
            slot += batch_records as usize;
        }
    }

    Ok(ParsedChunk {
        header: ChunkHeader {
            subscription_id,
            committed_chunk_id,
            timestamp,
            offset,
            record_count,
        },
        records,
        jobs,
    })
}

/// Writes a sub-batch's length-prefixed records into its reserved slot
/// range. `data` is the (decompressed) sub-batch byte region.
pub fn expand_sub_batch(
    records: &mut [Option<Bytes>],
    first_slot: usize,
    record_count: u16,
    data: &[u8],
) -> Result<(), ProtocolError> {
    if first_slot + record_count as usize > records.len() {
        return Err(ProtocolError::RecordIndexOutOfRange);
    }
    let mut r = WireReader::new(Bytes::copy_from_slice(data));
    for i in 0..record_count as usize {
        records[first_slot + i] = Some(r.bytes()?);
    }
    Ok(())
}
