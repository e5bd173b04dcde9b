//! Block reader contract consumed by the fused querier.
//!
//! A block is an immutable, bounded-fingerprint-range unit of bloom
//! storage exposing two logically linked streams: series records ordered
//! by fingerprint, and bloom records addressed by the offset each series
//! stores. Decoding, checksums, and compression live behind this trait;
//! the engine only seeks and reads forward.

pub mod mem;

use std::fmt;

use thiserror::Error;
use ulid::Ulid;

use crate::{
    bloom::BloomTest,
    chunk::ChunkRefs,
    fingerprint::{Fingerprint, FingerprintBounds},
    iter::MergeKey,
};

/// Identifier for one immutable block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(Ulid);

impl BlockId {
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Offset of a bloom record within a block's bloom stream. Opaque to the
/// engine; only the owning series record gives it meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct BloomOffset(u64);

impl BloomOffset {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(&self) -> u64 {
        self.0
    }
}

/// Per-stream record stored in a block: the stream's fingerprint, the
/// chunks the block knows for it, and where its bloom record lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Series {
    pub fp: Fingerprint,
    pub chunks: ChunkRefs,
    pub bloom: BloomOffset,
}

impl MergeKey for Series {
    type Key = Fingerprint;

    fn merge_key(&self) -> Fingerprint {
        self.fp
    }
}

/// Errors surfaced by block readers.
#[derive(Debug, Error)]
pub enum BlockError {
    /// Underlying storage failed while positioning or reading.
    #[error("block io error: {0}")]
    Io(#[from] std::io::Error),
    /// A series referenced a bloom offset outside the bloom stream.
    #[error("bloom offset {offset} out of range (stream holds {len})")]
    OffsetOutOfRange { offset: u64, len: u64 },
}

/// Seekable, two-stream reader over one block.
///
/// `seek` positions both streams so the next sequential reads return the
/// first records at or after the given fingerprint. Readers keep the two
/// streams logically linked through the stored offsets; the engine never
/// reads a bloom without having located its owning series first.
///
/// A reader is owned by a single fused querier for the duration of a run
/// and is not safe for concurrent use.
#[allow(async_fn_in_trait)]
pub trait BlockReader {
    /// Bloom record type produced by this reader.
    type Bloom: BloomTest;

    fn id(&self) -> BlockId;

    fn bounds(&self) -> FingerprintBounds;

    async fn seek(&mut self, fp: Fingerprint) -> Result<(), BlockError>;

    async fn next_series(&mut self) -> Result<Option<Series>, BlockError>;

    async fn seek_bloom(&mut self, offset: BloomOffset) -> Result<(), BlockError>;

    async fn next_bloom(&mut self) -> Result<Option<Self::Bloom>, BlockError>;
}
