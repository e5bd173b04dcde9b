//! Fused query execution over bloom-filter log-index blocks.
//!
//! A block stores one bloom filter per log stream, sorted by the stream's
//! numeric fingerprint, alongside the chunks the block knows for that
//! stream. Given a batch of concurrent candidate-chunk existence queries,
//! this crate determines per query which candidates cannot be excluded by
//! the filters and must be fetched from backing storage.
//!
//! The engine answers a whole batch in one sequential sweep per block:
//! request streams are heap-merged in fingerprint order, batched per
//! fingerprint, and tested against the block's series and bloom streams
//! as both advance strictly forward. Across blocks, a router partitions
//! the batch by each block's fingerprint bounds (bounds may overlap) and
//! runs one querier per block concurrently.
//!
//! Missing evidence never excludes: an absent series or unreadable bloom
//! answers with the full candidate set. Only seek failures abort a
//! block's run, and only that block's.

pub mod block;
pub mod bloom;
pub mod chunk;
pub mod fingerprint;
pub mod fuse;
pub mod iter;
pub mod option;
pub mod router;

pub(crate) const LOG_TARGET: &str = "bloomfuse";

pub use crate::{
    block::{mem::MemBlock, mem::MemBlockBuilder, BlockError, BlockId, BlockReader, BloomOffset, Series},
    bloom::{BloomTest, SeriesBloom},
    chunk::{ChunkRef, ChunkRefs},
    fingerprint::{BoundsCheck, Fingerprint, FingerprintBounds},
    fuse::{check_chunks, FuseError, FusedQuerier, Output, Request, RequestStream},
    option::FuseOptions,
    router::{
        partition_queries, run_batch, BatchResult, BlockRun, QuerySession, ResponseDrain,
        SeriesQuery,
    },
};
