//! Fused querier: answers many concurrent queries against one block in a
//! single fingerprint-ordered pass over its series and bloom streams.

use std::{fmt, sync::Arc};

use bytes::Bytes;
use flume::Sender;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::{
    block::{BlockError, BlockReader, Series},
    bloom::BloomTest,
    chunk::ChunkRefs,
    fingerprint::Fingerprint,
    iter::{DedupIter, MergeIter, MergeKey},
    LOG_TARGET,
};

/// One caller query routed to one block. Terminal after its single
/// [`Output`] is produced; requests carry no state across blocks.
#[derive(Clone)]
pub struct Request {
    pub fp: Fingerprint,
    /// Candidate chunks the caller would otherwise fetch.
    pub chunks: ChunkRefs,
    /// Search terms shared across the originating session.
    pub searches: Arc<[Bytes]>,
    /// Where the answer is delivered. Write-once per (request, block).
    pub sink: Sender<Output>,
}

impl MergeKey for Request {
    type Key = Fingerprint;

    fn merge_key(&self) -> Fingerprint {
        self.fp
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("fp", &self.fp)
            .field("chunks", &self.chunks.len())
            .field("searches", &self.searches.len())
            .finish()
    }
}

/// The subset of a request's candidate chunks that could not be excluded
/// and must be fetched from backing storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Output {
    pub fp: Fingerprint,
    pub chunks: ChunkRefs,
}

/// Request sequence accepted by the fused querier. Must be sorted by
/// fingerprint; the same fingerprint may repeat within and across
/// sequences.
pub type RequestStream = Box<dyn Iterator<Item = Request> + Send>;

/// Errors that abort a block's run. Missing series and unreadable blooms
/// are not errors; they resolve locally as fail-open answers.
#[derive(Debug, Error)]
pub enum FuseError {
    #[error("seek series at fingerprint {fp}: {source}")]
    SeekSeries {
        fp: Fingerprint,
        #[source]
        source: BlockError,
    },
    #[error("read series at fingerprint {fp}: {source}")]
    ReadSeries {
        fp: Fingerprint,
        #[source]
        source: BlockError,
    },
    #[error("seek bloom for fingerprint {fp}: {source}")]
    SeekBloom {
        fp: Fingerprint,
        #[source]
        source: BlockError,
    },
    /// A response sink was dropped before its answer could be delivered.
    #[error("response sink disconnected")]
    Disconnected,
    /// The run observed cancellation and stopped early; undelivered
    /// requests receive no output.
    #[error("run cancelled")]
    Cancelled,
}

/// Where a batch's fingerprint landed in the block.
enum Located<B> {
    /// Series stream exhausted; all remaining batches are unanswerable
    /// and the run ends successfully.
    End,
    /// No series or no readable bloom for this fingerprint; answer with
    /// full candidate sets.
    FailOpen,
    /// Series found with bloom evidence to test against.
    Test(Series, B),
}

async fn locate<B: BlockReader>(
    block: &mut B,
    fp: Fingerprint,
) -> Result<Located<B::Bloom>, FuseError> {
    block.seek(fp).await.map_err(|source| {
        error!(target: LOG_TARGET, %fp, error = %source, "series seek failed");
        FuseError::SeekSeries { fp, source }
    })?;

    let series = match block
        .next_series()
        .await
        .map_err(|source| FuseError::ReadSeries { fp, source })?
    {
        Some(series) => series,
        None => return Ok(Located::End),
    };

    if series.fp != fp {
        // stream doesn't exist in this block
        return Ok(Located::FailOpen);
    }

    block
        .seek_bloom(series.bloom)
        .await
        .map_err(|source| FuseError::SeekBloom { fp, source })?;

    match block.next_bloom().await {
        Ok(Some(bloom)) => Ok(Located::Test(series, bloom)),
        Ok(None) => {
            warn!(target: LOG_TARGET, %fp, "bloom stream ended early, failing open");
            Ok(Located::FailOpen)
        }
        Err(err) => {
            warn!(target: LOG_TARGET, %fp, error = %err, "unreadable bloom, failing open");
            Ok(Located::FailOpen)
        }
    }
}

/// Narrow one candidate set against a located series and its bloom.
fn filter_chunks(
    candidates: &ChunkRefs,
    searches: &[Bytes],
    series: &Series,
    bloom: &impl BloomTest,
) -> ChunkRefs {
    // chunks the block doesn't know about carry no evidence and are
    // always kept
    let (missing, in_blooms) = candidates.compare(&series.chunks);

    // series-level test first: any failing term excludes every in-block
    // chunk for this request
    for term in searches {
        if !bloom.test(term) {
            return missing;
        }
    }

    let mut kept = Vec::with_capacity(in_blooms.len());
    'chunks: for chunk in &in_blooms {
        for term in searches {
            if !bloom.test_chunk(chunk, term) {
                continue 'chunks;
            }
        }
        kept.push(*chunk);
    }
    missing.union(&ChunkRefs::from_sorted(kept))
}

/// Answer a single query against one block in isolation.
///
/// The fused path is equivalent to calling this once per query; fusing
/// only batches the I/O. Kept as the oracle the equivalence tests check
/// the merge loop against, and for callers with a single query in hand.
pub async fn check_chunks<B: BlockReader>(
    block: &mut B,
    fp: Fingerprint,
    candidates: &ChunkRefs,
    searches: &[Bytes],
) -> Result<ChunkRefs, FuseError> {
    match locate(block, fp).await? {
        Located::End | Located::FailOpen => Ok(candidates.clone()),
        Located::Test(series, bloom) => Ok(filter_chunks(candidates, searches, &series, &bloom)),
    }
}

/// Merge-execution engine for one block.
///
/// Construction wraps the request streams in a heap merge and batches
/// runs of equal fingerprints; `run` then advances the block's two
/// streams strictly forward, answering every request batch in one pass.
pub struct FusedQuerier<'a, B: BlockReader> {
    block: &'a mut B,
    batches: DedupIter<MergeIter<RequestStream>>,
    token: CancellationToken,
}

impl<'a, B: BlockReader> FusedQuerier<'a, B> {
    pub fn new(block: &'a mut B, inputs: Vec<RequestStream>, token: CancellationToken) -> Self {
        let batches = DedupIter::new(MergeIter::new(inputs));
        Self {
            block,
            batches,
            token,
        }
    }

    /// Drive every batch to completion.
    ///
    /// Returns `Ok` when the batch sequence or the block's series stream
    /// is exhausted. Batches past the end of the series stream receive no
    /// response; callers rely on the fail-open default for them.
    pub async fn run(mut self) -> Result<(), FuseError> {
        let block = self.block.id();
        debug!(target: LOG_TARGET, %block, "fused run started");

        let mut batches = 0usize;
        while let Some(batch) = self.batches.next() {
            if self.token.is_cancelled() {
                debug!(target: LOG_TARGET, %block, batches, "fused run cancelled");
                return Err(FuseError::Cancelled);
            }
            batches += 1;

            let fp = batch[0].fp;
            trace!(target: LOG_TARGET, %block, %fp, requests = batch.len(), "processing batch");

            match locate(self.block, fp).await? {
                Located::End => {
                    debug!(target: LOG_TARGET, %block, batches, "series stream exhausted");
                    return Ok(());
                }
                Located::FailOpen => {
                    for request in &batch {
                        let chunks = request.chunks.clone();
                        self.deliver(request, Output { fp, chunks }).await?;
                    }
                }
                Located::Test(series, bloom) => {
                    for request in &batch {
                        let chunks =
                            filter_chunks(&request.chunks, &request.searches, &series, &bloom);
                        self.deliver(request, Output { fp, chunks }).await?;
                    }
                }
            }
        }

        debug!(target: LOG_TARGET, %block, batches, "fused run finished");
        Ok(())
    }

    /// Delivery blocks on the bounded sink; a cancelled run aborts the
    /// in-flight send instead of deadlocking.
    async fn deliver(&self, request: &Request, output: Output) -> Result<(), FuseError> {
        tokio::select! {
            _ = self.token.cancelled() => Err(FuseError::Cancelled),
            sent = request.sink.send_async(output) => sent.map_err(|_| FuseError::Disconnected),
        }
    }
}
