//! Multi-block router: partitions a query batch across possibly
//! overlapping blocks, runs one fused querier per block with relevant
//! work, and reports per-block outcomes.

use std::{collections::HashMap, ops::Range, sync::Arc};

use bytes::Bytes;
use flume::{Receiver, Sender};
use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::{
    block::{BlockId, BlockReader},
    chunk::ChunkRefs,
    fingerprint::{BoundsCheck, Fingerprint, FingerprintBounds},
    fuse::{FuseError, FusedQuerier, Output, Request, RequestStream},
    option::FuseOptions,
    LOG_TARGET,
};

/// One logical query before submission: a stream plus the candidate
/// chunks the caller would fetch for it.
#[derive(Debug, Clone)]
pub struct SeriesQuery {
    pub fp: Fingerprint,
    pub chunks: ChunkRefs,
}

impl SeriesQuery {
    pub fn new(fp: impl Into<Fingerprint>, chunks: ChunkRefs) -> Self {
        Self {
            fp: fp.into(),
            chunks,
        }
    }
}

/// A batch of queries sharing search terms and one response channel.
///
/// Queries must be sorted by fingerprint before submission; unsorted
/// input is a caller bug, not a recoverable condition. A query routed to
/// several overlapping blocks receives one independent output per block.
///
/// Responses flow through a bounded channel, so a [`drain`](Self::drain)
/// handle must be consumed concurrently with the run unless the capacity
/// covers every expected output.
pub struct QuerySession {
    queries: Vec<SeriesQuery>,
    searches: Arc<[Bytes]>,
    tx: Sender<Output>,
    rx: Receiver<Output>,
}

impl QuerySession {
    pub fn new(
        queries: Vec<SeriesQuery>,
        searches: impl IntoIterator<Item = Bytes>,
        options: &FuseOptions,
    ) -> Self {
        debug_assert!(
            queries.windows(2).all(|w| w[0].fp <= w[1].fp),
            "queries must be sorted by fingerprint"
        );
        let (tx, rx) = flume::bounded(options.response_capacity);
        Self {
            queries,
            searches: searches.into_iter().collect(),
            tx,
            rx,
        }
    }

    pub fn queries(&self) -> &[SeriesQuery] {
        &self.queries
    }

    /// Drain handle for this session's responses. The channel closes once
    /// the batch run completes and the session is dropped.
    pub fn drain(&self) -> ResponseDrain {
        ResponseDrain {
            rx: self.rx.clone(),
        }
    }

    /// Materialize the request sequence for one partition slice.
    fn requests(&self, range: Range<usize>) -> RequestStream {
        let searches = Arc::clone(&self.searches);
        let tx = self.tx.clone();
        Box::new(self.queries[range].to_vec().into_iter().map(move |query| {
            Request {
                fp: query.fp,
                chunks: query.chunks,
                searches: Arc::clone(&searches),
                sink: tx.clone(),
            }
        }))
    }
}

/// Consumer side of a session's response channel.
#[derive(Clone)]
pub struct ResponseDrain {
    rx: Receiver<Output>,
}

impl ResponseDrain {
    /// Next output, or `None` once every producer is gone. A request that
    /// was never reached (cancellation, early series end) produces no
    /// output; absence is not exclusion.
    pub async fn recv(&self) -> Option<Output> {
        self.rx.recv_async().await.ok()
    }

    /// Union must-fetch sets per fingerprint across blocks until the
    /// channel closes.
    ///
    /// A chunk is excluded only if every block that knows it excluded it,
    /// which is the conservative combination: unioning can grow the fetch
    /// set but never wrongly shrink it. Callers needing a different rule
    /// can drain outputs themselves.
    pub async fn collect_must_fetch(self) -> HashMap<Fingerprint, ChunkRefs> {
        let mut merged: HashMap<Fingerprint, ChunkRefs> = HashMap::new();
        while let Some(output) = self.recv().await {
            merged
                .entry(output.fp)
                .and_modify(|chunks| *chunks = chunks.union(&output.chunks))
                .or_insert(output.chunks);
        }
        merged
    }
}

/// Compute each block's share of a fingerprint-sorted query batch.
///
/// `None` means the block has no overlap with the batch at all; an empty
/// range means the batch spans the block but no query lands inside it.
/// Queries in the overlap of two blocks' bounds land in both shares.
pub fn partition_queries(
    queries: &[SeriesQuery],
    bounds: &[FingerprintBounds],
) -> Vec<Option<Range<usize>>> {
    bounds
        .iter()
        .map(|b| {
            let min = queries.partition_point(|q| b.cmp(q.fp) == BoundsCheck::Before);
            let max = queries.partition_point(|q| b.cmp(q.fp) != BoundsCheck::After);
            if min == queries.len() || max == 0 {
                None
            } else {
                Some(min..max)
            }
        })
        .collect()
}

/// Outcome of one block's fused run.
#[derive(Debug)]
pub struct BlockRun {
    pub block: BlockId,
    pub result: Result<(), FuseError>,
}

/// Outcome of one multi-block batch run. Partial success is visible per
/// block; the aggregate is failed if any block failed.
#[derive(Debug)]
pub struct BatchResult {
    runs: Vec<BlockRun>,
}

impl BatchResult {
    pub fn runs(&self) -> &[BlockRun] {
        &self.runs
    }

    pub fn is_failed(&self) -> bool {
        self.runs.iter().any(|run| run.result.is_err())
    }

    pub fn errors(&self) -> impl Iterator<Item = (BlockId, &FuseError)> {
        self.runs
            .iter()
            .filter_map(|run| run.result.as_ref().err().map(|err| (run.block, err)))
    }
}

/// Partition every session across the blocks' bounds, run one fused
/// querier per block with non-empty work, and report per-block results.
///
/// Queriers run concurrently; each one is itself strictly sequential over
/// its block. One cancellation token covers the whole run. Consuming the
/// sessions here is what closes their response channels afterwards:
/// drains observe end-of-stream once the run and the sessions are gone.
pub async fn run_batch<B: BlockReader>(
    sessions: Vec<QuerySession>,
    blocks: &mut [B],
    token: CancellationToken,
) -> BatchResult {
    let bounds: Vec<FingerprintBounds> = blocks.iter().map(|b| b.bounds()).collect();

    // group request streams by target block
    let mut shares: Vec<Vec<RequestStream>> = (0..blocks.len()).map(|_| Vec::new()).collect();
    for session in &sessions {
        for (i, partition) in partition_queries(session.queries(), &bounds)
            .into_iter()
            .enumerate()
        {
            if let Some(range) = partition {
                shares[i].push(session.requests(range));
            }
        }
    }
    drop(sessions);

    debug!(
        target: LOG_TARGET,
        blocks = blocks.len(),
        active = shares.iter().filter(|s| !s.is_empty()).count(),
        "batch run started"
    );

    let queriers: Vec<_> = blocks
        .iter_mut()
        .zip(shares)
        .filter_map(|(block, share)| {
            if share.is_empty() {
                return None;
            }
            let id = block.id();
            let token = token.clone();
            Some(async move {
                let result = FusedQuerier::new(block, share, token).run().await;
                if let Err(err) = &result {
                    error!(target: LOG_TARGET, block = %id, error = %err, "block run failed");
                }
                BlockRun { block: id, result }
            })
        })
        .collect();

    let runs = join_all(queriers).await;
    debug!(
        target: LOG_TARGET,
        runs = runs.len(),
        failed = runs.iter().filter(|r| r.result.is_err()).count(),
        "batch run finished"
    );
    BatchResult { runs }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queries(fps: &[u64]) -> Vec<SeriesQuery> {
        fps.iter()
            .map(|fp| SeriesQuery::new(*fp, ChunkRefs::default()))
            .collect()
    }

    fn share_fps(queries: &[SeriesQuery], range: &Option<Range<usize>>) -> Option<Vec<u64>> {
        range
            .as_ref()
            .map(|r| queries[r.clone()].iter().map(|q| q.fp.get()).collect())
    }

    #[test]
    fn partition_includes_overlaps_in_both_shares() {
        let queries = queries(&[0, 1, 2, 3]);
        let bounds = [
            FingerprintBounds::new(0u64, 2u64),
            FingerprintBounds::new(1u64, 3u64),
            FingerprintBounds::new(5u64, 7u64),
        ];

        let partitions = partition_queries(&queries, &bounds);
        assert_eq!(share_fps(&queries, &partitions[0]), Some(vec![0, 1, 2]));
        assert_eq!(share_fps(&queries, &partitions[1]), Some(vec![1, 2, 3]));
        assert_eq!(partitions[2], None);
    }

    #[test]
    fn partition_distinguishes_empty_share_from_no_overlap() {
        let queries = queries(&[1, 9]);
        let bounds = [
            // batch spans these bounds but nothing lands inside
            FingerprintBounds::new(4u64, 6u64),
            // strictly after every query
            FingerprintBounds::new(10u64, 12u64),
        ];

        let partitions = partition_queries(&queries, &bounds);
        assert_eq!(partitions[0], Some(1..1));
        assert_eq!(partitions[1], None);
    }

    #[test]
    fn partition_of_empty_batch_is_all_none() {
        let partitions = partition_queries(&[], &[FingerprintBounds::new(0u64, 10u64)]);
        assert_eq!(partitions, vec![None]);
    }

    #[test]
    fn non_overlapping_bounds_split_exactly_once() {
        let queries = queries(&[0, 500, 1000, 1500, 2500, 3999]);
        let bounds: Vec<FingerprintBounds> = (0u64..4)
            .map(|i| FingerprintBounds::new(i * 1000, (i + 1) * 1000 - 1))
            .collect();

        let partitions = partition_queries(&queries, &bounds);
        let total: usize = partitions
            .iter()
            .flatten()
            .map(|r| r.end - r.start)
            .sum();
        assert_eq!(total, queries.len(), "each query served exactly once");
    }
}
