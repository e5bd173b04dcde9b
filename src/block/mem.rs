//! In-memory block reader.
//!
//! Backs the test suite and embedders that hold decoded blocks in memory;
//! the disk format proper lives outside this crate.

use std::sync::Arc;

use bytes::Bytes;

use crate::{
    block::{BlockError, BlockId, BlockReader, BloomOffset, Series},
    bloom::SeriesBloom,
    chunk::{ChunkRef, ChunkRefs},
    fingerprint::{Fingerprint, FingerprintBounds},
    option::FuseOptions,
};

struct StagedSeries {
    fp: Fingerprint,
    chunks: Vec<(ChunkRef, Vec<Bytes>)>,
}

/// Stages series with per-chunk terms and assembles a [`MemBlock`].
///
/// Each term is indexed twice: once at series level and once scoped to
/// the chunk that contributed it, so chunk-level tests can attribute
/// evidence.
pub struct MemBlockBuilder {
    id: BlockId,
    fp_rate: f64,
    bounds: Option<FingerprintBounds>,
    staged: Vec<StagedSeries>,
}

impl MemBlockBuilder {
    pub fn new(options: &FuseOptions) -> Self {
        Self {
            id: BlockId::generate(),
            fp_rate: options.bloom_fp_rate,
            bounds: None,
            staged: Vec::new(),
        }
    }

    /// Declare the fingerprint range the block owns. Defaults to the span
    /// of the staged series.
    pub fn with_bounds(mut self, bounds: FingerprintBounds) -> Self {
        self.bounds = Some(bounds);
        self
    }

    /// Stage one series. Fingerprints must be unique within the block;
    /// staging order does not matter.
    pub fn push_series(
        &mut self,
        fp: impl Into<Fingerprint>,
        chunks: Vec<(ChunkRef, Vec<Bytes>)>,
    ) -> &mut Self {
        self.staged.push(StagedSeries {
            fp: fp.into(),
            chunks,
        });
        self
    }

    pub fn build(mut self) -> MemBlock {
        self.staged.sort_by_key(|s| s.fp);
        debug_assert!(
            self.staged.windows(2).all(|w| w[0].fp != w[1].fp),
            "a fingerprint appears at most once per block"
        );

        let mut series = Vec::with_capacity(self.staged.len());
        let mut blooms = Vec::with_capacity(self.staged.len());
        for staged in &self.staged {
            let terms: usize = staged.chunks.iter().map(|(_, terms)| terms.len()).sum();
            let mut bloom = SeriesBloom::new(terms * 2, self.fp_rate);
            for (chunk, terms) in &staged.chunks {
                for term in terms {
                    bloom.insert(term);
                    bloom.insert_chunk(chunk, term);
                }
            }

            let chunks: ChunkRefs = staged.chunks.iter().map(|(chunk, _)| *chunk).collect();
            series.push(Series {
                fp: staged.fp,
                chunks,
                bloom: BloomOffset::new(blooms.len() as u64),
            });
            blooms.push(Arc::new(bloom));
        }

        let bounds = self.bounds.unwrap_or_else(|| match (series.first(), series.last()) {
            (Some(first), Some(last)) => FingerprintBounds::new(first.fp, last.fp),
            _ => FingerprintBounds::new(Fingerprint::MIN, Fingerprint::MAX),
        });

        MemBlock {
            id: self.id,
            bounds,
            series,
            blooms,
            series_cursor: 0,
            bloom_cursor: 0,
        }
    }
}

/// Decoded block held entirely in memory.
pub struct MemBlock {
    id: BlockId,
    bounds: FingerprintBounds,
    series: Vec<Series>,
    blooms: Vec<Arc<SeriesBloom>>,
    series_cursor: usize,
    bloom_cursor: usize,
}

impl MemBlock {
    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }
}

impl BlockReader for MemBlock {
    type Bloom = Arc<SeriesBloom>;

    fn id(&self) -> BlockId {
        self.id
    }

    fn bounds(&self) -> FingerprintBounds {
        self.bounds
    }

    async fn seek(&mut self, fp: Fingerprint) -> Result<(), BlockError> {
        self.series_cursor = self.series.partition_point(|s| s.fp < fp);
        // the bloom stream follows the series stream to the next record's
        // stored offset
        self.bloom_cursor = self
            .series
            .get(self.series_cursor)
            .map(|s| s.bloom.get() as usize)
            .unwrap_or(self.blooms.len());
        Ok(())
    }

    async fn next_series(&mut self) -> Result<Option<Series>, BlockError> {
        let series = self.series.get(self.series_cursor).cloned();
        if series.is_some() {
            self.series_cursor += 1;
        }
        Ok(series)
    }

    async fn seek_bloom(&mut self, offset: BloomOffset) -> Result<(), BlockError> {
        let index = offset.get() as usize;
        if index > self.blooms.len() {
            return Err(BlockError::OffsetOutOfRange {
                offset: offset.get(),
                len: self.blooms.len() as u64,
            });
        }
        self.bloom_cursor = index;
        Ok(())
    }

    async fn next_bloom(&mut self) -> Result<Option<Self::Bloom>, BlockError> {
        let bloom = self.blooms.get(self.bloom_cursor).cloned();
        if bloom.is_some() {
            self.bloom_cursor += 1;
        }
        Ok(bloom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bloom::BloomTest;

    fn chunk(start: i64) -> ChunkRef {
        ChunkRef::new(start, start + 10, start as u32)
    }

    fn block() -> MemBlock {
        let mut builder = MemBlockBuilder::new(&FuseOptions::default());
        builder.push_series(300u64, vec![(chunk(30), vec![Bytes::from_static(b"c")])]);
        builder.push_series(100u64, vec![(chunk(10), vec![Bytes::from_static(b"a")])]);
        builder.push_series(200u64, vec![(chunk(20), vec![Bytes::from_static(b"b")])]);
        builder.build()
    }

    #[tokio::test]
    async fn build_orders_series_by_fingerprint() {
        let mut block = block();
        assert_eq!(block.len(), 3);
        assert_eq!(block.bounds(), FingerprintBounds::new(100u64, 300u64));

        block.seek(Fingerprint::MIN).await.unwrap();
        let fps: Vec<u64> = [
            block.next_series().await.unwrap().unwrap(),
            block.next_series().await.unwrap().unwrap(),
            block.next_series().await.unwrap().unwrap(),
        ]
        .iter()
        .map(|s| s.fp.get())
        .collect();
        assert_eq!(fps, vec![100, 200, 300]);
        assert!(block.next_series().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn seek_lands_at_or_after() {
        let mut block = block();

        block.seek(Fingerprint::new(150)).await.unwrap();
        let series = block.next_series().await.unwrap().unwrap();
        assert_eq!(series.fp.get(), 200);

        block.seek(Fingerprint::new(301)).await.unwrap();
        assert!(block.next_series().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn bloom_stream_follows_series_offsets() {
        let mut block = block();

        block.seek(Fingerprint::new(200)).await.unwrap();
        let series = block.next_series().await.unwrap().unwrap();
        block.seek_bloom(series.bloom).await.unwrap();
        let bloom = block.next_bloom().await.unwrap().unwrap();

        assert!(bloom.test(b"b"));
        assert!(bloom.test_chunk(&chunk(20), b"b"));
    }

    #[tokio::test]
    async fn out_of_range_bloom_offset_errors() {
        let mut block = block();
        let err = block.seek_bloom(BloomOffset::new(99)).await.unwrap_err();
        assert!(matches!(err, BlockError::OffsetOutOfRange { offset: 99, .. }));
    }

    #[test]
    fn explicit_bounds_override_derived_span() {
        let mut builder =
            MemBlockBuilder::new(&FuseOptions::default()).with_bounds(FingerprintBounds::new(
                0u64, 0xffffu64,
            ));
        builder.push_series(100u64, vec![(chunk(10), vec![Bytes::from_static(b"a")])]);
        let block = builder.build();
        assert_eq!(block.bounds(), FingerprintBounds::new(0u64, 0xffffu64));
    }
}
