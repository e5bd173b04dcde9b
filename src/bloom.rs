//! Bloom-filter capability consumed by the query engine.
//!
//! The engine never inspects filter internals; it only needs one-sided
//! membership tests. `SeriesBloom` is the concrete filter used by the
//! in-memory block builder and the test suite.

use std::{fmt, sync::Arc};

use bloomfilter::Bloom;

use crate::chunk::ChunkRef;

/// Probabilistic membership evidence for one series.
///
/// Both tests have one-sided error: false positives are possible, false
/// negatives are not. A `false` answer is proof of absence.
pub trait BloomTest {
    /// Test a term against the series-level filter.
    fn test(&self, term: &[u8]) -> bool;

    /// Test a term against the finer-grained evidence for one chunk.
    fn test_chunk(&self, chunk: &ChunkRef, term: &[u8]) -> bool;
}

impl<T: BloomTest> BloomTest for Arc<T> {
    fn test(&self, term: &[u8]) -> bool {
        (**self).test(term)
    }

    fn test_chunk(&self, chunk: &ChunkRef, term: &[u8]) -> bool {
        (**self).test_chunk(chunk, term)
    }
}

/// Series bloom holding both series-level terms and chunk-scoped keys in
/// a single backing filter.
pub struct SeriesBloom {
    filter: Bloom<[u8]>,
    items: usize,
}

impl SeriesBloom {
    /// `expected_items` should count series-level and chunk-level
    /// insertions together; the false-positive target holds at that load.
    pub fn new(expected_items: usize, fp_rate: f64) -> Self {
        Self {
            filter: Bloom::new_for_fp_rate(expected_items.max(1), fp_rate.clamp(1e-9, 0.5)),
            items: 0,
        }
    }

    pub fn insert(&mut self, term: &[u8]) {
        self.filter.set(term);
        self.items += 1;
    }

    pub fn insert_chunk(&mut self, chunk: &ChunkRef, term: &[u8]) {
        self.filter.set(&chunk_key(chunk, term));
        self.items += 1;
    }

    pub fn items(&self) -> usize {
        self.items
    }
}

impl BloomTest for SeriesBloom {
    fn test(&self, term: &[u8]) -> bool {
        self.filter.check(term)
    }

    fn test_chunk(&self, chunk: &ChunkRef, term: &[u8]) -> bool {
        self.filter.check(&chunk_key(chunk, term))
    }
}

impl fmt::Debug for SeriesBloom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SeriesBloom")
            .field("items", &self.items)
            .field("bits", &self.filter.number_of_bits())
            .finish()
    }
}

/// Meld chunk identity and term into a single keyed byte string, so chunk
/// evidence shares the series filter without colliding across chunks.
fn chunk_key(chunk: &ChunkRef, term: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(20 + term.len());
    key.extend_from_slice(&chunk.start.to_le_bytes());
    key.extend_from_slice(&chunk.end.to_le_bytes());
    key.extend_from_slice(&chunk.checksum.to_le_bytes());
    key.extend_from_slice(term);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_false_negatives() {
        let mut bloom = SeriesBloom::new(16, 0.01);
        for term in [b"alpha".as_slice(), b"beta", b"gamma"] {
            bloom.insert(term);
        }

        assert!(bloom.test(b"alpha"));
        assert!(bloom.test(b"beta"));
        assert!(bloom.test(b"gamma"));
    }

    #[test]
    fn chunk_evidence_is_scoped_per_chunk() {
        let a = ChunkRef::new(0, 10, 1);
        let b = ChunkRef::new(10, 20, 2);

        let mut bloom = SeriesBloom::new(16, 1e-6);
        bloom.insert(b"needle");
        bloom.insert_chunk(&a, b"needle");

        assert!(bloom.test_chunk(&a, b"needle"));
        assert!(
            !bloom.test_chunk(&b, b"needle"),
            "term attributed to chunk a must not leak into chunk b"
        );
    }

    #[test]
    fn absent_term_fails_series_test() {
        let mut bloom = SeriesBloom::new(16, 1e-6);
        bloom.insert(b"present");
        assert!(!bloom.test(b"definitely-absent-term"));
    }
}
