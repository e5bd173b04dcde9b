use std::{cmp::Ordering, fmt, slice};

/// Identifies one chunk of a stream: a time range plus a checksum over the
/// chunk payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkRef {
    pub start: i64,
    pub end: i64,
    pub checksum: u32,
}

impl ChunkRef {
    pub fn new(start: i64, end: i64, checksum: u32) -> Self {
        Self {
            start,
            end,
            checksum,
        }
    }

    /// Build a reference with the checksum computed from the raw payload.
    pub fn checksummed(start: i64, end: i64, payload: &[u8]) -> Self {
        Self {
            start,
            end,
            checksum: crc32fast::hash(payload),
        }
    }
}

impl fmt::Display for ChunkRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}:{:08x}", self.start, self.end, self.checksum)
    }
}

/// Ordered, duplicate-free set of chunk references.
///
/// The ordering invariant lets set operations run as linear merge walks,
/// which the fused querier relies on in its per-request hot path.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChunkRefs(Vec<ChunkRef>);

impl ChunkRefs {
    pub fn new(mut chunks: Vec<ChunkRef>) -> Self {
        chunks.sort_unstable();
        chunks.dedup();
        Self(chunks)
    }

    /// Wrap a vector that is already sorted and deduplicated.
    pub(crate) fn from_sorted(chunks: Vec<ChunkRef>) -> Self {
        debug_assert!(chunks.windows(2).all(|w| w[0] < w[1]));
        Self(chunks)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> slice::Iter<'_, ChunkRef> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[ChunkRef] {
        &self.0
    }

    pub fn contains(&self, chunk: &ChunkRef) -> bool {
        self.0.binary_search(chunk).is_ok()
    }

    /// Split `self` against `other`: chunks present only in `self`, and
    /// chunks present in both.
    pub fn compare(&self, other: &ChunkRefs) -> (ChunkRefs, ChunkRefs) {
        let mut missing = Vec::new();
        let mut both = Vec::new();
        let (mut i, mut j) = (0, 0);
        while i < self.0.len() && j < other.0.len() {
            match self.0[i].cmp(&other.0[j]) {
                Ordering::Less => {
                    missing.push(self.0[i]);
                    i += 1;
                }
                Ordering::Greater => j += 1,
                Ordering::Equal => {
                    both.push(self.0[i]);
                    i += 1;
                    j += 1;
                }
            }
        }
        missing.extend_from_slice(&self.0[i..]);
        (ChunkRefs(missing), ChunkRefs(both))
    }

    pub fn union(&self, other: &ChunkRefs) -> ChunkRefs {
        let mut merged = Vec::with_capacity(self.0.len() + other.0.len());
        let (mut i, mut j) = (0, 0);
        while i < self.0.len() && j < other.0.len() {
            match self.0[i].cmp(&other.0[j]) {
                Ordering::Less => {
                    merged.push(self.0[i]);
                    i += 1;
                }
                Ordering::Greater => {
                    merged.push(other.0[j]);
                    j += 1;
                }
                Ordering::Equal => {
                    merged.push(self.0[i]);
                    i += 1;
                    j += 1;
                }
            }
        }
        merged.extend_from_slice(&self.0[i..]);
        merged.extend_from_slice(&other.0[j..]);
        ChunkRefs(merged)
    }
}

impl FromIterator<ChunkRef> for ChunkRefs {
    fn from_iter<T: IntoIterator<Item = ChunkRef>>(iter: T) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a ChunkRefs {
    type Item = &'a ChunkRef;
    type IntoIter = slice::Iter<'a, ChunkRef>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(start: i64) -> ChunkRef {
        ChunkRef::new(start, start + 10, start as u32)
    }

    #[test]
    fn new_sorts_and_dedups() {
        let refs = ChunkRefs::new(vec![chunk(30), chunk(10), chunk(30), chunk(20)]);
        assert_eq!(
            refs.as_slice(),
            &[chunk(10), chunk(20), chunk(30)],
            "construction must normalize ordering"
        );
    }

    #[test]
    fn compare_splits_missing_and_shared() {
        let candidates = ChunkRefs::new(vec![chunk(1), chunk(2), chunk(3), chunk(9)]);
        let known = ChunkRefs::new(vec![chunk(2), chunk(3), chunk(4)]);

        let (missing, both) = candidates.compare(&known);
        assert_eq!(missing.as_slice(), &[chunk(1), chunk(9)]);
        assert_eq!(both.as_slice(), &[chunk(2), chunk(3)]);
    }

    #[test]
    fn compare_with_empty_sides() {
        let candidates = ChunkRefs::new(vec![chunk(1), chunk(2)]);
        let empty = ChunkRefs::default();

        let (missing, both) = candidates.compare(&empty);
        assert_eq!(missing, candidates);
        assert!(both.is_empty());

        let (missing, both) = empty.compare(&candidates);
        assert!(missing.is_empty());
        assert!(both.is_empty());
    }

    #[test]
    fn union_merges_without_duplicates() {
        let a = ChunkRefs::new(vec![chunk(1), chunk(3)]);
        let b = ChunkRefs::new(vec![chunk(2), chunk(3), chunk(5)]);

        let merged = a.union(&b);
        assert_eq!(
            merged.as_slice(),
            &[chunk(1), chunk(2), chunk(3), chunk(5)]
        );
    }

    #[test]
    fn checksummed_hashes_payload() {
        let a = ChunkRef::checksummed(0, 10, b"payload");
        let b = ChunkRef::checksummed(0, 10, b"payload");
        let c = ChunkRef::checksummed(0, 10, b"other");
        assert_eq!(a.checksum, b.checksum);
        assert_ne!(a.checksum, c.checksum);
    }
}
