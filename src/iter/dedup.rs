use std::iter::Peekable;

use super::MergeKey;

/// Groups consecutive elements sharing a merge key into one batch.
///
/// Over a sorted input this yields exactly one batch per distinct key,
/// which is how the fused querier turns a merged request sequence into
/// per-fingerprint work units.
pub struct DedupIter<I>
where
    I: Iterator,
{
    inner: Peekable<I>,
}

impl<I> DedupIter<I>
where
    I: Iterator,
{
    pub fn new(iter: I) -> Self {
        Self {
            inner: iter.peekable(),
        }
    }
}

impl<I> Iterator for DedupIter<I>
where
    I: Iterator,
    I::Item: MergeKey,
{
    type Item = Vec<I::Item>;

    fn next(&mut self) -> Option<Self::Item> {
        let head = self.inner.next()?;
        let key = head.merge_key();
        let mut batch = vec![head];
        while let Some(item) = self.inner.next_if(|next| next.merge_key() == key) {
            batch.push(item);
        }
        Some(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batches_runs_of_equal_keys() {
        let batches: Vec<Vec<u64>> =
            DedupIter::new(vec![1u64, 1, 2, 3, 3, 3].into_iter()).collect();

        assert_eq!(batches, vec![vec![1, 1], vec![2], vec![3, 3, 3]]);
    }

    #[test]
    fn singleton_runs_stay_singletons() {
        let batches: Vec<Vec<u64>> = DedupIter::new(vec![5u64, 7, 9].into_iter()).collect();
        assert_eq!(batches, vec![vec![5], vec![7], vec![9]]);
    }

    #[test]
    fn empty_input_is_empty() {
        let mut batches = DedupIter::new(Vec::<u64>::new().into_iter());
        assert_eq!(batches.next(), None);
    }
}
