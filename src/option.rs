const DEFAULT_BLOOM_FP_RATE: f64 = 0.01;

/// Tuning knobs shared by query sessions and in-memory block building.
#[derive(Debug, Clone)]
pub struct FuseOptions {
    pub(crate) response_capacity: usize,
    pub(crate) bloom_fp_rate: f64,
}

impl Default for FuseOptions {
    fn default() -> Self {
        Self {
            response_capacity: 0,
            bloom_fp_rate: DEFAULT_BLOOM_FP_RATE,
        }
    }
}

impl FuseOptions {
    /// Capacity of each session's response channel. Zero makes every
    /// delivery rendezvous with a consumer, so responses must be drained
    /// concurrently with the run.
    pub fn response_capacity(self, response_capacity: usize) -> Self {
        Self {
            response_capacity,
            ..self
        }
    }

    /// False-positive rate for blooms built by
    /// [`MemBlockBuilder`](crate::block::mem::MemBlockBuilder).
    pub fn bloom_fp_rate(self, bloom_fp_rate: f64) -> Self {
        Self {
            bloom_fp_rate,
            ..self
        }
    }
}
