//! Partitioning of the k-mer code space into chunks.
//!
//! Every canonical code is hashed with a fixed-seed `ahash` state and mapped onto
//! `[0, chunk_count)` by a multiply-shift. The mapping is a pure function of the code,
//! so the chunks are disjoint and together cover the whole space, and every sample
//! store agrees on which chunk a k-mer belongs to.

use crate::kmer::KmerCode;
use ahash::RandomState;

const PARTITION_SEEDS: [u64; 4] = [
    0x243f_6a88_85a3_08d3,
    0x1319_8a2e_0370_7344,
    0xa409_3822_299f_31d0,
    0x082e_fa98_ec4e_6c89,
];

fn partition_state() -> RandomState {
    let [a, b, c, d] = PARTITION_SEEDS;
    RandomState::with_seeds(a, b, c, d)
}

/// Selects the k-mers belonging to one partition of the code space.
#[derive(Clone, Debug)]
pub struct ChunkSelector {
    index: usize,
    count: usize,
    state: RandomState,
}

impl ChunkSelector {
    /// A selector that accepts every k-mer (a partition with a single chunk).
    pub fn whole() -> Self {
        Self {
            index: 0,
            count: 1,
            state: partition_state(),
        }
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn contains(&self, code: KmerCode) -> bool {
        self.count == 1 || chunk_of(&self.state, self.count, code) == self.index
    }
}

#[inline]
fn chunk_of(state: &RandomState, count: usize, code: KmerCode) -> usize {
    let hash = state.hash_one(code.get());
    ((hash as u128 * count as u128) >> 64) as usize
}

/// Enumerates the chunks of a fixed partition.
#[derive(Clone, Debug)]
pub struct KmerPartitioner {
    count: usize,
    state: RandomState,
}

impl KmerPartitioner {
    /// `chunk_count` is clamped to at least one chunk.
    pub fn new(chunk_count: usize) -> Self {
        Self {
            count: chunk_count.max(1),
            state: partition_state(),
        }
    }

    pub fn chunk_count(&self) -> usize {
        self.count
    }

    pub fn chunk_of(&self, code: KmerCode) -> usize {
        chunk_of(&self.state, self.count, code)
    }

    pub fn selector(&self, index: usize) -> ChunkSelector {
        debug_assert!(index < self.count);
        ChunkSelector {
            index,
            count: self.count,
            state: self.state.clone(),
        }
    }

    pub fn selectors(&self) -> impl Iterator<Item = ChunkSelector> + '_ {
        (0..self.count).map(move |index| self.selector(index))
    }
}
