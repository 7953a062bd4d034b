// ========================================================================================
//
//                     PER-CHUNK MULTI-SAMPLE PRESENCE INDEX
//
// ========================================================================================
//
// For one chunk of the k-mer space, every sample store is streamed concurrently and each
// observed k-mer gets a bit set at that sample's column. Rows live in a sharded
// `DashMap`, so two samples only contend when they touch k-mers hashed to the same shard,
// and a sample only ever writes its own column. Once every stream is exhausted the map
// is frozen into a code-sorted vector and handed to the scorer. The whole index is
// dropped at the end of the chunk.

use crate::chunk::ChunkSelector;
use crate::kmer::KmerCode;
use crate::store::{SampleStore, StoreError};
use crate::types::CancellationToken;
use ahash::AHashSet;
use dashmap::DashMap;
use rayon::prelude::*;
use thiserror::Error;

/// How many k-mers a stream consumes between two cancellation checks.
const CANCEL_CHECK_INTERVAL: usize = 4096;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("failed to stream sample '{sample}': {source}")]
    Sample {
        sample: String,
        #[source]
        source: StoreError,
    },
    #[error("chunk construction was cancelled")]
    Cancelled,
}

/// Presence/absence of one k-mer across the samples, one bit per column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceRow {
    words: Box<[u64]>,
    n_samples: usize,
}

impl PresenceRow {
    /// An all-absent row.
    pub fn new(n_samples: usize) -> Self {
        Self {
            words: vec![0u64; n_samples.div_ceil(64)].into_boxed_slice(),
            n_samples,
        }
    }

    pub fn from_bools(calls: &[bool]) -> Self {
        let mut row = Self::new(calls.len());
        for (column, _) in calls.iter().enumerate().filter(|(_, present)| **present) {
            row.set(column);
        }
        row
    }

    #[inline]
    pub fn set(&mut self, column: usize) {
        debug_assert!(column < self.n_samples);
        self.words[column / 64] |= 1u64 << (column % 64);
    }

    #[inline]
    pub fn get(&self, column: usize) -> bool {
        debug_assert!(column < self.n_samples);
        (self.words[column / 64] >> (column % 64)) & 1 == 1
    }

    pub fn n_samples(&self) -> usize {
        self.n_samples
    }

    pub fn count_present(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Columns where the k-mer is present, in ascending order.
    pub fn present_columns(&self) -> impl Iterator<Item = usize> + '_ {
        self.words
            .iter()
            .enumerate()
            .flat_map(|(word_index, &word)| {
                let mut bits = word;
                std::iter::from_fn(move || {
                    if bits == 0 {
                        return None;
                    }
                    let offset = bits.trailing_zeros() as usize;
                    bits &= bits - 1;
                    Some(word_index * 64 + offset)
                })
            })
    }
}

/// Stream-time filters applied while a chunk is built.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuildOptions<'a> {
    /// Occurrences below this count are treated as absent.
    pub min_count: u32,
    /// When set, k-mers outside this set are ignored.
    pub restrict_to: Option<&'a AHashSet<KmerCode>>,
    pub cancel: Option<&'a CancellationToken>,
}

/// All k-mers observed in one chunk with their presence rows, sorted by code.
#[derive(Debug)]
pub struct MultiSampleIndex {
    chunk_index: usize,
    n_samples: usize,
    rows: Vec<(KmerCode, PresenceRow)>,
}

impl MultiSampleIndex {
    /// Streams every store restricted to `chunk` and merges the observations. The
    /// position of a store in `stores` is its column in every row.
    pub fn build_chunk<S: SampleStore>(
        stores: &[S],
        chunk: &ChunkSelector,
        options: BuildOptions<'_>,
    ) -> Result<Self, IndexError> {
        let n_samples = stores.len();
        let rows: DashMap<KmerCode, PresenceRow, ahash::RandomState> =
            DashMap::with_hasher(ahash::RandomState::new());

        stores
            .par_iter()
            .enumerate()
            .try_for_each(|(column, store)| -> Result<(), IndexError> {
                for (seen, item) in store.stream(chunk).enumerate() {
                    if seen % CANCEL_CHECK_INTERVAL == 0
                        && options.cancel.is_some_and(CancellationToken::is_cancelled)
                    {
                        return Err(IndexError::Cancelled);
                    }
                    let (code, count) = item.map_err(|source| IndexError::Sample {
                        sample: store.sample_id().to_string(),
                        source,
                    })?;
                    if count < options.min_count {
                        continue;
                    }
                    if options
                        .restrict_to
                        .is_some_and(|allowed| !allowed.contains(&code))
                    {
                        continue;
                    }
                    rows.entry(code)
                        .or_insert_with(|| PresenceRow::new(n_samples))
                        .set(column);
                }
                Ok(())
            })?;

        if options.cancel.is_some_and(CancellationToken::is_cancelled) {
            return Err(IndexError::Cancelled);
        }

        let mut rows: Vec<(KmerCode, PresenceRow)> = rows.into_iter().collect();
        rows.par_sort_unstable_by_key(|(code, _)| *code);

        Ok(Self {
            chunk_index: chunk.index(),
            n_samples,
            rows,
        })
    }

    pub fn chunk_index(&self) -> usize {
        self.chunk_index
    }

    pub fn n_samples(&self) -> usize {
        self.n_samples
    }

    /// Number of distinct k-mers materialized for this chunk.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[(KmerCode, PresenceRow)] {
        &self.rows
    }

    pub fn get(&self, code: KmerCode) -> Option<&PresenceRow> {
        self.rows
            .binary_search_by_key(&code, |(c, _)| *c)
            .ok()
            .map(|i| &self.rows[i].1)
    }

    pub fn into_rows(self) -> Vec<(KmerCode, PresenceRow)> {
        self.rows
    }
}
