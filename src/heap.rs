// ========================================================================================
//
//                          BOUNDED TOP-K SCORE RETENTION
//
// ========================================================================================

use crate::index::PresenceRow;
use crate::kmer::KmerCode;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::{Mutex, PoisonError};

/// A scored k-mer competing for (or holding) a place in the retained set.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredKmer {
    pub code: KmerCode,
    /// `NaN` marks a non-informative k-mer; such entries only appear in extraction output.
    pub score: f64,
    pub row: PresenceRow,
}

impl ScoredKmer {
    pub fn new(code: KmerCode, score: f64, row: PresenceRow) -> Self {
        Self { code, score, row }
    }

    pub fn is_informative(&self) -> bool {
        self.score.is_finite()
    }
}

/// Heap entry ordered by "retention priority": larger magnitude first, then earlier
/// admission.
#[derive(Debug)]
struct Entry {
    magnitude: f64,
    seq: u64,
    item: ScoredKmer,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.magnitude
            .total_cmp(&other.magnitude)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Default)]
struct HeapState {
    // Min-heap on retention priority: the top is the entry evicted next.
    entries: BinaryHeap<Reverse<Entry>>,
    next_seq: u64,
}

/// Occupancy snapshot, logged once per chunk.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeapStats {
    pub len: usize,
    pub capacity: usize,
    /// The magnitude a candidate must exceed to be admitted, once the heap is full.
    pub threshold: Option<f64>,
}

/// Keeps the `capacity` k-mers with the largest |score| seen so far.
///
/// Only `admit` and `drain` are exposed. Admissions are serialized behind a mutex, so
/// the heap can be shared between scoring threads; eviction decisions then follow the
/// order in which the admissions acquire the lock.
#[derive(Debug)]
pub struct ScoreHeap {
    capacity: usize,
    state: Mutex<HeapState>,
}

impl ScoreHeap {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(HeapState {
                entries: BinaryHeap::with_capacity(capacity.min(1 << 20) + 1),
                next_seq: 0,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Offers a candidate. Returns whether it was retained.
    ///
    /// While the heap is below capacity every finite score is taken. Once full, a
    /// candidate replaces the current minimum only if its |score| is strictly larger, so
    /// among equal magnitudes the earliest admitted entry survives. Non-finite scores
    /// are never retained.
    pub fn admit(&self, candidate: ScoredKmer) -> bool {
        if !candidate.is_informative() || self.capacity == 0 {
            return false;
        }
        let magnitude = candidate.score.abs();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let seq = state.next_seq;
        state.next_seq += 1;

        if state.entries.len() >= self.capacity {
            let beats_minimum = state
                .entries
                .peek()
                .is_some_and(|Reverse(worst)| magnitude > worst.magnitude);
            if !beats_minimum {
                return false;
            }
            state.entries.pop();
        }
        state.entries.push(Reverse(Entry {
            magnitude,
            seq,
            item: candidate,
        }));
        true
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> HeapStats {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let len = state.entries.len();
        let threshold = if len >= self.capacity {
            state.entries.peek().map(|Reverse(worst)| worst.magnitude)
        } else {
            None
        };
        HeapStats {
            len,
            capacity: self.capacity,
            threshold,
        }
    }

    /// Consumes the heap and returns the retained k-mers by descending |score|, ties in
    /// admission order.
    pub fn drain(self) -> RetainedSet {
        let state = self
            .state
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        let mut entries: Vec<Entry> = state
            .entries
            .into_vec()
            .into_iter()
            .map(|Reverse(entry)| entry)
            .collect();
        entries.sort_unstable_by(|a, b| b.cmp(a));
        RetainedSet {
            entries: entries.into_iter().map(|entry| entry.item).collect(),
        }
    }
}

/// The final ordered output of a run. Immutable once built.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetainedSet {
    entries: Vec<ScoredKmer>,
}

impl RetainedSet {
    /// Wraps k-mers whose order is already fixed by the caller (extraction output).
    pub(crate) fn from_ordered(entries: Vec<ScoredKmer>) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ScoredKmer> {
        self.entries.iter()
    }

    pub fn as_slice(&self) -> &[ScoredKmer] {
        &self.entries
    }
}

impl<'a> IntoIterator for &'a RetainedSet {
    type Item = &'a ScoredKmer;
    type IntoIter = std::slice::Iter<'a, ScoredKmer>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kmer::KmerCodec;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};
    use rayon::prelude::*;

    fn scored(raw: u64, score: f64) -> ScoredKmer {
        let codec = KmerCodec::new(16).unwrap();
        ScoredKmer::new(codec.canonicalize(raw).unwrap(), score, PresenceRow::new(3))
    }

    #[test]
    fn keeps_the_k_largest_magnitudes() {
        let heap = ScoreHeap::new(3);
        for (raw, score) in [(1, 0.1), (2, -0.9), (3, 0.5), (4, 0.2), (5, 0.7), (6, -0.05)] {
            heap.admit(scored(raw, score));
        }
        let retained = heap.drain();
        let scores: Vec<f64> = retained.iter().map(|s| s.score).collect();
        assert_eq!(scores, vec![-0.9, 0.7, 0.5]);
    }

    #[test]
    fn ties_keep_the_earliest_admission() {
        let heap = ScoreHeap::new(2);
        assert!(heap.admit(scored(10, 0.5)));
        assert!(heap.admit(scored(11, -0.5)));
        assert!(!heap.admit(scored(12, 0.5)));
        assert!(heap.admit(scored(13, 0.6)));

        let retained = heap.drain();
        let codes: Vec<KmerCode> = retained.iter().map(|s| s.code).collect();
        assert_eq!(codes, vec![scored(13, 0.0).code, scored(10, 0.0).code]);
    }

    #[test]
    fn drained_order_breaks_ties_by_admission() {
        let heap = ScoreHeap::new(4);
        for raw in [7, 3, 9] {
            heap.admit(scored(raw, -0.25));
        }
        let codes: Vec<KmerCode> = heap.drain().iter().map(|s| s.code).collect();
        let expected: Vec<KmerCode> = [7, 3, 9].into_iter().map(|raw| scored(raw, 0.0).code).collect();
        assert_eq!(codes, expected);
    }

    #[test]
    fn non_finite_and_zero_capacity_are_rejected() {
        let heap = ScoreHeap::new(2);
        assert!(!heap.admit(scored(1, f64::NAN)));
        assert!(!heap.admit(scored(2, f64::INFINITY)));
        assert!(heap.is_empty());

        let closed = ScoreHeap::new(0);
        assert!(!closed.admit(scored(3, 1.0)));
        assert!(closed.drain().is_empty());
    }

    #[test]
    fn stats_report_the_admission_threshold() {
        let heap = ScoreHeap::new(2);
        heap.admit(scored(1, 0.3));
        assert_eq!(heap.stats().threshold, None);
        heap.admit(scored(2, -0.8));
        let stats = heap.stats();
        assert_eq!(stats.len, 2);
        assert_eq!(stats.capacity, 2);
        assert_eq!(stats.threshold, Some(0.3));
    }

    #[test]
    fn retains_exactly_the_top_k_of_a_random_stream() {
        let mut rng = StdRng::seed_from_u64(99);
        let scores: Vec<f64> = (0..2_000).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let heap = ScoreHeap::new(50);
        for (raw, &score) in scores.iter().enumerate() {
            heap.admit(scored(raw as u64, score));
        }
        let retained = heap.drain();
        assert_eq!(retained.len(), 50);

        let mut expected: Vec<f64> = scores.iter().map(|s| s.abs()).collect();
        expected.sort_by(|a, b| b.total_cmp(a));
        let got: Vec<f64> = retained.iter().map(|s| s.score.abs()).collect();
        assert_eq!(got, expected[..50].to_vec());
    }

    #[test]
    fn concurrent_admissions_keep_the_same_set() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut candidates: Vec<(u64, f64)> = (0..5_000u64)
            .map(|raw| (raw, rng.gen_range(-1.0..1.0)))
            .collect();
        candidates.shuffle(&mut rng);

        let heap = ScoreHeap::new(100);
        candidates.par_iter().for_each(|&(raw, score)| {
            heap.admit(scored(raw, score));
        });
        let retained = heap.drain();

        let mut expected: Vec<f64> = candidates.iter().map(|(_, s)| s.abs()).collect();
        expected.sort_by(|a, b| b.total_cmp(a));
        let got: Vec<f64> = retained.iter().map(|s| s.score.abs()).collect();
        assert_eq!(got, expected[..100].to_vec());
    }
}
