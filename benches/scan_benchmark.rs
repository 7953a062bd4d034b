// ========================================================================================
//
//                          CHUNK SCAN THROUGHPUT BENCHMARK
//
// ========================================================================================
//
// Measures the two hot stages of a chunk: merging sample streams into presence rows, and
// scoring those rows into the bounded retained set. Sample data is synthetic and held in
// memory, so disk speed does not enter the numbers.
//
// ========================================================================================

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use kmergwas::chunk::{ChunkSelector, KmerPartitioner};
use kmergwas::heap::{ScoreHeap, ScoredKmer};
use kmergwas::index::{BuildOptions, MultiSampleIndex, PresenceRow};
use kmergwas::kmer::{KmerCode, KmerCodec};
use kmergwas::phenotype::PhenotypeVector;
use kmergwas::score::AssociationScorer;
use kmergwas::store::MemorySampleStore;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

// --- Benchmark Tuning Parameters ---

/// K-mer length of the synthetic databases.
const K: usize = 31;
/// Distinct k-mers shared across the cohort.
const POOL_SIZE: usize = 200_000;
/// Probability that a sample carries a given pool k-mer.
const CARRIER_RATE: f64 = 0.3;
/// Retained set capacity used by the scoring benchmark.
const RETAINED: usize = 10_000;
const SAMPLE_COUNTS: [usize; 3] = [16, 64, 256];

fn synthetic_cohort(n_samples: usize, rng: &mut StdRng) -> Vec<MemorySampleStore> {
    let codec = KmerCodec::new(K).expect("valid k");
    let pool: Vec<KmerCode> = (0..POOL_SIZE)
        .map(|_| {
            codec
                .canonicalize(rng.gen_range(0..1u64 << (2 * K)))
                .expect("code within k")
        })
        .collect();
    (0..n_samples)
        .map(|i| {
            let mut entries = Vec::new();
            for &code in &pool {
                if rng.gen_bool(CARRIER_RATE) {
                    entries.push((code, rng.gen_range(1..20u32)));
                }
            }
            MemorySampleStore::new(format!("s{i}"), entries)
        })
        .collect()
}

fn synthetic_phenotypes(n_samples: usize, rng: &mut StdRng) -> PhenotypeVector {
    PhenotypeVector::from_pairs((0..n_samples).map(|i| (format!("s{i}"), rng.gen_range(0.0..1.0))))
        .expect("unique sample ids")
}

fn bench_build_chunk(c: &mut Criterion) {
    let mut group = c.benchmark_group("build_chunk");
    group.sample_size(10);
    let partitioner = KmerPartitioner::new(8);
    let selector = partitioner.selector(0);

    for &n_samples in &SAMPLE_COUNTS {
        let mut rng = StdRng::seed_from_u64(n_samples as u64);
        let stores = synthetic_cohort(n_samples, &mut rng);
        let observations: usize = stores.len() * (POOL_SIZE as f64 * CARRIER_RATE) as usize;
        group.throughput(Throughput::Elements(observations as u64));

        group.bench_with_input(BenchmarkId::new("one_of_8", n_samples), &stores, |b, stores| {
            b.iter(|| {
                let index = MultiSampleIndex::build_chunk(
                    black_box(stores),
                    &selector,
                    BuildOptions {
                        min_count: 2,
                        ..BuildOptions::default()
                    },
                )
                .expect("in-memory stores never fail");
                black_box(index.len())
            })
        });
    }
    group.finish();
}

fn bench_score_and_admit(c: &mut Criterion) {
    let mut group = c.benchmark_group("score_and_admit");
    group.sample_size(10);

    for &n_samples in &SAMPLE_COUNTS {
        let mut rng = StdRng::seed_from_u64(0x5eed ^ n_samples as u64);
        let stores = synthetic_cohort(n_samples, &mut rng);
        let phenotypes = synthetic_phenotypes(n_samples, &mut rng);
        let scorer = AssociationScorer::new(&phenotypes);
        let rows: Vec<(KmerCode, PresenceRow)> = MultiSampleIndex::build_chunk(
            &stores,
            &ChunkSelector::whole(),
            BuildOptions::default(),
        )
        .expect("in-memory stores never fail")
        .into_rows();
        group.throughput(Throughput::Elements(rows.len() as u64));

        group.bench_with_input(BenchmarkId::new("whole_pool", n_samples), &rows, |b, rows| {
            b.iter(|| {
                let heap = ScoreHeap::new(RETAINED);
                let scores: Vec<Option<f64>> =
                    rows.par_iter().map(|(_, row)| scorer.score(row)).collect();
                for ((code, row), score) in rows.iter().zip(scores) {
                    if let Some(score) = score {
                        heap.admit(ScoredKmer::new(*code, score, row.clone()));
                    }
                }
                black_box(heap.drain().len())
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_build_chunk, bench_score_and_admit);
criterion_main!(benches);
