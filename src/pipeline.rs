// ========================================================================================
//
//                              THE RUN ORCHESTRATOR
//
// ========================================================================================
//
// The orchestrator is the only component that knows the overall control flow:
//
//     Init -> LoadPhenotype -> OpenSamples -> ProcessChunk(0..n) -> WriteOutput -> Done
//
// with `Failed` reachable from every state. Each chunk is built, scored and discarded
// before the next one starts, so peak memory is one chunk's distinct k-mers plus the
// retained set. Within a chunk, samples are streamed concurrently and rows are scored in
// parallel; admission into the retained set happens on this thread, in code order, which
// keeps the output independent of thread scheduling.

use crate::chunk::{ChunkSelector, KmerPartitioner};
use crate::config::{ConfigError, EngineConfig};
use crate::heap::{RetainedSet, ScoreHeap, ScoredKmer};
use crate::index::{BuildOptions, IndexError, MultiSampleIndex, PresenceRow};
use crate::kmer::{EncodingError, KmerCode, KmerCodec};
use crate::phenotype::{PhenotypeError, PhenotypeVector};
use crate::plink::{GenotypeMatrixWriter, OutputPaths, PlinkWriteError};
use crate::score::AssociationScorer;
use crate::store::{DatabaseLayout, MmapSampleStore, SampleStore, StoreError};
use crate::types::{CancellationToken, SamplePolicy};
use crate::universe::{self, UniverseError, UniverseFile};
use ahash::{AHashMap, AHashSet};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::{debug, info, warn};
use rayon::prelude::*;
use std::fmt;
use std::io::IsTerminal;
use std::path::PathBuf;
use thiserror::Error;

/// Problems with what the caller asked for. Always fatal, and always raised before any
/// chunk is processed.
#[derive(Debug, Error)]
pub enum InputError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Encoding(#[from] EncodingError),
    #[error("phenotype file: {0}")]
    Phenotype(#[from] PhenotypeError),
    #[error(transparent)]
    KmerList(#[from] UniverseError),
    #[error(transparent)]
    Sample(StoreError),
    #[error("at least two usable samples are required, found {usable}")]
    TooFewSamples { usable: usize },
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Input error: {0}")]
    Input(#[from] InputError),
    #[error("Cannot read k-mer database of sample '{sample}': {source}")]
    SampleRead {
        sample: String,
        #[source]
        source: StoreError,
    },
    #[error("Output error: {0}")]
    Output(#[from] PlinkWriteError),
    #[error("Failed to build worker thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("Run was cancelled")]
    Cancelled,
}

impl From<IndexError> for EngineError {
    fn from(err: IndexError) -> Self {
        match err {
            IndexError::Sample { sample, source } => Self::SampleRead { sample, source },
            IndexError::Cancelled => Self::Cancelled,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Init,
    LoadPhenotype,
    OpenSamples,
    ProcessChunk(usize),
    WriteOutput,
    Done,
    Failed,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init => f.write_str("init"),
            Self::LoadPhenotype => f.write_str("load-phenotype"),
            Self::OpenSamples => f.write_str("open-samples"),
            Self::ProcessChunk(index) => write!(f, "process-chunk[{index}]"),
            Self::WriteOutput => f.write_str("write-output"),
            Self::Done => f.write_str("done"),
            Self::Failed => f.write_str("failed"),
        }
    }
}

/// What a run produces.
#[derive(Debug, Clone)]
pub enum Mode {
    /// Score every k-mer (optionally only those of a universe file) and keep the top K.
    Associate { universe: Option<PathBuf> },
    /// Emit presence/absence and scores of an explicit k-mer list, in list order.
    Extract { kmers: PathBuf },
}

#[derive(Debug, Clone)]
pub struct Job {
    pub phenotypes: PathBuf,
    pub db_root: PathBuf,
    pub out_prefix: PathBuf,
    pub mode: Mode,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub samples_used: usize,
    /// Samples dropped under the best-effort policy.
    pub samples_skipped: Vec<String>,
    pub chunks_processed: usize,
    /// Distinct k-mers scored across all chunks.
    pub kmers_scored: u64,
    /// Scored k-mers that were present in every sample or in none.
    pub degenerate_kmers: u64,
    /// Largest number of k-mers resident at once (chunk index plus retained rows).
    pub peak_materialized: usize,
    pub retained: usize,
    pub outputs: OutputPaths,
}

/// Receives the scored rows of each chunk.
trait ChunkSink {
    fn accept(&mut self, code: KmerCode, row: PresenceRow, score: Option<f64>);

    /// Rows held by the sink between chunks.
    fn resident(&self) -> usize;

    fn chunk_finished(&self, chunk: &ChunkSelector, materialized: usize) {
        debug!(
            "chunk {}/{}: {} distinct k-mers",
            chunk.index() + 1,
            chunk.count(),
            materialized
        );
    }
}

struct HeapSink<'a> {
    heap: &'a ScoreHeap,
}

impl ChunkSink for HeapSink<'_> {
    fn accept(&mut self, code: KmerCode, row: PresenceRow, score: Option<f64>) {
        if let Some(score) = score {
            self.heap.admit(ScoredKmer::new(code, score, row));
        }
    }

    fn resident(&self) -> usize {
        self.heap.len()
    }

    fn chunk_finished(&self, chunk: &ChunkSelector, materialized: usize) {
        let stats = self.heap.stats();
        match stats.threshold {
            Some(threshold) => info!(
                "chunk {}/{}: {} distinct k-mers, retained {}/{} (admission |score| > {:.4})",
                chunk.index() + 1,
                chunk.count(),
                materialized,
                stats.len,
                stats.capacity,
                threshold
            ),
            None => info!(
                "chunk {}/{}: {} distinct k-mers, retained {}/{}",
                chunk.index() + 1,
                chunk.count(),
                materialized,
                stats.len,
                stats.capacity
            ),
        }
    }
}

/// Collects the rows of requested k-mers; unseen ones are filled in afterwards.
struct ExtractSink {
    found: AHashMap<KmerCode, (PresenceRow, Option<f64>)>,
}

impl ChunkSink for ExtractSink {
    fn accept(&mut self, code: KmerCode, row: PresenceRow, score: Option<f64>) {
        self.found.insert(code, (row, score));
    }

    fn resident(&self) -> usize {
        self.found.len()
    }
}

/// Restriction applied to every chunk.
enum ChunkFilter<'a> {
    Everything,
    Universe(&'a UniverseFile),
    Requested(&'a AHashSet<KmerCode>),
}

#[derive(Debug, Default)]
struct ScanTotals {
    chunks: usize,
    scored: u64,
    degenerate: u64,
    peak: usize,
}

pub struct Orchestrator {
    config: EngineConfig,
    cancel: CancellationToken,
    state: EngineState,
}

impl Orchestrator {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
            state: EngineState::Init,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// A handle that aborts the run from another thread. A cancelled run fails with
    /// `EngineError::Cancelled` and leaves no output behind.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn run(&mut self, job: &Job) -> Result<RunReport, EngineError> {
        let threads = self.config.threads;
        let result = match threads {
            Some(threads) => rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .build()
                .map_err(EngineError::from)
                .and_then(|pool| pool.install(|| self.execute(job))),
            None => self.execute(job),
        };
        if result.is_err() {
            self.transition(EngineState::Failed);
        }
        result
    }

    fn transition(&mut self, next: EngineState) {
        debug!("engine state: {} -> {}", self.state, next);
        self.state = next;
    }

    fn check_cancelled(&self) -> Result<(), EngineError> {
        if self.cancel.is_cancelled() {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn execute(&mut self, job: &Job) -> Result<RunReport, EngineError> {
        self.config.validate().map_err(InputError::from)?;
        let codec = KmerCodec::new(self.config.k).map_err(InputError::from)?;
        let outputs = OutputPaths::from_prefix(&job.out_prefix, self.config.write_presence_table)?;
        outputs.ensure_absent()?;

        // --- Phenotypes fix the sample set and its column order ---
        self.transition(EngineState::LoadPhenotype);
        let phenotypes = PhenotypeVector::from_file(&job.phenotypes).map_err(InputError::from)?;
        info!(
            "loaded phenotypes for {} samples from {}",
            phenotypes.len(),
            job.phenotypes.display()
        );
        if phenotypes.len() < 2 {
            return Err(InputError::TooFewSamples {
                usable: phenotypes.len(),
            }
            .into());
        }

        // --- Open every sample database before the first chunk ---
        self.transition(EngineState::OpenSamples);
        let (stores, phenotypes, skipped) = self.open_samples(&job.db_root, codec, phenotypes)?;
        info!(
            "opened {} sample databases ({} skipped)",
            stores.len(),
            skipped.len()
        );
        self.scan_and_publish(job, codec, outputs, &stores, phenotypes, skipped)
    }

    /// Runs the chunk loop over already opened stores and publishes the fileset. Any
    /// error raised here leaves the output prefix untouched.
    fn scan_and_publish<S: SampleStore>(
        &mut self,
        job: &Job,
        codec: KmerCodec,
        outputs: OutputPaths,
        stores: &[S],
        phenotypes: PhenotypeVector,
        skipped: Vec<String>,
    ) -> Result<RunReport, EngineError> {
        let scorer = AssociationScorer::new(&phenotypes);
        let partitioner = KmerPartitioner::new(self.config.chunk_count);
        let mut totals = ScanTotals::default();

        let retained = match &job.mode {
            Mode::Associate { universe } => {
                let universe = universe
                    .as_deref()
                    .map(|path| UniverseFile::open(path, codec))
                    .transpose()
                    .map_err(InputError::from)?;
                let filter = match &universe {
                    Some(universe) => ChunkFilter::Universe(universe),
                    None => ChunkFilter::Everything,
                };
                let heap = ScoreHeap::new(self.config.retained);
                let mut sink = HeapSink { heap: &heap };
                self.process_chunks(stores, &partitioner, &filter, &scorer, &mut sink, &mut totals)?;
                heap.drain()
            }
            Mode::Extract { kmers } => {
                let requested = universe::read_kmer_list(kmers, codec).map_err(InputError::from)?;
                info!("extracting {} requested k-mers", requested.len());
                let requested_set: AHashSet<KmerCode> = requested.iter().copied().collect();
                let mut sink = ExtractSink {
                    found: AHashMap::with_capacity(requested.len()),
                };
                self.process_chunks(
                    stores,
                    &partitioner,
                    &ChunkFilter::Requested(&requested_set),
                    &scorer,
                    &mut sink,
                    &mut totals,
                )?;
                let mut found = sink.found;
                let entries = requested
                    .into_iter()
                    .map(|code| {
                        let (row, score) = found
                            .remove(&code)
                            .unwrap_or_else(|| (PresenceRow::new(stores.len()), None));
                        ScoredKmer::new(code, score.unwrap_or(f64::NAN), row)
                    })
                    .collect();
                RetainedSet::from_ordered(entries)
            }
        };
        info!(
            "scored {} k-mers across {} chunks ({} non-informative), retaining {}",
            totals.scored,
            totals.chunks,
            totals.degenerate,
            retained.len()
        );

        // --- Publish the fileset ---
        self.check_cancelled()?;
        self.transition(EngineState::WriteOutput);
        GenotypeMatrixWriter::new(outputs.clone(), codec).write(&retained, phenotypes.samples())?;
        self.transition(EngineState::Done);

        Ok(RunReport {
            samples_used: stores.len(),
            samples_skipped: skipped,
            chunks_processed: totals.chunks,
            kmers_scored: totals.scored,
            degenerate_kmers: totals.degenerate,
            peak_materialized: totals.peak,
            retained: retained.len(),
            outputs,
        })
    }

    /// Opens the database of every phenotyped sample. A missing database or one built
    /// with another k is always fatal; an unreadable one is fatal under the strict
    /// policy and dropped under best-effort. Dropping happens here, before any chunk,
    /// so every chunk sees the same columns.
    fn open_samples(
        &self,
        db_root: &std::path::Path,
        codec: KmerCodec,
        phenotypes: PhenotypeVector,
    ) -> Result<(Vec<MmapSampleStore>, PhenotypeVector, Vec<String>), EngineError> {
        let layout = DatabaseLayout::new(db_root, self.config.db_template.clone());
        let opened: Vec<Result<MmapSampleStore, StoreError>> = phenotypes
            .samples()
            .par_iter()
            .map(|sample| MmapSampleStore::open(sample.clone(), &layout.path_for(sample), codec))
            .collect();

        let mut stores = Vec::with_capacity(opened.len());
        let mut keep = Vec::with_capacity(opened.len());
        let mut skipped = Vec::new();
        for (sample, result) in phenotypes.samples().iter().zip(opened) {
            match result {
                Ok(store) => {
                    stores.push(store);
                    keep.push(true);
                }
                Err(err @ (StoreError::NotFound { .. } | StoreError::KMismatch { .. })) => {
                    return Err(InputError::Sample(err).into());
                }
                Err(err) if self.config.sample_policy == SamplePolicy::BestEffort => {
                    warn!("skipping sample '{sample}': {err}");
                    skipped.push(sample.clone());
                    keep.push(false);
                }
                Err(err) => {
                    return Err(EngineError::SampleRead {
                        sample: sample.clone(),
                        source: err,
                    });
                }
            }
        }

        if stores.len() < 2 {
            return Err(InputError::TooFewSamples {
                usable: stores.len(),
            }
            .into());
        }
        let phenotypes = if skipped.is_empty() {
            phenotypes
        } else {
            phenotypes.retain_columns(&keep)
        };
        Ok((stores, phenotypes, skipped))
    }

    fn process_chunks<S: SampleStore>(
        &mut self,
        stores: &[S],
        partitioner: &KmerPartitioner,
        filter: &ChunkFilter<'_>,
        scorer: &AssociationScorer,
        sink: &mut impl ChunkSink,
        totals: &mut ScanTotals,
    ) -> Result<(), EngineError> {
        let pb = create_progress_bar(partitioner.chunk_count() as u64, "Scanning k-mer chunks");

        for selector in partitioner.selectors() {
            self.check_cancelled()?;
            self.transition(EngineState::ProcessChunk(selector.index()));

            let universe_slice = match filter {
                ChunkFilter::Universe(universe) => {
                    Some(universe.load_chunk(&selector).map_err(InputError::from)?)
                }
                _ => None,
            };
            let restrict_to = match filter {
                ChunkFilter::Everything => None,
                ChunkFilter::Universe(_) => universe_slice.as_ref(),
                ChunkFilter::Requested(set) => Some(*set),
            };

            let index = MultiSampleIndex::build_chunk(
                stores,
                &selector,
                BuildOptions {
                    min_count: self.config.min_count,
                    restrict_to,
                    cancel: Some(&self.cancel),
                },
            )?;
            let materialized = index.len();
            totals.peak = totals.peak.max(materialized + sink.resident());

            let rows = index.into_rows();
            let scores: Vec<Option<f64>> =
                rows.par_iter().map(|(_, row)| scorer.score(row)).collect();
            totals.scored += rows.len() as u64;
            totals.degenerate += scores.iter().filter(|s| s.is_none()).count() as u64;
            for ((code, row), score) in rows.into_iter().zip(scores) {
                sink.accept(code, row, score);
            }

            totals.chunks += 1;
            sink.chunk_finished(&selector, materialized);
            pb.inc(1);
        }

        pb.finish_with_message("Scan complete.");
        Ok(())
    }
}

fn create_progress_bar(len: u64, message: &str) -> ProgressBar {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };

    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    if let Ok(style) = ProgressStyle::with_template(
        "\n> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
    ) {
        pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
    }
    pb.set_message(message.to_string());

    pb
}
