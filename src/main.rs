// ========================================================================================
//
//                                 KMERGWAS DRIVER
//
// ========================================================================================
//
// Parses the command line, merges it over an optional TOML configuration, hands the job
// to the orchestrator and reports the outcome. Exit status is 0 on success and 1 on any
// failure.

use clap::error::ErrorKind;
use clap::{Args, Parser, Subcommand};
use kmergwas::config::EngineConfig;
use kmergwas::pipeline::{Job, Mode, Orchestrator, RunReport};
use kmergwas::types::SamplePolicy;
use std::error::Error;
use std::fs;
use std::path::PathBuf;
use std::process;
use std::time::Instant;

#[derive(Parser)]
#[command(
    name = "kmergwas",
    version,
    about = "Associate k-mer presence/absence across samples with a phenotype",
    long_about = "Merges per-sample k-mer databases chunk by chunk, scores every k-mer \
                  against a phenotype and writes the most associated k-mers as a PLINK \
                  binary fileset."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Score all k-mers and keep the most associated ones
    #[command(about = "Score k-mers against a phenotype (outputs: .bed/.bim/.fam/.scores.tsv)")]
    Associate {
        #[command(flatten)]
        common: CommonArgs,

        /// Only k-mers listed in this file (plain or .gz) are considered
        #[arg(long, value_name = "FILE")]
        universe: Option<PathBuf>,
    },

    /// Emit presence/absence and scores for a given k-mer list
    #[command(about = "Extract a requested k-mer set (outputs: .bed/.bim/.fam/.scores.tsv)")]
    Extract {
        #[command(flatten)]
        common: CommonArgs,

        /// K-mer list, one per line; a previous run's .scores.tsv works as well
        #[arg(long, value_name = "FILE")]
        kmers: PathBuf,
    },
}

#[derive(Args)]
struct CommonArgs {
    /// Phenotype file: a header line, then `sample value` pairs
    #[arg(long, value_name = "FILE")]
    phenotypes: PathBuf,

    /// Directory holding the per-sample k-mer databases
    #[arg(long, value_name = "DIR")]
    db_root: PathBuf,

    /// Output prefix for the PLINK fileset
    #[arg(long, value_name = "PREFIX")]
    out: PathBuf,

    /// TOML file with run settings; flags given here take precedence
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// K-mer length
    #[arg(long = "kmer-len", value_name = "K")]
    kmer_len: Option<usize>,

    /// Number of k-mers to retain
    #[arg(long, value_name = "K")]
    retained: Option<usize>,

    /// Number of chunks the k-mer space is split into
    #[arg(long, value_name = "N")]
    chunks: Option<usize>,

    /// Minimal occurrence count for a k-mer to count as present
    #[arg(long, value_name = "M")]
    min_count: Option<u32>,

    /// Skip unreadable sample databases instead of failing
    #[arg(long)]
    best_effort: bool,

    /// Worker threads (defaults to all cores)
    #[arg(long, value_name = "T")]
    threads: Option<usize>,

    /// Also write a tab-separated presence/absence table
    #[arg(long)]
    presence_table: bool,
}

impl CommonArgs {
    fn resolve_config(&self) -> Result<EngineConfig, Box<dyn Error>> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::from_toml_file(path)?,
            None => EngineConfig::default(),
        };
        if let Some(k) = self.kmer_len {
            config.k = k;
        }
        if let Some(retained) = self.retained {
            config.retained = retained;
        }
        if let Some(chunks) = self.chunks {
            config.chunk_count = chunks;
        }
        if let Some(min_count) = self.min_count {
            config.min_count = min_count;
        }
        if self.best_effort {
            config.sample_policy = SamplePolicy::BestEffort;
        }
        if self.threads.is_some() {
            config.threads = self.threads;
        }
        if self.presence_table {
            config.write_presence_table = true;
        }
        config.validate()?;
        Ok(config)
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => e.exit(),
        Err(e) => {
            // Usage errors count as failed runs and share their exit status.
            let _ = e.print();
            process::exit(1);
        }
    };
    if let Err(e) = run(cli.command) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run(command: Commands) -> Result<(), Box<dyn Error>> {
    let start_time = Instant::now();

    let (common, mode) = match command {
        Commands::Associate { common, universe } => (common, Mode::Associate { universe }),
        Commands::Extract { common, kmers } => (common, Mode::Extract { kmers }),
    };
    let config = common.resolve_config()?;

    if let Some(parent) = common.out.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    eprintln!(
        "> k={}, {} chunks, retaining {} k-mers, min count {}, {} sample policy, {} threads",
        config.k,
        config.chunk_count,
        config.retained,
        config.min_count,
        config.sample_policy,
        config.effective_threads()
    );
    eprintln!("> Phenotypes: {}", common.phenotypes.display());
    eprintln!("> Sample databases: {}", common.db_root.display());

    let job = Job {
        phenotypes: common.phenotypes,
        db_root: common.db_root,
        out_prefix: common.out,
        mode,
    };
    let mut engine = Orchestrator::new(config);
    let report = engine.run(&job)?;

    print_report(&report);
    eprintln!("> Total time: {:.2?}", start_time.elapsed());
    Ok(())
}

fn print_report(report: &RunReport) {
    eprintln!(
        "> Used {} samples across {} chunks.",
        report.samples_used, report.chunks_processed
    );
    if !report.samples_skipped.is_empty() {
        eprintln!(
            "> Skipped {} unreadable samples: {}",
            report.samples_skipped.len(),
            report.samples_skipped.join(", ")
        );
    }
    eprintln!(
        "> Scored {} k-mers ({} non-informative); at most {} resident at once.",
        report.kmers_scored, report.degenerate_kmers, report.peak_materialized
    );
    eprintln!("> Wrote {} k-mers:", report.retained);
    for path in report.outputs.iter() {
        eprintln!(">   {}", path.display());
    }
}
