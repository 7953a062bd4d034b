// ========================================================================================
//
//                      PLINK 1 BINARY FILESET FOR RETAINED K-MERS
//
// ========================================================================================
//
// Under an output prefix P the writer produces:
//
//   P.bed         magic 0x6c 0x1b 0x01 (variant-major), then one record of
//                 ceil(n_samples / 4) bytes per k-mer. Sample i sits in bits
//                 2*(i%4)..2*(i%4)+1 of byte i/4, least significant pair first.
//                 absent = 0b00 (hom A1), present = 0b11 (hom A2), 0b01 = missing
//                 (reserved, never written). Padding pairs are zero.
//   P.bim         `0  <kmer>  0  <rank>  A  T`, tab separated, rank is 1-based.
//   P.fam         `<sample> <sample> 0 0 0 -9`, in matrix column order.
//   P.scores.tsv  `kmer<TAB>score`, one line per marker in matrix order, `NA` when the
//                 k-mer carries no information.
//   P.presence.tsv (optional) `kmer` plus one 0/1 column per sample.
//
// Every artifact is staged in a hidden temporary next to its destination, flushed and
// fsynced, and only renamed into place once all of them were written. `.bed` is renamed
// last, so a visible `.bed` always comes with complete manifests. A rename that fails
// midway withdraws the files this write already published.

use crate::heap::RetainedSet;
use crate::index::PresenceRow;
use crate::kmer::KmerCodec;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const BED_MAGIC: [u8; 3] = [0x6c, 0x1b, 0x01];

const CALL_ABSENT: u8 = 0b00;
const CALL_PRESENT: u8 = 0b11;
const CALL_MISSING: u8 = 0b01;

#[derive(Debug, Error)]
pub enum PlinkWriteError {
    #[error("refusing to overwrite existing output file {}", .0.display())]
    OutputExists(PathBuf),
    #[error("output prefix '{}' has no file name", .0.display())]
    InvalidPrefix(PathBuf),
    #[error("presence row has {found} samples but the fileset has {expected}")]
    RowWidth { expected: usize, found: usize },
    #[error("I/O error writing {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error)]
pub enum PlinkReadError {
    #[error("I/O error reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid .bed header: {0}")]
    InvalidHeader(String),
    #[error(".bed body of {body} bytes is not a whole number of {record}-byte records")]
    TruncatedBody { body: usize, record: usize },
    /// A valid PLINK missing call. Presence rows have no third state to hold it.
    #[error("marker {marker}, sample {sample}: no-call cannot be represented as presence/absence")]
    NoCall { marker: usize, sample: usize },
    #[error("marker {marker}, sample {sample}: unexpected call code {code:#04b}")]
    UnexpectedCall {
        marker: usize,
        sample: usize,
        code: u8,
    },
}

/// The sibling files written under one output prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputPaths {
    pub bed: PathBuf,
    pub bim: PathBuf,
    pub fam: PathBuf,
    pub scores: PathBuf,
    pub presence: Option<PathBuf>,
}

impl OutputPaths {
    pub fn from_prefix(prefix: &Path, with_presence_table: bool) -> Result<Self, PlinkWriteError> {
        if prefix.file_name().is_none() {
            return Err(PlinkWriteError::InvalidPrefix(prefix.to_path_buf()));
        }
        let with_suffix = |suffix: &str| {
            let mut name = OsString::from(prefix.as_os_str());
            name.push(suffix);
            PathBuf::from(name)
        };
        Ok(Self {
            bed: with_suffix(".bed"),
            bim: with_suffix(".bim"),
            fam: with_suffix(".fam"),
            scores: with_suffix(".scores.tsv"),
            presence: with_presence_table.then(|| with_suffix(".presence.tsv")),
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Path> + '_ {
        [&self.bed, &self.bim, &self.fam, &self.scores]
            .into_iter()
            .chain(self.presence.as_ref())
            .map(PathBuf::as_path)
    }

    /// Fails if any artifact already exists.
    pub fn ensure_absent(&self) -> Result<(), PlinkWriteError> {
        match self.iter().find(|path| path.exists()) {
            Some(existing) => Err(PlinkWriteError::OutputExists(existing.to_path_buf())),
            None => Ok(()),
        }
    }
}

/// A hidden temporary that becomes `target` on `commit`, and is removed otherwise.
struct StagedFile {
    temp_path: PathBuf,
    target: PathBuf,
    writer: Option<BufWriter<File>>,
    committed: bool,
}

impl StagedFile {
    fn create(target: &Path) -> Result<Self, PlinkWriteError> {
        let io_err = |source| PlinkWriteError::Io {
            path: target.to_path_buf(),
            source,
        };
        let output_dir = target
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let output_name = target
            .file_name()
            .ok_or_else(|| PlinkWriteError::InvalidPrefix(target.to_path_buf()))?;

        let pid = std::process::id();
        let ts_nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);

        for attempt in 0..32u32 {
            let candidate = output_dir.join(format!(
                ".{}.{}.{}.tmp",
                output_name.to_string_lossy(),
                pid,
                ts_nanos + attempt as u128
            ));
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&candidate)
            {
                Ok(file) => {
                    return Ok(Self {
                        temp_path: candidate,
                        target: target.to_path_buf(),
                        writer: Some(BufWriter::new(file)),
                        committed: false,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(io_err(e)),
            }
        }
        Err(io_err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!(
                "failed to allocate a unique temporary file in '{}'",
                output_dir.display()
            ),
        )))
    }

    fn io_error(&self, source: io::Error) -> PlinkWriteError {
        PlinkWriteError::Io {
            path: self.target.clone(),
            source,
        }
    }

    /// Runs `body` against the temporary, then flushes and fsyncs it.
    fn write_with(
        &mut self,
        body: impl FnOnce(&mut BufWriter<File>) -> io::Result<()>,
    ) -> Result<(), PlinkWriteError> {
        let result = match self.writer.as_mut() {
            Some(writer) => body(writer),
            None => Err(io::Error::other("staged file already finished")),
        };
        result.map_err(|source| self.io_error(source))?;
        self.finish()
    }

    fn finish(&mut self) -> Result<(), PlinkWriteError> {
        let Some(writer) = self.writer.take() else {
            return Ok(());
        };
        let result = writer
            .into_inner()
            .map_err(|e| e.into_error())
            .and_then(|file| file.sync_all());
        result.map_err(|e| self.io_error(e))
    }

    fn commit(mut self) -> Result<(), PlinkWriteError> {
        self.finish()?;
        fs::rename(&self.temp_path, &self.target).map_err(|e| self.io_error(e))?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if !self.committed {
            self.writer.take();
            let _ = fs::remove_file(&self.temp_path);
        }
    }
}

/// Serializes a retained set as a PLINK 1 binary fileset plus score manifest.
#[derive(Debug, Clone)]
pub struct GenotypeMatrixWriter {
    paths: OutputPaths,
    codec: KmerCodec,
}

impl GenotypeMatrixWriter {
    pub fn new(paths: OutputPaths, codec: KmerCodec) -> Self {
        Self { paths, codec }
    }

    /// Writes every artifact for `retained`, with columns in `samples` order.
    ///
    /// Nothing becomes visible unless every artifact was written and synced.
    pub fn write(&self, retained: &RetainedSet, samples: &[String]) -> Result<(), PlinkWriteError> {
        self.paths.ensure_absent()?;
        if let Some(row) = retained
            .iter()
            .map(|s| &s.row)
            .find(|row| row.n_samples() != samples.len())
        {
            return Err(PlinkWriteError::RowWidth {
                expected: samples.len(),
                found: row.n_samples(),
            });
        }

        let kmer_ids: Vec<String> = retained.iter().map(|s| self.codec.decode(s.code)).collect();

        let mut bim = StagedFile::create(&self.paths.bim)?;
        bim.write_with(|w| write_bim(w, &kmer_ids))?;

        let mut fam = StagedFile::create(&self.paths.fam)?;
        fam.write_with(|w| write_fam(w, samples))?;

        let mut scores = StagedFile::create(&self.paths.scores)?;
        scores.write_with(|w| write_scores(w, &kmer_ids, retained))?;

        let presence = match &self.paths.presence {
            Some(path) => {
                let mut staged = StagedFile::create(path)?;
                staged.write_with(|w| write_presence_table(w, &kmer_ids, retained, samples))?;
                Some(staged)
            }
            None => None,
        };

        let mut bed = StagedFile::create(&self.paths.bed)?;
        bed.write_with(|w| write_bed(w, retained, samples.len()))?;

        let mut staged = vec![bim, fam, scores];
        staged.extend(presence);
        staged.push(bed);
        publish(staged)
    }
}

/// Renames every staged file into place, in order. If any rename fails, the targets
/// already published by this call are removed again and the remaining temporaries are
/// dropped, so a failed publish leaves no artifact behind.
fn publish(staged: Vec<StagedFile>) -> Result<(), PlinkWriteError> {
    let mut published: Vec<PathBuf> = Vec::with_capacity(staged.len());
    for file in staged {
        let target = file.target.clone();
        if let Err(err) = file.commit() {
            for path in &published {
                let _ = fs::remove_file(path);
            }
            return Err(err);
        }
        published.push(target);
    }
    Ok(())
}

fn write_bim(writer: &mut impl Write, kmer_ids: &[String]) -> io::Result<()> {
    for (rank, kmer) in kmer_ids.iter().enumerate() {
        writeln!(writer, "0\t{kmer}\t0\t{}\tA\tT", rank + 1)?;
    }
    Ok(())
}

fn write_fam(writer: &mut impl Write, samples: &[String]) -> io::Result<()> {
    for sample in samples {
        writeln!(writer, "{sample} {sample} 0 0 0 -9")?;
    }
    Ok(())
}

fn write_scores(
    writer: &mut impl Write,
    kmer_ids: &[String],
    retained: &RetainedSet,
) -> io::Result<()> {
    writeln!(writer, "kmer\tscore")?;
    let mut ryu_buffer = ryu::Buffer::new();
    for (kmer, scored) in kmer_ids.iter().zip(retained) {
        if scored.score.is_finite() {
            writeln!(writer, "{kmer}\t{}", ryu_buffer.format_finite(scored.score))?;
        } else {
            writeln!(writer, "{kmer}\tNA")?;
        }
    }
    Ok(())
}

fn write_presence_table(
    writer: &mut impl Write,
    kmer_ids: &[String],
    retained: &RetainedSet,
    samples: &[String],
) -> io::Result<()> {
    write!(writer, "kmer")?;
    for sample in samples {
        write!(writer, "\t{sample}")?;
    }
    writeln!(writer)?;

    let mut line = String::with_capacity(samples.len() * 2 + 40);
    for (kmer, scored) in kmer_ids.iter().zip(retained) {
        line.clear();
        line.push_str(kmer);
        for column in 0..samples.len() {
            line.push('\t');
            line.push(if scored.row.get(column) { '1' } else { '0' });
        }
        line.push('\n');
        writer.write_all(line.as_bytes())?;
    }
    Ok(())
}

fn write_bed(writer: &mut impl Write, retained: &RetainedSet, n_samples: usize) -> io::Result<()> {
    writer.write_all(&BED_MAGIC)?;
    let mut record = vec![0u8; n_samples.div_ceil(4)];
    for scored in retained {
        pack_row(&mut record, &scored.row);
        writer.write_all(&record)?;
    }
    Ok(())
}

/// Packs a presence row into one `.bed` record.
pub fn pack_row(dst: &mut [u8], row: &PresenceRow) {
    debug_assert_eq!(dst.len(), row.n_samples().div_ceil(4));
    dst.fill(CALL_ABSENT);
    for column in row.present_columns() {
        dst[column / 4] |= CALL_PRESENT << (2 * (column % 4));
    }
}

fn validate_bed_header(header: &[u8]) -> Result<(), PlinkReadError> {
    match header {
        [0x6c, 0x1b, 0x01] => Ok(()),
        [0x6c, 0x1b, mode] => Err(PlinkReadError::InvalidHeader(format!(
            "unsupported mode byte {mode:#04x} (only variant-major mode is supported)"
        ))),
        _ => Err(PlinkReadError::InvalidHeader(
            "missing PLINK magic bytes 0x6c 0x1b".to_string(),
        )),
    }
}

/// Decodes a `.bed` file written by `GenotypeMatrixWriter` back into presence rows.
///
/// Only two-state matrices decode: a no-call fails with `NoCall` and a heterozygous
/// code with `UnexpectedCall`. The writer never emits either.
pub fn read_bed_matrix(path: &Path, n_samples: usize) -> Result<Vec<PresenceRow>, PlinkReadError> {
    let bytes = fs::read(path).map_err(|source| PlinkReadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    if bytes.len() < BED_MAGIC.len() {
        return Err(PlinkReadError::InvalidHeader(format!(
            "file is only {} bytes",
            bytes.len()
        )));
    }
    validate_bed_header(&bytes[..3])?;

    let body = &bytes[3..];
    let record = n_samples.div_ceil(4);
    if record == 0 || body.len() % record != 0 {
        if body.is_empty() {
            return Ok(Vec::new());
        }
        return Err(PlinkReadError::TruncatedBody {
            body: body.len(),
            record,
        });
    }

    body.chunks_exact(record)
        .enumerate()
        .map(|(marker, bytes)| {
            let mut row = PresenceRow::new(n_samples);
            for sample in 0..n_samples {
                match (bytes[sample / 4] >> (2 * (sample % 4))) & 0b11 {
                    CALL_PRESENT => row.set(sample),
                    CALL_ABSENT => {}
                    CALL_MISSING => return Err(PlinkReadError::NoCall { marker, sample }),
                    code => {
                        return Err(PlinkReadError::UnexpectedCall {
                            marker,
                            sample,
                            code,
                        });
                    }
                }
            }
            Ok(row)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{ScoreHeap, ScoredKmer};
    use tempfile::tempdir;

    fn codec() -> KmerCodec {
        KmerCodec::new(4).unwrap()
    }

    fn samples(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("acc{i}")).collect()
    }

    fn retained(rows: &[(&str, f64, &[bool])]) -> RetainedSet {
        let codec = codec();
        let heap = ScoreHeap::new(rows.len());
        for &(seq, score, calls) in rows {
            heap.admit(ScoredKmer::new(
                codec.encode_str(seq).unwrap(),
                score,
                PresenceRow::from_bools(calls),
            ));
        }
        heap.drain()
    }

    #[test]
    fn pack_row_is_lsb_first_with_zero_padding() {
        let row = PresenceRow::from_bools(&[true, false, false, true, true]);
        let mut record = [0xFFu8; 2];
        pack_row(&mut record, &row);
        assert_eq!(record, [0b1100_0011, 0b0000_0011]);
    }

    #[test]
    fn fileset_round_trips_presence_calls() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let prefix = dir.path().join("run.1");
        let paths = OutputPaths::from_prefix(&prefix, true)?;
        assert_eq!(paths.bed, dir.path().join("run.1.bed"));

        let calls_a = [true, true, false, false, true, false, true];
        let calls_b = [false, false, true, false, false, false, false];
        let set = retained(&[("ACGA", 0.9, &calls_a[..]), ("CCGA", -0.4, &calls_b[..])]);
        let samples = samples(7);

        GenotypeMatrixWriter::new(paths.clone(), codec()).write(&set, &samples)?;

        let rows = read_bed_matrix(&paths.bed, samples.len())?;
        assert_eq!(
            rows,
            vec![PresenceRow::from_bools(&calls_a), PresenceRow::from_bools(&calls_b)]
        );
        assert_eq!(fs::metadata(&paths.bed)?.len(), 3 + 2 * 2);

        let bim = fs::read_to_string(&paths.bim)?;
        assert_eq!(bim, "0\tACGA\t0\t1\tA\tT\n0\tCCGA\t0\t2\tA\tT\n");
        let fam = fs::read_to_string(&paths.fam)?;
        assert_eq!(fam.lines().next(), Some("acc0 acc0 0 0 0 -9"));
        assert_eq!(fam.lines().count(), 7);
        let scores = fs::read_to_string(&paths.scores)?;
        assert_eq!(scores, "kmer\tscore\nACGA\t0.9\nCCGA\t-0.4\n");
        let presence = fs::read_to_string(paths.presence.as_ref().ok_or("no presence path")?)?;
        assert_eq!(presence.lines().nth(1), Some("ACGA\t1\t1\t0\t0\t1\t0\t1"));

        let leftovers = fs::read_dir(dir.path())?
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
        Ok(())
    }

    #[test]
    fn non_informative_scores_are_written_as_na() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let paths = OutputPaths::from_prefix(&dir.path().join("x"), false)?;
        let set = RetainedSet::from_ordered(vec![ScoredKmer::new(
            codec().encode_str("GATC")?,
            f64::NAN,
            PresenceRow::new(2),
        )]);
        GenotypeMatrixWriter::new(paths.clone(), codec()).write(&set, &samples(2))?;
        assert_eq!(fs::read_to_string(&paths.scores)?, "kmer\tscore\nGATC\tNA\n");
        assert!(paths.presence.is_none());
        Ok(())
    }

    #[test]
    fn existing_outputs_are_never_overwritten() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let paths = OutputPaths::from_prefix(&dir.path().join("out"), false)?;
        fs::write(&paths.fam, "keep me")?;
        let err = GenotypeMatrixWriter::new(paths.clone(), codec())
            .write(&RetainedSet::default(), &samples(3))
            .unwrap_err();
        assert!(matches!(err, PlinkWriteError::OutputExists(ref p) if p == &paths.fam));
        assert_eq!(fs::read_to_string(&paths.fam)?, "keep me");
        assert!(!paths.bed.exists());
        Ok(())
    }

    #[test]
    fn row_width_mismatch_leaves_nothing_behind() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let paths = OutputPaths::from_prefix(&dir.path().join("bad"), false)?;
        let set = retained(&[("ACGA", 0.5, &[true, false][..])]);
        let err = GenotypeMatrixWriter::new(paths.clone(), codec())
            .write(&set, &samples(3))
            .unwrap_err();
        assert!(matches!(err, PlinkWriteError::RowWidth { expected: 3, found: 2 }));
        assert_eq!(fs::read_dir(dir.path())?.count(), 0);
        Ok(())
    }

    #[test]
    fn failed_rename_withdraws_already_published_files() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let first_target = dir.path().join("run.bim");
        let second_target = dir.path().join("run.bed");

        let mut first = StagedFile::create(&first_target)?;
        first.write_with(|w| w.write_all(b"bim"))?;
        let mut second = StagedFile::create(&second_target)?;
        second.write_with(|w| w.write_all(b"bed"))?;

        // A non-empty directory squatting on the target makes the second rename fail.
        fs::create_dir(&second_target)?;
        fs::write(second_target.join("keep"), b"")?;

        let err = publish(vec![first, second]).unwrap_err();
        assert!(matches!(err, PlinkWriteError::Io { ref path, .. } if path == &second_target));
        assert!(!first_target.exists());
        let leftovers: Vec<_> = fs::read_dir(dir.path())?
            .map(|entry| entry.map(|e| e.file_name()))
            .collect::<Result<_, _>>()?;
        assert_eq!(leftovers, vec![std::ffi::OsString::from("run.bed")]);
        Ok(())
    }

    #[test]
    fn reader_rejects_bad_headers_and_truncation() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("m.bed");
        fs::write(&path, [0x6c, 0x1b, 0x00])?;
        assert!(matches!(
            read_bed_matrix(&path, 4),
            Err(PlinkReadError::InvalidHeader(_))
        ));

        fs::write(&path, [0x6c, 0x1b, 0x01, 0xFF, 0x00, 0x00])?;
        assert!(matches!(
            read_bed_matrix(&path, 5),
            Err(PlinkReadError::TruncatedBody { body: 3, record: 2 })
        ));

        // 0b10 is a heterozygous call, which a presence matrix never holds.
        fs::write(&path, [0x6c, 0x1b, 0x01, 0b0000_1000])?;
        assert!(matches!(
            read_bed_matrix(&path, 2),
            Err(PlinkReadError::UnexpectedCall {
                marker: 0,
                sample: 1,
                code: 0b10
            })
        ));

        fs::write(&path, [0x6c, 0x1b, 0x01, 0b0000_0011, 0b0001_0000])?;
        assert!(matches!(
            read_bed_matrix(&path, 3),
            Err(PlinkReadError::NoCall { marker: 1, sample: 2 })
        ));
        Ok(())
    }
}
