// ========================================================================================
//
//                         K-MER LIST FILES (UNIVERSE AND EXTRACTION)
//
// ========================================================================================
//
// A k-mer list is a plain-text file (optionally gzip-compressed, detected by a `.gz`
// extension) with one k-mer per line in its first whitespace-separated field. Blank
// lines, `#` comments and a leading `kmer` header are skipped. The same format backs two
// features:
//
// - a universe restriction, reloaded once per chunk so that only the slice of the list
//   falling into the active chunk is ever resident;
// - the explicit k-mer list of the extraction mode, read once in file order.

use crate::chunk::ChunkSelector;
use crate::kmer::{EncodingError, KmerCode, KmerCodec};
use ahash::AHashSet;
use flate2::read::MultiGzDecoder;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UniverseError {
    #[error("failed to read k-mer list {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{}:{line}: invalid k-mer '{text}': {source}", path.display())]
    InvalidKmer {
        path: PathBuf,
        line: usize,
        text: String,
        #[source]
        source: EncodingError,
    },
}

/// A k-mer list on disk that is scanned lazily, one chunk at a time.
#[derive(Debug, Clone)]
pub struct UniverseFile {
    path: PathBuf,
    codec: KmerCodec,
}

impl UniverseFile {
    /// Validates every entry once. Nothing is kept; `load_chunk` re-reads the file.
    pub fn open(path: &Path, codec: KmerCodec) -> Result<Self, UniverseError> {
        for_each_kmer(path, codec, |_| {})?;
        Ok(Self {
            path: path.to_path_buf(),
            codec,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the listed k-mers that fall inside `chunk`.
    pub fn load_chunk(&self, chunk: &ChunkSelector) -> Result<AHashSet<KmerCode>, UniverseError> {
        let mut set = AHashSet::new();
        for_each_kmer(&self.path, self.codec, |code| {
            if chunk.contains(code) {
                set.insert(code);
            }
        })?;
        Ok(set)
    }
}

/// Reads a k-mer list in file order, dropping repeated entries (including the second
/// strand of an already listed k-mer).
pub fn read_kmer_list(path: &Path, codec: KmerCodec) -> Result<Vec<KmerCode>, UniverseError> {
    let mut seen = AHashSet::new();
    let mut ordered = Vec::new();
    for_each_kmer(path, codec, |code| {
        if seen.insert(code) {
            ordered.push(code);
        }
    })?;
    Ok(ordered)
}

fn open_list(path: &Path) -> Result<Box<dyn BufRead>, UniverseError> {
    let file = File::open(path).map_err(|source| UniverseError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let reader: Box<dyn Read> = if path.extension().is_some_and(|ext| ext == "gz") {
        Box::new(MultiGzDecoder::new(file))
    } else {
        Box::new(file)
    };
    Ok(Box::new(BufReader::new(reader)))
}

fn for_each_kmer(
    path: &Path,
    codec: KmerCodec,
    mut visit: impl FnMut(KmerCode),
) -> Result<(), UniverseError> {
    let mut reader = open_list(path)?;
    let mut line = Vec::new();
    let mut line_number = 0usize;
    let mut seen_content = false;

    loop {
        line.clear();
        let read = reader
            .read_until(b'\n', &mut line)
            .map_err(|source| UniverseError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        if read == 0 {
            break;
        }
        line_number += 1;

        let Some(field) = first_field(&line) else {
            continue;
        };
        if field[0] == b'#' {
            continue;
        }
        let is_first = !seen_content;
        seen_content = true;
        if is_first && field.eq_ignore_ascii_case(b"kmer") {
            continue;
        }

        let code = codec
            .encode(field)
            .map_err(|source| UniverseError::InvalidKmer {
                path: path.to_path_buf(),
                line: line_number,
                text: String::from_utf8_lossy(field).into_owned(),
                source,
            })?;
        visit(code);
    }
    Ok(())
}

/// The first whitespace-delimited field of a line, or `None` for a blank line.
fn first_field(line: &[u8]) -> Option<&[u8]> {
    let start = line.iter().position(|b| !b.is_ascii_whitespace())?;
    let rest = &line[start..];
    let end = memchr::memchr3(b' ', b'\t', b'\n', rest).unwrap_or(rest.len());
    let field = &rest[..end];
    Some(field.strip_suffix(b"\r").unwrap_or(field))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::KmerPartitioner;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::fs;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn list_is_read_in_order_without_duplicates() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("kmers.txt");
        fs::write(
            &path,
            "kmer\n# requested set\nACGA\n\nTTTT 12\nTCGT\nGGCA\r\nAAAA\n",
        )?;
        let codec = KmerCodec::new(4)?;

        let list = read_kmer_list(&path, codec)?;
        let decoded: Vec<String> = list.iter().map(|&code| codec.decode(code)).collect();
        // TCGT is the reverse complement of ACGA and AAAA of TTTT.
        assert_eq!(decoded, vec!["ACGA", "AAAA", "GGCA"]);
        Ok(())
    }

    #[test]
    fn chunk_loads_partition_the_universe() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("universe.txt");
        let codec = KmerCodec::new(6)?;
        let mut contents = String::new();
        for raw in 0u64..300 {
            let code = codec.canonicalize(raw * 11)?;
            contents.push_str(&codec.decode(code));
            contents.push('\n');
        }
        fs::write(&path, contents)?;

        let universe = UniverseFile::open(&path, codec)?;
        let full = read_kmer_list(&path, codec)?;
        let partitioner = KmerPartitioner::new(5);
        let mut total = 0;
        for selector in partitioner.selectors() {
            let slice = universe.load_chunk(&selector)?;
            assert!(slice.iter().all(|&code| selector.contains(code)));
            total += slice.len();
        }
        assert_eq!(total, full.len());
        Ok(())
    }

    #[test]
    fn gzip_lists_are_decompressed() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("kmers.txt.gz");
        let mut encoder = GzEncoder::new(fs::File::create(&path)?, Compression::default());
        encoder.write_all(b"CCGT\nAGGA\n")?;
        encoder.finish()?;

        let codec = KmerCodec::new(4)?;
        let list = read_kmer_list(&path, codec)?;
        assert_eq!(list, vec![codec.encode_str("CCGT")?, codec.encode_str("AGGA")?]);
        Ok(())
    }

    #[test]
    fn invalid_entry_reports_its_line() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("bad.txt");
        fs::write(&path, "ACGT\nACNT\n")?;
        let err = read_kmer_list(&path, KmerCodec::new(4)?).unwrap_err();
        assert!(matches!(err, UniverseError::InvalidKmer { line: 2, .. }));
        Ok(())
    }

    #[test]
    fn missing_file_fails_on_open() {
        let dir = tempdir().unwrap();
        let codec = KmerCodec::new(4).unwrap();
        let err = UniverseFile::open(&dir.path().join("absent.txt"), codec).unwrap_err();
        assert!(matches!(err, UniverseError::Io { .. }));
    }

    #[test]
    fn first_field_skips_leading_whitespace() {
        assert_eq!(first_field(b"  ACGT\tx\n"), Some(&b"ACGT"[..]));
        assert_eq!(first_field(b"ACGT\r\n"), Some(&b"ACGT"[..]));
        assert_eq!(first_field(b" \t\n"), None);
    }
}
