// ========================================================================================
//
//                          PER-SAMPLE K-MER DATABASES
//
// ========================================================================================
//
// The engine only ever sees a sample through the `SampleStore` trait: a restartable,
// chunk-filtered stream of (canonical k-mer, count) pairs. The concrete store shipped
// here memory-maps a flat binary file (`.kdb`):
//
//     offset  size   field
//     0       8      magic  b"KMERDB01"
//     8       4      k      (u32 LE)
//     12      4      reserved (u32 LE, 0)
//     16      8      n      entry count (u64 LE)
//     24      n*12   entries: code (u64 LE) + count (u32 LE)
//
// Entries are in no particular order and may hold either strand; codes are
// canonicalized as they are streamed. Nothing is materialized beyond the mapping.

use crate::chunk::ChunkSelector;
use crate::kmer::{KmerCode, KmerCodec};
use memmap2::Mmap;
use std::fs::File;
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const KDB_MAGIC: &[u8; 8] = b"KMERDB01";
const HEADER_LEN: usize = 24;
const ENTRY_LEN: usize = 12;
const COUNT_OFFSET: u64 = 16;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("k-mer database for sample '{sample}' not found at {}", path.display())]
    NotFound { sample: String, path: PathBuf },
    #[error("corrupt k-mer database {}: {message}", path.display())]
    CorruptFormat { path: PathBuf, message: String },
    #[error("k-mer database {} was built with k={found}, expected k={expected}", path.display())]
    KMismatch {
        path: PathBuf,
        expected: usize,
        found: usize,
    },
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Read-only access to one sample's k-mer multiset.
pub trait SampleStore: Send + Sync {
    fn sample_id(&self) -> &str;

    /// Streams the k-mers of this sample that fall inside `chunk`.
    ///
    /// The stream is finite, may be restarted any number of times, and yields k-mers in
    /// storage order.
    fn stream<'a>(&'a self, chunk: &'a ChunkSelector) -> Box<dyn KmerStream + 'a>;
}

impl<T: SampleStore + ?Sized> SampleStore for Box<T> {
    fn sample_id(&self) -> &str {
        (**self).sample_id()
    }

    fn stream<'a>(&'a self, chunk: &'a ChunkSelector) -> Box<dyn KmerStream + 'a> {
        (**self).stream(chunk)
    }
}

/// A sample held entirely in memory. Handy for small studies and for tests.
#[derive(Debug, Clone)]
pub struct MemorySampleStore {
    sample_id: String,
    entries: Vec<(KmerCode, u32)>,
}

impl MemorySampleStore {
    pub fn new(sample_id: impl Into<String>, entries: Vec<(KmerCode, u32)>) -> Self {
        Self {
            sample_id: sample_id.into(),
            entries,
        }
    }
}

impl SampleStore for MemorySampleStore {
    fn sample_id(&self) -> &str {
        &self.sample_id
    }

    fn stream<'a>(&'a self, chunk: &'a ChunkSelector) -> Box<dyn KmerStream + 'a> {
        Box::new(
            self.entries
                .iter()
                .filter(move |(code, _)| chunk.contains(*code))
                .map(|&entry| Ok::<_, StoreError>(entry)),
        )
    }
}

/// A lazy sequence of (k-mer, count) pairs produced by a `SampleStore`.
pub trait KmerStream: Iterator<Item = Result<(KmerCode, u32), StoreError>> + Send {}

impl<T> KmerStream for T where T: Iterator<Item = Result<(KmerCode, u32), StoreError>> + Send {}

/// Maps sample identifiers onto database paths: `<root>/<template>` where the template
/// contains a `{sample}` placeholder.
#[derive(Debug, Clone)]
pub struct DatabaseLayout {
    root: PathBuf,
    template: String,
}

impl DatabaseLayout {
    pub fn new(root: impl Into<PathBuf>, template: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            template: template.into(),
        }
    }

    pub fn path_for(&self, sample: &str) -> PathBuf {
        self.root.join(self.template.replace("{sample}", sample))
    }
}

pub struct MmapSampleStore {
    sample_id: String,
    path: PathBuf,
    codec: KmerCodec,
    mmap: Mmap,
    entries: usize,
}

impl MmapSampleStore {
    /// Opens and validates a `.kdb` file: header, size, and every record's code. A
    /// store that opens cleanly cannot fail while streaming, so corruption is always
    /// detected before the first chunk.
    pub fn open(
        sample_id: impl Into<String>,
        path: &Path,
        codec: KmerCodec,
    ) -> Result<Self, StoreError> {
        let sample_id = sample_id.into();
        let file = File::open(path).map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                StoreError::NotFound {
                    sample: sample_id.clone(),
                    path: path.to_path_buf(),
                }
            } else {
                StoreError::Io {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })?;
        let file_len = file
            .metadata()
            .map_err(|source| StoreError::Io {
                path: path.to_path_buf(),
                source,
            })?
            .len();

        let corrupt = |message: String| StoreError::CorruptFormat {
            path: path.to_path_buf(),
            message,
        };

        if file_len < HEADER_LEN as u64 {
            return Err(corrupt(format!(
                "file is {file_len} bytes, shorter than the {HEADER_LEN}-byte header"
            )));
        }

        // The file handle is open and its length has been checked against the header.
        let mmap = unsafe { Mmap::map(&file) }.map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        if &mmap[..8] != KDB_MAGIC {
            return Err(corrupt("missing KMERDB01 magic bytes".to_string()));
        }
        let k = read_u32_le(&mmap[8..12]) as usize;
        let entries = read_u64_le(&mmap[16..24]);

        let expected_len = entries
            .checked_mul(ENTRY_LEN as u64)
            .and_then(|body| body.checked_add(HEADER_LEN as u64))
            .ok_or_else(|| corrupt(format!("entry count {entries} overflows")))?;
        if expected_len != file_len {
            return Err(corrupt(format!(
                "expected {expected_len} bytes for {entries} entries, found {file_len}"
            )));
        }
        if k != codec.k() {
            return Err(StoreError::KMismatch {
                path: path.to_path_buf(),
                expected: codec.k(),
                found: k,
            });
        }
        for (record_index, record) in mmap[HEADER_LEN..].chunks_exact(ENTRY_LEN).enumerate() {
            codec
                .canonicalize(read_u64_le(&record[..8]))
                .map_err(|err| corrupt(format!("record {record_index}: {err}")))?;
        }

        Ok(Self {
            sample_id,
            path: path.to_path_buf(),
            codec,
            mmap,
            entries: entries as usize,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }
}

impl SampleStore for MmapSampleStore {
    fn sample_id(&self) -> &str {
        &self.sample_id
    }

    fn stream<'a>(&'a self, chunk: &'a ChunkSelector) -> Box<dyn KmerStream + 'a> {
        Box::new(KdbStream {
            records: self.mmap[HEADER_LEN..].chunks_exact(ENTRY_LEN),
            codec: self.codec,
            chunk,
            path: &self.path,
        })
    }
}

impl std::fmt::Debug for MmapSampleStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MmapSampleStore")
            .field("sample_id", &self.sample_id)
            .field("path", &self.path)
            .field("k", &self.codec.k())
            .field("entries", &self.entries)
            .finish()
    }
}

struct KdbStream<'a> {
    records: std::slice::ChunksExact<'a, u8>,
    codec: KmerCodec,
    chunk: &'a ChunkSelector,
    path: &'a Path,
}

impl Iterator for KdbStream<'_> {
    type Item = Result<(KmerCode, u32), StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        for record in self.records.by_ref() {
            let raw = read_u64_le(&record[..8]);
            let count = read_u32_le(&record[8..12]);
            let code = match self.codec.canonicalize(raw) {
                Ok(code) => code,
                Err(err) => {
                    return Some(Err(StoreError::CorruptFormat {
                        path: self.path.to_path_buf(),
                        message: err.to_string(),
                    }));
                }
            };
            if self.chunk.contains(code) {
                return Some(Ok((code, count)));
            }
        }
        None
    }
}

#[inline]
fn read_u32_le(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(buf)
}

#[inline]
fn read_u64_le(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}

/// Streams (code, count) pairs into a `.kdb` file. The entry count in the header is
/// patched in by `finish`.
pub struct SampleStoreWriter {
    writer: BufWriter<File>,
    path: PathBuf,
    codec: KmerCodec,
    entries: u64,
}

impl SampleStoreWriter {
    pub fn create(path: &Path, codec: KmerCodec) -> Result<Self, StoreError> {
        let io_err = |source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        };
        let file = File::create(path).map_err(io_err)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(KDB_MAGIC).map_err(io_err)?;
        writer
            .write_all(&(codec.k() as u32).to_le_bytes())
            .map_err(io_err)?;
        writer.write_all(&0u32.to_le_bytes()).map_err(io_err)?;
        writer.write_all(&0u64.to_le_bytes()).map_err(io_err)?;
        Ok(Self {
            writer,
            path: path.to_path_buf(),
            codec,
            entries: 0,
        })
    }

    pub fn push(&mut self, code: KmerCode, count: u32) -> Result<(), StoreError> {
        self.push_raw(code.get(), count)
    }

    /// Appends a raw packing of either strand; it is validated against k.
    pub fn push_raw(&mut self, raw: u64, count: u32) -> Result<(), StoreError> {
        self.codec
            .canonicalize(raw)
            .map_err(|err| StoreError::CorruptFormat {
                path: self.path.clone(),
                message: err.to_string(),
            })?;
        self.writer
            .write_all(&raw.to_le_bytes())
            .and_then(|()| self.writer.write_all(&count.to_le_bytes()))
            .map_err(|source| StoreError::Io {
                path: self.path.clone(),
                source,
            })?;
        self.entries += 1;
        Ok(())
    }

    pub fn finish(mut self) -> Result<u64, StoreError> {
        let entries = self.entries;
        let path = self.path.clone();
        let result = (|| -> io::Result<()> {
            self.writer.flush()?;
            let mut file = self.writer.into_inner().map_err(io::Error::other)?;
            file.seek(SeekFrom::Start(COUNT_OFFSET))?;
            file.write_all(&entries.to_le_bytes())?;
            file.sync_all()
        })();
        result.map_err(|source| StoreError::Io { path, source })?;
        Ok(entries)
    }
}
