// ========================================================================================
//
//                               PHENOTYPE VECTOR
//
// ========================================================================================
//
// The phenotype file is text: one header line (ignored), then whitespace-separated
// `sample value` pairs, any number per line, until EOF. A pair may be split across a
// line break. The order of the pairs fixes the sample column order for the whole run.

use ahash::AHashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PhenotypeError {
    #[error("failed to read phenotype file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("line {line}: cannot parse phenotype value '{text}' for sample '{sample}'")]
    Parse {
        line: usize,
        sample: String,
        text: String,
    },
    #[error("line {line}: sample '{sample}' has no phenotype value")]
    MissingValue { line: usize, sample: String },
    #[error("line {line}: sample '{sample}' is listed more than once")]
    DuplicateSample { line: usize, sample: String },
    #[error("phenotype value {value} for sample '{sample}' is not finite")]
    NonFinite { sample: String, value: f64 },
    #[error("line {line}: phenotype identifier is not valid UTF-8")]
    InvalidIdentifier { line: usize },
}

/// Sample identifiers paired with their real-valued phenotype, in column order.
#[derive(Debug, Clone, PartialEq)]
pub struct PhenotypeVector {
    samples: Vec<String>,
    values: Vec<f64>,
}

impl PhenotypeVector {
    /// Builds a vector from explicit pairs, rejecting duplicate identifiers and
    /// non-finite values.
    pub fn from_pairs<I, S>(pairs: I) -> Result<Self, PhenotypeError>
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        let mut builder = Builder::default();
        for (sample, value) in pairs {
            let sample = sample.into();
            if !value.is_finite() {
                return Err(PhenotypeError::NonFinite { sample, value });
            }
            builder.push(sample, value, 0)?;
        }
        Ok(builder.finish())
    }

    pub fn from_file(path: &Path) -> Result<Self, PhenotypeError> {
        let bytes = fs::read(path).map_err(|source| PhenotypeError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&bytes)
    }

    /// Parses the phenotype text format.
    pub fn parse(bytes: &[u8]) -> Result<Self, PhenotypeError> {
        let body_start = match memchr::memchr(b'\n', bytes) {
            Some(pos) => pos + 1,
            None => bytes.len(),
        };

        let mut builder = Builder::default();
        let mut pending: Option<(String, usize)> = None;

        for (offset, line) in bytes[body_start..].split(|&b| b == b'\n').enumerate() {
            let line_number = offset + 2;
            for token in line
                .split(|b| b.is_ascii_whitespace())
                .filter(|token| !token.is_empty())
            {
                match pending.take() {
                    None => {
                        let sample = std::str::from_utf8(token)
                            .map_err(|_| PhenotypeError::InvalidIdentifier { line: line_number })?;
                        pending = Some((sample.to_string(), line_number));
                    }
                    Some((sample, _)) => {
                        let value = lexical_core::parse::<f64>(token)
                            .ok()
                            .filter(|v| v.is_finite())
                            .ok_or_else(|| PhenotypeError::Parse {
                                line: line_number,
                                sample: sample.clone(),
                                text: String::from_utf8_lossy(token).into_owned(),
                            })?;
                        builder.push(sample, value, line_number)?;
                    }
                }
            }
        }

        if let Some((sample, line)) = pending {
            return Err(PhenotypeError::MissingValue { line, sample });
        }
        Ok(builder.finish())
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[String] {
        &self.samples
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> + '_ {
        self.samples
            .iter()
            .map(String::as_str)
            .zip(self.values.iter().copied())
    }

    /// A vector restricted to the columns where `keep` is true, order preserved.
    pub fn retain_columns(&self, keep: &[bool]) -> Self {
        debug_assert_eq!(keep.len(), self.len());
        let (samples, values) = self
            .iter()
            .zip(keep)
            .filter(|(_, keep)| **keep)
            .map(|((sample, value), _)| (sample.to_string(), value))
            .unzip();
        Self { samples, values }
    }
}

#[derive(Default)]
struct Builder {
    seen: AHashSet<String>,
    samples: Vec<String>,
    values: Vec<f64>,
}

impl Builder {
    fn push(&mut self, sample: String, value: f64, line: usize) -> Result<(), PhenotypeError> {
        if !self.seen.insert(sample.clone()) {
            return Err(PhenotypeError::DuplicateSample { line, sample });
        }
        self.samples.push(sample);
        self.values.push(value);
        Ok(())
    }

    fn finish(self) -> PhenotypeVector {
        PhenotypeVector {
            samples: self.samples,
            values: self.values,
        }
    }
}
