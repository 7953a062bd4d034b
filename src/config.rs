// ========================================================================================
//                                 Run Configuration
// ========================================================================================

use crate::kmer::MAX_K;
use crate::types::SamplePolicy;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("k must be between 1 and {MAX_K}, got {0}.")]
    InvalidK(usize),
    #[error("chunk_count must be at least 1.")]
    ZeroChunks,
    #[error("threads must be at least 1 when set.")]
    ZeroThreads,
    #[error("Database template '{0}' does not contain the {{sample}} placeholder.")]
    TemplateWithoutSample(String),
}

/// Tunables of one run. Every field has a default, so a TOML file only needs to name
/// what it changes; command-line flags are applied on top of the file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// K-mer length every sample database must have been built with.
    pub k: usize,
    /// Number of hash partitions the k-mer space is split into. Peak memory is roughly
    /// one partition's distinct k-mers plus the retained set.
    pub chunk_count: usize,
    /// Capacity K of the retained set.
    pub retained: usize,
    /// Occurrence counts below this threshold count as absence.
    pub min_count: u32,
    pub sample_policy: SamplePolicy,
    /// Per-sample database path relative to the database root.
    pub db_template: String,
    /// Worker threads; all cores when unset.
    pub threads: Option<usize>,
    pub write_presence_table: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            k: 31,
            chunk_count: 64,
            retained: 10_000,
            min_count: 2,
            sample_policy: SamplePolicy::Strict,
            db_template: "{sample}.kdb".to_string(),
            threads: None,
            write_presence_table: false,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        Ok(config)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.k == 0 || self.k > MAX_K {
            return Err(ConfigError::InvalidK(self.k));
        }
        if self.chunk_count == 0 {
            return Err(ConfigError::ZeroChunks);
        }
        if self.threads == Some(0) {
            return Err(ConfigError::ZeroThreads);
        }
        if !self.db_template.contains("{sample}") {
            return Err(ConfigError::TemplateWithoutSample(self.db_template.clone()));
        }
        Ok(())
    }

    /// Worker threads the run will use.
    pub fn effective_threads(&self) -> usize {
        self.threads.unwrap_or_else(num_cpus::get).max(1)
    }
}
