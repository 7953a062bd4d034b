// ========================================================================================
//                             High-Level Data Contracts
// ========================================================================================

// Small types used by both the engine and the driver.

use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// How the engine reacts to a per-sample database that exists but cannot be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SamplePolicy {
    /// Any unreadable database aborts the run.
    #[default]
    Strict,
    /// Unreadable databases are dropped from the study before the first chunk is
    /// built, so every remaining column is consistent across all chunks.
    BestEffort,
}

impl fmt::Display for SamplePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Strict => f.write_str("strict"),
            Self::BestEffort => f.write_str("best-effort"),
        }
    }
}

/// A cloneable abort flag shared between the orchestrator and the streaming workers.
///
/// Workers poll it between batches of k-mers; once raised it is never lowered.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}
