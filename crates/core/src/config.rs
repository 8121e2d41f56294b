//! Tunables for the distance engine and the RSA comparator.

use std::path::Path;

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::error::{RdmError, RdmResult};

/// Row block size used when the caller does not pick one.
pub const DEFAULT_CHUNK_SIZE: usize = 5000;
pub const DEFAULT_SEED: u64 = 42;

/// How block pairs are scheduled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, EnumString, Display)]
#[strum(ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum Execution {
    #[default]
    #[strum(serialize = "seq", to_string = "sequential")]
    Sequential,
    #[strum(serialize = "par", to_string = "parallel")]
    Parallel,
}

/// Configuration for the chunked distance engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Rows per block; bounds peak working memory per block pair.
    pub chunk_size: usize,
    pub execution: Execution,
    /// Emit an info-level progress event every this many block pairs.
    pub progress_every: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            execution: Execution::Sequential,
            progress_every: 1,
        }
    }
}

/// Configuration for RDM comparison.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RsaConfig {
    /// Subsample this many rows/columns per comparison; `None` compares exactly.
    pub max_samples: Option<usize>,
    pub seed: u64,
}

impl Default for RsaConfig {
    fn default() -> Self {
        Self {
            max_samples: None,
            seed: DEFAULT_SEED,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub engine: EngineConfig,
    pub rsa: RsaConfig,
}

impl AnalysisConfig {
    pub fn from_json_str(text: &str) -> RdmResult<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> RdmResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> RdmResult<()> {
        if self.engine.chunk_size == 0 {
            return Err(RdmError::InvalidConfig("chunk_size must be greater than 0".into()));
        }
        if self.rsa.max_samples == Some(0) {
            return Err(RdmError::InvalidConfig("max_samples must be greater than 0".into()));
        }
        Ok(())
    }
}
