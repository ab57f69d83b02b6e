//! Boss configuration.
//!
//! Loaded from TOML:
//!
//! ```toml
//! region_sections = 256
//!
//! [cpu]
//! enabled = true
//! priority = 1
//! workers = 4
//!
//! [dsp]
//! enabled = false
//! priority = 2
//!
//! [rpc]
//! restart_retries = 3
//!
//! [memory]
//! limit_bytes = 67108864
//! ```
//!
//! Every key is optional.

use std::path::Path;

use dvp_mem::MemoryConfig;
use dvp_rpc::RpcConfig;
use serde::{Deserialize, Serialize};

use crate::error::{KernelError, Result};

/// Default number of section slots in the shared graph region.
pub const DEFAULT_REGION_SECTIONS: usize = 256;

const MAX_DEFAULT_WORKERS: usize = 8;

/// Settings for the built-in CPU manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuConfig {
    pub enabled: bool,
    pub priority: u32,
    /// Concurrent blocking kernel executions.
    pub workers: usize,
}

impl Default for CpuConfig {
    fn default() -> Self {
        let workers = std::thread::available_parallelism()
            .map(usize::from)
            .unwrap_or(1)
            .min(MAX_DEFAULT_WORKERS);
        Self {
            enabled: true,
            priority: 1,
            workers,
        }
    }
}

/// Settings for the built-in remote DSP manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DspConfig {
    pub enabled: bool,
    pub priority: u32,
}

impl Default for DspConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            priority: 2,
        }
    }
}

/// Top-level configuration for [`Boss`](crate::boss::Boss).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BossConfig {
    /// Section slots in the shared graph region.  Zero makes `init` fail.
    pub region_sections: usize,
    pub cpu: CpuConfig,
    pub dsp: DspConfig,
    pub rpc: RpcConfig,
    pub memory: MemoryConfig,
}

impl Default for BossConfig {
    fn default() -> Self {
        Self {
            region_sections: DEFAULT_REGION_SECTIONS,
            cpu: CpuConfig::default(),
            dsp: DspConfig::default(),
            rpc: RpcConfig::default(),
            memory: MemoryConfig::default(),
        }
    }
}

impl BossConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| KernelError::Config {
            reason: format!("failed to parse TOML config: {e}"),
        })
    }

    /// Read and parse a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| KernelError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&content)?;
        tracing::info!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    pub fn with_region_sections(mut self, sections: usize) -> Self {
        self.region_sections = sections;
        self
    }

    pub fn with_cpu(mut self, enabled: bool) -> Self {
        self.cpu.enabled = enabled;
        self
    }

    pub fn with_cpu_workers(mut self, workers: usize) -> Self {
        self.cpu.workers = workers;
        self
    }

    pub fn with_dsp(mut self, enabled: bool) -> Self {
        self.dsp.enabled = enabled;
        self
    }

    pub fn with_restart_retries(mut self, retries: u32) -> Self {
        self.rpc.restart_retries = retries;
        self
    }

    pub fn with_memory_limit(mut self, limit_bytes: usize) -> Self {
        self.memory.limit_bytes = Some(limit_bytes);
        self
    }
}
