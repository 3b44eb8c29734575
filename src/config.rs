//! Converter configuration.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Default capacity of the converter input and output queues.
pub const DEFAULT_QUEUE_CAPACITY: usize = 16;

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

/// Settings pairing a converter executable with its cache file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConverterConfig {
    /// Name shown in log output
    pub name: String,
    /// Filter executable, run without arguments
    pub executable: PathBuf,
    /// Cache file holding converted streams
    pub cache_path: PathBuf,
    /// Capacity of the input and output queues (0 = rendezvous)
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl ConverterConfig {
    pub fn new(
        name: impl Into<String>,
        executable: impl Into<PathBuf>,
        cache_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            executable: executable.into(),
            cache_path: cache_path.into(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    /// Set the queue capacity.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Check the configuration for obviously unusable values.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Config("converter name is empty".to_string()));
        }
        if self.executable.as_os_str().is_empty() {
            return Err(Error::Config(format!(
                "converter {} has no executable",
                self.name
            )));
        }
        if self.cache_path.as_os_str().is_empty() {
            return Err(Error::Config(format!(
                "converter {} has no cache path",
                self.name
            )));
        }
        Ok(())
    }

    /// Load and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Self =
            serde_json::from_str(&content).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save the configuration to a file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content =
            serde_json::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        fs::write(path, content)?;
        Ok(())
    }
}
