//! Runtime configuration
//!
//! Limits and knobs for the VM and orchestrator, loadable from a TOML file.
//! Every field has a default so a partial file (or none) is fine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Which sequence resource variant to prefer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetailLevel {
    High,
    Low,
}

impl DetailLevel {
    /// Suffix replacing the last character of a sequence resource name
    pub fn suffix(self) -> char {
        match self {
            DetailLevel::High => 'H',
            DetailLevel::Low => 'L',
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// Instructions one `execute` call may dispatch before the script is
    /// aborted as runaway. Zero disables the valve.
    pub safety_valve: u32,
    /// Instructions dispatched per tick before a script yields
    pub tick_budget: Option<u32>,
    pub max_call_depth: usize,
    /// Operand stack limit per script thread
    pub max_stack: usize,
    /// Digits after the point when floats become strings
    pub float_precision: usize,
    /// Fixed seed for the `random` builtin, for reproducible runs
    pub random_seed: Option<u64>,
    pub detail: DetailLevel,
    /// Resolution diagnostics retained on the VM
    pub max_diagnostics: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            safety_valve: 1000,
            tick_budget: None,
            max_call_depth: 64,
            max_stack: 1024,
            float_precision: 4,
            random_seed: None,
            detail: DetailLevel::High,
            max_diagnostics: 256,
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::Io(msg) => write!(f, "Cannot read config: {}", msg),
            ConfigError::Parse(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl VmConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}
