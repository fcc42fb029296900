//! Named resource access for script, track and sequence loading

use indexmap::IndexMap;
use log::debug;
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq)]
pub enum ResourceError {
    NotFound(String),
    Io(String, String), // name, message
}

impl fmt::Display for ResourceError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ResourceError::NotFound(name) => write!(f, "Resource not found: {}", name),
            ResourceError::Io(name, msg) => write!(f, "Cannot read resource {}: {}", name, msg),
        }
    }
}

impl std::error::Error for ResourceError {}

pub trait ResourceProvider {
    fn has_resource(&self, name: &str) -> bool;
    fn open(&self, name: &str) -> Result<Vec<u8>, ResourceError>;
}

/// Resources held in memory, keyed by name
#[derive(Debug, Clone, Default)]
pub struct MemoryResources {
    entries: IndexMap<String, Vec<u8>>,
}

impl MemoryResources {
    pub fn new() -> Self {
        MemoryResources::default()
    }

    pub fn insert(&mut self, name: &str, data: impl Into<Vec<u8>>) {
        self.entries.insert(name.to_string(), data.into());
    }

    pub fn with(mut self, name: &str, data: impl Into<Vec<u8>>) -> Self {
        self.insert(name, data);
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(|k| k.as_str())
    }
}

impl ResourceProvider for MemoryResources {
    fn has_resource(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    fn open(&self, name: &str) -> Result<Vec<u8>, ResourceError> {
        self.entries
            .get(name)
            .cloned()
            .ok_or_else(|| ResourceError::NotFound(name.to_string()))
    }
}

/// Resources stored as files in one directory
#[derive(Debug, Clone)]
pub struct DirectoryResources {
    root: PathBuf,
}

impl DirectoryResources {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DirectoryResources { root: root.into() }
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

impl ResourceProvider for DirectoryResources {
    fn has_resource(&self, name: &str) -> bool {
        self.path_for(name).is_file()
    }

    fn open(&self, name: &str) -> Result<Vec<u8>, ResourceError> {
        let path = self.path_for(name);
        debug!("Opening resource {}", path.display());
        std::fs::read(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ResourceError::NotFound(name.to_string()),
            _ => ResourceError::Io(name.to_string(), e.to_string()),
        })
    }
}
