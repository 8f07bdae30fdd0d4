//! # Memory Configuration
//!
//! Startup settings for the root manager, loaded once from TOML:
//!
//! ```toml
//! arena_capacity = 67108864
//! allow_external = true
//! heap_limit = 134217728
//! ```
//!
//! Every key is optional.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{MemoryError, MemoryResult};
use crate::manager::MemoryManager;
use crate::raw::RawAllocator;

/// Default arena size: 64 MiB.
pub const DEFAULT_ARENA_CAPACITY: u64 = 64 * 1024 * 1024;

/// Settings for the heap and the root manager.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MemoryConfig {
    /// Size of the root manager's arena in bytes.
    pub arena_capacity: u64,
    /// Whether claims that fit nowhere may fall back to the raw allocator.
    pub allow_external: bool,
    /// Cap on live raw bytes. `None` means unlimited.
    pub heap_limit: Option<u64>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            arena_capacity: DEFAULT_ARENA_CAPACITY,
            allow_external: true,
            heap_limit: None,
        }
    }
}

impl MemoryConfig {
    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidConfig`] if the document is malformed
    /// or fails [`validate`](Self::validate).
    pub fn from_toml_str(source: &str) -> MemoryResult<Self> {
        let config: Self =
            toml::from_str(source).map_err(|error| MemoryError::InvalidConfig(error.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidConfig`] if the file can't be read or
    /// its contents are invalid.
    pub fn load(path: impl AsRef<Path>) -> MemoryResult<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|error| {
            MemoryError::InvalidConfig(format!("failed to read {}: {error}", path.display()))
        })?;
        let config = Self::from_toml_str(&source)?;
        tracing::debug!("loaded memory config from {}: {:?}", path.display(), config);
        Ok(config)
    }

    /// Checks that the settings can produce a working manager.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidConfig`] for a zero arena, or an arena
    /// larger than the heap limit.
    pub fn validate(&self) -> MemoryResult<()> {
        if self.arena_capacity == 0 {
            return Err(MemoryError::InvalidConfig(
                "arena_capacity must be at least 1 byte".to_string(),
            ));
        }
        if let Some(limit) = self.heap_limit {
            if self.arena_capacity > limit {
                return Err(MemoryError::InvalidConfig(format!(
                    "arena_capacity {} exceeds heap_limit {limit}",
                    self.arena_capacity
                )));
            }
        }
        Ok(())
    }

    /// Builds the raw allocator described by these settings.
    #[must_use]
    pub fn heap(&self) -> Arc<RawAllocator> {
        Arc::new(match self.heap_limit {
            Some(limit) => RawAllocator::with_limit(limit),
            None => RawAllocator::new(),
        })
    }

    /// Builds the root manager on top of `heap`.
    ///
    /// # Errors
    ///
    /// Fails like [`MemoryManager::new`].
    pub fn manager(&self, heap: Arc<RawAllocator>) -> MemoryResult<MemoryManager> {
        MemoryManager::new(heap, self.arena_capacity, self.allow_external)
    }
}
