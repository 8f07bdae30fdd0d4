//! # Soak Configuration
//!
//! ```toml
//! stacks = 2000
//! primitives = 20
//! min_stack_size = 4096
//! arena_capacity = 67108864
//! seed = 42
//! ```
//!
//! Every key is optional. The same seed always produces the same run.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{SoakError, SoakResult};

/// Largest jump pushed between values, exclusive.
pub const MAX_JUMP: u64 = 100;

/// Worst-case stack bytes needed per primitive of each type, plus one jump.
///
/// i8 + i16 + u16 + i32 + f32 + i64 + f64 + jump
pub const MAX_BYTES_PER_PRIMITIVE: u64 = 1 + 2 + 2 + 4 + 4 + 8 + 8 + (MAX_JUMP - 1);

/// Settings of one soak run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SoakConfig {
    /// Number of stacks claimed at once.
    pub stacks: usize,
    /// Values of each primitive type pushed per stack.
    pub primitives: usize,
    /// Smallest stack size; sizes are drawn from `min..2 * min`.
    pub min_stack_size: u64,
    /// Arena size of the manager under test.
    pub arena_capacity: u64,
    /// Seed of the random number generator.
    pub seed: u64,
}

impl Default for SoakConfig {
    fn default() -> Self {
        Self {
            stacks: 2000,
            primitives: 20,
            min_stack_size: 4096,
            arena_capacity: 64 * 1024 * 1024,
            seed: 0x5EED,
        }
    }
}

impl SoakConfig {
    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`SoakError::InvalidConfig`] if the document is malformed or
    /// fails [`validate`](Self::validate).
    pub fn from_toml_str(source: &str) -> SoakResult<Self> {
        let config: Self =
            toml::from_str(source).map_err(|error| SoakError::InvalidConfig(error.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`SoakError::InvalidConfig`] if the file can't be read or is invalid.
    pub fn load(path: impl AsRef<Path>) -> SoakResult<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|error| SoakError::InvalidConfig(format!("failed to read {}: {error}", path.display())))?;
        Self::from_toml_str(&source)
    }

    /// Smallest stack that can hold one full frame of values.
    #[must_use]
    pub fn required_stack_size(&self) -> u64 {
        (self.primitives as u64).saturating_mul(MAX_BYTES_PER_PRIMITIVE).max(1)
    }

    /// Checks that every stack can hold its values.
    ///
    /// The arena size is not checked against the stack count; a run that
    /// doesn't fit fails with an out-of-memory error instead.
    ///
    /// # Errors
    ///
    /// Returns [`SoakError::InvalidConfig`] for stacks too small for the
    /// configured number of primitives, or a zero arena.
    pub fn validate(&self) -> SoakResult<()> {
        if self.arena_capacity == 0 {
            return Err(SoakError::InvalidConfig("arena_capacity must be at least 1 byte".to_string()));
        }
        let required = self.required_stack_size();
        if self.min_stack_size < required {
            return Err(SoakError::InvalidConfig(format!(
                "min_stack_size {} can't hold {} primitives per type, need at least {required}",
                self.min_stack_size, self.primitives
            )));
        }
        if self.min_stack_size.checked_mul(2).is_none() {
            return Err(SoakError::InvalidConfig(format!(
                "min_stack_size {} is too large",
                self.min_stack_size
            )));
        }
        Ok(())
    }
}
