//! # Vulko
//!
//! Tools built on the Vulko memory subsystem.
//!
//! The soak driver hammers a [`MemoryManager`](vulko_memory::MemoryManager)
//! with thousands of randomly sized stacks, pushes random values of every
//! primitive type, pops them back in reverse and checks every bit. A run
//! that finishes without error has also closed its manager cleanly, so no
//! claim or heap block was leaked.
//!
//! ## Example
//!
//! ```rust,ignore
//! use vulko::{soak, SoakConfig};
//!
//! let config = SoakConfig::load("soak.toml")?;
//! let report = soak::run(&config)?;
//! println!("{report}");
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod config;
pub mod error;
pub mod soak;

pub use config::SoakConfig;
pub use error::{SoakError, SoakResult};
pub use soak::SoakReport;
