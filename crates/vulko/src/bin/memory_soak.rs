//! # Vulko Memory Soak
//!
//! Stress test for the memory subsystem: thousands of stacks, random values
//! of every primitive type, bit-exact verification, and a leak check at the
//! end.
//!
//! ```bash
//! # Default settings
//! ./memory_soak
//!
//! # Settings from a TOML file, with debug summaries
//! RUST_LOG=debug ./memory_soak soak.toml
//! ```

use std::process::ExitCode;

use tracing_subscriber::EnvFilter;
use vulko::{soak, SoakConfig};

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("═══════════════════════════════════════════════════════════════════");
    println!("                    VULKO MEMORY SOAK v{}", env!("CARGO_PKG_VERSION"));
    println!("═══════════════════════════════════════════════════════════════════");
    println!();

    let config = match std::env::args().nth(1) {
        Some(path) => match SoakConfig::load(&path) {
            Ok(config) => {
                println!("  Config:   {path}");
                config
            }
            Err(error) => {
                eprintln!("   ✗ FATAL: {error}");
                return ExitCode::FAILURE;
            }
        },
        None => {
            println!("  Config:   defaults");
            SoakConfig::default()
        }
    };
    println!("  Stacks:   {}", config.stacks);
    println!("  Values:   {} per type and stack", config.primitives);
    println!("  Arena:    {} bytes", config.arena_capacity);
    println!("  Seed:     {}", config.seed);
    println!();

    match soak::run(&config) {
        Ok(report) => {
            println!("{report}");
            println!();
            println!("   ✓ Closed manager, no leaks");
            ExitCode::SUCCESS
        }
        Err(error) => {
            eprintln!("   ✗ FATAL: {error}");
            ExitCode::FAILURE
        }
    }
}
