//! GrabMe Common Utilities
//!
//! Shared infrastructure for the export pipeline crates:
//! - Error taxonomy and result aliases
//! - Centralized pipeline configuration
//! - Time-base conversions and the export clock
//! - FIFO backpressure primitives used by every bounded queue
//! - Latency statistics
//! - Tracing/logging initialization

pub mod backpressure;
pub mod clock;
pub mod config;
pub mod error;
pub mod logging;
pub mod stats;

pub use backpressure::*;
pub use clock::*;
pub use config::*;
pub use error::*;
pub use stats::*;
