//! GrabMe Project Model
//!
//! The slice of the editing model the export pipeline consumes:
//! - **Viewport:** normalized crop/zoom rectangles
//! - **Composite:** per-frame compositing parameters and the
//!   [`CompositeSource`] "parameters at time T" contract
//! - **Timeline:** trim regions and effective-to-source time remapping
//!
//! All spatial coordinates are normalized to `[0.0, 1.0]` relative to the
//! capture region so they survive resolution changes between recording
//! and export.

pub mod composite;
pub mod timeline;
pub mod viewport;

pub use composite::*;
pub use timeline::*;
pub use viewport::*;
