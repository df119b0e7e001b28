//! # Bean Morphometry Library
//!
//! Measures coffee beans photographed next to a printed square marker.
//! The marker gives the physical scale; classical segmentation (optionally
//! seeded by a learned detector) finds the beans; a watershed splits the
//! ones that touch; region properties are reported in millimetres.
//!
//! ## Core Features
//!
//! - **Marker calibration**: square fiducial detection with sub-pixel corners
//! - **Two localisation strategies**: detector boxes or a global threshold
//! - **Per-region refinement**: local Otsu thresholds, opening and closing
//! - **Instance separation**: distance-transform watershed
//! - **Call-scoped state**: one `Pipeline` can be shared across threads
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use morphometry::{Pipeline, PipelineStatus};
//!
//! let pipeline = Pipeline::builder().marker_length_mm(20.0).build()?;
//! let image = image::open("beans.jpg")?;
//! let result = pipeline.process(&image)?;
//!
//! match result.status() {
//!     PipelineStatus::MarkerNotFound => eprintln!("place a marker in frame"),
//!     _ => println!("{}", serde_json::to_string_pretty(&result)?),
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Custom Components
//!
//! ```rust,no_run
//! use morphometry::{Pipeline, algorithms::WatershedSeparator};
//!
//! let pipeline = Pipeline::builder()
//!     .set_separator(WatershedSeparator { peak_footprint: 7, min_prominence_px: 1.5, noise_floor_px: 150 })
//!     .build()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod algorithms;
pub mod config;
pub mod debug;
pub mod error;
pub mod pipeline;
pub mod synthetic;
pub mod traits;
pub mod types;

// Re-exports for convenience
pub use config::{MarkerConfig, PipelineConfig, Polarity};
pub use error::{MorphometryError, Result};
pub use pipeline::{Pipeline, PipelineStage, builder::PipelineBuilder};
pub use traits::*;
pub use types::*;
