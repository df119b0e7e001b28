pub mod calibration;
pub mod dictionary;
pub mod features;
pub mod localization;
pub mod marker;
pub mod refinement;
pub mod separation;
pub mod threshold;

pub use calibration::*;
pub use features::*;
pub use localization::*;
pub use marker::*;
pub use refinement::*;
pub use separation::*;
