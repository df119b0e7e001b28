use image::{GrayImage, RgbImage};

use crate::{
    algorithms::marker::DetectedMarker,
    error::Result,
    types::{BeanRegion, DetectionBox, FeatureSet},
};

/// Trait for fiducial marker detection
pub trait MarkerDetector: Send + Sync {
    /// Detect markers in a grayscale image. Order is the detector's own and
    /// callers that need one marker take the first.
    fn detect_markers(&self, image: &GrayImage) -> Result<Vec<DetectedMarker>>;
}

/// Trait for a learned bean detector.
///
/// Implementations are shared across concurrent pipeline calls and must
/// not mutate state during inference.
pub trait BeanDetector: Send + Sync {
    /// Return candidate boxes with confidence at or above `confidence_threshold`.
    fn detect(&self, image: &RgbImage, confidence_threshold: f32) -> Result<Vec<DetectionBox>>;
}

/// Trait for turning a coarse foreground mask into a tight one
pub trait RegionRefiner: Send + Sync {
    /// Refine every connected region of `coarse_mask` against `grayscale`.
    fn refine(&self, grayscale: &GrayImage, coarse_mask: &GrayImage) -> Result<GrayImage>;
}

/// Trait for splitting a foreground mask into bean instances
pub trait InstanceSeparator: Send + Sync {
    fn separate(&self, mask: &GrayImage) -> Result<Vec<BeanRegion>>;
}

/// Trait for measuring one separated region
pub trait FeatureExtractor: Send + Sync {
    /// Compute scaled descriptors. `mm_per_pixel` belongs to the current
    /// call and is never retained.
    fn compute(&self, region: &BeanRegion, grayscale: &GrayImage, mm_per_pixel: f64) -> Result<FeatureSet>;
}
