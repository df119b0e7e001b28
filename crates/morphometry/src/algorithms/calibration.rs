//! Physical scale from a fiducial marker, and the raster footprint that keeps
//! the marker out of segmentation.

use image::{GrayImage, Luma};
use imageproc::distance_transform::Norm;
use imageproc::point::Point as PixelPoint;
use tracing::{debug, warn};

use crate::{
    algorithms::threshold::radius,
    traits::MarkerDetector,
    types::{CalibrationResult, MarkerCorners},
};

/// Derives `mm_per_pixel` from the first marker a detector reports.
pub struct Calibrator<'a> {
    detector: &'a dyn MarkerDetector,
    marker_length_mm: f64,
}

impl<'a> Calibrator<'a> {
    pub fn new(detector: &'a dyn MarkerDetector, marker_length_mm: f64) -> Self {
        Self {
            detector,
            marker_length_mm,
        }
    }

    /// Never fails: a missing marker, a detector error or a degenerate
    /// quadrilateral all come back as `succeeded == false`.
    pub fn calibrate(&self, gray: &GrayImage) -> CalibrationResult {
        self.survey(gray).0
    }

    /// Calibrate, and also return the outline of every marker detected.
    /// Only the first marker sets the scale; all of them must be masked.
    pub fn survey(&self, gray: &GrayImage) -> (CalibrationResult, Vec<MarkerCorners>) {
        let markers = match self.detector.detect_markers(gray) {
            Ok(markers) => markers,
            Err(e) => {
                warn!(error = %e, "marker detection failed");
                return (CalibrationResult::failed(), Vec::new());
            }
        };
        let outlines: Vec<MarkerCorners> = markers.iter().map(|m| m.corners).collect();

        let Some(first) = markers.first() else {
            warn!("calibration marker not found");
            return (CalibrationResult::failed(), outlines);
        };
        if markers.len() > 1 {
            debug!(count = markers.len(), "several markers found, using the first");
        }

        match CalibrationResult::from_marker(first.corners, self.marker_length_mm, gray.width(), gray.height()) {
            Some(result) => {
                debug!(
                    marker_id = first.id,
                    mm_per_pixel = result.mm_per_pixel,
                    "calibrated"
                );
                (result, outlines)
            }
            None => {
                warn!(
                    marker_id = first.id,
                    marker_length_mm = self.marker_length_mm,
                    "marker geometry or length gives no usable scale"
                );
                (CalibrationResult::failed(), outlines)
            }
        }
    }
}

/// Pixels that must never become bean foreground. Non-zero in `keep` means
/// the pixel is usable.
#[derive(Debug, Clone, PartialEq)]
pub struct ExclusionMask {
    keep: GrayImage,
}

impl ExclusionMask {
    /// A mask that excludes nothing.
    pub fn none(width: u32, height: u32) -> Self {
        Self {
            keep: GrayImage::from_pixel(width, height, Luma([255])),
        }
    }

    /// Exclude the marker quadrilateral, grown by a square element of side
    /// `max(3, odd(round(min(width, height) * margin_ratio)))`.
    pub fn around_marker(corners: &MarkerCorners, width: u32, height: u32, margin_ratio: f64) -> Self {
        Self::around_markers(std::slice::from_ref(corners), width, height, margin_ratio)
    }

    /// Exclude every quadrilateral, each grown like [`ExclusionMask::around_marker`].
    pub fn around_markers(markers: &[MarkerCorners], width: u32, height: u32, margin_ratio: f64) -> Self {
        let mut excluded = GrayImage::new(width, height);
        if width == 0 || height == 0 {
            return Self { keep: excluded };
        }

        for corners in markers {
            let mut polygon: Vec<PixelPoint<i32>> = corners
                .iter()
                .map(|&[x, y]| PixelPoint::new(x.round() as i32, y.round() as i32))
                .collect();
            polygon.dedup();
            if polygon.len() > 1 && polygon.first() == polygon.last() {
                polygon.pop();
            }
            if polygon.len() >= 3 {
                imageproc::drawing::draw_polygon_mut(&mut excluded, &polygon, Luma([255]));
            }
        }

        let grown = imageproc::morphology::dilate(&excluded, Norm::LInf, radius(margin_size(width, height, margin_ratio)));
        let keep = GrayImage::from_fn(width, height, |x, y| {
            if grown.get_pixel(x, y)[0] > 0 { Luma([0]) } else { Luma([255]) }
        });
        Self { keep }
    }

    /// The calibration marker plus any other markers in frame. Nothing is
    /// excluded when calibration failed.
    pub fn for_calibration(
        calibration: &CalibrationResult,
        others: &[MarkerCorners],
        width: u32,
        height: u32,
        margin_ratio: f64,
    ) -> Self {
        match (&calibration.marker_corners, calibration.succeeded) {
            (Some(corners), true) => {
                let mut markers = vec![*corners];
                markers.extend(others.iter().filter(|&other| other != corners));
                Self::around_markers(&markers, width, height, margin_ratio)
            }
            _ => Self::none(width, height),
        }
    }

    /// Clear every excluded pixel in `mask`.
    pub fn apply(&self, mask: &mut GrayImage) {
        super::threshold::intersect(mask, &self.keep);
    }

    pub fn excludes(&self, x: u32, y: u32) -> bool {
        self.keep.get_pixel_checked(x, y).is_none_or(|p| p[0] == 0)
    }

    pub fn excluded_pixels(&self) -> u64 {
        self.keep.pixels().filter(|p| p[0] == 0).count() as u64
    }
}

fn margin_size(width: u32, height: u32, margin_ratio: f64) -> u32 {
    let scaled = (width.min(height) as f64 * margin_ratio).round() as u32;
    (scaled | 1).max(3)
}
