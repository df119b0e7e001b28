//! Coarse bean localisation: detector boxes when a detector is available and
//! finds something, otherwise one global threshold over the whole image.

use image::{GrayImage, Luma, RgbImage};
use imageproc::drawing::draw_filled_rect_mut;
use imageproc::rect::Rect;
use tracing::{debug, warn};

use crate::{
    algorithms::{
        calibration::ExclusionMask,
        threshold::{binarize, foreground_count},
    },
    config::{PipelineConfig, Polarity},
    error::Result,
    traits::BeanDetector,
    types::DetectionBox,
};

/// Output of coarse localisation. The variant decides how the mask is
/// refined downstream.
#[derive(Debug, Clone, PartialEq)]
pub enum CoarseMask {
    /// Union of surviving detector boxes, marker footprint removed. Each
    /// connected region is refined separately.
    DetectorBased { boxes: Vec<DetectionBox>, mask: GrayImage },
    /// Global threshold of the denoised image, marker footprint removed.
    /// Only global cleanup applies.
    GlobalThreshold { mask: GrayImage },
}

impl CoarseMask {
    pub fn mask(&self) -> &GrayImage {
        match self {
            Self::DetectorBased { mask, .. } | Self::GlobalThreshold { mask } => mask,
        }
    }

    pub fn into_mask(self) -> GrayImage {
        match self {
            Self::DetectorBased { mask, .. } | Self::GlobalThreshold { mask } => mask,
        }
    }

    pub fn boxes(&self) -> &[DetectionBox] {
        match self {
            Self::DetectorBased { boxes, .. } => boxes,
            Self::GlobalThreshold { .. } => &[],
        }
    }

    pub fn strategy(&self) -> &'static str {
        match self {
            Self::DetectorBased { .. } => "detector",
            Self::GlobalThreshold { .. } => "global_threshold",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoarseLocalizer {
    pub confidence_threshold: f32,
    pub polarity: Polarity,
}

impl CoarseLocalizer {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            confidence_threshold: config.confidence_threshold,
            polarity: config.polarity,
        }
    }

    /// `image` goes to the detector; `denoised` is the grayscale used by the
    /// threshold fallback.
    pub fn localize(
        &self,
        detector: Option<&dyn BeanDetector>,
        image: &RgbImage,
        denoised: &GrayImage,
        exclusion: &ExclusionMask,
    ) -> Result<CoarseMask> {
        if let Some(detector) = detector {
            match detector.detect(image, self.confidence_threshold) {
                Ok(found) => {
                    let boxes: Vec<DetectionBox> = found
                        .into_iter()
                        .filter(|b| b.confidence.is_finite() && (0.0..=1.0).contains(&b.confidence))
                        .filter(|b| b.confidence >= self.confidence_threshold)
                        .collect();

                    if !boxes.is_empty() {
                        let mut mask = rasterize_boxes(&boxes, image.width(), image.height());
                        exclusion.apply(&mut mask);
                        debug!(
                            boxes = boxes.len(),
                            foreground = foreground_count(&mask),
                            "coarse mask from detector"
                        );
                        return Ok(CoarseMask::DetectorBased { boxes, mask });
                    }
                    warn!("detector returned no boxes above threshold, using global threshold");
                }
                // An unavailable detector is the same as having none.
                Err(e) => warn!(error = %e, "detector failed, using global threshold"),
            }
        }

        let mut mask = binarize(denoised, self.polarity);
        exclusion.apply(&mut mask);
        debug!(foreground = foreground_count(&mask), "coarse mask from global threshold");
        Ok(CoarseMask::GlobalThreshold { mask })
    }
}

/// Fill each box, clipped to the image, into a new mask.
pub fn rasterize_boxes(boxes: &[DetectionBox], width: u32, height: u32) -> GrayImage {
    let mut mask = GrayImage::new(width, height);
    for pixel_box in boxes.iter().filter_map(|b| b.to_pixel_box(width, height)) {
        let rect = Rect::at(pixel_box.x as i32, pixel_box.y as i32).of_size(pixel_box.width, pixel_box.height);
        draw_filled_rect_mut(&mut mask, rect, Luma([255]));
    }
    mask
}

/// Median filter radius for a calibrated image: `denoise_radius_mm` in
/// pixels, at least one, at most `max_denoise_radius_px`.
pub fn denoise_radius(config: &PipelineConfig, mm_per_pixel: Option<f64>) -> u32 {
    let radius = match mm_per_pixel {
        Some(k) if k.is_finite() && k > 0.0 => (config.denoise_radius_mm / k).round().max(1.0) as u32,
        _ => config.fallback_denoise_radius_px.max(1),
    };
    radius.min(config.max_denoise_radius_px.max(1))
}

pub fn denoise(gray: &GrayImage, radius: u32) -> GrayImage {
    imageproc::filter::median_filter(gray, radius, radius)
}
