use image::GrayImage;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum::Display;

/// A point in image space, `[x, y]` in pixels.
pub type Point = [f64; 2];

/// The four corners of a square fiducial marker, in detection order.
pub type MarkerCorners = [Point; 4];

/// Outcome of locating the fiducial marker and deriving the image scale.
///
/// When `succeeded` is false every optional field is `None`; when it is true
/// `mm_per_pixel` is present and strictly positive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CalibrationResult {
    pub succeeded: bool,
    pub mm_per_pixel: Option<f64>,
    pub marker_corners: Option<MarkerCorners>,
    pub marker_size_mm: Option<f64>,
    pub image_width_mm: Option<f64>,
    pub image_height_mm: Option<f64>,
}

impl CalibrationResult {
    pub fn failed() -> Self {
        Self {
            succeeded: false,
            mm_per_pixel: None,
            marker_corners: None,
            marker_size_mm: None,
            image_width_mm: None,
            image_height_mm: None,
        }
    }

    /// Build a successful calibration from the corners of a marker whose
    /// physical side is `marker_length_mm`. Returns `None` for degenerate
    /// quadrilaterals that would yield a non-positive or non-finite scale.
    pub fn from_marker(
        corners: MarkerCorners,
        marker_length_mm: f64,
        image_width: u32,
        image_height: u32,
    ) -> Option<Self> {
        let avg_side_px = average_side_length(&corners);
        let mm_per_pixel = marker_length_mm / avg_side_px;
        if !avg_side_px.is_finite() || avg_side_px <= 0.0 || !mm_per_pixel.is_finite() || mm_per_pixel <= 0.0 {
            return None;
        }

        Some(Self {
            succeeded: true,
            mm_per_pixel: Some(mm_per_pixel),
            marker_corners: Some(corners),
            marker_size_mm: Some(marker_length_mm),
            image_width_mm: Some(image_width as f64 * mm_per_pixel),
            image_height_mm: Some(image_height as f64 * mm_per_pixel),
        })
    }

    /// The scale factor, present only for successful calibrations.
    pub fn scale(&self) -> Option<f64> {
        if self.succeeded { self.mm_per_pixel } else { None }
    }
}

/// Mean Euclidean length of the four sides of a quadrilateral.
pub fn average_side_length(corners: &MarkerCorners) -> f64 {
    let total: f64 = (0..4)
        .map(|i| {
            let [ax, ay] = corners[i];
            let [bx, by] = corners[(i + 1) % 4];
            ((bx - ax).powi(2) + (by - ay).powi(2)).sqrt()
        })
        .sum();
    total / 4.0
}

/// One hit from an object detector, in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DetectionBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    /// Detector confidence in `[0, 1]`.
    pub confidence: f32,
    pub class_id: u32,
}

impl DetectionBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32, confidence: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
            confidence,
            class_id: 0,
        }
    }

    /// Clip the box to an image of the given size. Boxes that fall entirely
    /// outside the image, or have no extent, yield `None`.
    pub fn to_pixel_box(&self, image_width: u32, image_height: u32) -> Option<PixelBox> {
        let finite = [self.x, self.y, self.width, self.height]
            .iter()
            .all(|v| v.is_finite());
        if !finite || self.width <= 0.0 || self.height <= 0.0 {
            return None;
        }

        let x0 = self.x.floor().max(0.0) as i64;
        let y0 = self.y.floor().max(0.0) as i64;
        let x1 = ((self.x + self.width).ceil() as i64).min(image_width as i64);
        let y1 = ((self.y + self.height).ceil() as i64).min(image_height as i64);
        if x1 <= x0 || y1 <= y0 {
            return None;
        }

        Some(PixelBox {
            x: x0 as u32,
            y: y0 as u32,
            width: (x1 - x0) as u32,
            height: (y1 - y0) as u32,
        })
    }
}

/// Axis-aligned integer rectangle `(x, y, width, height)` in pixel space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct PixelBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl PixelBox {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// Smallest box covering the inclusive pixel range `[min, max]`.
    pub fn from_extent(min_x: u32, min_y: u32, max_x: u32, max_y: u32) -> Self {
        Self {
            x: min_x,
            y: min_y,
            width: max_x - min_x + 1,
            height: max_y - min_y + 1,
        }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn right(&self) -> u32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> u32 {
        self.y + self.height
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.x && x < self.right() && y >= self.y && y < self.bottom()
    }
}

/// A single separated bean instance.
///
/// `pixel_mask` is cropped to `bounding_box`: pixel `(x, y)` of the mask
/// corresponds to image pixel `(bounding_box.x + x, bounding_box.y + y)` and
/// is foreground when non-zero.
#[derive(Debug, Clone, PartialEq, Serialize, JsonSchema)]
pub struct BeanRegion {
    /// 1-based index, stable within one pipeline call.
    pub bean_index: usize,
    #[serde(skip)]
    #[schemars(skip)]
    pub pixel_mask: GrayImage,
    pub bounding_box: PixelBox,
    pub pixel_area: u64,
}

impl BeanRegion {
    /// Build a region from absolute pixel coordinates. Returns `None` when
    /// `pixels` is empty.
    pub fn from_pixels(bean_index: usize, pixels: &[(u32, u32)]) -> Option<Self> {
        let (&(first_x, first_y), rest) = pixels.split_first()?;
        let (mut min_x, mut min_y, mut max_x, mut max_y) = (first_x, first_y, first_x, first_y);
        for &(x, y) in rest {
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
        }

        let bounding_box = PixelBox::from_extent(min_x, min_y, max_x, max_y);
        let mut pixel_mask = GrayImage::new(bounding_box.width, bounding_box.height);
        for &(x, y) in pixels {
            pixel_mask.put_pixel(x - min_x, y - min_y, image::Luma([255]));
        }
        let pixel_area = pixel_mask.pixels().filter(|p| p[0] > 0).count() as u64;

        Some(Self {
            bean_index,
            pixel_mask,
            bounding_box,
            pixel_area,
        })
    }

    /// Absolute image coordinates of every foreground pixel, in raster order.
    pub fn pixels(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        let PixelBox { x: ox, y: oy, .. } = self.bounding_box;
        self.pixel_mask
            .enumerate_pixels()
            .filter(|(_, _, p)| p[0] > 0)
            .map(move |(x, y, _)| (ox + x, oy + y))
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        self.bounding_box.contains(x, y)
            && self.pixel_mask.get_pixel(x - self.bounding_box.x, y - self.bounding_box.y)[0] > 0
    }
}

/// Physically scaled morphometric descriptors of one bean.
///
/// Lengths are in millimetres, areas in square millimetres; `eccentricity`,
/// `extent`, `solidity`, `mean_intensity` and `aspect_ratio` are unitless.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FeatureSet {
    pub area_mm2: f64,
    pub perimeter_mm: f64,
    pub major_axis_length_mm: f64,
    pub minor_axis_length_mm: f64,
    pub eccentricity: f64,
    pub extent: f64,
    pub equivalent_diameter_mm: f64,
    pub solidity: f64,
    /// Mean grayscale value inside the region, normalised to `[0, 1]`.
    pub mean_intensity: f64,
    pub aspect_ratio: f64,
    pub convex_area_mm2: f64,
}

/// A separated region together with its measurements.
#[derive(Debug, Clone, PartialEq, Serialize, JsonSchema)]
pub struct Bean {
    #[serde(flatten)]
    pub region: BeanRegion,
    /// Major axis length, in millimetres.
    pub length_mm: f64,
    /// Minor axis length, in millimetres.
    pub width_mm: f64,
    pub features: FeatureSet,
}

impl Bean {
    pub fn new(region: BeanRegion, features: FeatureSet) -> Self {
        Self {
            length_mm: features.major_axis_length_mm,
            width_mm: features.minor_axis_length_mm,
            region,
            features,
        }
    }
}

/// Caller-facing classification of a completed pipeline call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Display)]
#[serde(tag = "status", rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PipelineStatus {
    /// No fiducial marker was found; nothing past calibration ran.
    MarkerNotFound,
    /// Calibration succeeded but segmentation produced no beans.
    NoBeansDetected,
    BeansMeasured { count: usize },
}

/// Terminal artifact of one pipeline call.
#[derive(Debug, Clone, PartialEq, Serialize, JsonSchema)]
pub struct PipelineResult {
    pub calibration: CalibrationResult,
    pub beans: Vec<Bean>,
}

impl PipelineResult {
    pub fn marker_not_found() -> Self {
        Self {
            calibration: CalibrationResult::failed(),
            beans: Vec::new(),
        }
    }

    pub fn status(&self) -> PipelineStatus {
        if !self.calibration.succeeded {
            PipelineStatus::MarkerNotFound
        } else if self.beans.is_empty() {
            PipelineStatus::NoBeansDetected
        } else {
            PipelineStatus::BeansMeasured {
                count: self.beans.len(),
            }
        }
    }

    /// Turn a missing marker into an error, for callers that want a strict
    /// `Result` rather than inspecting [`PipelineResult::status`].
    pub fn require_calibration(self) -> crate::Result<Self> {
        if self.calibration.succeeded {
            Ok(self)
        } else {
            Err(crate::MorphometryError::CalibrationMarkerNotFound)
        }
    }

    pub fn total_area_mm2(&self) -> f64 {
        self.beans.iter().map(|b| b.features.area_mm2).sum()
    }

    /// The bean with the largest area, if any.
    pub fn largest(&self) -> Option<&Bean> {
        self.beans
            .iter()
            .max_by(|a, b| a.features.area_mm2.total_cmp(&b.features.area_mm2))
    }

    pub fn to_json(&self) -> crate::Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}
