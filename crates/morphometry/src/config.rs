use std::fs;
use std::path::Path;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::algorithms::dictionary::ARUCO_4X4_CODES;
use crate::error::{MorphometryError, Result};

/// Which side of a threshold holds the beans.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Polarity {
    /// Beans are darker than the surface: the brighter side is background.
    #[default]
    Dark,
    /// Beans are lighter than the surface.
    Light,
    /// Whichever side covers fewer pixels is foreground.
    Auto,
}

/// Square fiducial marker detection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct MarkerConfig {
    /// Number of data cells per side, excluding the one-cell border.
    #[schemars(range(min = 3, max = 8))]
    pub bits: u32,
    /// Dictionary codes, row-major, most significant bit first, 1 = white cell.
    pub codes: Vec<u64>,
    /// Window radii (pixels) for the local-mean binarisations.
    pub adaptive_radii: Vec<u32>,
    /// Offset subtracted from the local mean before comparison.
    pub adaptive_offset: u8,
    /// Minimum contour length as a fraction of the larger image dimension.
    pub min_perimeter_rate: f64,
    /// Maximum contour length as a fraction of the larger image dimension.
    pub max_perimeter_rate: f64,
    /// Douglas-Peucker tolerance as a fraction of the contour length.
    pub polygon_accuracy_rate: f64,
    /// Shortest acceptable side of a candidate quadrilateral, in pixels.
    pub min_side_px: f64,
    /// Fraction of border cells allowed to read as white.
    pub max_border_error_rate: f64,
    /// Bits that may differ from a dictionary code.
    pub max_correction_bits: u32,
    /// Minimum brightness difference between darkest and brightest cell.
    pub min_cell_contrast: f64,
}

impl Default for MarkerConfig {
    fn default() -> Self {
        Self {
            bits: 4,
            codes: ARUCO_4X4_CODES.to_vec(),
            adaptive_radii: vec![7, 17, 37],
            adaptive_offset: 7,
            min_perimeter_rate: 0.03,
            max_perimeter_rate: 4.0,
            polygon_accuracy_rate: 0.03,
            min_side_px: 8.0,
            max_border_error_rate: 0.35,
            max_correction_bits: 0,
            min_cell_contrast: 40.0,
        }
    }
}

/// Every tunable of the morphometry pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct PipelineConfig {
    /// Physical side length of the printed marker.
    #[schemars(range(min = 0.1))]
    pub marker_length_mm: f64,
    /// Detector hits below this confidence are discarded.
    #[schemars(range(min = 0.0, max = 1.0))]
    pub confidence_threshold: f32,
    /// Regions whose pixel area is at or below this are treated as noise.
    pub noise_floor_px: u64,
    /// Side of the square neighbourhood used to find watershed seeds.
    /// Larger values merge closely seeded instances; smaller values risk
    /// splitting one bean into several.
    pub peak_footprint: u32,
    /// How far, in pixels of distance to background, a peak must rise above
    /// the pass joining it to a higher peak to seed a bean of its own.
    pub min_peak_prominence_px: f64,
    /// Side of the square opening element (odd).
    pub open_size: u32,
    /// Side of the square closing element (odd).
    pub close_size: u32,
    /// Median filter radius expressed in millimetres.
    pub denoise_radius_mm: f64,
    /// Median filter radius used when no scale is known.
    pub fallback_denoise_radius_px: u32,
    /// Upper bound on the median filter radius.
    pub max_denoise_radius_px: u32,
    /// Extra margin around the marker footprint, relative to the shorter image side.
    pub exclusion_margin_ratio: f64,
    pub polarity: Polarity,
    pub marker: MarkerConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            marker_length_mm: 20.0,
            confidence_threshold: 0.6,
            noise_floor_px: 100,
            peak_footprint: 3,
            min_peak_prominence_px: 1.0,
            open_size: 3,
            close_size: 5,
            denoise_radius_mm: 0.5,
            fallback_denoise_radius_px: 5,
            max_denoise_radius_px: 15,
            exclusion_margin_ratio: 0.004,
            polarity: Polarity::Dark,
            marker: MarkerConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Reject settings that would make every image fail or produce nonsense.
    pub fn validate(&self) -> Result<()> {
        if !self.marker_length_mm.is_finite() || self.marker_length_mm <= 0.0 {
            return Err(MorphometryError::configuration(
                "marker_length_mm",
                format!("must be a positive length, got {}", self.marker_length_mm),
            ));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(MorphometryError::configuration(
                "confidence_threshold",
                format!("must lie in [0, 1], got {}", self.confidence_threshold),
            ));
        }
        if self.peak_footprint == 0 {
            return Err(MorphometryError::configuration("peak_footprint", "must be at least 1"));
        }
        if !self.min_peak_prominence_px.is_finite() || self.min_peak_prominence_px < 0.0 {
            return Err(MorphometryError::configuration(
                "min_peak_prominence_px",
                format!("must be a non-negative distance, got {}", self.min_peak_prominence_px),
            ));
        }
        for (field, size) in [("open_size", self.open_size), ("close_size", self.close_size)] {
            if size == 0 || size % 2 == 0 {
                return Err(MorphometryError::configuration(
                    field,
                    format!("must be a positive odd size, got {size}"),
                ));
            }
        }
        if !self.denoise_radius_mm.is_finite() || self.denoise_radius_mm < 0.0 {
            return Err(MorphometryError::configuration(
                "denoise_radius_mm",
                "must be a non-negative length",
            ));
        }
        if !self.exclusion_margin_ratio.is_finite() || self.exclusion_margin_ratio < 0.0 {
            return Err(MorphometryError::configuration(
                "exclusion_margin_ratio",
                "must be non-negative",
            ));
        }
        self.marker.validate()
    }

    /// Load configuration from a TOML file
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load configuration from a JSON file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Load configuration from a JSON string
    pub fn from_json(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    /// Auto-detect file format from the extension and load configuration
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        match path_ref.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Self::from_toml_file(path),
            Some("json") => Self::from_json_file(path),
            other => Err(MorphometryError::configuration(
                "config_path",
                format!("unsupported file extension {other:?}, use .toml or .json"),
            )),
        }
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// JSON schema describing every configuration field.
    pub fn schema() -> schemars::schema::RootSchema {
        schemars::schema_for!(PipelineConfig)
    }
}

impl MarkerConfig {
    pub fn validate(&self) -> Result<()> {
        if !(3..=8).contains(&self.bits) {
            return Err(MorphometryError::configuration(
                "marker.bits",
                format!("must lie in 3..=8, got {}", self.bits),
            ));
        }
        if self.codes.is_empty() {
            return Err(MorphometryError::configuration("marker.codes", "dictionary is empty"));
        }
        // An 8x8 grid uses all 64 bits, so every code fits.
        let limit = 1u64.checked_shl(self.bits * self.bits);
        if let Some(code) = limit.and_then(|limit| self.codes.iter().find(|&&c| c >= limit)) {
            return Err(MorphometryError::configuration(
                "marker.codes",
                format!("code {code:#x} does not fit a {0}x{0} grid", self.bits),
            ));
        }
        if self.adaptive_radii.contains(&0) {
            return Err(MorphometryError::configuration(
                "marker.adaptive_radii",
                "radii must be positive",
            ));
        }
        if !(self.min_perimeter_rate >= 0.0 && self.min_perimeter_rate < self.max_perimeter_rate) {
            return Err(MorphometryError::configuration(
                "marker.min_perimeter_rate",
                "must be non-negative and below max_perimeter_rate",
            ));
        }
        if !(self.polygon_accuracy_rate > 0.0 && self.polygon_accuracy_rate < 1.0) {
            return Err(MorphometryError::configuration(
                "marker.polygon_accuracy_rate",
                "must lie in (0, 1)",
            ));
        }
        if !(0.0..=1.0).contains(&self.max_border_error_rate) {
            return Err(MorphometryError::configuration(
                "marker.max_border_error_rate",
                "must lie in [0, 1]",
            ));
        }
        Ok(())
    }
}
