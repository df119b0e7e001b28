pub mod builder;

use image::{DynamicImage, GenericImageView, GrayImage};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum::Display;
use tracing::{debug, info, info_span};

use crate::{
    algorithms::{
        Calibrator, CoarseLocalizer, CoarseMask, ExclusionMask, denoise, denoise_radius,
        threshold::{foreground_count, open_close},
    },
    config::PipelineConfig,
    error::{MorphometryError, Result},
    traits::{BeanDetector, FeatureExtractor, InstanceSeparator, MarkerDetector, RegionRefiner},
    types::{Bean, PipelineResult},
};

/// States of one pipeline call.
///
/// `Idle → Calibrating → CalibrationFailed` when no marker is found,
/// otherwise `Calibrating → Localizing → Refining → Separating →
/// ComputingFeatures → Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PipelineStage {
    Idle,
    Calibrating,
    CalibrationFailed,
    Localizing,
    Refining,
    Separating,
    ComputingFeatures,
    Done,
}

impl PipelineStage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::CalibrationFailed | Self::Done)
    }
}

/// State owned by a single `process` call. Nothing here outlives the call,
/// so one `Pipeline` can serve many threads.
struct Call {
    stage: PipelineStage,
    trace: Vec<PipelineStage>,
}

impl Call {
    fn new() -> Self {
        Self {
            stage: PipelineStage::Idle,
            trace: vec![PipelineStage::Idle],
        }
    }

    fn enter(&mut self, stage: PipelineStage) {
        debug!(from = %self.stage, to = %stage, "stage transition");
        self.stage = stage;
        self.trace.push(stage);
    }

    /// Run `step` as the current stage, tagging any error with it.
    fn run<T>(&self, step: impl FnOnce() -> Result<T>) -> Result<T> {
        let stage = self.stage;
        step().map_err(|e| e.in_stage(stage))
    }
}

/// Bean morphometry pipeline: calibration, coarse localisation, refinement,
/// watershed separation and feature computation.
pub struct Pipeline {
    config: PipelineConfig,
    marker_detector: Box<dyn MarkerDetector>,
    bean_detector: Option<Box<dyn BeanDetector>>,
    refiner: Box<dyn RegionRefiner>,
    separator: Box<dyn InstanceSeparator>,
    extractor: Box<dyn FeatureExtractor>,
}

impl Pipeline {
    /// Create a new pipeline builder
    pub fn builder() -> builder::PipelineBuilder {
        builder::PipelineBuilder::new()
    }

    /// Create a pipeline from components. The configuration is assumed valid;
    /// prefer the builder, which validates it.
    pub fn new(
        config: PipelineConfig,
        marker_detector: Box<dyn MarkerDetector>,
        bean_detector: Option<Box<dyn BeanDetector>>,
        refiner: Box<dyn RegionRefiner>,
        separator: Box<dyn InstanceSeparator>,
        extractor: Box<dyn FeatureExtractor>,
    ) -> Self {
        Self {
            config,
            marker_detector,
            bean_detector,
            refiner,
            separator,
            extractor,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn has_detector(&self) -> bool {
        self.bean_detector.is_some()
    }

    /// Process one decoded image.
    ///
    /// A missing marker is not an error: the result has
    /// `calibration.succeeded == false` and no beans. Errors raised inside a
    /// stage come back as [`MorphometryError::Stage`].
    pub fn process(&self, image: &DynamicImage) -> Result<PipelineResult> {
        self.process_traced(image).0
    }

    /// Like [`Pipeline::process`], also returning the stages visited.
    pub fn process_traced(&self, image: &DynamicImage) -> (Result<PipelineResult>, Vec<PipelineStage>) {
        let mut call = Call::new();
        let result = self.run(image, &mut call);
        (result, call.trace)
    }

    fn run(&self, image: &DynamicImage, call: &mut Call) -> Result<PipelineResult> {
        let (width, height) = image.dimensions();
        let span = info_span!("pipeline", width, height);
        let _guard = span.enter();

        if width == 0 || height == 0 {
            return Err(MorphometryError::InvalidImage(format!("image is {width}x{height}")));
        }
        let gray = image.to_luma8();

        call.enter(PipelineStage::Calibrating);
        let (calibration, markers) =
            Calibrator::new(self.marker_detector.as_ref(), self.config.marker_length_mm).survey(&gray);
        let Some(mm_per_pixel) = calibration.scale() else {
            call.enter(PipelineStage::CalibrationFailed);
            info!("calibration marker not found, skipping segmentation");
            return Ok(PipelineResult::marker_not_found());
        };

        let exclusion =
            ExclusionMask::for_calibration(&calibration, &markers, width, height, self.config.exclusion_margin_ratio);
        let radius = denoise_radius(&self.config, Some(mm_per_pixel));
        let denoised = denoise(&gray, radius);
        debug!(radius, excluded = exclusion.excluded_pixels(), "prepared grayscale");

        call.enter(PipelineStage::Localizing);
        let coarse = call.run(|| {
            let rgb = image.to_rgb8();
            CoarseLocalizer::from_config(&self.config).localize(
                self.bean_detector.as_deref(),
                &rgb,
                &denoised,
                &exclusion,
            )
        })?;
        debug!(strategy = coarse.strategy(), boxes = coarse.boxes().len(), "localized");

        call.enter(PipelineStage::Refining);
        let refined = call.run(|| self.refine(&denoised, coarse, &exclusion))?;
        debug!(foreground = foreground_count(&refined), "refined");

        call.enter(PipelineStage::Separating);
        let regions = call.run(|| self.separator.separate(&refined))?;

        call.enter(PipelineStage::ComputingFeatures);
        let beans = call.run(|| {
            regions
                .into_iter()
                .map(|region| {
                    let features = self.extractor.compute(&region, &denoised, mm_per_pixel)?;
                    Ok(Bean::new(region, features))
                })
                .collect::<Result<Vec<_>>>()
        })?;

        call.enter(PipelineStage::Done);
        info!(beans = beans.len(), mm_per_pixel, "pipeline finished");
        Ok(PipelineResult { calibration, beans })
    }

    /// Detector regions are refined one by one; a global threshold only gets
    /// whole-image cleanup.
    fn refine(&self, denoised: &GrayImage, coarse: CoarseMask, exclusion: &ExclusionMask) -> Result<GrayImage> {
        let mut refined = match coarse {
            CoarseMask::DetectorBased { mask, .. } => self.refiner.refine(denoised, &mask)?,
            CoarseMask::GlobalThreshold { mask } => open_close(&mask, self.config.open_size, self.config.close_size),
        };
        exclusion.apply(&mut refined);
        Ok(refined)
    }

    /// Get information about the pipeline configuration
    pub fn info(&self) -> String {
        format!(
            "Pipeline: marker {} mm, detector {}, noise floor {} px, peak footprint {}",
            self.config.marker_length_mm,
            if self.has_detector() { "attached" } else { "none (global threshold)" },
            self.config.noise_floor_px,
            self.config.peak_footprint,
        )
    }
}
