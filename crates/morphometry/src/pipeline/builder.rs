use crate::{
    algorithms::{LocalOtsuRefiner, RegionPropsExtractor, SquareMarkerDetector, WatershedSeparator},
    config::{PipelineConfig, Polarity},
    error::Result,
    pipeline::Pipeline,
    traits::{BeanDetector, FeatureExtractor, InstanceSeparator, MarkerDetector, RegionRefiner},
};

/// Builder for creating pipelines with a fluent API
///
/// Components that are not set are derived from the configuration when
/// [`PipelineBuilder::build`] runs, so configuration setters and component
/// setters can be called in any order.
#[derive(Default)]
pub struct PipelineBuilder {
    config: PipelineConfig,
    marker_detector: Option<Box<dyn MarkerDetector>>,
    bean_detector: Option<Box<dyn BeanDetector>>,
    refiner: Option<Box<dyn RegionRefiner>>,
    separator: Option<Box<dyn InstanceSeparator>>,
    extractor: Option<Box<dyn FeatureExtractor>>,
}

impl PipelineBuilder {
    /// Create a new pipeline builder with default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole configuration
    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn marker_length_mm(mut self, marker_length_mm: f64) -> Self {
        self.config.marker_length_mm = marker_length_mm;
        self
    }

    pub fn confidence_threshold(mut self, threshold: f32) -> Self {
        self.config.confidence_threshold = threshold;
        self
    }

    pub fn noise_floor_px(mut self, noise_floor_px: u64) -> Self {
        self.config.noise_floor_px = noise_floor_px;
        self
    }

    pub fn peak_footprint(mut self, footprint: u32) -> Self {
        self.config.peak_footprint = footprint;
        self
    }

    pub fn min_peak_prominence_px(mut self, prominence: f64) -> Self {
        self.config.min_peak_prominence_px = prominence;
        self
    }

    pub fn polarity(mut self, polarity: Polarity) -> Self {
        self.config.polarity = polarity;
        self
    }

    /// Attach a learned bean detector (replaces any existing one)
    pub fn with_detector<D>(mut self, detector: D) -> Self
    where
        D: BeanDetector + 'static,
    {
        self.bean_detector = Some(Box::new(detector));
        self
    }

    /// Set the marker detector (replaces the square-marker default)
    pub fn set_marker_detector<M>(mut self, detector: M) -> Self
    where
        M: MarkerDetector + 'static,
    {
        self.marker_detector = Some(Box::new(detector));
        self
    }

    /// Set the region refiner (replaces the local Otsu default)
    pub fn set_refiner<R>(mut self, refiner: R) -> Self
    where
        R: RegionRefiner + 'static,
    {
        self.refiner = Some(Box::new(refiner));
        self
    }

    /// Set the instance separator (replaces the watershed default)
    pub fn set_separator<S>(mut self, separator: S) -> Self
    where
        S: InstanceSeparator + 'static,
    {
        self.separator = Some(Box::new(separator));
        self
    }

    /// Set the feature extractor (replaces the region-properties default)
    pub fn set_extractor<E>(mut self, extractor: E) -> Self
    where
        E: FeatureExtractor + 'static,
    {
        self.extractor = Some(Box::new(extractor));
        self
    }

    /// Validate the configuration and build the pipeline, filling in default
    /// components where none were set.
    pub fn build(self) -> Result<Pipeline> {
        self.config.validate()?;
        let config = self.config;

        let marker_detector = self
            .marker_detector
            .unwrap_or_else(|| Box::new(SquareMarkerDetector::new(config.marker.clone())));
        let refiner = self
            .refiner
            .unwrap_or_else(|| Box::new(LocalOtsuRefiner::from_config(&config)));
        let separator = self
            .separator
            .unwrap_or_else(|| Box::new(WatershedSeparator::from_config(&config)));
        let extractor = self.extractor.unwrap_or_else(|| Box::new(RegionPropsExtractor));

        Ok(Pipeline::new(
            config,
            marker_detector,
            self.bean_detector,
            refiner,
            separator,
            extractor,
        ))
    }

    /// Build the classical pipeline (no detector) from a configuration
    pub fn build_from_config(config: PipelineConfig) -> Result<Pipeline> {
        Self::new().with_config(config).build()
    }
}
