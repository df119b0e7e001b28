//! End-to-end tests for the bean morphometry pipeline
//!
//! Every scene is rendered in memory by `morphometry::synthetic`, so the
//! expected marker scale and bean sizes are known exactly.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use image::{DynamicImage, GrayImage, RgbImage};
use morphometry::algorithms::LocalOtsuRefiner;
use morphometry::synthetic::{MarkerSpec, Scene};
use morphometry::{
    BeanDetector, BeanRegion, DetectionBox, InstanceSeparator, MorphometryError, Pipeline, PipelineStage,
    PipelineStatus, RegionRefiner, Result,
};

// ============================================================================
// Fakes
// ============================================================================

struct CountingDetector {
    calls: Arc<AtomicUsize>,
    boxes: Vec<DetectionBox>,
}

impl BeanDetector for CountingDetector {
    fn detect(&self, _image: &RgbImage, _confidence_threshold: f32) -> Result<Vec<DetectionBox>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.boxes.clone())
    }
}

struct CountingRefiner {
    calls: Arc<AtomicUsize>,
    inner: LocalOtsuRefiner,
}

impl RegionRefiner for CountingRefiner {
    fn refine(&self, grayscale: &GrayImage, coarse_mask: &GrayImage) -> Result<GrayImage> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.refine(grayscale, coarse_mask)
    }
}

struct UnavailableDetector;

impl BeanDetector for UnavailableDetector {
    fn detect(&self, _image: &RgbImage, _confidence_threshold: f32) -> Result<Vec<DetectionBox>> {
        Err(MorphometryError::ImageProcessing("model not loaded".into()))
    }
}

struct FailingSeparator;

impl InstanceSeparator for FailingSeparator {
    fn separate(&self, _mask: &GrayImage) -> Result<Vec<BeanRegion>> {
        Err(MorphometryError::ImageProcessing("degenerate geometry".into()))
    }
}

fn instrumented(boxes: Vec<DetectionBox>) -> (Pipeline, Arc<AtomicUsize>, Arc<AtomicUsize>) {
    let detector_calls = Arc::new(AtomicUsize::new(0));
    let refiner_calls = Arc::new(AtomicUsize::new(0));
    let pipeline = Pipeline::builder()
        .with_detector(CountingDetector {
            calls: Arc::clone(&detector_calls),
            boxes,
        })
        .set_refiner(CountingRefiner {
            calls: Arc::clone(&refiner_calls),
            inner: LocalOtsuRefiner::default(),
        })
        .build()
        .unwrap();
    (pipeline, detector_calls, refiner_calls)
}

/// 20 mm marker rendered 100 px wide, so 0.2 mm per pixel.
fn calibrated_scene() -> Scene {
    Scene::new(320, 240).with_marker(MarkerSpec::new(0, 20, 20, 100))
}

// ============================================================================
// Calibration
// ============================================================================

#[test]
fn test_no_marker_short_circuits() {
    let (pipeline, detector_calls, refiner_calls) = instrumented(vec![DetectionBox::new(0.0, 0.0, 50.0, 50.0, 0.9)]);
    let image = Scene::new(320, 240).with_disk(200.0, 120.0, 12.0).render();

    let (result, trace) = pipeline.process_traced(&image);
    let result = result.unwrap();

    assert!(!result.calibration.succeeded);
    assert!(result.calibration.mm_per_pixel.is_none());
    assert!(result.beans.is_empty());
    assert_eq!(result.status(), PipelineStatus::MarkerNotFound);
    assert_eq!(detector_calls.load(Ordering::SeqCst), 0);
    assert_eq!(refiner_calls.load(Ordering::SeqCst), 0);
    assert_eq!(trace.last(), Some(&PipelineStage::CalibrationFailed));
}

#[test]
fn test_marker_scale_is_exact() {
    let pipeline = Pipeline::builder().build().unwrap();
    let result = pipeline.process(&calibrated_scene().render()).unwrap();

    let k = result.calibration.mm_per_pixel.unwrap();
    assert!(result.calibration.succeeded);
    assert!(((k - 0.2) / 0.2).abs() < 1e-6, "mm_per_pixel = {k}");
    assert!((result.calibration.image_width_mm.unwrap() - 64.0).abs() < 1e-4);
    assert!((result.calibration.image_height_mm.unwrap() - 48.0).abs() < 1e-4);
    assert_eq!(result.status(), PipelineStatus::NoBeansDetected);
}

#[test]
fn test_marker_length_is_configurable() {
    let pipeline = Pipeline::builder().marker_length_mm(30.0).build().unwrap();
    let result = pipeline.process(&calibrated_scene().render()).unwrap();
    assert!((result.calibration.mm_per_pixel.unwrap() - 0.3).abs() < 1e-6);
}

// ============================================================================
// Segmentation and measurement
// ============================================================================

#[test]
fn test_single_bean_equivalent_diameter() {
    let pipeline = Pipeline::builder().build().unwrap();
    let image = calibrated_scene().with_disk(220.0, 150.0, 10.0).render();
    let (result, trace) = pipeline.process_traced(&image);
    let result = result.unwrap();

    assert_eq!(result.beans.len(), 1);
    assert_eq!(result.status(), PipelineStatus::BeansMeasured { count: 1 });
    let bean = &result.beans[0];
    assert_eq!(bean.region.bean_index, 1);
    assert!(
        (bean.features.equivalent_diameter_mm - 4.0).abs() < 0.3,
        "equivalent diameter {}",
        bean.features.equivalent_diameter_mm
    );
    assert!(bean.region.contains(220, 150));
    assert_eq!(
        trace,
        vec![
            PipelineStage::Idle,
            PipelineStage::Calibrating,
            PipelineStage::Localizing,
            PipelineStage::Refining,
            PipelineStage::Separating,
            PipelineStage::ComputingFeatures,
            PipelineStage::Done,
        ]
    );
}

#[test]
fn test_touching_beans_are_separated() {
    let pipeline = Pipeline::builder().build().unwrap();
    let image = calibrated_scene()
        .with_disk(200.0, 150.0, 15.0)
        .with_disk(224.0, 150.0, 15.0)
        .render();
    let result = pipeline.process(&image).unwrap();

    assert_eq!(result.beans.len(), 2);
    for bean in &result.beans {
        assert!(bean.region.pixel_area > 100);
    }
    let indices: Vec<usize> = result.beans.iter().map(|b| b.region.bean_index).collect();
    assert_eq!(indices, vec![1, 2]);
}

#[test]
fn test_marker_never_becomes_a_bean() {
    let pipeline = Pipeline::builder().noise_floor_px(10).build().unwrap();
    let image = calibrated_scene().with_disk(250.0, 180.0, 12.0).render();
    let result = pipeline.process(&image).unwrap();

    assert_eq!(result.beans.len(), 1);
    for bean in &result.beans {
        for (x, y) in bean.region.pixels() {
            assert!(!(20..120).contains(&x) || !(20..120).contains(&y), "bean pixel ({x}, {y}) on marker");
        }
    }
}

#[test]
fn test_area_scales_with_square_of_calibration() {
    let pipeline = Pipeline::builder().build().unwrap();
    let image = calibrated_scene().with_ellipse(230.0, 150.0, 25.0, 14.0, 0.4).render();
    let result = pipeline.process(&image).unwrap();

    assert_eq!(result.beans.len(), 1);
    let k = result.calibration.mm_per_pixel.unwrap();
    let bean = &result.beans[0];
    assert_eq!(bean.features.area_mm2, bean.region.pixel_area as f64 * (k * k));
    assert_eq!(bean.length_mm, bean.features.major_axis_length_mm);
    assert_eq!(bean.width_mm, bean.features.minor_axis_length_mm);
    assert!(bean.features.aspect_ratio > 1.5);
}

#[test]
fn test_elongated_beans_stay_whole() {
    let pipeline = Pipeline::builder().build().unwrap();
    for &(a, b, angle) in &[(25.0, 14.0, 0.4), (40.0, 28.0, 0.3), (45.0, 30.0, -0.5), (50.0, 20.0, 0.7), (36.0, 25.0, 0.1)] {
        let image = Scene::new(400, 300)
            .with_marker(MarkerSpec::new(0, 20, 20, 100))
            .with_ellipse(270.0, 170.0, a, b, angle)
            .render();
        let result = pipeline.process(&image).unwrap();
        assert_eq!(
            result.beans.len(),
            1,
            "ellipse {a}x{b} at {angle} rad measured as {} beans",
            result.beans.len()
        );
    }
}

#[test]
fn test_demo_scene_has_four_beans() {
    let pipeline = Pipeline::builder().build().unwrap();
    let result = pipeline.process(&Scene::demo().render()).unwrap();

    assert!(result.calibration.succeeded);
    assert_eq!(result.beans.len(), 4);
    assert_eq!(result.status(), PipelineStatus::BeansMeasured { count: 4 });
}

#[test]
fn test_every_marker_in_frame_is_excluded() {
    let pipeline = Pipeline::builder().noise_floor_px(10).build().unwrap();
    let image = Scene::new(400, 300)
        .with_marker(MarkerSpec::new(0, 20, 20, 100))
        .with_marker(MarkerSpec::new(1, 260, 20, 100))
        .with_disk(200.0, 220.0, 12.0)
        .render();
    let result = pipeline.process(&image).unwrap();

    assert!(((result.calibration.mm_per_pixel.unwrap() - 0.2) / 0.2).abs() < 1e-6);
    assert_eq!(result.beans.len(), 1);
    assert!(result.beans[0].region.contains(200, 220));
}

#[test]
fn test_processing_is_deterministic() {
    let pipeline = Pipeline::builder().build().unwrap();
    let image = calibrated_scene()
        .with_disk(200.0, 150.0, 15.0)
        .with_ellipse(270.0, 80.0, 20.0, 12.0, 1.0)
        .render();

    assert_eq!(pipeline.process(&image).unwrap(), pipeline.process(&image).unwrap());
}

// ============================================================================
// Detector path
// ============================================================================

#[test]
fn test_detector_boxes_are_refined_per_region() {
    let (pipeline, detector_calls, refiner_calls) =
        instrumented(vec![DetectionBox::new(200.0, 130.0, 40.0, 40.0, 0.92)]);
    let image = calibrated_scene()
        .with_disk(220.0, 150.0, 10.0)
        .with_disk(280.0, 60.0, 10.0)
        .render();
    let result = pipeline.process(&image).unwrap();

    assert_eq!(detector_calls.load(Ordering::SeqCst), 1);
    assert_eq!(refiner_calls.load(Ordering::SeqCst), 1);
    // Only the boxed bean is reported.
    assert_eq!(result.beans.len(), 1);
    assert!(result.beans[0].region.contains(220, 150));
}

#[test]
fn test_weak_detections_fall_back_to_threshold() {
    let (pipeline, detector_calls, refiner_calls) =
        instrumented(vec![DetectionBox::new(200.0, 130.0, 40.0, 40.0, 0.3)]);
    let image = calibrated_scene()
        .with_disk(220.0, 150.0, 10.0)
        .with_disk(280.0, 60.0, 10.0)
        .render();
    let result = pipeline.process(&image).unwrap();

    assert_eq!(detector_calls.load(Ordering::SeqCst), 1);
    assert_eq!(refiner_calls.load(Ordering::SeqCst), 0);
    assert_eq!(result.beans.len(), 2);
}

#[test]
fn test_unavailable_detector_falls_back_to_threshold() {
    let pipeline = Pipeline::builder().with_detector(UnavailableDetector).build().unwrap();
    let image = calibrated_scene().with_disk(220.0, 150.0, 10.0).render();
    let (result, trace) = pipeline.process_traced(&image);

    assert_eq!(result.unwrap().beans.len(), 1);
    assert_eq!(trace.last(), Some(&PipelineStage::Done));
}

// ============================================================================
// Error Handling Tests
// ============================================================================

#[test]
fn test_stage_fault_names_the_stage() {
    let pipeline = Pipeline::builder().set_separator(FailingSeparator).build().unwrap();
    let image = calibrated_scene().with_disk(220.0, 150.0, 10.0).render();
    let (result, trace) = pipeline.process_traced(&image);

    let err = result.unwrap_err();
    assert_eq!(err.stage(), Some(PipelineStage::Separating));
    assert!(err.is_recoverable());
    assert!(err.user_message().contains("retry"));
    assert_eq!(trace.last(), Some(&PipelineStage::Separating));
}

#[test]
fn test_missing_marker_is_distinct_from_empty_result() {
    let pipeline = Pipeline::builder().build().unwrap();

    let no_marker = pipeline.process(&Scene::new(200, 200).render()).unwrap();
    let err = no_marker.require_calibration().unwrap_err();
    assert!(matches!(err, MorphometryError::CalibrationMarkerNotFound));
    assert!(err.user_message().contains("marker"));

    let empty = pipeline.process(&calibrated_scene().render()).unwrap();
    assert_eq!(empty.status(), PipelineStatus::NoBeansDetected);
    assert!(empty.require_calibration().is_ok());
}

#[test]
fn test_result_serializes_with_documented_fields() {
    let pipeline = Pipeline::builder().build().unwrap();
    let result = pipeline
        .process(&calibrated_scene().with_disk(220.0, 150.0, 10.0).render())
        .unwrap();
    let json = result.to_json().unwrap();

    assert_eq!(json["calibration"]["succeeded"], true);
    let bean = &json["beans"][0];
    assert_eq!(bean["bean_index"], 1);
    assert!(bean["bounding_box"]["width"].is_u64());
    assert!(bean.get("pixel_mask").is_none());
    for field in [
        "area_mm2",
        "perimeter_mm",
        "major_axis_length_mm",
        "minor_axis_length_mm",
        "eccentricity",
        "extent",
        "equivalent_diameter_mm",
        "solidity",
        "mean_intensity",
        "aspect_ratio",
    ] {
        assert!(bean["features"][field].is_f64(), "missing {field}");
    }
}

// ============================================================================
// Concurrency
// ============================================================================

#[test]
fn test_shared_pipeline_keeps_calibration_per_call() {
    let pipeline = Pipeline::builder().build().unwrap();
    let near: DynamicImage = calibrated_scene().with_disk(220.0, 150.0, 10.0).render();
    let far: DynamicImage = Scene::new(320, 240)
        .with_marker(MarkerSpec::new(0, 20, 20, 80))
        .with_disk(220.0, 150.0, 10.0)
        .render();

    std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let pipeline = &pipeline;
                let (image, expected) = if i % 2 == 0 { (&near, 0.2) } else { (&far, 0.25) };
                scope.spawn(move || {
                    let result = pipeline.process(image).unwrap();
                    (result.calibration.mm_per_pixel.unwrap(), expected)
                })
            })
            .collect();

        for handle in handles {
            let (k, expected) = handle.join().unwrap();
            assert!((k - expected).abs() < 1e-6, "got {k}, expected {expected}");
        }
    });
}
