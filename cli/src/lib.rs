//! Batch front end for the morphometry pipeline: reads image files, runs
//! each one on a blocking worker under a deadline, and assembles the JSON
//! response.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use morphometry::{MorphometryError, Pipeline, PipelineResult, PipelineStage, PipelineStatus, debug};
use schemars::JsonSchema;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum BatchError {
    #[error(transparent)]
    Morphometry(#[from] MorphometryError),
    #[error(transparent)]
    SerdeError(#[from] serde_json::Error),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
    #[error("Worker stopped unexpectedly: {0}")]
    Worker(String),
}

/// One encoded image as received from the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputImage {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl InputImage {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            bytes,
        }
    }

    pub async fn read(path: &Path) -> std::io::Result<Self> {
        let bytes = tokio::fs::read(path).await?;
        Ok(Self::new(path.display().to_string(), bytes))
    }
}

const PROCESSING_FAILED: &str = "Processing failed";

/// Per-image entry of the batch response.
#[derive(Debug, Clone, Serialize, JsonSchema)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ImageReport {
    Measured {
        image: String,
        total_area_mm2: f64,
        #[serde(flatten)]
        result: PipelineResult,
    },
    MarkerNotFound {
        image: String,
        error: String,
        message: String,
    },
    Failed {
        image: String,
        error: String,
        detail: String,
        stage: Option<PipelineStage>,
        message: String,
    },
}

impl ImageReport {
    pub fn from_outcome(image: String, outcome: Result<PipelineResult, BatchError>) -> Self {
        match outcome {
            Ok(result) if result.status() == PipelineStatus::MarkerNotFound => {
                let err = MorphometryError::CalibrationMarkerNotFound;
                Self::MarkerNotFound {
                    image,
                    error: err.to_string(),
                    message: err.user_message(),
                }
            }
            Ok(result) => Self::Measured {
                image,
                total_area_mm2: result.total_area_mm2(),
                result,
            },
            Err(BatchError::Morphometry(err)) => Self::Failed {
                image,
                error: PROCESSING_FAILED.to_string(),
                detail: err.to_string(),
                stage: err.stage(),
                message: err.user_message(),
            },
            Err(other) => Self::Failed {
                image,
                error: PROCESSING_FAILED.to_string(),
                detail: other.to_string(),
                stage: None,
                message: "Processing error, please retry.".to_string(),
            },
        }
    }

    pub fn bean_count(&self) -> usize {
        match self {
            Self::Measured { result, .. } => result.beans.len(),
            _ => 0,
        }
    }

    pub fn is_measured(&self) -> bool {
        matches!(self, Self::Measured { .. })
    }
}

#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct BatchResponse {
    pub images: Vec<ImageReport>,
    pub total_images_processed: usize,
    pub total_beans_detected: usize,
    pub duplicates_skipped: usize,
}

impl BatchResponse {
    pub fn new(images: Vec<ImageReport>, duplicates_skipped: usize) -> Self {
        Self {
            total_images_processed: images.iter().filter(|r| r.is_measured()).count(),
            total_beans_detected: images.iter().map(ImageReport::bean_count).sum(),
            images,
            duplicates_skipped,
        }
    }

    pub fn to_json(&self, pretty: bool) -> Result<String, BatchError> {
        Ok(if pretty {
            serde_json::to_string_pretty(self)?
        } else {
            serde_json::to_string(self)?
        })
    }
}

#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Images processed at the same time.
    pub jobs: usize,
    /// Deadline per image. A late image is reported as failed; its worker
    /// finishes in the background and the result is dropped.
    pub timeout: Duration,
    /// Where to write annotated and isolated views, if anywhere.
    pub debug_dir: Option<PathBuf>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            jobs: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            timeout: Duration::from_secs(60),
            debug_dir: None,
        }
    }
}

/// Drop byte-identical uploads, keeping the first occurrence.
pub fn dedupe(inputs: Vec<InputImage>) -> (Vec<InputImage>, usize) {
    let fresh: Vec<bool> = {
        let mut seen: HashSet<&[u8]> = HashSet::with_capacity(inputs.len());
        inputs.iter().map(|input| seen.insert(input.bytes.as_slice())).collect()
    };
    let before = inputs.len();
    let unique: Vec<InputImage> = inputs
        .into_iter()
        .zip(fresh)
        .filter_map(|(input, fresh)| {
            if !fresh {
                info!(image = %input.name, "skipping duplicate image");
            }
            fresh.then_some(input)
        })
        .collect();
    let skipped = before - unique.len();
    (unique, skipped)
}

/// Decode and measure one image. Runs on a blocking thread.
fn analyze(pipeline: &Pipeline, input: &InputImage, debug_dir: Option<&Path>) -> Result<PipelineResult, BatchError> {
    let image = image::load_from_memory(&input.bytes).map_err(MorphometryError::from)?;
    let result = pipeline.process(&image)?;

    if let Some(dir) = debug_dir {
        let stem = Path::new(&input.name)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image".to_string());
        let annotated = dir.join(format!("{stem}_annotated.png"));
        let isolated = dir.join(format!("{stem}_beans.png"));
        if let Err(e) = debug::annotate(&image, &result).save(&annotated) {
            warn!(path = %annotated.display(), error = %e, "could not write debug image");
        }
        if let Err(e) = debug::isolate_beans(&image, &result).save(&isolated) {
            warn!(path = %isolated.display(), error = %e, "could not write debug image");
        }
    }
    Ok(result)
}

/// Process a batch. Failures stay with their image; the batch itself never
/// fails.
pub async fn process_batch(pipeline: Arc<Pipeline>, inputs: Vec<InputImage>, options: &BatchOptions) -> BatchResponse {
    let (unique, duplicates_skipped) = dedupe(inputs);
    let semaphore = Arc::new(Semaphore::new(options.jobs.max(1)));
    let mut tasks = JoinSet::new();

    for (index, input) in unique.into_iter().enumerate() {
        let pipeline = Arc::clone(&pipeline);
        let semaphore = Arc::clone(&semaphore);
        let timeout = options.timeout;
        let debug_dir = options.debug_dir.clone();

        tasks.spawn(async move {
            let name = input.name.clone();
            let outcome = match semaphore.acquire_owned().await {
                Ok(permit) => {
                    let worker = tokio::task::spawn_blocking(move || {
                        let _permit = permit;
                        analyze(&pipeline, &input, debug_dir.as_deref())
                    });
                    match tokio::time::timeout(timeout, worker).await {
                        Ok(Ok(outcome)) => outcome,
                        Ok(Err(join_error)) => Err(BatchError::Worker(join_error.to_string())),
                        Err(_) => {
                            warn!(image = %name, ?timeout, "image timed out");
                            Err(BatchError::Timeout(timeout))
                        }
                    }
                }
                Err(closed) => Err(BatchError::Worker(closed.to_string())),
            };
            (index, ImageReport::from_outcome(name, outcome))
        });
    }

    let mut reports: Vec<(usize, ImageReport)> = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(report) => reports.push(report),
            Err(e) => warn!(error = %e, "batch task failed"),
        }
    }
    reports.sort_by_key(|(index, _)| *index);

    let response = BatchResponse::new(reports.into_iter().map(|(_, r)| r).collect(), duplicates_skipped);
    info!(
        processed = response.total_images_processed,
        beans = response.total_beans_detected,
        "batch finished"
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use morphometry::synthetic::{MarkerSpec, Scene};
    use std::io::Cursor;

    fn png(scene: &Scene) -> Vec<u8> {
        let mut bytes = Vec::new();
        scene
            .render()
            .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        bytes
    }

    fn pipeline() -> Arc<Pipeline> {
        Arc::new(Pipeline::builder().build().unwrap())
    }

    #[test]
    fn test_dedupe_keeps_first_occurrence() {
        let inputs = vec![
            InputImage::new("a.png", vec![1, 2, 3]),
            InputImage::new("b.png", vec![4, 5]),
            InputImage::new("c.png", vec![1, 2, 3]),
        ];
        let (unique, skipped) = dedupe(inputs);

        assert_eq!(skipped, 1);
        let names: Vec<&str> = unique.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["a.png", "b.png"]);
    }

    #[test]
    fn test_dedupe_compares_content_not_length() {
        let inputs = vec![
            InputImage::new("a.png", vec![0, 1, 2, 3]),
            InputImage::new("b.png", vec![3, 2, 1, 0]),
            InputImage::new("c.png", vec![0, 1, 2, 4]),
            InputImage::new("d.png", Vec::new()),
            InputImage::new("e.png", Vec::new()),
        ];
        let (unique, skipped) = dedupe(inputs);

        assert_eq!(skipped, 1);
        let names: Vec<&str> = unique.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["a.png", "b.png", "c.png", "d.png"]);
    }

    #[tokio::test]
    async fn test_batch_isolates_failures() {
        let measured = Scene::new(320, 240)
            .with_marker(MarkerSpec::new(0, 20, 20, 100))
            .with_disk(220.0, 150.0, 10.0);
        let inputs = vec![
            InputImage::new("beans.png", png(&measured)),
            InputImage::new("no_marker.png", png(&Scene::new(200, 150).with_disk(100.0, 75.0, 12.0))),
            InputImage::new("garbage.png", b"not an image".to_vec()),
            InputImage::new("copy.png", png(&measured)),
        ];

        let response = process_batch(pipeline(), inputs, &BatchOptions::default()).await;

        assert_eq!(response.images.len(), 3);
        assert_eq!(response.duplicates_skipped, 1);
        assert_eq!(response.total_images_processed, 1);
        assert_eq!(response.total_beans_detected, 1);
        assert!(matches!(&response.images[0], ImageReport::Measured { image, .. } if image == "beans.png"));
        assert!(matches!(
            &response.images[1],
            ImageReport::MarkerNotFound { error, .. } if error == "Calibration marker not found"
        ));
        assert!(matches!(&response.images[2], ImageReport::Failed { stage: None, .. }));
    }

    #[tokio::test]
    async fn test_response_json_shape() {
        let scene = Scene::new(320, 240)
            .with_marker(MarkerSpec::new(0, 20, 20, 100))
            .with_disk(220.0, 150.0, 10.0);
        let response = process_batch(
            pipeline(),
            vec![InputImage::new("beans.png", png(&scene))],
            &BatchOptions::default(),
        )
        .await;
        let json: serde_json::Value = serde_json::from_str(&response.to_json(false).unwrap()).unwrap();

        assert_eq!(json["total_images_processed"], 1);
        assert_eq!(json["images"][0]["outcome"], "measured");
        assert_eq!(json["images"][0]["calibration"]["succeeded"], true);
        assert!(json["images"][0]["beans"][0]["features"]["area_mm2"].is_f64());
    }

    #[test]
    fn test_stage_fault_report_carries_stage() {
        let err = MorphometryError::ImageProcessing("bad crop".into()).in_stage(PipelineStage::Refining);
        let report = ImageReport::from_outcome("x.png".into(), Err(err.into()));

        match report {
            ImageReport::Failed { error, stage, message, .. } => {
                assert_eq!(error, "Processing failed");
                assert_eq!(stage, Some(PipelineStage::Refining));
                assert!(message.contains("retry"));
            }
            other => panic!("expected a failure, got {other:?}"),
        }
    }
}
