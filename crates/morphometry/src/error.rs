use thiserror::Error;

use crate::pipeline::PipelineStage;

#[derive(Error, Debug)]
pub enum MorphometryError {
    #[error("Failed to load image: {0}")]
    ImageLoad(#[from] image::ImageError),

    #[error("Invalid image: {0}")]
    InvalidImage(String),

    #[error("Invalid configuration for `{field}`: {reason}")]
    Configuration { field: &'static str, reason: String },

    #[error("Calibration marker not found")]
    CalibrationMarkerNotFound,

    #[error("Stage `{stage}` failed: {source}")]
    Stage {
        stage: PipelineStage,
        #[source]
        source: Box<MorphometryError>,
    },

    #[error("Image processing error: {0}")]
    ImageProcessing(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("TOML write error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MorphometryError {
    pub fn configuration(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Configuration {
            field,
            reason: reason.into(),
        }
    }

    /// Attribute this error to a pipeline stage. Errors that already carry a
    /// stage keep the innermost one.
    pub fn in_stage(self, stage: PipelineStage) -> Self {
        match self {
            already @ Self::Stage { .. } => already,
            other => Self::Stage {
                stage,
                source: Box::new(other),
            },
        }
    }

    /// The stage an error was raised in, if it was raised inside the pipeline.
    pub fn stage(&self) -> Option<PipelineStage> {
        match self {
            Self::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// Whether a batch caller should skip this image and keep going.
    /// Configuration problems are not recoverable: they affect every image.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Configuration { .. })
    }

    /// Message suitable for showing to the person who took the photograph.
    pub fn user_message(&self) -> String {
        match self {
            Self::CalibrationMarkerNotFound => {
                "Calibration marker not found. Place the marker in frame, fully visible, and retake the photo."
                    .to_string()
            }
            Self::ImageLoad(_) | Self::InvalidImage(_) => {
                "Could not read the image. Please check the file format and try again.".to_string()
            }
            Self::Configuration { .. } => {
                "The analysis service is misconfigured. Please contact an administrator.".to_string()
            }
            _ => "Processing error, please retry.".to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, MorphometryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_is_attached_once() {
        let err = MorphometryError::ImageProcessing("empty crop".into())
            .in_stage(PipelineStage::Refining)
            .in_stage(PipelineStage::Separating);

        assert_eq!(err.stage(), Some(PipelineStage::Refining));
        assert!(err.to_string().contains("refining"));
    }

    #[test]
    fn test_user_messages_are_distinct() {
        let marker = MorphometryError::CalibrationMarkerNotFound.user_message();
        let fault = MorphometryError::ImageProcessing("x".into())
            .in_stage(PipelineStage::Separating)
            .user_message();

        assert!(marker.contains("marker"));
        assert!(fault.contains("retry"));
        assert_ne!(marker, fault);
    }

    #[test]
    fn test_configuration_is_not_recoverable() {
        assert!(!MorphometryError::configuration("noise_floor_px", "must be > 0").is_recoverable());
        assert!(MorphometryError::CalibrationMarkerNotFound.is_recoverable());
    }
}
