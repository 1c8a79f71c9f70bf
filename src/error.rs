use thiserror::Error;

use crate::media::{MediaKind, MediaTime, Rect};

/// Main error type for the crop-transcoder library
#[derive(Error, Debug)]
pub enum TranscoderError {
    #[error("Transcode failed: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Sample dropped: {0}")]
    Sample(#[from] SampleError),

    #[error("Media backend error: {0}")]
    Media(#[from] MediaError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Generic error: {0}")]
    Generic(String),
}

/// Fatal failures of one transcode run
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("No readable media source")]
    NoSource,

    #[error("Source has no video track")]
    NoVideoTrack,

    #[error("Crop rectangle {rect} maps to an empty region of the stored frame")]
    InvalidCropRect { rect: Rect },

    #[error("Could not open decode cursor: {reason}")]
    ReaderInitFailure { reason: String },

    #[error("Could not create destination container: {reason}")]
    WriterInitFailure { reason: String },

    #[error("Reading was cancelled before completion")]
    ReaderCancelled,

    #[error("Could not finalize destination container: {reason}")]
    FinalizeFailure { reason: String },
}

/// Per-sample failures; these are logged and absorbed by the drain loops
#[derive(Error, Debug)]
pub enum SampleError {
    #[error("{kind} append failed: {reason}")]
    AppendFailed { kind: MediaKind, reason: String },

    #[error("{kind} sample at {next} arrived after {previous}")]
    OutOfOrder {
        kind: MediaKind,
        previous: MediaTime,
        next: MediaTime,
    },

    #[error("Frame transform failed: {reason}")]
    TransformFailed { reason: String },
}

/// Errors raised by a media backend (demuxer, decoder, encoder, muxer)
#[derive(Error, Debug)]
pub enum MediaError {
    #[error("Failed to open media: {path}")]
    OpenFailed { path: String },

    #[error("Decoding failed: {reason}")]
    DecodeFailed { reason: String },

    #[error("Encoding failed: {reason}")]
    EncodeFailed { reason: String },

    #[error("Unsupported format: {format}")]
    UnsupportedFormat { format: String },

    #[error("Invalid buffer: {details}")]
    InvalidBuffer { details: String },
}

/// Configuration-specific errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse configuration file: {path}")]
    ParseFailed { path: String },

    #[error("Invalid configuration value: {key} = {value}")]
    InvalidValue { key: String, value: String },

    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },
}

/// Convenience type alias for Results using TranscoderError
pub type Result<T> = std::result::Result<T, TranscoderError>;

impl TranscoderError {
    /// Create a generic error with a custom message
    pub fn generic<S: Into<String>>(message: S) -> Self {
        Self::Generic(message.into())
    }

    /// Whether this error ends the whole transcode.
    ///
    /// Per-sample errors are absorbed by the drain that raised them; every
    /// other kind surfaces to the caller as the single failure result.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Sample(_))
    }

    /// The pipeline failure kind, if this is one
    pub fn pipeline_kind(&self) -> Option<&PipelineError> {
        match self {
            Self::Pipeline(kind) => Some(kind),
            _ => None,
        }
    }

    /// Get a user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            Self::Pipeline(PipelineError::NoSource) => {
                "Could not read the input video. Please check the file exists and is a supported format.".to_string()
            }
            Self::Pipeline(PipelineError::NoVideoTrack) => {
                "The input has no video track, so there is nothing to crop.".to_string()
            }
            Self::Pipeline(PipelineError::InvalidCropRect { rect }) => {
                format!("Crop rectangle {} does not cover any part of the video frame.", rect)
            }
            Self::Pipeline(PipelineError::ReaderCancelled) => "Transcode cancelled.".to_string(),
            Self::Config(ConfigError::FileNotFound { path }) => {
                format!("Configuration file '{}' not found.", path)
            }
            _ => self.to_string(),
        }
    }
}

impl MediaError {
    pub fn decode<S: Into<String>>(reason: S) -> Self {
        Self::DecodeFailed { reason: reason.into() }
    }

    pub fn encode<S: Into<String>>(reason: S) -> Self {
        Self::EncodeFailed { reason: reason.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_errors_are_not_fatal() {
        let err: TranscoderError = SampleError::TransformFailed {
            reason: "allocation".to_string(),
        }
        .into();
        assert!(!err.is_fatal());
        assert!(err.pipeline_kind().is_none());
    }

    #[test]
    fn test_pipeline_errors_are_fatal() {
        let err: TranscoderError = PipelineError::NoVideoTrack.into();
        assert!(err.is_fatal());
        assert!(matches!(err.pipeline_kind(), Some(PipelineError::NoVideoTrack)));
        assert!(err.user_message().contains("no video track"));
    }

    #[test]
    fn test_out_of_order_message_names_leg() {
        let err = SampleError::OutOfOrder {
            kind: MediaKind::Video,
            previous: MediaTime::new(2, 30),
            next: MediaTime::new(1, 30),
        };
        assert!(err.to_string().starts_with("video"));
    }
}
