//! # Crop-Transcoder
//!
//! Crop every frame of a video to a fixed rectangle and re-encode it, with its
//! audio track passed through, into a fresh MP4 file.
//!
//! The crop is given in display coordinates, so rotated phone footage is cropped
//! the way it looks on screen. Reading, cropping and writing run on separate
//! blocking workers joined by bounded channels, which keeps memory flat no
//! matter how long the input is.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use crop_transcoder::{
//!     config::Config,
//!     media::ffmpeg::{FfmpegSinkFactory, FfmpegSource},
//!     media::Rect,
//!     TranscodeOrchestrator, TranscodeRequest,
//! };
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let source = FfmpegSource::open("portrait.mov")?;
//! let orchestrator = TranscodeOrchestrator::new(
//!     Some(Box::new(source)),
//!     Arc::new(FfmpegSinkFactory::new()),
//!     Config::default(),
//! );
//!
//! let request = TranscodeRequest::new(Rect::new(0.0, 0.0, 720.0, 720.0));
//! let path = orchestrator.transcode(request).await?;
//! println!("{}", path.display());
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`media`] - Geometry, decoded samples, and the source/sink seams
//! - [`pipeline`] - Probing, crop mapping, frame transformation, read and write sides
//! - [`transcode`] - The orchestrator that sequences one transcode
//! - [`config`] - Configuration management
//!
//! ## Media Backends
//!
//! The pipeline only talks to [`MediaSource`](media::MediaSource) and
//! [`SinkFactory`](media::SinkFactory). The `ffmpeg` feature provides
//! libav*-backed implementations; [`SyntheticSource`](media::SyntheticSource)
//! and [`MemorySinkFactory`](media::MemorySinkFactory) run the whole pipeline
//! without any native libraries.

pub mod config;
pub mod error;
pub mod media;
pub mod pipeline;
pub mod transcode;

// Re-export commonly used types for convenience
pub use crate::{
    config::Config,
    error::{Result, TranscoderError},
    pipeline::CropRequest,
    transcode::{TranscodeHandle, TranscodeOrchestrator, TranscodeRequest, TranscodeState},
};
