//! # Pipeline Module
//!
//! The stages one transcode is built from: probing, crop mapping, frame
//! transformation, and the read and write sides.

pub mod probe;
pub mod crop;
pub mod transform;
pub mod reader;
pub mod writer;
pub mod progress;

pub use probe::{ProbeResult, SourceProbe};
pub use crop::CropRequest;
pub use transform::FrameTransformer;
pub use reader::{DemuxReadPipeline, ReadOutcome, ReaderStatus};
pub use writer::MuxWritePipeline;
pub use progress::{ProgressSnapshot, TranscodeProgress};
