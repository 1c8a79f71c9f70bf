//! # Media Module
//!
//! Media primitives shared by every stage: geometry, decoded samples, and the
//! source/sink seams that media backends implement.

pub mod geometry;
pub mod types;
pub mod source;
pub mod sink;
pub mod memory;

#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;

pub use geometry::{AffineTransform, PixelRect, Point, Rect, Size};
pub use types::{
    AudioBuffer, FormatDescription, MediaKind, MediaTime, PixelBuffer, PixelFormat, Sample,
    SamplePayload, SampleTiming,
};
pub use source::{MediaSource, ReadCursor, SourceInfo, TrackDescriptor};
pub use sink::{AudioLegSettings, ContainerSink, OutputLayout, SinkFactory, VideoLegSettings};
pub use memory::{MemorySinkFactory, RecordedContainer, SyntheticSource};
