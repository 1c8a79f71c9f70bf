use crate::config::ReaderSettings;
use crate::error::Result;
use crate::media::{AffineTransform, MediaTime, Sample, Size};

/// Read-only metadata of one track, loaded once while probing
#[derive(Debug, Clone, PartialEq)]
pub struct TrackDescriptor {
    /// Backend-specific track identifier (stream index for containers)
    pub id: usize,

    /// Stored pixel dimensions; zero for audio tracks
    pub natural_size: Size,

    /// Maps stored pixels to display orientation
    pub orientation: AffineTransform,

    /// Nominal frames per second; zero for audio tracks
    pub nominal_frame_rate: f64,

    /// Estimated data rate in bits per second, when known
    pub estimated_bitrate: Option<u64>,
}

impl TrackDescriptor {
    pub fn video(id: usize, natural_size: Size, orientation: AffineTransform, frame_rate: f64) -> Self {
        Self {
            id,
            natural_size,
            orientation,
            nominal_frame_rate: frame_rate,
            estimated_bitrate: None,
        }
    }

    pub fn audio(id: usize) -> Self {
        Self {
            id,
            natural_size: Size::ZERO,
            orientation: AffineTransform::IDENTITY,
            nominal_frame_rate: 0.0,
            estimated_bitrate: None,
        }
    }

    pub fn with_bitrate(mut self, bitrate: Option<u64>) -> Self {
        self.estimated_bitrate = bitrate;
        self
    }

    /// Size of the track once its orientation transform is applied
    pub fn display_size(&self) -> Size {
        self.orientation.apply_to_size(self.natural_size).abs()
    }
}

/// Everything a source reports about itself in one probe
#[derive(Debug, Clone, PartialEq)]
pub struct SourceInfo {
    pub duration: MediaTime,
    /// First video track, if any
    pub video: Option<TrackDescriptor>,
    /// First audio track, if any
    pub audio: Option<TrackDescriptor>,
}

/// An encoded, fully available input asset.
///
/// Implementations are opaque to the pipeline: it only asks for metadata and
/// for one decode cursor per selected track.
pub trait MediaSource: Send {
    /// Human-readable identifier for logs
    fn name(&self) -> String;

    /// Load duration and per-track metadata
    fn load_info(&mut self) -> Result<SourceInfo>;

    /// Open a cursor emitting decoded samples of `track` in decode order,
    /// converted to the fixed formats in `settings`
    fn open_cursor(
        &mut self,
        track: &TrackDescriptor,
        settings: &ReaderSettings,
    ) -> Result<Box<dyn ReadCursor>>;
}

/// Pull-based stream of decoded samples for a single track
pub trait ReadCursor: Send {
    /// Next sample, or `Ok(None)` at end of stream
    fn next_sample(&mut self) -> Result<Option<Sample>>;
}
