use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::EncoderSettings;
use crate::error::Result;
use crate::media::{AffineTransform, MediaKind, Sample};

/// Parameters of the video leg
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoLegSettings {
    /// Encoded frame width; equals the crop width
    pub width: u32,

    /// Encoded frame height; equals the crop height
    pub height: u32,

    /// Source orientation, recorded so players show the result upright
    pub orientation: AffineTransform,

    /// Nominal frame rate of the source, used as an encoder hint
    pub frame_rate: f64,
}

/// Parameters of the audio leg
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioLegSettings {
    pub sample_rate: u32,
    pub channels: u16,
}

/// Legs declared to the destination container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputLayout {
    pub video: VideoLegSettings,
    /// Omitted when the source has no readable audio track
    pub audio: Option<AudioLegSettings>,
}

impl OutputLayout {
    pub fn has_leg(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Video => true,
            MediaKind::Audio => self.audio.is_some(),
        }
    }
}

/// Encoder/muxer backend for one destination container.
///
/// The write pipeline guarantees that appends within a leg arrive in decode
/// order and that nothing is appended to a leg after `finish_leg`.
pub trait ContainerSink: Send {
    /// Whether `kind` can take another sample without blocking
    fn is_ready(&self, kind: MediaKind) -> bool {
        let _ = kind;
        true
    }

    /// Encode and write one sample
    fn append(&mut self, kind: MediaKind, sample: Sample) -> Result<()>;

    /// Flush the leg; no further appends follow
    fn finish_leg(&mut self, kind: MediaKind) -> Result<()>;

    /// Close the container and return its location
    fn finalize(self: Box<Self>) -> Result<PathBuf>;

    /// Discard the container, removing any partial output
    fn abort(self: Box<Self>);
}

/// Creates sinks for a given destination
pub trait SinkFactory: Send + Sync {
    fn create(
        &self,
        path: &Path,
        layout: &OutputLayout,
        settings: &EncoderSettings,
    ) -> Result<Box<dyn ContainerSink>>;
}
