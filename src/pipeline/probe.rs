use tracing::{debug, info, warn};

use crate::{
    error::{PipelineError, Result},
    media::{MediaSource, MediaTime, TrackDescriptor},
};

/// Metadata gathered from one probe of a source
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResult {
    pub duration: MediaTime,
    pub video: Option<TrackDescriptor>,
    pub audio: Option<TrackDescriptor>,
    /// `ceil(duration_seconds * frame_rate)`; zero without a video track
    pub estimated_frames: u64,
}

impl ProbeResult {
    /// The video track, which every crop transcode needs
    pub fn require_video(&self) -> Result<&TrackDescriptor> {
        self.video
            .as_ref()
            .ok_or_else(|| PipelineError::NoVideoTrack.into())
    }

    pub fn has_audio(&self) -> bool {
        self.audio.is_some()
    }
}

/// Inspects a media source once before any sample is read
pub struct SourceProbe;

impl SourceProbe {
    /// Load duration and track metadata.
    ///
    /// A missing or unreadable source fails with `NoSource`. A missing video
    /// track is not an error here; callers decide with `require_video`.
    pub fn probe(source: Option<&mut dyn MediaSource>) -> Result<ProbeResult> {
        let source = source.ok_or(PipelineError::NoSource)?;
        let name = source.name();

        let info = source.load_info().map_err(|e| {
            warn!("Could not load metadata for {}: {}", name, e);
            PipelineError::NoSource
        })?;

        let estimated_frames = info
            .video
            .as_ref()
            .map(|track| Self::estimate_frames(info.duration, track.nominal_frame_rate))
            .unwrap_or(0);

        info!("🔍 Probed {}: duration {}", name, info.duration);
        if let Some(video) = &info.video {
            debug!(
                "   Video: {}x{} @ {:.2} fps, {}°, bitrate {:?}",
                video.natural_size.width,
                video.natural_size.height,
                video.nominal_frame_rate,
                video.orientation.rotation_degrees(),
                video.estimated_bitrate
            );
        }
        debug!("   Audio: {}", if info.audio.is_some() { "present" } else { "absent" });

        Ok(ProbeResult {
            duration: info.duration,
            video: info.video,
            audio: info.audio,
            estimated_frames,
        })
    }

    /// Frame count estimate used for progress reporting only
    pub fn estimate_frames(duration: MediaTime, frame_rate: f64) -> u64 {
        let frames = (duration.seconds() * frame_rate).ceil();
        if frames.is_finite() && frames > 0.0 {
            frames as u64
        } else {
            0
        }
    }
}
