use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::{
    config::ReaderSettings,
    error::{PipelineError, Result},
    media::{MediaKind, MediaSource, ReadCursor, Sample},
    pipeline::ProbeResult,
};

/// Overall state of the read side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderStatus {
    /// At least one track still has samples
    Reading,
    /// Every opened track reached end of stream
    Completed,
    /// A cursor reported a decode error
    Failed,
    /// Reading was stopped from outside
    Cancelled,
}

/// Result of pulling from one track
#[derive(Debug)]
pub enum ReadOutcome {
    Sample(Sample),
    EndOfStream,
}

struct TrackCursor {
    cursor: Box<dyn ReadCursor>,
    finished: bool,
    read: u64,
}

impl TrackCursor {
    fn new(cursor: Box<dyn ReadCursor>) -> Self {
        Self {
            cursor,
            finished: false,
            read: 0,
        }
    }
}

/// Pulls decoded samples from the selected tracks in decode order
pub struct DemuxReadPipeline {
    video: TrackCursor,
    audio: Option<TrackCursor>,
    status: ReaderStatus,
    cancel: CancellationToken,
}

impl DemuxReadPipeline {
    /// Open one cursor per selected track.
    ///
    /// The video cursor is required. An audio cursor that fails to open is
    /// logged and left out, which skips the audio phase entirely.
    pub fn open(
        source: &mut dyn MediaSource,
        probe: &ProbeResult,
        settings: &ReaderSettings,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let video_track = probe.require_video()?;
        let video = source.open_cursor(video_track, settings).map_err(|e| {
            PipelineError::ReaderInitFailure {
                reason: format!("video track {}: {}", video_track.id, e),
            }
        })?;

        let audio = match &probe.audio {
            Some(track) => match source.open_cursor(track, settings) {
                Ok(cursor) => Some(TrackCursor::new(cursor)),
                Err(e) => {
                    warn!("Audio track {} could not be opened, output will be silent: {}", track.id, e);
                    None
                }
            },
            None => None,
        };

        debug!(
            "Read cursors open: video, audio {}",
            if audio.is_some() { "yes" } else { "no" }
        );

        Ok(Self {
            video: TrackCursor::new(video),
            audio,
            status: ReaderStatus::Reading,
            cancel,
        })
    }

    pub fn status(&self) -> ReaderStatus {
        self.status
    }

    pub fn has_audio(&self) -> bool {
        self.audio.is_some()
    }

    pub fn next_video_sample(&mut self) -> ReadOutcome {
        self.next_sample(MediaKind::Video)
    }

    pub fn next_audio_sample(&mut self) -> ReadOutcome {
        self.next_sample(MediaKind::Audio)
    }

    /// Pull the next sample of `kind`. A track that has ended is never
    /// polled again.
    pub fn next_sample(&mut self, kind: MediaKind) -> ReadOutcome {
        if self.cancel.is_cancelled() {
            self.cancel_reading();
        }
        if matches!(self.status, ReaderStatus::Cancelled | ReaderStatus::Failed) {
            return ReadOutcome::EndOfStream;
        }

        let track = match kind {
            MediaKind::Video => &mut self.video,
            MediaKind::Audio => match self.audio.as_mut() {
                Some(track) => track,
                None => return ReadOutcome::EndOfStream,
            },
        };
        if track.finished {
            return ReadOutcome::EndOfStream;
        }

        match track.cursor.next_sample() {
            Ok(Some(sample)) => {
                track.read += 1;
                ReadOutcome::Sample(sample)
            }
            Ok(None) => {
                track.finished = true;
                debug!("{} track ended after {} samples", kind, track.read);
                if self.all_finished() {
                    self.status = ReaderStatus::Completed;
                }
                ReadOutcome::EndOfStream
            }
            Err(e) => {
                track.finished = true;
                error!("Reading {} failed after {} samples: {}", kind, track.read, e);
                self.status = ReaderStatus::Failed;
                ReadOutcome::EndOfStream
            }
        }
    }

    /// Stop reading. Pending tracks are treated as ended.
    pub fn cancel_reading(&mut self) {
        if matches!(self.status, ReaderStatus::Reading) {
            debug!("Reading cancelled");
            self.status = ReaderStatus::Cancelled;
        }
    }

    pub fn is_finished(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Video => self.video.finished,
            MediaKind::Audio => self.audio.as_ref().map_or(true, |t| t.finished),
        }
    }

    pub fn samples_read(&self, kind: MediaKind) -> u64 {
        match kind {
            MediaKind::Video => self.video.read,
            MediaKind::Audio => self.audio.as_ref().map_or(0, |t| t.read),
        }
    }

    fn all_finished(&self) -> bool {
        self.is_finished(MediaKind::Video) && self.is_finished(MediaKind::Audio)
    }
}
