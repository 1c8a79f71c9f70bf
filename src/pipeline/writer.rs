use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::{
    config::EncoderSettings,
    error::{PipelineError, Result, SampleError, TranscoderError},
    media::{ContainerSink, MediaKind, MediaTime, OutputLayout, Sample, SinkFactory},
};

#[derive(Debug, Default, Clone, Copy)]
struct LegState {
    declared: bool,
    finished: bool,
    last_dts: Option<MediaTime>,
    appended: u64,
    dropped: u64,
}

impl LegState {
    fn declared(declared: bool) -> Self {
        Self {
            declared,
            ..Self::default()
        }
    }
}

/// Writes the video and audio legs of one destination container.
///
/// Appends within a leg must arrive in strictly increasing decode order.
/// The container is finalized only once every declared leg is finished.
pub struct MuxWritePipeline {
    sink: Box<dyn ContainerSink>,
    path: PathBuf,
    layout: OutputLayout,
    settings: EncoderSettings,
    video: LegState,
    audio: LegState,
}

impl MuxWritePipeline {
    /// Create the destination container with the legs in `layout`
    pub fn create(
        factory: &dyn SinkFactory,
        path: PathBuf,
        layout: OutputLayout,
        settings: EncoderSettings,
    ) -> Result<Self> {
        let sink = factory.create(&path, &layout, &settings).map_err(|e| {
            PipelineError::WriterInitFailure {
                reason: format!("{}: {}", path.display(), e),
            }
        })?;

        info!(
            "📼 Writing {}x{} H.264 at {} bps{} to {:?}",
            layout.video.width,
            layout.video.height,
            settings.video_bitrate,
            if layout.has_leg(MediaKind::Audio) { " with AAC audio" } else { "" },
            path
        );

        let video = LegState::declared(layout.has_leg(MediaKind::Video));
        let audio = LegState::declared(layout.has_leg(MediaKind::Audio));
        Ok(Self {
            sink,
            path,
            layout,
            settings,
            video,
            audio,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn layout(&self) -> &OutputLayout {
        &self.layout
    }

    pub fn settings(&self) -> &EncoderSettings {
        &self.settings
    }

    fn leg(&self, kind: MediaKind) -> &LegState {
        match kind {
            MediaKind::Video => &self.video,
            MediaKind::Audio => &self.audio,
        }
    }

    fn leg_mut(&mut self, kind: MediaKind) -> &mut LegState {
        match kind {
            MediaKind::Video => &mut self.video,
            MediaKind::Audio => &mut self.audio,
        }
    }

    /// Whether `kind` accepts another sample right now
    pub fn is_ready(&self, kind: MediaKind) -> bool {
        let leg = self.leg(kind);
        leg.declared && !leg.finished && self.sink.is_ready(kind)
    }

    /// Append one sample to the leg matching its kind.
    ///
    /// Failures are per sample: the sample is dropped and counted, and the
    /// leg stays open for the next one.
    pub fn append(&mut self, sample: Sample) -> std::result::Result<(), SampleError> {
        let kind = sample.kind();
        let dts = sample.timing().dts;
        let leg = *self.leg(kind);

        let rejection = if !leg.declared {
            Some(SampleError::AppendFailed {
                kind,
                reason: "leg not declared in this container".to_string(),
            })
        } else if leg.finished {
            Some(SampleError::AppendFailed {
                kind,
                reason: "leg already finished".to_string(),
            })
        } else {
            match leg.last_dts {
                Some(previous) if dts <= previous => Some(SampleError::OutOfOrder {
                    kind,
                    previous,
                    next: dts,
                }),
                _ => None,
            }
        };
        if let Some(err) = rejection {
            self.leg_mut(kind).dropped += 1;
            return Err(err);
        }

        match self.sink.append(kind, sample) {
            Ok(()) => {
                let leg = self.leg_mut(kind);
                leg.last_dts = Some(dts);
                leg.appended += 1;
                Ok(())
            }
            Err(e) => {
                self.leg_mut(kind).dropped += 1;
                Err(match e {
                    TranscoderError::Sample(inner) => inner,
                    other => SampleError::AppendFailed {
                        kind,
                        reason: other.to_string(),
                    },
                })
            }
        }
    }

    /// Mark `kind` as complete. Idempotent; a leg that was never declared
    /// counts as finished already.
    pub fn mark_finished(&mut self, kind: MediaKind) -> Result<()> {
        let leg = *self.leg(kind);
        if !leg.declared || leg.finished {
            return Ok(());
        }

        self.leg_mut(kind).finished = true;
        self.sink.finish_leg(kind)?;
        debug!(
            "{} leg finished: {} appended, {} dropped",
            kind, leg.appended, leg.dropped
        );
        Ok(())
    }

    pub fn is_finished(&self, kind: MediaKind) -> bool {
        let leg = self.leg(kind);
        !leg.declared || leg.finished
    }

    pub fn appended(&self, kind: MediaKind) -> u64 {
        self.leg(kind).appended
    }

    pub fn dropped(&self, kind: MediaKind) -> u64 {
        self.leg(kind).dropped
    }

    /// Close the container once every declared leg is finished
    pub fn finalize(self) -> Result<PathBuf> {
        for kind in [MediaKind::Video, MediaKind::Audio] {
            if !self.is_finished(kind) {
                let reason = format!("{} leg still open", kind);
                self.abort();
                return Err(PipelineError::FinalizeFailure { reason }.into());
            }
        }

        let path = self.path.clone();
        self.sink.finalize().map_err(|e| {
            if path.exists() {
                let _ = std::fs::remove_file(&path);
            }
            TranscoderError::from(PipelineError::FinalizeFailure {
                reason: e.to_string(),
            })
        })
    }

    /// Discard the container and any partial output
    pub fn abort(self) {
        warn!("Discarding partial output {:?}", self.path);
        self.sink.abort();
    }
}
