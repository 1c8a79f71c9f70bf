use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::{Config, EncoderSettings, ReaderSettings},
    error::{PipelineError, Result, TranscoderError},
    media::{
        AudioLegSettings, MediaKind, MediaSource, OutputLayout, PixelRect, Rect, Sample,
        SinkFactory, VideoLegSettings,
    },
    pipeline::{
        CropRequest, DemuxReadPipeline, FrameTransformer, MuxWritePipeline, ProgressSnapshot,
        ReadOutcome, ReaderStatus, SourceProbe, TranscodeProgress,
    },
    transcode::TranscodeState,
};

/// How long a consumer waits before asking a busy sink again
const READY_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Destination path of a finished transcode, or the failure that ended it
pub type TranscodeResult = Result<PathBuf>;

/// What to transcode
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TranscodeRequest {
    /// Crop rectangle in display space; the zero rectangle is rejected
    pub crop: Rect,

    /// Accepted and validated, but samples are not trimmed
    pub start_time: Option<f64>,

    /// Accepted and validated, but samples are not trimmed
    pub end_time: Option<f64>,
}

impl TranscodeRequest {
    pub fn new(crop: Rect) -> Self {
        Self {
            crop,
            ..Self::default()
        }
    }

    pub fn with_time_range(mut self, start_time: Option<f64>, end_time: Option<f64>) -> Self {
        self.start_time = start_time;
        self.end_time = end_time;
        self
    }

    /// Check the optional time range for plausibility
    pub fn check_time_range(&self) -> std::result::Result<(), String> {
        for (label, time) in [("start", self.start_time), ("end", self.end_time)] {
            if let Some(t) = time {
                if !t.is_finite() || t < 0.0 {
                    return Err(format!("{} time {} is not a non-negative number", label, t));
                }
            }
        }
        if let (Some(start), Some(end)) = (self.start_time, self.end_time) {
            if start >= end {
                return Err(format!("start {} is not before end {}", start, end));
            }
        }
        Ok(())
    }
}

/// Observer side of a running transcode
#[derive(Clone)]
pub struct TranscodeHandle {
    progress: Arc<TranscodeProgress>,
    state: watch::Receiver<TranscodeState>,
    cancel: CancellationToken,
}

impl TranscodeHandle {
    pub fn progress(&self) -> ProgressSnapshot {
        self.progress.snapshot()
    }

    pub fn state(&self) -> TranscodeState {
        *self.state.borrow()
    }

    /// Receiver notified on every state change
    pub fn subscribe(&self) -> watch::Receiver<TranscodeState> {
        self.state.clone()
    }

    /// Stop the transcode; no output is produced
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Runs one crop transcode from probe to finalized container.
///
/// The sequence is linear with no retries:
/// 1. Probe - load metadata, require a video track, map the crop
/// 2. Drain video - read, crop and write every frame
/// 3. Drain audio - pass every audio sample through (skipped without audio
///    or after a read failure)
/// 4. Finalize - close the container and return its path
///
/// The orchestrator is consumed by `transcode`; a new one is needed for
/// every run.
pub struct TranscodeOrchestrator {
    source: Option<Box<dyn MediaSource>>,
    sinks: Arc<dyn SinkFactory>,
    config: Config,
    progress: Arc<TranscodeProgress>,
    state: watch::Sender<TranscodeState>,
    cancel: CancellationToken,
}

impl TranscodeOrchestrator {
    pub fn new(
        source: Option<Box<dyn MediaSource>>,
        sinks: Arc<dyn SinkFactory>,
        config: Config,
    ) -> Self {
        let (state, _) = watch::channel(TranscodeState::Idle);
        Self {
            source,
            sinks,
            config,
            progress: Arc::new(TranscodeProgress::new()),
            state,
            cancel: CancellationToken::new(),
        }
    }

    /// Use an externally owned cancellation token
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn handle(&self) -> TranscodeHandle {
        TranscodeHandle {
            progress: Arc::clone(&self.progress),
            state: self.state.subscribe(),
            cancel: self.cancel.clone(),
        }
    }

    pub fn state(&self) -> TranscodeState {
        *self.state.borrow()
    }

    /// Crop and re-encode the source, returning the new file's location
    pub async fn transcode(mut self, request: TranscodeRequest) -> TranscodeResult {
        info!("🎬 Starting crop transcode");
        info!(
            "   Source: {}",
            self.source.as_ref().map_or_else(|| "<none>".to_string(), |s| s.name())
        );
        info!("   Crop: {}", request.crop);

        let result = self.run(request).await;

        match &result {
            Ok(path) => {
                self.transition(TranscodeState::Done);
                info!("🎉 Transcode complete! Output saved to: {:?}", path);
            }
            Err(e) => {
                self.transition(TranscodeState::Failed);
                error!("❌ Transcode failed: {}", e);
            }
        }
        result
    }

    async fn run(&mut self, request: TranscodeRequest) -> Result<PathBuf> {
        self.config.validate()?;

        // Probing
        self.transition(TranscodeState::Probing);
        let probe = SourceProbe::probe(self.source_mut())?;
        let video = probe.require_video()?.clone();
        let crop = CropRequest::new(request.crop).to_storage(&video)?;

        match request.check_time_range() {
            Ok(()) if request.start_time.is_some() || request.end_time.is_some() => {
                debug!(
                    "Time range {:?}..{:?} accepted, full source is transcoded",
                    request.start_time, request.end_time
                );
            }
            Ok(()) => {}
            Err(reason) => warn!("Ignoring time range: {}", reason),
        }

        self.progress.set_total_frames(probe.estimated_frames);

        let reader_settings = ReaderSettings::from_config(&self.config);
        let cancel = self.cancel.clone();
        let source = self.source_mut().ok_or(PipelineError::NoSource)?;
        let reader = DemuxReadPipeline::open(source, &probe, &reader_settings, cancel)?;

        let settings = EncoderSettings::from_config(&self.config);
        if let Some(bitrate) = video.estimated_bitrate {
            debug!(
                "Source video at {} bps, encoding at {} bps",
                bitrate, settings.video_bitrate
            );
        }
        let layout = OutputLayout {
            video: VideoLegSettings {
                width: crop.width,
                height: crop.height,
                orientation: video.orientation,
                frame_rate: video.nominal_frame_rate,
            },
            audio: reader.has_audio().then(|| AudioLegSettings {
                sample_rate: reader_settings.audio_sample_rate,
                channels: reader_settings.audio_channels,
            }),
        };

        let directory = self.config.output.resolved_directory();
        std::fs::create_dir_all(&directory).map_err(|e| PipelineError::WriterInitFailure {
            reason: format!("{}: {}", directory.display(), e),
        })?;
        let path = self.config.output.unique_path();
        let writer = MuxWritePipeline::create(self.sinks.as_ref(), path, layout, settings)?;

        let drain = DrainContext {
            progress: Arc::clone(&self.progress),
            cancel: self.cancel.clone(),
            capacity: self.config.pipeline.channel_capacity,
        };

        // Draining video
        self.transition(TranscodeState::DrainingVideo);
        info!("🎞️  Draining video ({} frames expected)", probe.estimated_frames);
        let (reader, mut writer) = drain_leg(reader, writer, MediaKind::Video, crop, &drain).await?;
        if let Err(e) = writer.mark_finished(MediaKind::Video) {
            writer.abort();
            return Err(e);
        }
        if self.cancelled(&reader) {
            writer.abort();
            return Err(PipelineError::ReaderCancelled.into());
        }

        // Draining audio
        let (reader, mut writer) = if reader.has_audio() && reader.status() == ReaderStatus::Reading
        {
            self.transition(TranscodeState::DrainingAudio);
            info!("🔊 Draining audio");
            drain_leg(reader, writer, MediaKind::Audio, crop, &drain).await?
        } else {
            if reader.has_audio() {
                warn!("Reading did not complete ({:?}), skipping audio", reader.status());
            }
            (reader, writer)
        };
        if let Err(e) = writer.mark_finished(MediaKind::Audio) {
            writer.abort();
            return Err(e);
        }
        if self.cancelled(&reader) {
            writer.abort();
            return Err(PipelineError::ReaderCancelled.into());
        }
        drop(reader);

        // Finalizing
        self.transition(TranscodeState::Finalizing);
        let path = tokio::task::spawn_blocking(move || writer.finalize())
            .await
            .map_err(|e| TranscoderError::generic(format!("finalize task failed: {}", e)))??;

        let snap = self.progress.snapshot();
        info!(
            "   Video: {} read, {} written, {} dropped, {} uncropped",
            snap.video_read, snap.frames_completed, snap.video_dropped, snap.transform_fallbacks
        );
        info!(
            "   Audio: {} read, {} written, {} dropped",
            snap.audio_read, snap.audio_written, snap.audio_dropped
        );

        Ok(path)
    }

    fn source_mut(&mut self) -> Option<&mut dyn MediaSource> {
        let source: &mut dyn MediaSource = &mut **self.source.as_mut()?;
        Some(source)
    }

    fn cancelled(&self, reader: &DemuxReadPipeline) -> bool {
        self.cancel.is_cancelled() || reader.status() == ReaderStatus::Cancelled
    }

    fn transition(&self, next: TranscodeState) {
        let current = *self.state.borrow();
        if !current.can_transition_to(&next) {
            warn!("Unexpected state change {} -> {}", current, next);
        }
        debug!("State: {} -> {}", current, next);
        self.state.send_replace(next);
    }
}

/// Shared by both halves of a drain
struct DrainContext {
    progress: Arc<TranscodeProgress>,
    cancel: CancellationToken,
    capacity: usize,
}

/// Move every sample of `kind` from the reader to the writer.
///
/// A producer task reads (and crops video) and a consumer task appends,
/// joined by a bounded channel so the reader never runs more than
/// `capacity` samples ahead of the leg. Both check the cancellation token
/// on every iteration. The reader and writer come back once both tasks end.
async fn drain_leg(
    mut reader: DemuxReadPipeline,
    mut writer: MuxWritePipeline,
    kind: MediaKind,
    crop: PixelRect,
    ctx: &DrainContext,
) -> Result<(DemuxReadPipeline, MuxWritePipeline)> {
    let (tx, mut rx) = mpsc::channel::<Sample>(ctx.capacity.max(1));
    let path = writer.path().to_path_buf();

    let producer = {
        let progress = Arc::clone(&ctx.progress);
        let cancel = ctx.cancel.clone();
        tokio::task::spawn_blocking(move || {
            loop {
                if cancel.is_cancelled() {
                    reader.cancel_reading();
                    break;
                }

                let sample = match reader.next_sample(kind) {
                    ReadOutcome::Sample(sample) => sample,
                    ReadOutcome::EndOfStream => break,
                };
                progress.record_read(kind);

                let sample = match kind {
                    MediaKind::Video => match FrameTransformer::transform(&sample, &crop) {
                        Some(cropped) => cropped,
                        None => {
                            progress.record_transform_fallback();
                            warn!("Writing frame at {} uncropped", sample.timing().pts);
                            sample
                        }
                    },
                    MediaKind::Audio => sample,
                };

                if tx.blocking_send(sample).is_err() {
                    debug!("{} writer stopped, ending read", kind);
                    break;
                }
            }
            reader
        })
    };

    let consumer = {
        let progress = Arc::clone(&ctx.progress);
        let cancel = ctx.cancel.clone();
        tokio::task::spawn_blocking(move || {
            'samples: loop {
                while !writer.is_ready(kind) {
                    if cancel.is_cancelled() || writer.is_finished(kind) {
                        break 'samples;
                    }
                    std::thread::sleep(READY_POLL_INTERVAL);
                }
                if cancel.is_cancelled() {
                    break;
                }

                let Some(sample) = rx.blocking_recv() else {
                    break;
                };
                match writer.append(sample) {
                    Ok(()) => progress.record_written(kind),
                    Err(e) => {
                        progress.record_dropped(kind);
                        warn!("Dropped {} sample: {}", kind, e);
                    }
                }
            }
            writer
        })
    };

    match tokio::join!(producer, consumer) {
        (Ok(reader), Ok(writer)) => Ok((reader, writer)),
        (Err(e), Ok(writer)) => {
            writer.abort();
            Err(TranscoderError::generic(format!("{} read task failed: {}", kind, e)))
        }
        (_, Err(e)) => {
            let _ = std::fs::remove_file(&path);
            Err(TranscoderError::generic(format!("{} write task failed: {}", kind, e)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::atomic::Ordering;

    use rand::{rngs::SmallRng, Rng, SeedableRng};
    use tempfile::tempdir;

    use crate::config::MIN_VIDEO_BITRATE;
    use crate::media::{
        AffineTransform, MediaTime, MemorySinkFactory, RecordedContainer, Size, SyntheticSource,
    };

    fn config_in(dir: &Path) -> Config {
        let mut config = Config::default();
        config.output.directory = Some(dir.to_path_buf());
        config
    }

    fn orchestrator(
        source: Option<SyntheticSource>,
        factory: &MemorySinkFactory,
        dir: &Path,
    ) -> TranscodeOrchestrator {
        let source = source.map(|s| Box::new(s) as Box<dyn MediaSource>);
        TranscodeOrchestrator::new(source, Arc::new(factory.clone()), config_in(dir))
    }

    async fn run(
        source: SyntheticSource,
        factory: &MemorySinkFactory,
        dir: &Path,
        crop: Rect,
    ) -> TranscodeResult {
        orchestrator(Some(source), factory, dir)
            .transcode(TranscodeRequest::new(crop))
            .await
    }

    fn files_in(dir: &Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    fn recorded(factory: &MemorySinkFactory) -> RecordedContainer {
        factory.recorded().unwrap()
    }

    #[tokio::test]
    async fn test_full_scenario_with_audio() {
        let dir = tempdir().unwrap();
        let factory = MemorySinkFactory::new();
        let source = SyntheticSource::new(1920, 1080, 30)
            .with_duration(10.0)
            .with_bitrate(1_000_000);
        let stats = source.stats();

        let orchestrator = orchestrator(Some(source), &factory, dir.path());
        let handle = orchestrator.handle();
        let path = orchestrator
            .transcode(TranscodeRequest::new(Rect::new(0.0, 0.0, 100.0, 100.0)))
            .await
            .unwrap();

        assert!(path.exists());
        assert!(path.starts_with(dir.path()));
        assert!(path.to_string_lossy().ends_with("_finished.mp4"));
        assert_eq!(handle.state(), TranscodeState::Done);

        let container = recorded(&factory);
        assert!(container.finalized);
        assert_eq!((container.layout.video.width, container.layout.video.height), (100, 100));
        assert_eq!(container.video.sample_count(), 300);
        assert!(container.video.frame_sizes.iter().all(|&size| size == (100, 100)));
        assert!(container.video.finished);

        let audio = container.layout.audio.clone().unwrap();
        assert_eq!((audio.sample_rate, audio.channels), (44100, 2));
        assert!(container.audio.finished);
        assert_eq!(container.audio.audio_frames, 441_000);
        assert_eq!(
            container.audio.sample_count(),
            stats.audio_samples_read.load(Ordering::Relaxed)
        );

        // Source bitrate is below the floor; the encoder still gets the floor
        assert_eq!(container.settings.video_bitrate, MIN_VIDEO_BITRATE);

        let progress = handle.progress();
        assert_eq!(progress.total_frames, 300);
        assert_eq!(progress.frames_completed, 300);
        assert_eq!(progress.fraction(), 1.0);
    }

    #[tokio::test]
    async fn test_output_size_matches_random_contained_crops() {
        let dir = tempdir().unwrap();
        let mut rng = SmallRng::seed_from_u64(7);

        for _ in 0..20 {
            let width = rng.gen_range(1..=64u32);
            let height = rng.gen_range(1..=48u32);
            let x = rng.gen_range(0..=64 - width);
            let y = rng.gen_range(0..=48 - height);
            let crop = Rect::new(x as f64, y as f64, width as f64, height as f64);

            let factory = MemorySinkFactory::new();
            let source = SyntheticSource::new(64, 48, 10).with_duration(0.3).without_audio();
            run(source, &factory, dir.path(), crop).await.unwrap();

            let container = recorded(&factory);
            assert_eq!(container.video.sample_count(), 3);
            for (i, size) in container.video.frame_sizes.iter().enumerate() {
                assert_eq!(*size, (width, height), "frame {i} of crop {crop}");
            }
            // Top-left pixel of the crop carries the crop origin
            assert_eq!(container.video.first_pixels[0], [x as u8, y as u8, 0, 255]);
        }
    }

    #[tokio::test]
    async fn test_append_failures_drop_only_those_samples() {
        let dir = tempdir().unwrap();
        let factory = MemorySinkFactory::new()
            .fail_append(MediaKind::Video, 3)
            .fail_append(MediaKind::Video, 7)
            .fail_append(MediaKind::Audio, 0);
        let source = SyntheticSource::new(64, 64, 10).with_duration(1.0);
        let stats = source.stats();

        let orchestrator = orchestrator(Some(source), &factory, dir.path());
        let handle = orchestrator.handle();
        orchestrator
            .transcode(TranscodeRequest::new(Rect::new(0.0, 0.0, 32.0, 32.0)))
            .await
            .unwrap();

        let read = stats.video_samples_read.load(Ordering::Relaxed) as u64;
        let progress = handle.progress();
        assert_eq!(read, 10);
        assert_eq!(progress.video_dropped, 2);
        assert_eq!(progress.frames_completed, read - progress.video_dropped);
        assert_eq!(progress.audio_dropped, 1);

        let container = recorded(&factory);
        assert_eq!(container.video.sample_count() as u64, progress.frames_completed);
        assert_eq!(container.video.rejected, 2);
    }

    #[tokio::test]
    async fn test_output_timing_is_ordered_subsequence_of_input() {
        let dir = tempdir().unwrap();
        let factory = MemorySinkFactory::new().fail_append(MediaKind::Video, 4);
        let source = SyntheticSource::new(32, 32, 25).with_duration(1.0).without_audio();
        run(source, &factory, dir.path(), Rect::new(4.0, 4.0, 8.0, 8.0))
            .await
            .unwrap();

        let written = recorded(&factory).video.presentation_times;
        let expected: Vec<MediaTime> = (0..25)
            .filter(|&i| i != 4)
            .map(|i| MediaTime::new(i, 25))
            .collect();
        assert_eq!(written, expected);
        assert!(written.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[tokio::test]
    async fn test_video_only_source_finalizes_without_audio() {
        let dir = tempdir().unwrap();
        let factory = MemorySinkFactory::new();
        let source = SyntheticSource::new(320, 240, 30).with_duration(1.0).without_audio();

        let orchestrator = orchestrator(Some(source), &factory, dir.path());
        let mut states = orchestrator.handle().subscribe();
        let path = orchestrator
            .transcode(TranscodeRequest::new(Rect::new(10.0, 10.0, 100.0, 50.0)))
            .await
            .unwrap();

        assert!(path.exists());
        let container = recorded(&factory);
        assert!(container.finalized);
        assert!(container.layout.audio.is_none());
        assert_eq!(container.audio.sample_count(), 0);
        assert_eq!(container.video.sample_count(), 30);
        assert_eq!(*states.borrow_and_update(), TranscodeState::Done);
    }

    #[tokio::test]
    async fn test_invalid_crop_fails_before_reading() {
        for crop in [
            Rect::ZERO,
            Rect::new(0.0, 0.0, -0.0, 10.0),
            Rect::new(5000.0, 5000.0, 10.0, 10.0),
        ] {
            let dir = tempdir().unwrap();
            let factory = MemorySinkFactory::new();
            let source = SyntheticSource::new(640, 480, 30);
            let stats = source.stats();

            let err = run(source, &factory, dir.path(), crop).await.unwrap_err();
            assert!(
                matches!(err.pipeline_kind(), Some(PipelineError::InvalidCropRect { .. })),
                "{crop}: {err}"
            );
            assert_eq!(stats.cursors_opened.load(Ordering::Relaxed), 0);
            assert!(factory.recorded().is_none());
            assert_eq!(files_in(dir.path()), 0);
        }
    }

    #[tokio::test]
    async fn test_default_request_is_rejected() {
        let dir = tempdir().unwrap();
        let factory = MemorySinkFactory::new();
        let err = orchestrator(Some(SyntheticSource::new(64, 64, 30)), &factory, dir.path())
            .transcode(TranscodeRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err.pipeline_kind(), Some(PipelineError::InvalidCropRect { .. })));
    }

    #[tokio::test]
    async fn test_missing_video_track_fails_without_output() {
        let dir = tempdir().unwrap();
        let factory = MemorySinkFactory::new();
        let source = SyntheticSource::new(1920, 1080, 30).with_duration(10.0).without_video();

        let orchestrator = orchestrator(Some(source), &factory, dir.path());
        let handle = orchestrator.handle();
        let err = orchestrator
            .transcode(TranscodeRequest::new(Rect::new(0.0, 0.0, 100.0, 100.0)))
            .await
            .unwrap_err();

        assert!(matches!(err.pipeline_kind(), Some(PipelineError::NoVideoTrack)));
        assert_eq!(handle.state(), TranscodeState::Failed);
        assert!(factory.recorded().is_none());
        assert_eq!(files_in(dir.path()), 0);
    }

    #[tokio::test]
    async fn test_missing_source_is_no_source() {
        let dir = tempdir().unwrap();
        let factory = MemorySinkFactory::new();
        let err = orchestrator(None, &factory, dir.path())
            .transcode(TranscodeRequest::new(Rect::new(0.0, 0.0, 10.0, 10.0)))
            .await
            .unwrap_err();
        assert!(matches!(err.pipeline_kind(), Some(PipelineError::NoSource)));

        let err = run(
            SyntheticSource::new(64, 64, 30).unavailable(),
            &factory,
            dir.path(),
            Rect::new(0.0, 0.0, 10.0, 10.0),
        )
        .await
        .unwrap_err();
        assert!(matches!(err.pipeline_kind(), Some(PipelineError::NoSource)));
    }

    #[tokio::test]
    async fn test_cancellation_discards_output() {
        let dir = tempdir().unwrap();
        let cancel = CancellationToken::new();
        let factory = MemorySinkFactory::new().cancel_after_video_frames(5, cancel.clone());
        let source = SyntheticSource::new(64, 64, 30).with_duration(2.0);

        let orchestrator =
            orchestrator(Some(source), &factory, dir.path()).with_cancellation(cancel);
        let handle = orchestrator.handle();
        let err = orchestrator
            .transcode(TranscodeRequest::new(Rect::new(0.0, 0.0, 16.0, 16.0)))
            .await
            .unwrap_err();

        assert!(matches!(err.pipeline_kind(), Some(PipelineError::ReaderCancelled)));
        assert!(handle.is_cancelled());
        assert_eq!(handle.state(), TranscodeState::Failed);

        let container = recorded(&factory);
        assert!(container.aborted);
        assert!(!container.finalized);
        assert!(container.video.sample_count() < 60);
        assert_eq!(container.audio.sample_count(), 0);
        assert_eq!(files_in(dir.path()), 0);
    }

    #[tokio::test]
    async fn test_read_failure_skips_audio_and_still_finalizes() {
        let dir = tempdir().unwrap();
        let factory = MemorySinkFactory::new();
        let source = SyntheticSource::new(64, 64, 30).with_duration(1.0).fail_video_read_at(12);
        let stats = source.stats();

        let path = run(source, &factory, dir.path(), Rect::new(0.0, 0.0, 32.0, 32.0))
            .await
            .unwrap();

        assert!(path.exists());
        let container = recorded(&factory);
        assert!(container.finalized);
        assert_eq!(container.video.sample_count(), 12);
        assert!(container.layout.audio.is_some());
        assert!(container.audio.finished);
        assert_eq!(container.audio.sample_count(), 0);
        assert_eq!(stats.audio_samples_read.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_transform_failure_falls_back_to_original_frame() {
        let dir = tempdir().unwrap();
        let factory = MemorySinkFactory::new();
        let source = SyntheticSource::new(64, 48, 10)
            .with_duration(1.0)
            .without_audio()
            .short_frame_at(2);

        let orchestrator = orchestrator(Some(source), &factory, dir.path());
        let handle = orchestrator.handle();
        orchestrator
            .transcode(TranscodeRequest::new(Rect::new(40.0, 30.0, 20.0, 10.0)))
            .await
            .unwrap();

        let container = recorded(&factory);
        assert_eq!(container.video.sample_count(), 10);
        assert_eq!(container.video.frame_sizes[2], (32, 24));
        assert_eq!(container.video.frame_sizes[3], (20, 10));
        assert_eq!(handle.progress().transform_fallbacks, 1);
    }

    #[tokio::test]
    async fn test_rotated_source_keeps_orientation() {
        let dir = tempdir().unwrap();
        let factory = MemorySinkFactory::new();
        let natural = Size::new(64.0, 32.0);
        let orientation = AffineTransform::rotation(90, natural);
        let source = SyntheticSource::new(64, 32, 10)
            .with_duration(0.5)
            .with_orientation(orientation)
            .without_audio();

        // Display is 32 wide, 64 tall: a 10x20 crop there is 20x10 stored
        run(source, &factory, dir.path(), Rect::new(0.0, 0.0, 10.0, 20.0))
            .await
            .unwrap();

        let container = recorded(&factory);
        assert_eq!(container.layout.video.orientation, orientation);
        assert_eq!((container.layout.video.width, container.layout.video.height), (20, 10));
        assert!(container.video.frame_sizes.iter().all(|&size| size == (20, 10)));
        assert_eq!(container.video.first_pixels[0], [0, 22, 0, 255]);
    }

    #[tokio::test]
    async fn test_backpressure_with_intermittent_readiness() {
        let dir = tempdir().unwrap();
        let factory = MemorySinkFactory::new().not_ready_every(3);
        let source = SyntheticSource::new(32, 32, 30).with_duration(1.0);

        let mut config = config_in(dir.path());
        config.pipeline.channel_capacity = 1;
        let orchestrator = TranscodeOrchestrator::new(
            Some(Box::new(source)),
            Arc::new(factory.clone()),
            config,
        );
        orchestrator
            .transcode(TranscodeRequest::new(Rect::new(0.0, 0.0, 8.0, 8.0)))
            .await
            .unwrap();

        let container = recorded(&factory);
        assert_eq!(container.video.sample_count(), 30);
        assert_eq!(container.audio.audio_frames, 44100);
    }

    #[tokio::test]
    async fn test_stalled_sink_is_polled_not_spun() {
        let dir = tempdir().unwrap();
        let factory = MemorySinkFactory::new().stall_for(Duration::from_millis(200));
        let source = SyntheticSource::new(32, 32, 30).with_duration(0.3);
        let frames = source.frame_count();

        let mut config = config_in(dir.path());
        config.pipeline.channel_capacity = 1;
        let orchestrator = TranscodeOrchestrator::new(
            Some(Box::new(source)),
            Arc::new(factory.clone()),
            config,
        );
        orchestrator
            .transcode(TranscodeRequest::new(Rect::new(0.0, 0.0, 8.0, 8.0)))
            .await
            .unwrap();

        let container = recorded(&factory);
        assert_eq!(container.video.sample_count(), frames);
        // One check per poll interval while stalled, plus one per sample after
        assert!(
            container.video.readiness_checks < 1_000,
            "{} readiness checks",
            container.video.readiness_checks
        );
    }

    #[tokio::test]
    async fn test_audio_open_failure_gives_video_only_output() {
        let dir = tempdir().unwrap();
        let factory = MemorySinkFactory::new();
        let source = SyntheticSource::new(32, 32, 10).fail_audio_open();

        run(source, &factory, dir.path(), Rect::new(0.0, 0.0, 8.0, 8.0))
            .await
            .unwrap();

        let container = recorded(&factory);
        assert!(container.finalized);
        assert!(container.layout.audio.is_none());
        assert_eq!(container.video.sample_count(), 10);
    }

    #[tokio::test]
    async fn test_writer_init_failure() {
        let dir = tempdir().unwrap();
        let factory = MemorySinkFactory::new().fail_create();
        let err = run(
            SyntheticSource::new(32, 32, 10),
            &factory,
            dir.path(),
            Rect::new(0.0, 0.0, 8.0, 8.0),
        )
        .await
        .unwrap_err();

        assert!(matches!(err.pipeline_kind(), Some(PipelineError::WriterInitFailure { .. })));
        assert_eq!(files_in(dir.path()), 0);
    }

    #[tokio::test]
    async fn test_finalize_failure_removes_output() {
        let dir = tempdir().unwrap();
        let factory = MemorySinkFactory::new().fail_finalize();
        let err = run(
            SyntheticSource::new(32, 32, 10),
            &factory,
            dir.path(),
            Rect::new(0.0, 0.0, 8.0, 8.0),
        )
        .await
        .unwrap_err();

        assert!(matches!(err.pipeline_kind(), Some(PipelineError::FinalizeFailure { .. })));
        assert_eq!(files_in(dir.path()), 0);
    }

    #[tokio::test]
    async fn test_time_range_is_accepted_but_inert() {
        let dir = tempdir().unwrap();
        let factory = MemorySinkFactory::new();
        let source = SyntheticSource::new(32, 32, 10).without_audio();

        let request = TranscodeRequest::new(Rect::new(0.0, 0.0, 8.0, 8.0))
            .with_time_range(Some(0.2), Some(0.5));
        assert!(request.check_time_range().is_ok());
        orchestrator(Some(source), &factory, dir.path())
            .transcode(request)
            .await
            .unwrap();
        assert_eq!(recorded(&factory).video.sample_count(), 10);

        let backwards = request.with_time_range(Some(2.0), Some(1.0));
        assert!(backwards.check_time_range().is_err());
        assert!(request.with_time_range(Some(f64::NAN), None).check_time_range().is_err());
    }

    #[tokio::test]
    async fn test_invalid_config_fails_before_probing() {
        let dir = tempdir().unwrap();
        let factory = MemorySinkFactory::new();
        let mut config = config_in(dir.path());
        config.pipeline.channel_capacity = 0;
        let source = SyntheticSource::new(32, 32, 10);
        let stats = source.stats();

        let err = TranscodeOrchestrator::new(Some(Box::new(source)), Arc::new(factory), config)
            .transcode(TranscodeRequest::new(Rect::new(0.0, 0.0, 8.0, 8.0)))
            .await
            .unwrap_err();
        assert!(matches!(err, TranscoderError::Config(_)));
        assert_eq!(stats.cursors_opened.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_audio_leg_follows_decode_rate() {
        let dir = tempdir().unwrap();
        let factory = MemorySinkFactory::new();
        let mut config = config_in(dir.path());
        config.reader.audio_sample_rate = 48_000;
        let source = SyntheticSource::new(32, 32, 10);

        let orchestrator =
            TranscodeOrchestrator::new(Some(Box::new(source)), Arc::new(factory.clone()), config);
        let handle = orchestrator.handle();
        orchestrator
            .transcode(TranscodeRequest::new(Rect::new(0.0, 0.0, 8.0, 8.0)))
            .await
            .unwrap();

        let container = recorded(&factory);
        let audio = container.layout.audio.clone().unwrap();
        assert_eq!(audio.sample_rate, 48_000);
        assert_eq!(container.settings.audio_sample_rate, 48_000);
        assert_eq!(container.audio.audio_frames, 48_000);
        assert_eq!(container.audio.rejected, 0);
        assert_eq!(handle.progress().audio_dropped, 0);
    }
}
