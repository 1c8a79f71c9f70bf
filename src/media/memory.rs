//! Deterministic in-memory media backend.
//!
//! `SyntheticSource` generates frames whose pixel values encode their own
//! coordinates, and `MemorySinkFactory` records everything appended to it.
//! Both take injected faults so every pipeline path can be driven without
//! codecs.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{EncoderSettings, ReaderSettings};
use crate::error::{MediaError, Result, SampleError};
use crate::media::{
    AffineTransform, AudioBuffer, ContainerSink, MediaKind, MediaSource, MediaTime, OutputLayout,
    PixelBuffer, ReadCursor, Sample, SampleTiming, SinkFactory, Size, SourceInfo,
    TrackDescriptor,
};

const VIDEO_TRACK_ID: usize = 0;
const AUDIO_TRACK_ID: usize = 1;

/// Audio frames per synthetic chunk
pub const AUDIO_CHUNK_FRAMES: usize = 1024;

/// Counters a synthetic source keeps about how it was read
#[derive(Debug, Default)]
pub struct SourceStats {
    pub video_samples_read: AtomicUsize,
    pub audio_samples_read: AtomicUsize,
    /// Polls a cursor received after it had already reported end of stream
    pub polls_after_end: AtomicUsize,
    pub cursors_opened: AtomicUsize,
}

/// Generated source: a BGRA frame stream with optional stereo audio.
///
/// Pixel `(x, y)` of every frame stores `x % 256` in the blue byte and
/// `y % 256` in the green byte, so any crop can be checked by looking at
/// the first pixel of the output.
#[derive(Debug, Clone)]
pub struct SyntheticSource {
    name: String,
    width: u32,
    height: u32,
    fps: u32,
    duration_seconds: f64,
    orientation: AffineTransform,
    bitrate: Option<u64>,
    has_video: bool,
    has_audio: bool,
    available: bool,
    fail_video_read_at: Option<usize>,
    short_frame_at: Option<usize>,
    audio_open_fails: bool,
    stats: Arc<SourceStats>,
}

impl SyntheticSource {
    /// One second of `width` x `height` video at `fps`, with audio
    pub fn new(width: u32, height: u32, fps: u32) -> Self {
        Self {
            name: format!("synthetic {}x{}@{}", width, height, fps),
            width,
            height,
            fps: fps.max(1),
            duration_seconds: 1.0,
            orientation: AffineTransform::IDENTITY,
            bitrate: None,
            has_video: true,
            has_audio: true,
            available: true,
            fail_video_read_at: None,
            short_frame_at: None,
            audio_open_fails: false,
            stats: Arc::new(SourceStats::default()),
        }
    }

    pub fn with_duration(mut self, seconds: f64) -> Self {
        self.duration_seconds = seconds.max(0.0);
        self
    }

    pub fn with_orientation(mut self, orientation: AffineTransform) -> Self {
        self.orientation = orientation;
        self
    }

    pub fn with_bitrate(mut self, bitrate: u64) -> Self {
        self.bitrate = Some(bitrate);
        self
    }

    pub fn without_audio(mut self) -> Self {
        self.has_audio = false;
        self
    }

    pub fn without_video(mut self) -> Self {
        self.has_video = false;
        self
    }

    /// Fail at metadata load, like an unreadable file
    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    /// Decode error in place of video frame `index`
    pub fn fail_video_read_at(mut self, index: usize) -> Self {
        self.fail_video_read_at = Some(index);
        self
    }

    /// Emit frame `index` at half size, so a crop sized for the full frame
    /// cannot be applied to it
    pub fn short_frame_at(mut self, index: usize) -> Self {
        self.short_frame_at = Some(index);
        self
    }

    /// Refuse to open an audio cursor
    pub fn fail_audio_open(mut self) -> Self {
        self.audio_open_fails = true;
        self
    }

    pub fn stats(&self) -> Arc<SourceStats> {
        Arc::clone(&self.stats)
    }

    /// Number of video frames the source yields
    pub fn frame_count(&self) -> usize {
        (self.duration_seconds * self.fps as f64).ceil() as usize
    }

    fn duration(&self) -> MediaTime {
        MediaTime::from_seconds(self.duration_seconds, 600)
    }
}

impl MediaSource for SyntheticSource {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn load_info(&mut self) -> Result<SourceInfo> {
        if !self.available {
            return Err(MediaError::OpenFailed { path: self.name.clone() }.into());
        }

        let video = self.has_video.then(|| {
            TrackDescriptor::video(
                VIDEO_TRACK_ID,
                Size::new(self.width as f64, self.height as f64),
                self.orientation,
                self.fps as f64,
            )
            .with_bitrate(self.bitrate)
        });
        let audio = self.has_audio.then(|| TrackDescriptor::audio(AUDIO_TRACK_ID));

        Ok(SourceInfo {
            duration: self.duration(),
            video,
            audio,
        })
    }

    fn open_cursor(
        &mut self,
        track: &TrackDescriptor,
        settings: &ReaderSettings,
    ) -> Result<Box<dyn ReadCursor>> {
        self.stats.cursors_opened.fetch_add(1, Ordering::Relaxed);

        match track.id {
            VIDEO_TRACK_ID if self.has_video => {
                let base = coordinate_frame(self.width, self.height)?;
                Ok(Box::new(SyntheticVideoCursor {
                    base,
                    index: 0,
                    count: self.frame_count(),
                    fps: self.fps as i32,
                    fail_at: self.fail_video_read_at,
                    short_at: self.short_frame_at,
                    ended: false,
                    stats: Arc::clone(&self.stats),
                }))
            }
            AUDIO_TRACK_ID if self.has_audio => {
                if self.audio_open_fails {
                    return Err(MediaError::OpenFailed {
                        path: format!("{} audio", self.name),
                    }
                    .into());
                }
                let rate = settings.audio_sample_rate;
                let total = (self.duration_seconds * rate as f64).ceil() as usize;
                Ok(Box::new(SyntheticAudioCursor {
                    offset: 0,
                    total,
                    channels: settings.audio_channels,
                    sample_rate: rate,
                    ended: false,
                    stats: Arc::clone(&self.stats),
                }))
            }
            other => Err(MediaError::UnsupportedFormat {
                format: format!("track {} of {}", other, self.name),
            }
            .into()),
        }
    }
}

fn coordinate_frame(width: u32, height: u32) -> Result<PixelBuffer> {
    let mut data = Vec::with_capacity(width as usize * height as usize * 4);
    for y in 0..height {
        for x in 0..width {
            data.extend_from_slice(&[(x % 256) as u8, (y % 256) as u8, 0, 255]);
        }
    }
    Ok(PixelBuffer::bgra(width, height, data)?)
}

struct SyntheticVideoCursor {
    base: PixelBuffer,
    index: usize,
    count: usize,
    fps: i32,
    fail_at: Option<usize>,
    short_at: Option<usize>,
    ended: bool,
    stats: Arc<SourceStats>,
}

impl ReadCursor for SyntheticVideoCursor {
    fn next_sample(&mut self) -> Result<Option<Sample>> {
        if self.ended {
            self.stats.polls_after_end.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }
        if self.index >= self.count {
            self.ended = true;
            return Ok(None);
        }
        if self.fail_at == Some(self.index) {
            return Err(MediaError::decode(format!("corrupt frame {}", self.index)).into());
        }

        let buffer = if self.short_at == Some(self.index) {
            coordinate_frame((self.base.width() / 2).max(1), (self.base.height() / 2).max(1))?
        } else {
            self.base.clone()
        };
        let timing = SampleTiming::in_order(
            MediaTime::new(self.index as i64, self.fps),
            MediaTime::new(1, self.fps),
        );

        self.index += 1;
        self.stats.video_samples_read.fetch_add(1, Ordering::Relaxed);
        Ok(Some(Sample::video(buffer, timing)))
    }
}

struct SyntheticAudioCursor {
    offset: usize,
    total: usize,
    channels: u16,
    sample_rate: u32,
    ended: bool,
    stats: Arc<SourceStats>,
}

impl ReadCursor for SyntheticAudioCursor {
    fn next_sample(&mut self) -> Result<Option<Sample>> {
        if self.ended {
            self.stats.polls_after_end.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }
        if self.offset >= self.total {
            self.ended = true;
            return Ok(None);
        }

        let frames = AUDIO_CHUNK_FRAMES.min(self.total - self.offset);
        let samples = (0..frames * self.channels as usize)
            .map(|i| (((self.offset * self.channels as usize + i) % 2000) as i16) - 1000)
            .collect();
        let buffer = AudioBuffer::new(samples, self.channels, self.sample_rate)?;
        let rate = self.sample_rate as i32;
        let timing = SampleTiming::in_order(
            MediaTime::new(self.offset as i64, rate),
            MediaTime::new(frames as i64, rate),
        );

        self.offset += frames;
        self.stats.audio_samples_read.fetch_add(1, Ordering::Relaxed);
        Ok(Some(Sample::audio(buffer, timing)))
    }
}

/// What a memory sink saw on one leg
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecordedLeg {
    pub presentation_times: Vec<MediaTime>,
    pub decode_times: Vec<MediaTime>,
    /// Width and height of each video frame as appended
    pub frame_sizes: Vec<(u32, u32)>,
    /// First pixel of each video frame as appended
    pub first_pixels: Vec<[u8; 4]>,
    /// Total PCM frames appended
    pub audio_frames: usize,
    pub finished: bool,
    /// Append attempts that the sink rejected
    pub rejected: usize,
    /// Times the writer asked whether this leg could take a sample
    pub readiness_checks: usize,
}

impl RecordedLeg {
    pub fn sample_count(&self) -> usize {
        self.presentation_times.len()
    }
}

/// Everything a memory sink recorded for one destination
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedContainer {
    pub path: PathBuf,
    pub layout: OutputLayout,
    pub settings: EncoderSettings,
    pub video: RecordedLeg,
    pub audio: RecordedLeg,
    pub finalized: bool,
    pub aborted: bool,
}

impl RecordedContainer {
    pub fn leg(&self, kind: MediaKind) -> &RecordedLeg {
        match kind {
            MediaKind::Video => &self.video,
            MediaKind::Audio => &self.audio,
        }
    }

    fn leg_mut(&mut self, kind: MediaKind) -> &mut RecordedLeg {
        match kind {
            MediaKind::Video => &mut self.video,
            MediaKind::Audio => &mut self.audio,
        }
    }
}

/// Flat summary written to the destination file on finalize
#[derive(Serialize)]
struct Manifest {
    width: u32,
    height: u32,
    video_bitrate: u64,
    orientation_degrees: i32,
    video_samples: usize,
    audio_leg: bool,
    audio_samples: usize,
    audio_frames: usize,
    fast_start: bool,
}

impl Manifest {
    fn of(container: &RecordedContainer) -> Self {
        Self {
            width: container.layout.video.width,
            height: container.layout.video.height,
            video_bitrate: container.settings.video_bitrate,
            orientation_degrees: container.layout.video.orientation.rotation_degrees(),
            video_samples: container.video.sample_count(),
            audio_leg: container.layout.audio.is_some(),
            audio_samples: container.audio.sample_count(),
            audio_frames: container.audio.audio_frames,
            fast_start: container.settings.fast_start,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct SinkFaults {
    fail_create: bool,
    fail_finalize: bool,
    failing_video_appends: HashSet<usize>,
    failing_audio_appends: HashSet<usize>,
    not_ready_every: Option<usize>,
    stall: Option<Duration>,
    cancel_after_video: Option<(usize, CancellationToken)>,
}

/// Factory for recording sinks. Keeps the most recently created container
/// so callers can inspect it after the transcode returns.
#[derive(Debug, Clone, Default)]
pub struct MemorySinkFactory {
    faults: SinkFaults,
    recorded: Arc<Mutex<Option<RecordedContainer>>>,
}

impl MemorySinkFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_create(mut self) -> Self {
        self.faults.fail_create = true;
        self
    }

    pub fn fail_finalize(mut self) -> Self {
        self.faults.fail_finalize = true;
        self
    }

    /// Reject the `index`-th append attempt (zero based) on `kind`
    pub fn fail_append(mut self, kind: MediaKind, index: usize) -> Self {
        match kind {
            MediaKind::Video => self.faults.failing_video_appends.insert(index),
            MediaKind::Audio => self.faults.failing_audio_appends.insert(index),
        };
        self
    }

    /// Report not-ready on every `n`-th readiness check
    pub fn not_ready_every(mut self, n: usize) -> Self {
        self.faults.not_ready_every = Some(n.max(2));
        self
    }

    /// Report every leg as not ready until `duration` has passed since creation
    pub fn stall_for(mut self, duration: Duration) -> Self {
        self.faults.stall = Some(duration);
        self
    }

    /// Cancel `token` once `frames` video frames have been appended
    pub fn cancel_after_video_frames(mut self, frames: usize, token: CancellationToken) -> Self {
        self.faults.cancel_after_video = Some((frames, token));
        self
    }

    /// Snapshot of the last container created by this factory
    pub fn recorded(&self) -> Option<RecordedContainer> {
        lock(&self.recorded).clone()
    }
}

impl SinkFactory for MemorySinkFactory {
    fn create(
        &self,
        path: &Path,
        layout: &OutputLayout,
        settings: &EncoderSettings,
    ) -> Result<Box<dyn ContainerSink>> {
        if self.faults.fail_create {
            return Err(MediaError::OpenFailed { path: path.display().to_string() }.into());
        }

        // Claim the destination the way a muxer writing its header would
        std::fs::File::create(path)?;

        *lock(&self.recorded) = Some(RecordedContainer {
            path: path.to_path_buf(),
            layout: layout.clone(),
            settings: settings.clone(),
            video: RecordedLeg::default(),
            audio: RecordedLeg::default(),
            finalized: false,
            aborted: false,
        });

        Ok(Box::new(MemorySink {
            path: path.to_path_buf(),
            faults: self.faults.clone(),
            recorded: Arc::clone(&self.recorded),
            attempts: [0, 0],
            readiness_checks: [AtomicUsize::new(0), AtomicUsize::new(0)],
            created: Instant::now(),
        }))
    }
}

struct MemorySink {
    path: PathBuf,
    faults: SinkFaults,
    recorded: Arc<Mutex<Option<RecordedContainer>>>,
    attempts: [usize; 2],
    readiness_checks: [AtomicUsize; 2],
    created: Instant,
}

fn slot(kind: MediaKind) -> usize {
    match kind {
        MediaKind::Video => 0,
        MediaKind::Audio => 1,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemorySink {
    fn with_container<R>(&self, f: impl FnOnce(&mut RecordedContainer) -> R) -> Result<R> {
        let mut guard = lock(&self.recorded);
        let container = guard
            .as_mut()
            .ok_or_else(|| MediaError::encode("container record missing"))?;
        Ok(f(container))
    }
}

impl ContainerSink for MemorySink {
    fn is_ready(&self, kind: MediaKind) -> bool {
        let checks = self.readiness_checks[slot(kind)].fetch_add(1, Ordering::Relaxed) + 1;
        let _ = self.with_container(|c| c.leg_mut(kind).readiness_checks = checks);

        if self.faults.stall.is_some_and(|stall| self.created.elapsed() < stall) {
            return false;
        }
        self.faults.not_ready_every.map_or(true, |n| checks % n != 0)
    }

    fn append(&mut self, kind: MediaKind, sample: Sample) -> Result<()> {
        let attempt = self.attempts[slot(kind)];
        self.attempts[slot(kind)] += 1;

        let failing = match kind {
            MediaKind::Video => &self.faults.failing_video_appends,
            MediaKind::Audio => &self.faults.failing_audio_appends,
        };
        let finished = self.with_container(|c| c.leg(kind).finished)?;
        if finished || failing.contains(&attempt) {
            self.with_container(|c| c.leg_mut(kind).rejected += 1)?;
            let reason = if finished {
                "leg already finished".to_string()
            } else {
                format!("injected failure at append {}", attempt)
            };
            return Err(SampleError::AppendFailed { kind, reason }.into());
        }

        if let Some(buffer) = sample.audio_buffer() {
            let declared = self.with_container(|c| c.layout.audio.clone())?;
            let matches = declared.as_ref().is_some_and(|leg| {
                leg.sample_rate == buffer.sample_rate() && leg.channels == buffer.channels()
            });
            if !matches {
                self.with_container(|c| c.audio.rejected += 1)?;
                let reason = format!(
                    "{} Hz x{} audio does not match leg {:?}",
                    buffer.sample_rate(),
                    buffer.channels(),
                    declared
                );
                return Err(SampleError::AppendFailed { kind, reason }.into());
            }
        }

        let appended = self.with_container(|c| {
            let leg = c.leg_mut(kind);
            let timing = sample.timing();
            leg.presentation_times.push(timing.pts);
            leg.decode_times.push(timing.dts);
            if let Some(buffer) = sample.pixel_buffer() {
                leg.frame_sizes.push((buffer.width(), buffer.height()));
                leg.first_pixels.push(buffer.pixel(0, 0).unwrap_or_default());
            }
            if let Some(buffer) = sample.audio_buffer() {
                leg.audio_frames += buffer.frames();
            }
            leg.sample_count()
        })?;

        if kind == MediaKind::Video {
            if let Some((after, token)) = &self.faults.cancel_after_video {
                if appended >= *after {
                    token.cancel();
                }
            }
        }
        Ok(())
    }

    fn finish_leg(&mut self, kind: MediaKind) -> Result<()> {
        self.with_container(|c| c.leg_mut(kind).finished = true)
    }

    fn finalize(self: Box<Self>) -> Result<PathBuf> {
        if self.faults.fail_finalize {
            return Err(MediaError::encode("injected finalize failure").into());
        }

        let manifest = self.with_container(|c| {
            c.finalized = true;
            Manifest::of(c)
        })?;
        let content = toml::to_string_pretty(&manifest)
            .map_err(|e| MediaError::encode(e.to_string()))?;
        std::fs::write(&self.path, content)?;

        debug!("memory sink finalized {:?}", self.path);
        Ok(self.path)
    }

    fn abort(self: Box<Self>) {
        let _ = self.with_container(|c| c.aborted = true);
        if self.path.exists() {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{SamplePayload, VideoLegSettings};
    use tempfile::tempdir;

    fn drain(cursor: &mut dyn ReadCursor) -> Vec<Sample> {
        let mut samples = Vec::new();
        while let Some(sample) = cursor.next_sample().unwrap() {
            samples.push(sample);
        }
        samples
    }

    #[test]
    fn test_synthetic_frames_encode_coordinates() {
        let mut source = SyntheticSource::new(32, 16, 10).with_duration(0.5);
        let info = source.load_info().unwrap();
        let video = info.video.unwrap();
        let mut cursor = source.open_cursor(&video, &ReaderSettings::default()).unwrap();

        let frames = drain(cursor.as_mut());
        assert_eq!(frames.len(), 5);

        let buffer = frames[3].pixel_buffer().unwrap();
        assert_eq!(buffer.pixel(7, 9), Some([7, 9, 0, 255]));
        assert_eq!(frames[3].timing().pts, MediaTime::new(3, 10));
    }

    #[test]
    fn test_cursor_counts_polls_after_end() {
        let mut source = SyntheticSource::new(4, 4, 2).with_duration(1.0);
        let stats = source.stats();
        let video = source.load_info().unwrap().video.unwrap();
        let mut cursor = source.open_cursor(&video, &ReaderSettings::default()).unwrap();

        drain(cursor.as_mut());
        assert_eq!(stats.polls_after_end.load(Ordering::Relaxed), 0);
        assert!(cursor.next_sample().unwrap().is_none());
        assert_eq!(stats.polls_after_end.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_audio_covers_duration() {
        let mut source = SyntheticSource::new(4, 4, 30).with_duration(0.5);
        let audio = source.load_info().unwrap().audio.unwrap();
        let mut cursor = source.open_cursor(&audio, &ReaderSettings::default()).unwrap();

        let chunks = drain(cursor.as_mut());
        let frames: usize = chunks
            .iter()
            .map(|s| match s.payload() {
                SamplePayload::Audio(buffer) => buffer.frames(),
                SamplePayload::Video(_) => 0,
            })
            .sum();
        assert_eq!(frames, 22050);
        assert_eq!(chunks.len(), 22);
    }

    #[test]
    fn test_injected_faults() {
        let mut source = SyntheticSource::new(4, 4, 10).fail_video_read_at(2).fail_audio_open();
        let info = source.load_info().unwrap();
        let settings = ReaderSettings::default();

        assert!(source.open_cursor(info.audio.as_ref().unwrap(), &settings).is_err());

        let mut cursor = source.open_cursor(info.video.as_ref().unwrap(), &settings).unwrap();
        assert!(cursor.next_sample().is_ok());
        assert!(cursor.next_sample().is_ok());
        assert!(cursor.next_sample().is_err());

        let mut gone = SyntheticSource::new(4, 4, 10).unavailable();
        assert!(gone.load_info().is_err());
    }

    #[test]
    fn test_memory_sink_records_and_finalizes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.mp4");
        let layout = OutputLayout {
            video: VideoLegSettings {
                width: 4,
                height: 2,
                orientation: AffineTransform::IDENTITY,
                frame_rate: 30.0,
            },
            audio: None,
        };
        let factory = MemorySinkFactory::new().fail_append(MediaKind::Video, 1);
        let mut sink = factory.create(&path, &layout, &EncoderSettings::default()).unwrap();

        for i in 0..3 {
            let frame = PixelBuffer::filled(4, 2, [1, 2, 3, 255]).unwrap();
            let timing = SampleTiming::in_order(MediaTime::new(i, 30), MediaTime::new(1, 30));
            let result = sink.append(MediaKind::Video, Sample::video(frame, timing));
            assert_eq!(result.is_err(), i == 1);
        }
        sink.finish_leg(MediaKind::Video).unwrap();
        let written = sink.finalize().unwrap();

        let recorded = factory.recorded().unwrap();
        assert!(recorded.finalized);
        assert_eq!(recorded.video.sample_count(), 2);
        assert_eq!(recorded.video.rejected, 1);
        assert!(std::fs::read_to_string(written).unwrap().contains("video_samples = 2"));
    }

    #[test]
    fn test_abort_removes_destination() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("partial.mp4");
        let layout = OutputLayout {
            video: VideoLegSettings {
                width: 2,
                height: 2,
                orientation: AffineTransform::IDENTITY,
                frame_rate: 30.0,
            },
            audio: None,
        };
        let factory = MemorySinkFactory::new();
        let sink = factory.create(&path, &layout, &EncoderSettings::default()).unwrap();
        assert!(path.exists());

        sink.abort();
        assert!(!path.exists());
        assert!(factory.recorded().unwrap().aborted);
    }
}
