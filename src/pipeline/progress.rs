//! Progress counters shared between the drains and any observer

use std::sync::atomic::{AtomicU64, Ordering};

use crate::media::MediaKind;

/// Transcode progress.
///
/// Every counter is atomic. The video drain is the only writer of
/// `frames_completed`; observers only ever read snapshots.
#[derive(Debug, Default)]
pub struct TranscodeProgress {
    /// Estimated total video frames, `ceil(duration * frame_rate)`
    total_frames: AtomicU64,

    /// Video frames successfully appended to the destination
    frames_completed: AtomicU64,

    /// Video samples pulled from the source
    video_read: AtomicU64,

    /// Audio samples pulled from the source
    audio_read: AtomicU64,

    /// Audio samples successfully appended
    audio_written: AtomicU64,

    /// Video samples rejected by the destination
    video_dropped: AtomicU64,

    /// Audio samples rejected by the destination
    audio_dropped: AtomicU64,

    /// Frames written uncropped because the crop could not be applied
    transform_fallbacks: AtomicU64,
}

impl TranscodeProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_total_frames(&self, total: u64) {
        self.total_frames.store(total, Ordering::Relaxed);
    }

    pub fn record_read(&self, kind: MediaKind) {
        match kind {
            MediaKind::Video => self.video_read.fetch_add(1, Ordering::Relaxed),
            MediaKind::Audio => self.audio_read.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn record_written(&self, kind: MediaKind) {
        match kind {
            MediaKind::Video => self.frames_completed.fetch_add(1, Ordering::Relaxed),
            MediaKind::Audio => self.audio_written.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn record_dropped(&self, kind: MediaKind) {
        match kind {
            MediaKind::Video => self.video_dropped.fetch_add(1, Ordering::Relaxed),
            MediaKind::Audio => self.audio_dropped.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn record_transform_fallback(&self) {
        self.transform_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frames_completed(&self) -> u64 {
        self.frames_completed.load(Ordering::Relaxed)
    }

    pub fn total_frames(&self) -> u64 {
        self.total_frames.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            total_frames: self.total_frames.load(Ordering::Relaxed),
            frames_completed: self.frames_completed.load(Ordering::Relaxed),
            video_read: self.video_read.load(Ordering::Relaxed),
            audio_read: self.audio_read.load(Ordering::Relaxed),
            audio_written: self.audio_written.load(Ordering::Relaxed),
            video_dropped: self.video_dropped.load(Ordering::Relaxed),
            audio_dropped: self.audio_dropped.load(Ordering::Relaxed),
            transform_fallbacks: self.transform_fallbacks.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of `TranscodeProgress`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProgressSnapshot {
    pub total_frames: u64,
    pub frames_completed: u64,
    pub video_read: u64,
    pub audio_read: u64,
    pub audio_written: u64,
    pub video_dropped: u64,
    pub audio_dropped: u64,
    pub transform_fallbacks: u64,
}

impl ProgressSnapshot {
    /// Completed fraction in `[0, 1]`; the estimate can undershoot, so the
    /// value is clamped
    pub fn fraction(&self) -> f64 {
        if self.total_frames == 0 {
            return 0.0;
        }
        (self.frames_completed as f64 / self.total_frames as f64).min(1.0)
    }

    pub fn percent(&self) -> f64 {
        self.fraction() * 100.0
    }
}

impl std::fmt::Display for ProgressSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{} frames ({:.1}%)",
            self.frames_completed,
            self.total_frames,
            self.percent()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let progress = TranscodeProgress::new();
        progress.set_total_frames(4);
        progress.record_read(MediaKind::Video);
        progress.record_written(MediaKind::Video);
        progress.record_dropped(MediaKind::Audio);
        progress.record_transform_fallback();

        let snap = progress.snapshot();
        assert_eq!(snap.frames_completed, 1);
        assert_eq!(snap.video_read, 1);
        assert_eq!(snap.audio_dropped, 1);
        assert_eq!(snap.transform_fallbacks, 1);
        assert_eq!(snap.fraction(), 0.25);
    }

    #[test]
    fn test_fraction_is_clamped() {
        let snap = ProgressSnapshot {
            total_frames: 10,
            frames_completed: 12,
            ..ProgressSnapshot::default()
        };
        assert_eq!(snap.fraction(), 1.0);
        assert_eq!(ProgressSnapshot::default().fraction(), 0.0);
    }
}
