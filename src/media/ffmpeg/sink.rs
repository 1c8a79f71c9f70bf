use std::path::{Path, PathBuf};

use ffmpeg_next as ffmpeg;
use ffmpeg::codec::{self, Id as CodecId};
use ffmpeg::format::context::Output;
use ffmpeg::format::{sample::Type as SampleType, Pixel, Sample as SampleFormat};
use ffmpeg::software::scaling;
use ffmpeg::util::channel_layout::ChannelLayout;
use ffmpeg::util::frame::{audio::Audio as AudioFrame, video::Video as VideoFrame};
use ffmpeg::{encoder, Dictionary, Packet, Rational};
use tracing::{debug, info};

use super::{encode_error, init, SendScaler};
use crate::config::{EncoderSettings, VideoCodec};
use crate::error::{MediaError, Result};
use crate::media::{
    AffineTransform, AudioBuffer, AudioLegSettings, ContainerSink, MediaKind, OutputLayout,
    PixelBuffer, Sample, SamplePayload, SinkFactory, Size, VideoLegSettings,
};

/// Timescale of encoded video timestamps
const VIDEO_TIMESCALE: i32 = 90_000;

/// Creates H.264/AAC MP4 containers through libavformat
#[derive(Debug, Default, Clone, Copy)]
pub struct FfmpegSinkFactory;

impl FfmpegSinkFactory {
    pub fn new() -> Self {
        init();
        Self
    }
}

impl SinkFactory for FfmpegSinkFactory {
    fn create(
        &self,
        path: &Path,
        layout: &OutputLayout,
        settings: &EncoderSettings,
    ) -> Result<Box<dyn ContainerSink>> {
        init();
        Ok(Box::new(FfmpegSink::create(path, layout, settings)?))
    }
}

/// Push one encoder's pending packets into the container
fn write_packets(
    encoder: &mut encoder::Encoder,
    output: &mut Output,
    stream_index: usize,
    encoder_time_base: Rational,
    stream_time_base: Rational,
) -> Result<()> {
    let mut packet = Packet::empty();
    while encoder.receive_packet(&mut packet).is_ok() {
        packet.set_stream(stream_index);
        packet.rescale_ts(encoder_time_base, stream_time_base);
        packet
            .write_interleaved(output)
            .map_err(|e| encode_error("write packet", e))?;
    }
    Ok(())
}

struct VideoLeg {
    encoder: encoder::video::Encoder,
    stream_index: usize,
    stream_time_base: Rational,
    format: Pixel,
    width: u32,
    height: u32,
    /// Converter from the last seen BGRA input size
    scaler: Option<(u32, u32, SendScaler)>,
    finished: bool,
}

impl VideoLeg {
    fn open(output: &mut Output, leg: &VideoLegSettings, settings: &EncoderSettings) -> Result<Self> {
        let codec_id = match settings.video_codec {
            VideoCodec::H264 => CodecId::H264,
        };
        let codec = encoder::find(codec_id).ok_or_else(|| MediaError::UnsupportedFormat {
            format: "H.264 encoder".to_string(),
        })?;
        let global_header = output
            .format()
            .flags()
            .contains(ffmpeg::format::Flags::GLOBAL_HEADER);

        let mut stream = output
            .add_stream(codec)
            .map_err(|e| encode_error("add video stream", e))?;
        let stream_index = stream.index();

        let mut context = codec::context::Context::new_with_codec(codec)
            .encoder()
            .video()
            .map_err(|e| encode_error("video encoder context", e))?;

        // 4:2:0 chroma needs even dimensions
        let format = if leg.width % 2 == 0 && leg.height % 2 == 0 {
            Pixel::YUV420P
        } else {
            Pixel::YUV444P
        };
        let frame_rate = if leg.frame_rate.is_finite() && leg.frame_rate > 0.0 {
            Rational::from(leg.frame_rate)
        } else {
            Rational::new(30, 1)
        };

        context.set_width(leg.width);
        context.set_height(leg.height);
        context.set_format(format);
        context.set_time_base(Rational::new(1, VIDEO_TIMESCALE));
        context.set_frame_rate(Some(frame_rate));
        context.set_bit_rate(settings.video_bitrate as usize);
        context.set_max_bit_rate(settings.video_bitrate as usize * 2);
        if global_header {
            context.set_flags(codec::Flags::GLOBAL_HEADER);
        }

        let mut options = Dictionary::new();
        options.set("threads", &settings.threads.max(1).to_string());
        options.set("preset", "medium");

        let encoder = context
            .open_as_with(codec, options)
            .map_err(|e| encode_error("open H.264 encoder", e))?;
        stream.set_time_base(Rational::new(1, VIDEO_TIMESCALE));
        stream.set_parameters(&encoder);

        Ok(Self {
            encoder,
            stream_index,
            stream_time_base: Rational::new(1, VIDEO_TIMESCALE),
            format,
            width: leg.width,
            height: leg.height,
            scaler: None,
            finished: false,
        })
    }

    fn convert(&mut self, buffer: &PixelBuffer) -> Result<VideoFrame> {
        let (in_width, in_height) = (buffer.width(), buffer.height());
        let stale = match &self.scaler {
            Some((w, h, _)) => (*w, *h) != (in_width, in_height),
            None => true,
        };
        if stale {
            if (in_width, in_height) != (self.width, self.height) {
                debug!(
                    "Scaling {}x{} frame to {}x{}",
                    in_width, in_height, self.width, self.height
                );
            }
            let context = scaling::Context::get(
                Pixel::BGRA,
                in_width,
                in_height,
                self.format,
                self.width,
                self.height,
                scaling::Flags::BILINEAR,
            )
            .map_err(|e| encode_error("scaler", e))?;
            self.scaler = Some((in_width, in_height, SendScaler(context)));
        }

        let mut bgra = VideoFrame::new(Pixel::BGRA, in_width, in_height);
        let stride = bgra.stride(0);
        let plane = bgra.data_mut(0);
        for y in 0..in_height {
            let row = buffer.row(y).ok_or_else(|| MediaError::InvalidBuffer {
                details: format!("row {} missing from {}x{} frame", y, in_width, in_height),
            })?;
            let start = y as usize * stride;
            plane[start..start + row.len()].copy_from_slice(row);
        }

        let mut converted = VideoFrame::empty();
        if let Some((_, _, scaler)) = self.scaler.as_mut() {
            scaler
                .run(&bgra, &mut converted)
                .map_err(|e| encode_error("pixel conversion", e))?;
        }
        Ok(converted)
    }

    fn append(&mut self, output: &mut Output, buffer: &PixelBuffer, pts: i64) -> Result<()> {
        let mut frame = self.convert(buffer)?;
        frame.set_pts(Some(pts));
        self.encoder
            .send_frame(&frame)
            .map_err(|e| encode_error("send video frame", e))?;
        self.drain(output)
    }

    fn drain(&mut self, output: &mut Output) -> Result<()> {
        write_packets(
            &mut self.encoder,
            output,
            self.stream_index,
            Rational::new(1, VIDEO_TIMESCALE),
            self.stream_time_base,
        )
    }

    fn finish(&mut self, output: &mut Output) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.encoder
            .send_eof()
            .map_err(|e| encode_error("flush video encoder", e))?;
        self.drain(output)
    }
}

/// Planar float sample queue feeding fixed-size encoder frames
struct PlanarFifo {
    planes: Vec<Vec<f32>>,
}

impl PlanarFifo {
    fn new(channels: usize) -> Self {
        Self {
            planes: vec![Vec::new(); channels.max(1)],
        }
    }

    fn len(&self) -> usize {
        self.planes[0].len()
    }

    /// Append interleaved 16-bit samples, one plane per channel
    fn push(&mut self, buffer: &AudioBuffer) {
        let channels = buffer.channels() as usize;
        for frame in buffer.samples().chunks_exact(channels) {
            for (plane, sample) in self.planes.iter_mut().enumerate() {
                let value = frame.get(plane).or_else(|| frame.first()).copied().unwrap_or(0);
                sample.push(value as f32 / 32768.0);
            }
        }
    }

    /// Take `n` samples per channel, zero-padding a short tail
    fn pop(&mut self, n: usize, layout: ChannelLayout, rate: u32, pts: i64) -> AudioFrame {
        let available = self.len().min(n);
        let mut frame = AudioFrame::new(SampleFormat::F32(SampleType::Planar), n, layout);
        frame.set_rate(rate);
        frame.set_pts(Some(pts));

        for (index, plane) in self.planes.iter_mut().enumerate() {
            let target = frame.plane_mut::<f32>(index);
            target[..available].copy_from_slice(&plane[..available]);
            target[available..].fill(0.0);
            plane.drain(..available);
        }
        frame
    }
}

struct AudioLeg {
    encoder: encoder::audio::Encoder,
    stream_index: usize,
    stream_time_base: Rational,
    layout: ChannelLayout,
    sample_rate: u32,
    frame_size: usize,
    fifo: PlanarFifo,
    next_pts: i64,
    finished: bool,
}

impl AudioLeg {
    fn open(output: &mut Output, leg: &AudioLegSettings, settings: &EncoderSettings) -> Result<Self> {
        let codec = encoder::find(CodecId::AAC).ok_or_else(|| MediaError::UnsupportedFormat {
            format: "AAC encoder".to_string(),
        })?;
        let global_header = output
            .format()
            .flags()
            .contains(ffmpeg::format::Flags::GLOBAL_HEADER);
        let time_base = Rational::new(1, leg.sample_rate as i32);
        let layout = ChannelLayout::default(leg.channels as i32);

        let mut stream = output
            .add_stream(codec)
            .map_err(|e| encode_error("add audio stream", e))?;
        let stream_index = stream.index();

        let mut context = codec::context::Context::new_with_codec(codec)
            .encoder()
            .audio()
            .map_err(|e| encode_error("audio encoder context", e))?;
        context.set_rate(leg.sample_rate as i32);
        context.set_channel_layout(layout);
        context.set_channels(leg.channels as i32);
        context.set_format(SampleFormat::F32(SampleType::Planar));
        context.set_bit_rate(settings.audio_bitrate as usize);
        context.set_time_base(time_base);
        if global_header {
            context.set_flags(codec::Flags::GLOBAL_HEADER);
        }

        let encoder = context
            .open_as_with(codec, Dictionary::new())
            .map_err(|e| encode_error("open AAC encoder", e))?;
        stream.set_time_base(time_base);
        stream.set_parameters(&encoder);

        let frame_size = (encoder.frame_size() as usize).max(1024);
        Ok(Self {
            encoder,
            stream_index,
            stream_time_base: time_base,
            layout,
            sample_rate: leg.sample_rate,
            frame_size,
            fifo: PlanarFifo::new(leg.channels as usize),
            next_pts: 0,
            finished: false,
        })
    }

    /// Encode every full frame in the queue, and the padded tail on flush
    fn encode_queued(&mut self, output: &mut Output, flush: bool) -> Result<()> {
        while self.fifo.len() >= self.frame_size || (flush && self.fifo.len() > 0) {
            let frame = self
                .fifo
                .pop(self.frame_size, self.layout, self.sample_rate, self.next_pts);
            self.next_pts += self.frame_size as i64;
            self.encoder
                .send_frame(&frame)
                .map_err(|e| encode_error("send audio frame", e))?;
            self.drain(output)?;
        }
        Ok(())
    }

    fn append(&mut self, output: &mut Output, buffer: &AudioBuffer) -> Result<()> {
        if buffer.sample_rate() != self.sample_rate {
            return Err(MediaError::UnsupportedFormat {
                format: format!("{} Hz audio into a {} Hz leg", buffer.sample_rate(), self.sample_rate),
            }
            .into());
        }
        self.fifo.push(buffer);
        self.encode_queued(output, false)
    }

    fn drain(&mut self, output: &mut Output) -> Result<()> {
        write_packets(
            &mut self.encoder,
            output,
            self.stream_index,
            Rational::new(1, self.sample_rate as i32),
            self.stream_time_base,
        )
    }

    fn finish(&mut self, output: &mut Output) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.encode_queued(output, true)?;
        self.encoder
            .send_eof()
            .map_err(|e| encode_error("flush audio encoder", e))?;
        self.drain(output)
    }
}

/// One MP4 destination being written through libavformat
pub struct FfmpegSink {
    path: PathBuf,
    output: Output,
    video: VideoLeg,
    audio: Option<AudioLeg>,
}

impl FfmpegSink {
    pub fn create(path: &Path, layout: &OutputLayout, settings: &EncoderSettings) -> Result<Self> {
        let mut output = ffmpeg::format::output(&path).map_err(|e| MediaError::OpenFailed {
            path: format!("{}: {}", path.display(), e),
        })?;

        let mut video = VideoLeg::open(&mut output, &layout.video, settings)?;
        write_display_matrix(&mut output, video.stream_index, &layout.video)?;
        let mut audio = match &layout.audio {
            Some(leg) => Some(AudioLeg::open(&mut output, leg, settings)?),
            None => None,
        };

        let mut options = Dictionary::new();
        if settings.fast_start {
            options.set("movflags", "+faststart");
        }
        if let Err(e) = output.write_header_with(options) {
            let _ = std::fs::remove_file(path);
            return Err(encode_error("write container header", e).into());
        }

        // The muxer may pick its own stream time bases while writing the header
        if let Some(stream) = output.stream(video.stream_index) {
            video.stream_time_base = stream.time_base();
        }
        if let Some(leg) = audio.as_mut() {
            if let Some(stream) = output.stream(leg.stream_index) {
                leg.stream_time_base = stream.time_base();
            }
        }

        info!(
            "🎞️  Opened {:?}: {}x{} {:?}",
            path, layout.video.width, layout.video.height, video.format
        );

        Ok(Self {
            path: path.to_path_buf(),
            output,
            video,
            audio,
        })
    }
}

/// Record the source rotation on the video stream, re-anchored to the
/// cropped frame size
fn write_display_matrix(output: &mut Output, stream_index: usize, leg: &VideoLegSettings) -> Result<()> {
    if leg.orientation.is_identity() {
        return Ok(());
    }
    let cropped = Size::new(leg.width as f64, leg.height as f64);
    let matrix =
        AffineTransform::rotation(leg.orientation.rotation_degrees(), cropped).to_display_matrix();
    let mut bytes = Vec::with_capacity(36);
    for value in matrix {
        bytes.extend_from_slice(&value.to_ne_bytes());
    }

    unsafe {
        let stream = *(*output.as_mut_ptr()).streams.add(stream_index);
        let data = ffmpeg::ffi::av_stream_new_side_data(
            stream,
            ffmpeg::ffi::AVPacketSideDataType::AV_PKT_DATA_DISPLAYMATRIX,
            bytes.len() as _,
        );
        if data.is_null() {
            return Err(MediaError::encode("display matrix allocation failed").into());
        }
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), data, bytes.len());
    }
    Ok(())
}

impl ContainerSink for FfmpegSink {
    fn append(&mut self, kind: MediaKind, sample: Sample) -> Result<()> {
        let timing = sample.timing();
        match (kind, sample.into_payload()) {
            (MediaKind::Video, SamplePayload::Video(buffer)) => {
                let pts = timing.pts.rescale(VIDEO_TIMESCALE);
                self.video.append(&mut self.output, &buffer, pts)
            }
            (MediaKind::Audio, SamplePayload::Audio(buffer)) => match self.audio.as_mut() {
                Some(leg) => leg.append(&mut self.output, &buffer),
                None => Err(MediaError::encode("no audio leg in this container").into()),
            },
            (kind, _) => Err(MediaError::InvalidBuffer {
                details: format!("payload does not match the {} leg", kind),
            }
            .into()),
        }
    }

    fn finish_leg(&mut self, kind: MediaKind) -> Result<()> {
        match kind {
            MediaKind::Video => self.video.finish(&mut self.output),
            MediaKind::Audio => match self.audio.as_mut() {
                Some(leg) => leg.finish(&mut self.output),
                None => Ok(()),
            },
        }
    }

    fn finalize(mut self: Box<Self>) -> Result<PathBuf> {
        self.video.finish(&mut self.output)?;
        if let Some(leg) = self.audio.as_mut() {
            leg.finish(&mut self.output)?;
        }
        self.output
            .write_trailer()
            .map_err(|e| encode_error("write container trailer", e))?;
        Ok(self.path.clone())
    }

    fn abort(self: Box<Self>) {
        let path = self.path.clone();
        drop(self);
        if path.exists() {
            let _ = std::fs::remove_file(&path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, ReaderSettings};
    use crate::media::{MediaSource, Rect, SyntheticSource};
    use crate::pipeline::{DemuxReadPipeline, ReadOutcome, ReaderStatus, SourceProbe};
    use tokio_util::sync::CancellationToken;
    use crate::media::ffmpeg::FfmpegSource;
    use crate::transcode::{TranscodeOrchestrator, TranscodeRequest};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn config_in(dir: &Path) -> Config {
        let mut config = Config::default();
        config.output.directory = Some(dir.to_path_buf());
        config.encoder.threads = 2;
        config
    }

    #[tokio::test]
    async fn test_encoded_file_reads_back_at_crop_size() {
        let dir = tempdir().unwrap();
        let source = SyntheticSource::new(320, 240, 30).with_duration(1.0);
        let orchestrator = TranscodeOrchestrator::new(
            Some(Box::new(source)),
            Arc::new(FfmpegSinkFactory::new()),
            config_in(dir.path()),
        );
        let request = TranscodeRequest::new(Rect::new(10.0, 20.0, 160.0, 120.0));

        let path = orchestrator.transcode(request).await.unwrap();
        assert!(path.exists());

        let mut written = FfmpegSource::open(&path).unwrap();
        let info = written.load_info().unwrap();
        let video = info.video.unwrap();
        assert_eq!(video.natural_size, Size::new(160.0, 120.0));
        assert!(info.audio.is_some());
        assert!((info.duration.seconds() - 1.0).abs() < 0.2);
    }

    #[tokio::test]
    async fn test_encoded_audio_drains_through_the_resampler() {
        let dir = tempdir().unwrap();
        let source = SyntheticSource::new(64, 48, 30).with_duration(1.0);
        let orchestrator = TranscodeOrchestrator::new(
            Some(Box::new(source)),
            Arc::new(FfmpegSinkFactory::new()),
            config_in(dir.path()),
        );
        let path = orchestrator
            .transcode(TranscodeRequest::new(Rect::new(0.0, 0.0, 32.0, 32.0)))
            .await
            .unwrap();

        let mut written = FfmpegSource::open(&path).unwrap();
        let tracks = SourceProbe::probe(Some(&mut written as &mut dyn MediaSource)).unwrap();
        let settings = ReaderSettings::default();
        let mut reader =
            DemuxReadPipeline::open(&mut written, &tracks, &settings, CancellationToken::new())
                .unwrap();
        assert!(reader.has_audio());

        let mut frames = 0usize;
        while let ReadOutcome::Sample(sample) = reader.next_audio_sample() {
            let buffer = sample.audio_buffer().unwrap();
            assert_eq!(buffer.sample_rate(), settings.audio_sample_rate);
            frames += buffer.frames();
        }
        while let ReadOutcome::Sample(_) = reader.next_video_sample() {}

        // AAC priming and padding add at most a couple of packets
        assert!(frames.abs_diff(44_100) <= 2048, "decoded {} audio frames", frames);
        assert_eq!(reader.status(), ReaderStatus::Completed);
    }

    #[tokio::test]
    async fn test_odd_crop_without_audio() {
        let dir = tempdir().unwrap();
        let source = SyntheticSource::new(64, 48, 25).with_duration(0.4).without_audio();
        let orchestrator = TranscodeOrchestrator::new(
            Some(Box::new(source)),
            Arc::new(FfmpegSinkFactory::new()),
            config_in(dir.path()),
        );
        let request = TranscodeRequest::new(Rect::new(1.0, 1.0, 33.0, 21.0));

        let path = orchestrator.transcode(request).await.unwrap();
        let info = FfmpegSource::open(&path).unwrap().load_info().unwrap();
        assert_eq!(info.video.unwrap().natural_size, Size::new(33.0, 21.0));
        assert!(info.audio.is_none());
    }

    #[tokio::test]
    async fn test_rotation_survives_the_crop() {
        let dir = tempdir().unwrap();
        let natural = Size::new(64.0, 48.0);
        let source = SyntheticSource::new(64, 48, 25)
            .with_duration(0.2)
            .without_audio()
            .with_orientation(AffineTransform::rotation(90, natural));
        let orchestrator = TranscodeOrchestrator::new(
            Some(Box::new(source)),
            Arc::new(FfmpegSinkFactory::new()),
            config_in(dir.path()),
        );
        let request = TranscodeRequest::new(Rect::new(0.0, 0.0, 20.0, 40.0));

        let path = orchestrator.transcode(request).await.unwrap();
        let info = FfmpegSource::open(&path).unwrap().load_info().unwrap();
        let video = info.video.unwrap();
        assert_eq!(video.orientation.rotation_degrees(), 90);
        assert_eq!(video.display_size(), Size::new(20.0, 40.0));
    }

    #[test]
    fn test_missing_input_is_open_failure() {
        let err = FfmpegSource::open("/definitely/not/here.mp4").unwrap_err();
        assert!(matches!(err, crate::error::TranscoderError::Media(MediaError::OpenFailed { .. })));
    }
}
