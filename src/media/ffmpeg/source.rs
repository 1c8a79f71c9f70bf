use std::path::{Path, PathBuf};

use ffmpeg_next as ffmpeg;
use ffmpeg::codec::packet::side_data::Type as SideDataType;
use ffmpeg::format::context::Input;
use ffmpeg::format::{sample::Type as SampleType, Pixel, Sample as SampleFormat};
use ffmpeg::media::Type as MediaType;
use ffmpeg::software::{resampling, scaling};
use ffmpeg::util::channel_layout::ChannelLayout;
use ffmpeg::util::frame::{audio::Audio as AudioFrame, video::Video as VideoFrame};
use ffmpeg::{decoder, Packet, Rational};
use tracing::{debug, warn};

use super::{decode_error, init, SendResampler, SendScaler};
use crate::config::ReaderSettings;
use crate::error::{MediaError, Result};
use crate::media::{
    AffineTransform, AudioBuffer, MediaSource, MediaTime, PixelBuffer, PixelFormat, ReadCursor,
    Sample, SampleTiming, Size, SourceInfo, TrackDescriptor,
};

const FALLBACK_FRAME_RATE: f64 = 30.0;

/// A media file opened through libavformat.
///
/// Every cursor opens its own demuxer so the video and audio tracks can be
/// drained independently.
#[derive(Debug, Clone)]
pub struct FfmpegSource {
    path: PathBuf,
}

impl FfmpegSource {
    /// Check that `path` opens as a container and wrap it
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        init();
        let path = path.as_ref().to_path_buf();
        open_input(&path)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn open_input(path: &Path) -> Result<Input> {
    ffmpeg::format::input(&path).map_err(|e| {
        debug!("avformat_open_input failed for {:?}: {}", path, e);
        MediaError::OpenFailed {
            path: path.display().to_string(),
        }
        .into()
    })
}

/// Decoders occasionally repeat or regress timestamps. A frame that does not
/// advance past `last` is placed one frame duration after it.
fn monotonic_pts(pts: MediaTime, last: Option<MediaTime>, frame_duration: MediaTime) -> MediaTime {
    match last {
        Some(last) if pts <= last => {
            let retimed = MediaTime::from_seconds(last.seconds() + frame_duration.seconds(), 90_000);
            debug!(
                "Video pts {:.4}s does not advance past {:.4}s, retimed to {:.4}s",
                pts.seconds(),
                last.seconds(),
                retimed.seconds()
            );
            retimed
        }
        _ => pts,
    }
}

fn rational_seconds(value: i64, base: Rational) -> MediaTime {
    if base.denominator() <= 0 {
        return MediaTime::ZERO;
    }
    MediaTime::new(value * base.numerator() as i64, base.denominator())
}

/// Display orientation from the stream's display matrix, falling back to
/// the legacy `rotate` tag
fn stream_orientation(stream: &ffmpeg::format::stream::Stream, natural: Size) -> AffineTransform {
    for side_data in stream.side_data() {
        if side_data.kind() != SideDataType::DisplayMatrix {
            continue;
        }
        let bytes = side_data.data();
        if bytes.len() < 36 {
            continue;
        }
        let mut matrix = [0i32; 9];
        for (value, chunk) in matrix.iter_mut().zip(bytes.chunks_exact(4)) {
            *value = i32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        let degrees = AffineTransform::from_display_matrix(&matrix).rotation_degrees();
        return AffineTransform::rotation(degrees, natural);
    }

    stream
        .metadata()
        .get("rotate")
        .and_then(|tag| tag.trim().parse::<i32>().ok())
        .map(|degrees| AffineTransform::rotation(degrees, natural))
        .unwrap_or(AffineTransform::IDENTITY)
}

impl MediaSource for FfmpegSource {
    fn name(&self) -> String {
        self.path.display().to_string()
    }

    fn load_info(&mut self) -> Result<SourceInfo> {
        let input = open_input(&self.path)?;

        let duration = if input.duration() > 0 {
            MediaTime::new(input.duration(), ffmpeg::ffi::AV_TIME_BASE as i32)
        } else {
            MediaTime::ZERO
        };

        let video = match input.streams().best(MediaType::Video) {
            Some(stream) => {
                let context = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
                    .map_err(|e| decode_error("video parameters", e))?;
                let decoder = context
                    .decoder()
                    .video()
                    .map_err(|e| decode_error("video decoder", e))?;

                let natural = Size::new(decoder.width() as f64, decoder.height() as f64);
                let mut frame_rate = f64::from(stream.avg_frame_rate());
                if !frame_rate.is_finite() || frame_rate <= 0.0 {
                    frame_rate = f64::from(stream.rate());
                }
                if !frame_rate.is_finite() || frame_rate <= 0.0 {
                    frame_rate = FALLBACK_FRAME_RATE;
                }
                let bitrate = match decoder.bit_rate() {
                    0 => None,
                    rate => Some(rate as u64),
                };

                Some(
                    TrackDescriptor::video(
                        stream.index(),
                        natural,
                        stream_orientation(&stream, natural),
                        frame_rate,
                    )
                    .with_bitrate(bitrate),
                )
            }
            None => None,
        };

        let audio = input
            .streams()
            .best(MediaType::Audio)
            .map(|stream| TrackDescriptor::audio(stream.index()));

        Ok(SourceInfo {
            duration,
            video,
            audio,
        })
    }

    fn open_cursor(
        &mut self,
        track: &TrackDescriptor,
        settings: &ReaderSettings,
    ) -> Result<Box<dyn ReadCursor>> {
        let input = open_input(&self.path)?;
        let stream = input
            .stream(track.id)
            .ok_or_else(|| MediaError::decode(format!("stream {} not found", track.id)))?;
        let parameters = stream.parameters();
        let time_base = stream.time_base();
        let start = stream.start_time();
        let medium = parameters.medium();
        let context = ffmpeg::codec::context::Context::from_parameters(parameters)
            .map_err(|e| decode_error("codec parameters", e))?;

        let packets = PacketFeed {
            input,
            stream_index: track.id,
            eof_sent: false,
        };

        match medium {
            MediaType::Video => {
                if settings.pixel_format != PixelFormat::Bgra {
                    return Err(MediaError::UnsupportedFormat {
                        format: format!("{:?}", settings.pixel_format),
                    }
                    .into());
                }
                let decoder = context
                    .decoder()
                    .video()
                    .map_err(|e| decode_error("video decoder", e))?;
                let rate = track.nominal_frame_rate.max(1.0);
                Ok(Box::new(VideoCursor {
                    packets,
                    decoder,
                    scaler: None,
                    time_base,
                    start: if start == ffmpeg::ffi::AV_NOPTS_VALUE { 0 } else { start },
                    frame_duration: MediaTime::from_seconds(1.0 / rate, 90_000),
                    last_pts: None,
                    emitted: 0,
                }))
            }
            MediaType::Audio => {
                let decoder = context
                    .decoder()
                    .audio()
                    .map_err(|e| decode_error("audio decoder", e))?;
                Ok(Box::new(AudioCursor {
                    packets,
                    decoder,
                    resampler: None,
                    sample_rate: settings.audio_sample_rate,
                    channels: settings.audio_channels,
                    emitted_frames: 0,
                    flushed: false,
                }))
            }
            other => Err(MediaError::UnsupportedFormat {
                format: format!("{:?} stream", other),
            }
            .into()),
        }
    }
}

/// Packets of one stream, read from a private demuxer
struct PacketFeed {
    input: Input,
    stream_index: usize,
    eof_sent: bool,
}

impl PacketFeed {
    /// Hand the decoder its next packet, or end-of-stream once the
    /// container is exhausted
    fn feed(&mut self, decoder: &mut decoder::Opened) -> Result<()> {
        let mut packet = Packet::empty();
        loop {
            match packet.read(&mut self.input) {
                Ok(()) => {
                    if packet.stream() != self.stream_index {
                        continue;
                    }
                    if let Err(e) = decoder.send_packet(&packet) {
                        warn!("Skipping undecodable packet: {}", e);
                        continue;
                    }
                    return Ok(());
                }
                Err(ffmpeg::Error::Eof) => {
                    decoder
                        .send_eof()
                        .map_err(|e| decode_error("decoder flush", e))?;
                    self.eof_sent = true;
                    return Ok(());
                }
                Err(e) => return Err(decode_error("packet read", e).into()),
            }
        }
    }
}

struct VideoCursor {
    packets: PacketFeed,
    decoder: decoder::Video,
    scaler: Option<(Pixel, u32, u32, SendScaler)>,
    time_base: Rational,
    start: i64,
    frame_duration: MediaTime,
    last_pts: Option<MediaTime>,
    emitted: i64,
}

impl VideoCursor {
    fn to_bgra(&mut self, decoded: &VideoFrame) -> Result<PixelBuffer> {
        let (format, width, height) = (decoded.format(), decoded.width(), decoded.height());
        let stale = match &self.scaler {
            Some((f, w, h, _)) => (*f, *w, *h) != (format, width, height),
            None => true,
        };
        if stale {
            let context = scaling::Context::get(
                format,
                width,
                height,
                Pixel::BGRA,
                width,
                height,
                scaling::Flags::BILINEAR,
            )
            .map_err(|e| decode_error("scaler", e))?;
            self.scaler = Some((format, width, height, SendScaler(context)));
        }

        let mut bgra = VideoFrame::empty();
        if let Some((_, _, _, scaler)) = self.scaler.as_mut() {
            scaler
                .run(decoded, &mut bgra)
                .map_err(|e| decode_error("pixel conversion", e))?;
        }

        let stride = bgra.stride(0);
        let data = bgra.data(0).to_vec();
        Ok(PixelBuffer::from_raw(width, height, stride, PixelFormat::Bgra, data)?)
    }

    fn timing(&mut self, decoded: &VideoFrame) -> SampleTiming {
        let fallback = MediaTime::from_seconds(
            self.emitted as f64 * self.frame_duration.seconds(),
            90_000,
        );
        let pts = decoded
            .timestamp()
            .map(|ts| rational_seconds(ts - self.start, self.time_base))
            .unwrap_or(fallback);

        let pts = monotonic_pts(pts, self.last_pts, self.frame_duration);
        self.last_pts = Some(pts);
        self.emitted += 1;
        SampleTiming::in_order(pts, self.frame_duration)
    }
}

impl ReadCursor for VideoCursor {
    fn next_sample(&mut self) -> Result<Option<Sample>> {
        let mut decoded = VideoFrame::empty();
        loop {
            if self.decoder.receive_frame(&mut decoded).is_ok() {
                let buffer = self.to_bgra(&decoded)?;
                let timing = self.timing(&decoded);
                return Ok(Some(Sample::video(buffer, timing)));
            }
            if self.packets.eof_sent {
                return Ok(None);
            }
            self.packets.feed(&mut self.decoder)?;
        }
    }
}

/// Headroom added to every resampler output frame
const RESAMPLE_SLACK_FRAMES: usize = 256;
/// Largest frame handed to the resampler when draining its tail
const FLUSH_CHUNK_FRAMES: usize = 4096;

/// Frames the resampler still holds, expressed at the output rate
fn pending_output(resampler: &resampling::Context) -> usize {
    resampler
        .delay()
        .map_or(0, |delay| usize::try_from(delay.output).unwrap_or(0))
}

/// Packed 16-bit output frame with room for `capacity` frames.
///
/// swr only writes into frames that already match its output format, so an
/// empty frame makes it bail with "output changed".
fn output_frame(capacity: usize, layout: ChannelLayout, rate: u32) -> AudioFrame {
    let mut frame = AudioFrame::new(SampleFormat::I16(SampleType::Packed), capacity, layout);
    frame.set_rate(rate);
    frame
}

struct AudioCursor {
    packets: PacketFeed,
    decoder: decoder::Audio,
    resampler: Option<SendResampler>,
    sample_rate: u32,
    channels: u16,
    emitted_frames: i64,
    flushed: bool,
}

impl AudioCursor {
    fn target_layout(&self) -> ChannelLayout {
        ChannelLayout::default(self.channels as i32)
    }

    fn resample(&mut self, decoded: &mut AudioFrame) -> Result<AudioFrame> {
        if decoded.channel_layout().is_empty() {
            decoded.set_channel_layout(ChannelLayout::default(decoded.channels() as i32));
        }
        if self.resampler.is_none() {
            let context = resampling::Context::get(
                decoded.format(),
                decoded.channel_layout(),
                decoded.rate(),
                SampleFormat::I16(SampleType::Packed),
                self.target_layout(),
                self.sample_rate,
            )
            .map_err(|e| decode_error("resampler", e))?;
            self.resampler = Some(SendResampler(context));
        }

        let layout = self.target_layout();
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(AudioFrame::empty());
        };
        // Room for this frame at the output rate plus whatever is still buffered
        let in_rate = decoded.rate().max(1) as usize;
        let scaled = (decoded.samples() * self.sample_rate as usize).div_ceil(in_rate);
        let capacity = scaled + pending_output(resampler) + RESAMPLE_SLACK_FRAMES;
        let mut converted = output_frame(capacity, layout, self.sample_rate);
        resampler
            .run(decoded, &mut converted)
            .map_err(|e| decode_error("resample", e))?;
        Ok(converted)
    }

    /// Drain the resampler's buffered tail, one bounded frame per call.
    /// `None` once nothing is left.
    fn flush(&mut self) -> Result<Option<AudioFrame>> {
        let layout = self.target_layout();
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(None);
        };
        let capacity = pending_output(resampler).clamp(RESAMPLE_SLACK_FRAMES, FLUSH_CHUNK_FRAMES);
        let mut converted = output_frame(capacity, layout, self.sample_rate);
        resampler
            .flush(&mut converted)
            .map_err(|e| decode_error("resampler flush", e))?;
        if converted.samples() == 0 {
            return Ok(None);
        }
        Ok(Some(converted))
    }

    /// Interleaved 16-bit sample from a converted frame, or `None` when the
    /// resampler is still buffering
    fn to_sample(&mut self, converted: &AudioFrame) -> Result<Option<Sample>> {
        let frames = converted.samples();
        if frames == 0 {
            return Ok(None);
        }
        let byte_len = frames * self.channels as usize * 2;
        let bytes = converted.data(0);
        if bytes.len() < byte_len {
            return Err(MediaError::InvalidBuffer {
                details: format!("{} bytes for {} audio frames", bytes.len(), frames),
            }
            .into());
        }
        let samples = bytes[..byte_len]
            .chunks_exact(2)
            .map(|pair| i16::from_ne_bytes([pair[0], pair[1]]))
            .collect();

        let buffer = AudioBuffer::new(samples, self.channels, self.sample_rate)?;
        let offset = MediaTime::new(self.emitted_frames, self.sample_rate as i32);
        self.emitted_frames += frames as i64;
        let timing = SampleTiming::in_order(offset, buffer.duration());
        Ok(Some(Sample::audio(buffer, timing)))
    }
}

impl ReadCursor for AudioCursor {
    fn next_sample(&mut self) -> Result<Option<Sample>> {
        let mut decoded = AudioFrame::empty();
        loop {
            if self.decoder.receive_frame(&mut decoded).is_ok() {
                let converted = self.resample(&mut decoded)?;
                if let Some(sample) = self.to_sample(&converted)? {
                    return Ok(Some(sample));
                }
                continue;
            }
            if self.packets.eof_sent {
                if self.flushed {
                    return Ok(None);
                }
                match self.flush()? {
                    Some(converted) => return self.to_sample(&converted),
                    None => {
                        self.flushed = true;
                        return Ok(None);
                    }
                }
            }
            self.packets.feed(&mut self.decoder)?;
        }
    }
}
