use std::cmp::Ordering;
use std::fmt;

use image::{ImageBuffer, Rgba};
use serde::{Deserialize, Serialize};

use crate::error::MediaError;

/// Rational time value: `value / timescale` seconds
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MediaTime {
    pub value: i64,
    pub timescale: i32,
}

impl MediaTime {
    pub const ZERO: MediaTime = MediaTime {
        value: 0,
        timescale: 1,
    };

    /// Create a time value. A non-positive timescale is treated as 1.
    pub fn new(value: i64, timescale: i32) -> Self {
        Self {
            value,
            timescale: timescale.max(1),
        }
    }

    /// Nearest representation of `seconds` at the given timescale
    pub fn from_seconds(seconds: f64, timescale: i32) -> Self {
        let timescale = timescale.max(1);
        Self::new((seconds * timescale as f64).round() as i64, timescale)
    }

    pub fn seconds(&self) -> f64 {
        self.value as f64 / self.timescale as f64
    }

    /// Express this time in another timescale, rounding to nearest
    pub fn rescale(&self, timescale: i32) -> i64 {
        let timescale = timescale.max(1) as i128;
        let num = self.value as i128 * timescale;
        let den = self.timescale as i128;
        let half = den / 2;
        let scaled = if num >= 0 {
            (num + half) / den
        } else {
            (num - half) / den
        };
        scaled as i64
    }
}

impl PartialEq for MediaTime {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for MediaTime {}

impl PartialOrd for MediaTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MediaTime {
    fn cmp(&self, other: &Self) -> Ordering {
        let lhs = self.value as i128 * other.timescale as i128;
        let rhs = other.value as i128 * self.timescale as i128;
        lhs.cmp(&rhs)
    }
}

impl Default for MediaTime {
    fn default() -> Self {
        Self::ZERO
    }
}

impl fmt::Display for MediaTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}s", self.seconds())
    }
}

/// Which sub-stream a sample, track or leg belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Video => write!(f, "video"),
            MediaKind::Audio => write!(f, "audio"),
        }
    }
}

/// Presentation/decode timing carried by every sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SampleTiming {
    pub pts: MediaTime,
    pub dts: MediaTime,
    pub duration: MediaTime,
}

impl SampleTiming {
    pub fn new(pts: MediaTime, dts: MediaTime, duration: MediaTime) -> Self {
        Self { pts, dts, duration }
    }

    /// Timing for streams without reordering, where decode time equals
    /// presentation time
    pub fn in_order(pts: MediaTime, duration: MediaTime) -> Self {
        Self::new(pts, pts, duration)
    }
}

/// Raw pixel layouts produced by the read side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// 32-bit, one byte each of blue, green, red, alpha
    Bgra,
}

impl PixelFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Bgra => 4,
        }
    }
}

/// A decoded video frame in a packed 4-byte pixel format
#[derive(Clone, PartialEq, Eq)]
pub struct PixelBuffer {
    data: Vec<u8>,
    width: u32,
    height: u32,
    stride: usize,
    format: PixelFormat,
}

impl PixelBuffer {
    /// Wrap raw rows. `stride` is the byte distance between row starts.
    pub fn from_raw(
        width: u32,
        height: u32,
        stride: usize,
        format: PixelFormat,
        data: Vec<u8>,
    ) -> std::result::Result<Self, MediaError> {
        let row_bytes = width as usize * format.bytes_per_pixel();
        if width == 0 || height == 0 {
            return Err(MediaError::InvalidBuffer {
                details: format!("empty {}x{} frame", width, height),
            });
        }
        if stride < row_bytes {
            return Err(MediaError::InvalidBuffer {
                details: format!("stride {} shorter than row of {} bytes", stride, row_bytes),
            });
        }
        let needed = stride * (height as usize - 1) + row_bytes;
        if data.len() < needed {
            return Err(MediaError::InvalidBuffer {
                details: format!("{} bytes for {}x{} frame, need {}", data.len(), width, height, needed),
            });
        }
        Ok(Self {
            data,
            width,
            height,
            stride,
            format,
        })
    }

    /// Tightly packed BGRA buffer
    pub fn bgra(width: u32, height: u32, data: Vec<u8>) -> std::result::Result<Self, MediaError> {
        let stride = width as usize * PixelFormat::Bgra.bytes_per_pixel();
        Self::from_raw(width, height, stride, PixelFormat::Bgra, data)
    }

    /// Tightly packed BGRA buffer filled with one color
    pub fn filled(width: u32, height: u32, bgra: [u8; 4]) -> std::result::Result<Self, MediaError> {
        let data = bgra.repeat(width as usize * height as usize);
        Self::bgra(width, height, data)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn row_bytes(&self) -> usize {
        self.width as usize * self.format.bytes_per_pixel()
    }

    pub fn is_packed(&self) -> bool {
        self.stride == self.row_bytes()
    }

    /// Pixel at `(x, y)` as stored, or `None` outside the frame
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = y as usize * self.stride + x as usize * self.format.bytes_per_pixel();
        let px = self.data.get(offset..offset + 4)?;
        Some([px[0], px[1], px[2], px[3]])
    }

    /// Row `y` without stride padding
    pub fn row(&self, y: u32) -> Option<&[u8]> {
        if y >= self.height {
            return None;
        }
        let start = y as usize * self.stride;
        self.data.get(start..start + self.row_bytes())
    }

    /// Copy the pixels into an owned image.
    ///
    /// `image` dropped its BGRA pixel type in 0.24, so the four channels are
    /// carried in an `Rgba` container in stored order. Geometry operations
    /// do not look at channel meaning.
    pub fn to_image(&self) -> Option<ImageBuffer<Rgba<u8>, Vec<u8>>> {
        let packed = self.to_packed();
        ImageBuffer::from_raw(packed.width, packed.height, packed.data)
    }

    /// Wrap an image produced by `to_image` (or any 4-byte image) as BGRA
    pub fn from_image(image: ImageBuffer<Rgba<u8>, Vec<u8>>) -> std::result::Result<Self, MediaError> {
        let (width, height) = image.dimensions();
        Self::bgra(width, height, image.into_raw())
    }

    /// Copy into a tightly packed buffer
    pub fn to_packed(&self) -> PixelBuffer {
        if self.is_packed() {
            return self.clone();
        }
        let mut data = Vec::with_capacity(self.row_bytes() * self.height as usize);
        for y in 0..self.height {
            if let Some(row) = self.row(y) {
                data.extend_from_slice(row);
            }
        }
        Self {
            data,
            width: self.width,
            height: self.height,
            stride: self.row_bytes(),
            format: self.format,
        }
    }
}

impl fmt::Debug for PixelBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PixelBuffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("stride", &self.stride)
            .field("format", &self.format)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// Interleaved signed 16-bit linear PCM
#[derive(Clone, PartialEq, Eq)]
pub struct AudioBuffer {
    samples: Vec<i16>,
    channels: u16,
    sample_rate: u32,
}

impl AudioBuffer {
    pub fn new(
        samples: Vec<i16>,
        channels: u16,
        sample_rate: u32,
    ) -> std::result::Result<Self, MediaError> {
        if channels == 0 || sample_rate == 0 {
            return Err(MediaError::InvalidBuffer {
                details: format!("{} channels at {} Hz", channels, sample_rate),
            });
        }
        if samples.len() % channels as usize != 0 {
            return Err(MediaError::InvalidBuffer {
                details: format!("{} samples do not divide into {} channels", samples.len(), channels),
            });
        }
        Ok(Self {
            samples,
            channels,
            sample_rate,
        })
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Number of sample frames (one value per channel each)
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    pub fn duration(&self) -> MediaTime {
        MediaTime::new(self.frames() as i64, self.sample_rate as i32)
    }
}

impl fmt::Debug for AudioBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioBuffer")
            .field("frames", &self.frames())
            .field("channels", &self.channels)
            .field("sample_rate", &self.sample_rate)
            .finish()
    }
}

/// Describes the payload layout of a sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum FormatDescription {
    Video {
        width: u32,
        height: u32,
        pixel_format: PixelFormat,
    },
    Audio {
        sample_rate: u32,
        channels: u16,
    },
}

impl FormatDescription {
    pub fn for_pixel_buffer(buffer: &PixelBuffer) -> Self {
        Self::Video {
            width: buffer.width(),
            height: buffer.height(),
            pixel_format: buffer.format(),
        }
    }

    pub fn for_audio_buffer(buffer: &AudioBuffer) -> Self {
        Self::Audio {
            sample_rate: buffer.sample_rate(),
            channels: buffer.channels(),
        }
    }

    pub fn kind(&self) -> MediaKind {
        match self {
            Self::Video { .. } => MediaKind::Video,
            Self::Audio { .. } => MediaKind::Audio,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SamplePayload {
    Video(PixelBuffer),
    Audio(AudioBuffer),
}

/// One decoded unit of the video or audio sub-stream.
///
/// Samples are moved, never shared: each one is read once, optionally
/// transformed, and handed once to the write side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    payload: SamplePayload,
    timing: SampleTiming,
    format: FormatDescription,
}

impl Sample {
    pub fn video(buffer: PixelBuffer, timing: SampleTiming) -> Self {
        let format = FormatDescription::for_pixel_buffer(&buffer);
        Self {
            payload: SamplePayload::Video(buffer),
            timing,
            format,
        }
    }

    pub fn audio(buffer: AudioBuffer, timing: SampleTiming) -> Self {
        let format = FormatDescription::for_audio_buffer(&buffer);
        Self {
            payload: SamplePayload::Audio(buffer),
            timing,
            format,
        }
    }

    pub fn kind(&self) -> MediaKind {
        match self.payload {
            SamplePayload::Video(_) => MediaKind::Video,
            SamplePayload::Audio(_) => MediaKind::Audio,
        }
    }

    pub fn timing(&self) -> SampleTiming {
        self.timing
    }

    pub fn format(&self) -> FormatDescription {
        self.format
    }

    pub fn payload(&self) -> &SamplePayload {
        &self.payload
    }

    pub fn pixel_buffer(&self) -> Option<&PixelBuffer> {
        match &self.payload {
            SamplePayload::Video(buffer) => Some(buffer),
            SamplePayload::Audio(_) => None,
        }
    }

    pub fn audio_buffer(&self) -> Option<&AudioBuffer> {
        match &self.payload {
            SamplePayload::Audio(buffer) => Some(buffer),
            SamplePayload::Video(_) => None,
        }
    }

    pub fn into_payload(self) -> SamplePayload {
        self.payload
    }
}
