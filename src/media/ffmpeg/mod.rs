//! # FFmpeg Backend
//!
//! Container demuxing, decoding, encoding and muxing through libav*.
//! Enabled with the `ffmpeg` feature.

mod sink;
mod source;

use std::ops::{Deref, DerefMut};
use std::sync::Once;

use ffmpeg_next as ffmpeg;
use ffmpeg::software::{resampling, scaling};
use tracing::warn;

use crate::error::MediaError;

pub use sink::{FfmpegSink, FfmpegSinkFactory};
pub use source::FfmpegSource;

static INIT: Once = Once::new();

/// Register codecs and formats once per process
pub fn init() {
    INIT.call_once(|| {
        if let Err(e) = ffmpeg::init() {
            warn!("FFmpeg initialisation reported an error: {}", e);
        }
        ffmpeg::util::log::set_level(ffmpeg::util::log::Level::Error);
    });
}

/// Scaling context that can move to a blocking worker thread.
///
/// libswscale contexts are used by exactly one owner at a time here.
pub(crate) struct SendScaler(scaling::Context);

unsafe impl Send for SendScaler {}

impl Deref for SendScaler {
    type Target = scaling::Context;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for SendScaler {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Resampling context that can move to a blocking worker thread
pub(crate) struct SendResampler(resampling::Context);

unsafe impl Send for SendResampler {}

impl Deref for SendResampler {
    type Target = resampling::Context;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for SendResampler {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

fn decode_error(context: &str, e: ffmpeg::Error) -> MediaError {
    MediaError::decode(format!("{}: {}", context, e))
}

fn encode_error(context: &str, e: ffmpeg::Error) -> MediaError {
    MediaError::encode(format!("{}: {}", context, e))
}
