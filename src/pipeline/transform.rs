use image::imageops;
use tracing::warn;

use crate::{
    error::SampleError,
    media::{PixelBuffer, PixelRect, Sample},
};

/// Crops decoded video frames
pub struct FrameTransformer;

impl FrameTransformer {
    /// Crop one video sample to `crop`, given in stored pixel space.
    ///
    /// The new buffer is exactly `crop.width` x `crop.height`, anchored at
    /// the origin, with the original timing and a fresh format description.
    /// Returns `None` when the crop cannot be applied; the caller then
    /// writes the original sample for this frame only.
    pub fn transform(sample: &Sample, crop: &PixelRect) -> Option<Sample> {
        match Self::try_transform(sample, crop) {
            Ok(cropped) => Some(cropped),
            Err(e) => {
                warn!("{}", e);
                None
            }
        }
    }

    /// Same as `transform`, keeping the failure reason
    pub fn try_transform(sample: &Sample, crop: &PixelRect) -> Result<Sample, SampleError> {
        let buffer = sample.pixel_buffer().ok_or_else(|| SampleError::TransformFailed {
            reason: format!("{} sample has no pixel buffer", sample.kind()),
        })?;

        if !crop.fits_within(buffer.width(), buffer.height()) {
            return Err(SampleError::TransformFailed {
                reason: format!(
                    "crop {} outside {}x{} frame",
                    crop,
                    buffer.width(),
                    buffer.height()
                ),
            });
        }

        let image = buffer.to_image().ok_or_else(|| SampleError::TransformFailed {
            reason: format!("could not view {:?} as an image", buffer),
        })?;

        let cropped = imageops::crop_imm(&image, crop.x, crop.y, crop.width, crop.height).to_image();
        let out = PixelBuffer::from_image(cropped).map_err(|e| SampleError::TransformFailed {
            reason: e.to_string(),
        })?;

        Ok(Sample::video(out, sample.timing()))
    }
}
