use tracing::{debug, warn};

use crate::{
    error::{PipelineError, Result},
    media::{AffineTransform, PixelRect, Rect, TrackDescriptor},
};

/// A crop rectangle as the caller sees the video, in display space
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CropRequest {
    pub rect: Rect,
}

impl CropRequest {
    pub fn new(rect: Rect) -> Self {
        Self { rect }
    }

    /// Map the request into the stored pixel space of `track`.
    ///
    /// The orientation transform takes stored pixels to display pixels, so
    /// the display rectangle goes back through its inverse. The result is
    /// rounded outward to whole pixels and clamped to the natural frame.
    /// Anything left without area is `InvalidCropRect`.
    pub fn to_storage(&self, track: &TrackDescriptor) -> Result<PixelRect> {
        let invalid = || PipelineError::InvalidCropRect { rect: self.rect };

        if self.rect.is_empty() {
            return Err(invalid().into());
        }

        let to_storage = track.orientation.inverted().unwrap_or_else(|| {
            warn!("Orientation transform of track {} is singular, cropping unrotated", track.id);
            AffineTransform::IDENTITY
        });

        let mapped = to_storage.apply_to_rect(&self.rect.standardized()).integral();
        let bounds = Rect::from_size(track.natural_size.abs());

        let clamped = mapped.intersection(&bounds).ok_or_else(invalid)?;
        let pixels = PixelRect::from_rect(&clamped).ok_or_else(invalid)?;

        debug!("Crop {} in display space maps to {} in storage space", self.rect, pixels);
        Ok(pixels)
    }
}

impl From<Rect> for CropRequest {
    fn from(rect: Rect) -> Self {
        Self::new(rect)
    }
}
