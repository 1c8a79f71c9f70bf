use std::fmt;

use serde::{Deserialize, Serialize};

/// A point in pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const ZERO: Point = Point { x: 0.0, y: 0.0 };

    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// A width/height pair. Components may be negative after a transform.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Size {
    pub width: f64,
    pub height: f64,
}

impl Size {
    pub const ZERO: Size = Size { width: 0.0, height: 0.0 };

    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }

    /// The same size with both components made non-negative
    pub fn abs(self) -> Self {
        Self::new(self.width.abs(), self.height.abs())
    }
}

/// An axis-aligned rectangle with an origin and a size
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub origin: Point,
    pub size: Size,
}

impl Rect {
    pub const ZERO: Rect = Rect {
        origin: Point::ZERO,
        size: Size::ZERO,
    };

    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            origin: Point::new(x, y),
            size: Size::new(width, height),
        }
    }

    /// Rectangle anchored at the origin covering `size`
    pub fn from_size(size: Size) -> Self {
        Self {
            origin: Point::ZERO,
            size,
        }
    }

    pub fn min_x(&self) -> f64 {
        self.origin.x.min(self.origin.x + self.size.width)
    }

    pub fn min_y(&self) -> f64 {
        self.origin.y.min(self.origin.y + self.size.height)
    }

    pub fn max_x(&self) -> f64 {
        self.origin.x.max(self.origin.x + self.size.width)
    }

    pub fn max_y(&self) -> f64 {
        self.origin.y.max(self.origin.y + self.size.height)
    }

    pub fn width(&self) -> f64 {
        self.size.width.abs()
    }

    pub fn height(&self) -> f64 {
        self.size.height.abs()
    }

    /// Same rectangle with a non-negative width and height
    pub fn standardized(&self) -> Self {
        Self::new(self.min_x(), self.min_y(), self.width(), self.height())
    }

    /// True when the rectangle encloses no area or has non-finite components
    pub fn is_empty(&self) -> bool {
        let finite = self.origin.x.is_finite()
            && self.origin.y.is_finite()
            && self.size.width.is_finite()
            && self.size.height.is_finite();
        !finite || self.width() <= 0.0 || self.height() <= 0.0
    }

    /// Overlap of two rectangles, or `None` when they do not overlap
    pub fn intersection(&self, other: &Rect) -> Option<Rect> {
        let min_x = self.min_x().max(other.min_x());
        let min_y = self.min_y().max(other.min_y());
        let max_x = self.max_x().min(other.max_x());
        let max_y = self.max_y().min(other.max_y());

        if max_x <= min_x || max_y <= min_y {
            return None;
        }
        Some(Rect::new(min_x, min_y, max_x - min_x, max_y - min_y))
    }

    /// Smallest rectangle with integral bounds that contains this one
    pub fn integral(&self) -> Self {
        let min_x = self.min_x().floor();
        let min_y = self.min_y().floor();
        let max_x = self.max_x().ceil();
        let max_y = self.max_y().ceil();
        Rect::new(min_x, min_y, max_x - min_x, max_y - min_y)
    }
}

impl fmt::Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}, {}x{})",
            self.origin.x, self.origin.y, self.size.width, self.size.height
        )
    }
}

/// An integral, non-empty region of a pixel buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl PixelRect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// Convert an integral, non-negative rectangle. Returns `None` for empty
    /// or negative-origin rectangles.
    pub fn from_rect(rect: &Rect) -> Option<Self> {
        let rect = rect.integral();
        if rect.is_empty() || rect.min_x() < 0.0 || rect.min_y() < 0.0 {
            return None;
        }
        if rect.max_x() > u32::MAX as f64 || rect.max_y() > u32::MAX as f64 {
            return None;
        }
        Some(Self::new(
            rect.min_x() as u32,
            rect.min_y() as u32,
            rect.width() as u32,
            rect.height() as u32,
        ))
    }

    /// Whether the region lies completely inside a `width` x `height` buffer
    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        self.width > 0
            && self.height > 0
            && self.x as u64 + self.width as u64 <= width as u64
            && self.y as u64 + self.height as u64 <= height as u64
    }

    pub fn to_rect(&self) -> Rect {
        Rect::new(
            self.x as f64,
            self.y as f64,
            self.width as f64,
            self.height as f64,
        )
    }
}

impl fmt::Display for PixelRect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}+{}+{}", self.width, self.height, self.x, self.y)
    }
}

/// 2-D affine transform mapping `(x, y)` to
/// `(a*x + c*y + tx, b*x + d*y + ty)`.
///
/// Orientation transforms recorded with a video track use this form: they
/// map stored (natural) pixel coordinates to display coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AffineTransform {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
    pub tx: f64,
    pub ty: f64,
}

impl Default for AffineTransform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Tolerance used when snapping matrix entries decoded from fixed point
const EPSILON: f64 = 1e-9;

impl AffineTransform {
    pub const IDENTITY: AffineTransform = AffineTransform {
        a: 1.0,
        b: 0.0,
        c: 0.0,
        d: 1.0,
        tx: 0.0,
        ty: 0.0,
    };

    pub fn new(a: f64, b: f64, c: f64, d: f64, tx: f64, ty: f64) -> Self {
        Self { a, b, c, d, tx, ty }
    }

    /// Rotation by a multiple of 90 degrees (clockwise on screen) that keeps
    /// a `natural` sized frame inside the positive quadrant.
    pub fn rotation(degrees: i32, natural: Size) -> Self {
        match degrees.rem_euclid(360) {
            90 => Self::new(0.0, 1.0, -1.0, 0.0, natural.height, 0.0),
            180 => Self::new(-1.0, 0.0, 0.0, -1.0, natural.width, natural.height),
            270 => Self::new(0.0, -1.0, 1.0, 0.0, 0.0, natural.width),
            _ => Self::IDENTITY,
        }
    }

    /// Clockwise rotation in whole degrees implied by the linear part
    pub fn rotation_degrees(&self) -> i32 {
        let radians = self.b.atan2(self.a);
        let degrees = radians.to_degrees().round() as i32;
        degrees.rem_euclid(360)
    }

    pub fn is_identity(&self) -> bool {
        (self.a - 1.0).abs() < EPSILON
            && self.b.abs() < EPSILON
            && self.c.abs() < EPSILON
            && (self.d - 1.0).abs() < EPSILON
            && self.tx.abs() < EPSILON
            && self.ty.abs() < EPSILON
    }

    pub fn determinant(&self) -> f64 {
        self.a * self.d - self.b * self.c
    }

    pub fn apply_to_point(&self, p: Point) -> Point {
        Point::new(
            self.a * p.x + self.c * p.y + self.tx,
            self.b * p.x + self.d * p.y + self.ty,
        )
    }

    /// Linear part only, no translation
    pub fn apply_to_size(&self, s: Size) -> Size {
        Size::new(
            self.a * s.width + self.c * s.height,
            self.b * s.width + self.d * s.height,
        )
    }

    /// Bounding box of the four transformed corners
    pub fn apply_to_rect(&self, r: &Rect) -> Rect {
        let corners = [
            Point::new(r.min_x(), r.min_y()),
            Point::new(r.max_x(), r.min_y()),
            Point::new(r.min_x(), r.max_y()),
            Point::new(r.max_x(), r.max_y()),
        ]
        .map(|p| self.apply_to_point(p));

        let min_x = corners.iter().map(|p| p.x).fold(f64::INFINITY, f64::min);
        let min_y = corners.iter().map(|p| p.y).fold(f64::INFINITY, f64::min);
        let max_x = corners.iter().map(|p| p.x).fold(f64::NEG_INFINITY, f64::max);
        let max_y = corners.iter().map(|p| p.y).fold(f64::NEG_INFINITY, f64::max);

        Rect::new(min_x, min_y, max_x - min_x, max_y - min_y)
    }

    /// Inverse transform, or `None` if the matrix is singular
    pub fn inverted(&self) -> Option<Self> {
        let det = self.determinant();
        if det.abs() < EPSILON || !det.is_finite() {
            return None;
        }
        let a = self.d / det;
        let b = -self.b / det;
        let c = -self.c / det;
        let d = self.a / det;
        let tx = -(a * self.tx + c * self.ty);
        let ty = -(b * self.tx + d * self.ty);
        Some(Self::new(a, b, c, d, tx, ty))
    }

    /// Decode a 3x3 display matrix as stored in MP4/MOV track headers:
    /// row-major, `a b c d tx ty` in 16.16 fixed point, the third column in
    /// 2.30.
    pub fn from_display_matrix(matrix: &[i32; 9]) -> Self {
        let fixed = |v: i32| snap(v as f64 / 65536.0);
        Self::new(
            fixed(matrix[0]),
            fixed(matrix[1]),
            fixed(matrix[3]),
            fixed(matrix[4]),
            fixed(matrix[6]),
            fixed(matrix[7]),
        )
    }

    /// Encode as a 3x3 display matrix (inverse of `from_display_matrix`)
    pub fn to_display_matrix(&self) -> [i32; 9] {
        let fixed = |v: f64| (v * 65536.0).round() as i32;
        [
            fixed(self.a),
            fixed(self.b),
            0,
            fixed(self.c),
            fixed(self.d),
            0,
            fixed(self.tx),
            fixed(self.ty),
            1 << 30,
        ]
    }
}

fn snap(v: f64) -> f64 {
    let rounded = v.round();
    if (v - rounded).abs() < 1e-6 {
        rounded
    } else {
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_leaves_rect_unchanged() {
        let rect = Rect::new(10.0, 20.0, 100.0, 50.0);
        assert_eq!(AffineTransform::IDENTITY.apply_to_rect(&rect), rect);
        assert!(AffineTransform::IDENTITY.is_identity());
    }

    #[test]
    fn test_rotation_90_swaps_axes() {
        let natural = Size::new(1920.0, 1080.0);
        let t = AffineTransform::rotation(90, natural);
        let display = t.apply_to_size(natural).abs();
        assert_eq!(display, Size::new(1080.0, 1920.0));
        assert_eq!(t.rotation_degrees(), 90);

        // The whole stored frame maps onto the whole display frame.
        let mapped = t.apply_to_rect(&Rect::from_size(natural));
        assert_eq!(mapped, Rect::new(0.0, 0.0, 1080.0, 1920.0));
    }

    #[test]
    fn test_inverse_round_trips_rect() {
        let natural = Size::new(640.0, 480.0);
        for degrees in [0, 90, 180, 270] {
            let t = AffineTransform::rotation(degrees, natural);
            let inv = t.inverted().unwrap();
            let rect = Rect::new(12.0, 30.0, 100.0, 60.0);
            let back = inv.apply_to_rect(&t.apply_to_rect(&rect));
            assert!((back.min_x() - rect.min_x()).abs() < 1e-9, "{degrees}");
            assert!((back.min_y() - rect.min_y()).abs() < 1e-9, "{degrees}");
            assert!((back.width() - rect.width()).abs() < 1e-9, "{degrees}");
        }
    }

    #[test]
    fn test_singular_transform_has_no_inverse() {
        let t = AffineTransform::new(0.0, 0.0, 0.0, 0.0, 5.0, 5.0);
        assert!(t.inverted().is_none());
    }

    #[test]
    fn test_display_matrix_round_trip() {
        let t = AffineTransform::rotation(270, Size::new(1280.0, 720.0));
        let back = AffineTransform::from_display_matrix(&t.to_display_matrix());
        assert_eq!(back, t);
    }

    #[test]
    fn test_integral_rounds_outward() {
        let rect = Rect::new(0.5, 1.2, 10.0, 10.0).integral();
        assert_eq!(rect, Rect::new(0.0, 1.0, 11.0, 11.0));
    }

    #[test]
    fn test_intersection_and_emptiness() {
        let bounds = Rect::new(0.0, 0.0, 100.0, 100.0);
        let partial = Rect::new(90.0, 90.0, 50.0, 50.0);
        assert_eq!(
            bounds.intersection(&partial),
            Some(Rect::new(90.0, 90.0, 10.0, 10.0))
        );
        assert!(bounds.intersection(&Rect::new(200.0, 0.0, 5.0, 5.0)).is_none());
        assert!(Rect::ZERO.is_empty());
        assert!(Rect::new(0.0, 0.0, f64::NAN, 1.0).is_empty());
    }

    #[test]
    fn test_pixel_rect_conversion() {
        let px = PixelRect::from_rect(&Rect::new(4.0, 8.0, 16.0, 32.0)).unwrap();
        assert_eq!(px, PixelRect::new(4, 8, 16, 32));
        assert!(px.fits_within(20, 40));
        assert!(!px.fits_within(19, 40));
        assert!(PixelRect::from_rect(&Rect::new(-1.0, 0.0, 5.0, 5.0)).is_none());
    }
}
