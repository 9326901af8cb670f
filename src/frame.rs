//! Detector frames, pixel storage and the visible screen region.
//!
//! LEED cameras deliver either 8-bit or 16-bit grayscale frames. [`Image`] keeps
//! the native sample width and exposes every pixel as `u16`, so the refinement
//! and integration stages never branch on bit depth. Conversions between the two
//! widths are explicit ([`Image::to_gray16`], [`Image::to_gray8`]).
//!
//! Pixel coordinates: origin at the top-left corner, +X right (column), +Y down
//! (row).

use serde::{Deserialize, Serialize};

use crate::error::{MkivError, Result};
use crate::Vector2;

/// Widen an 8-bit sample to 16 bits. The value is preserved, not rescaled.
#[inline]
pub fn widen_sample(v: u8) -> u16 {
    u16::from(v)
}

/// Narrow a 16-bit sample to 8 bits, saturating at 255.
#[inline]
pub fn narrow_sample(v: u16) -> u8 {
    v.min(u16::from(u8::MAX)) as u8
}

/// Row-major grayscale samples in their native width.
#[derive(Debug, Clone, PartialEq)]
pub enum PixelData {
    Gray8(Vec<u8>),
    Gray16(Vec<u16>),
}

impl PixelData {
    fn len(&self) -> usize {
        match self {
            PixelData::Gray8(p) => p.len(),
            PixelData::Gray16(p) => p.len(),
        }
    }
}

/// A grayscale detector frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    width: u32,
    height: u32,
    pixels: PixelData,
}

impl Image {
    /// Wrap row-major samples; fails with [`MkivError::ImageSizeMismatch`] when
    /// the buffer does not hold exactly `width * height` samples.
    pub fn new(width: u32, height: u32, pixels: PixelData) -> Result<Self> {
        let len = pixels.len();
        if len != width as usize * height as usize {
            return Err(MkivError::ImageSizeMismatch { len, width, height });
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    /// 16-bit frame from row-major samples.
    pub fn from_u16(width: u32, height: u32, pixels: Vec<u16>) -> Result<Self> {
        Self::new(width, height, PixelData::Gray16(pixels))
    }

    /// 8-bit frame from row-major samples.
    pub fn from_u8(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self> {
        Self::new(width, height, PixelData::Gray8(pixels))
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn bits_per_sample(&self) -> u8 {
        match self.pixels {
            PixelData::Gray8(_) => 8,
            PixelData::Gray16(_) => 16,
        }
    }

    pub fn pixels(&self) -> &PixelData {
        &self.pixels
    }

    /// Sample at column `x`, row `y`, widened to `u16`.
    ///
    /// Panics when the coordinate is outside the frame; use [`Image::get_checked`]
    /// for signed or possibly out-of-range coordinates.
    #[inline]
    pub fn get(&self, x: usize, y: usize) -> u16 {
        let i = y * self.width as usize + x;
        match &self.pixels {
            PixelData::Gray8(p) => widen_sample(p[i]),
            PixelData::Gray16(p) => p[i],
        }
    }

    /// Sample at a signed coordinate, `None` outside the frame.
    #[inline]
    pub fn get_checked(&self, x: i64, y: i64) -> Option<u16> {
        if self.contains_pixel(x, y) {
            Some(self.get(x as usize, y as usize))
        } else {
            None
        }
    }

    #[inline]
    pub fn contains_pixel(&self, x: i64, y: i64) -> bool {
        x >= 0 && y >= 0 && x < self.width as i64 && y < self.height as i64
    }

    /// Copy of this frame with 16-bit samples. 8-bit values keep their value.
    pub fn to_gray16(&self) -> Image {
        let pixels = match &self.pixels {
            PixelData::Gray8(p) => p.iter().map(|&v| widen_sample(v)).collect(),
            PixelData::Gray16(p) => p.clone(),
        };
        Image {
            width: self.width,
            height: self.height,
            pixels: PixelData::Gray16(pixels),
        }
    }

    /// Copy of this frame with 8-bit samples, saturating values above 255.
    pub fn to_gray8(&self) -> Image {
        let pixels = match &self.pixels {
            PixelData::Gray8(p) => p.clone(),
            PixelData::Gray16(p) => p.iter().map(|&v| narrow_sample(v)).collect(),
        };
        Image {
            width: self.width,
            height: self.height,
            pixels: PixelData::Gray8(pixels),
        }
    }
}

// ── Screen region ───────────────────────────────────────────────────────────

/// Geometry of the fluorescent screen as seen by the camera.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScreenConfig {
    /// Screen centre in pixels.
    /// Default: (250, 250)
    pub center: Vector2,
    /// Outer visible radius in pixels.
    /// Default: 230
    pub outer_radius: f64,
    /// Inner radius hidden by the electron gun shadow, in pixels.
    /// Default: 0
    pub inner_radius: f64,
}

impl Default for ScreenConfig {
    fn default() -> Self {
        Self {
            center: Vector2::new(250.0, 250.0),
            outer_radius: 230.0,
            inner_radius: 0.0,
        }
    }
}

/// The part of the detector on which spots may be measured.
///
/// With a mask, a pixel is usable when the mask sample is non-zero. Without one,
/// visibility falls back to the annulus described by [`ScreenConfig`].
#[derive(Debug, Clone)]
pub struct ScreenRegion {
    pub mask: Option<Image>,
    pub center: Vector2,
    pub outer_radius: f64,
    pub inner_radius: f64,
}

impl ScreenRegion {
    pub fn new(config: &ScreenConfig, mask: Option<Image>) -> Self {
        Self {
            mask,
            center: config.center,
            outer_radius: config.outer_radius,
            inner_radius: config.inner_radius,
        }
    }

    /// Whether a predicted spot at `pos` is on the visible screen.
    ///
    /// The annulus fallback is widened by `margin` on both edges so spots whose
    /// centre sits just outside can still be recovered by the peak search.
    pub fn is_visible(&self, pos: &Vector2, margin: f64) -> bool {
        match &self.mask {
            Some(mask) => mask
                .get_checked(pos.x.floor() as i64, pos.y.floor() as i64)
                .is_some_and(|v| v != 0),
            None => {
                let r = (pos - self.center).norm();
                r >= self.inner_radius - margin && r <= self.outer_radius + margin
            }
        }
    }

    /// Whether the pixel at column `x`, row `y` may contribute to integration.
    /// Always true without a mask.
    #[inline]
    pub fn pixel_allowed(&self, x: usize, y: usize) -> bool {
        match &self.mask {
            Some(mask) => mask.get(x, y) != 0,
            None => true,
        }
    }

    /// Fails with [`MkivError::MaskSizeMismatch`] when a mask is present and
    /// differs in size from `image`.
    pub fn check_frame(&self, image: &Image) -> Result<()> {
        if let Some(mask) = &self.mask {
            if mask.dimensions() != image.dimensions() {
                return Err(MkivError::MaskSizeMismatch {
                    mask_width: mask.width(),
                    mask_height: mask.height(),
                    width: image.width(),
                    height: image.height(),
                });
            }
        }
        Ok(())
    }
}

/// One detector frame of an energy ramp.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Beam energy in eV.
    pub energy: f64,
    pub image: Image,
    /// Raw beam current reading for this frame (arbitrary units).
    pub beam_current: f64,
}

impl Frame {
    pub fn new(energy: f64, image: Image, beam_current: f64) -> Self {
        Self {
            energy,
            image,
            beam_current,
        }
    }
}

// ── `image` crate adapter ───────────────────────────────────────────────────

#[cfg(feature = "image")]
impl Image {
    /// Convert an [`image::DynamicImage`] to a core frame.
    ///
    /// 16-bit luma stays 16-bit, 8-bit luma stays 8-bit. Colour frames are
    /// reduced to luma with Rec. 709 weights at 16 bits.
    pub fn from_dynamic_image(img: &image::DynamicImage) -> Image {
        use image::DynamicImage;
        let (width, height) = (img.width(), img.height());
        let rec709 = |r: u16, g: u16, b: u16| {
            (0.2126 * f64::from(r) + 0.7152 * f64::from(g) + 0.0722 * f64::from(b)).round() as u16
        };
        let pixels = match img {
            DynamicImage::ImageLuma8(g) => PixelData::Gray8(g.as_raw().clone()),
            DynamicImage::ImageLumaA8(g) => PixelData::Gray8(g.pixels().map(|p| p.0[0]).collect()),
            DynamicImage::ImageLuma16(g) => PixelData::Gray16(g.as_raw().clone()),
            DynamicImage::ImageLumaA16(g) => {
                PixelData::Gray16(g.pixels().map(|p| p.0[0]).collect())
            }
            DynamicImage::ImageRgb16(rgb) => PixelData::Gray16(
                rgb.pixels()
                    .map(|p| {
                        let [r, g, b] = p.0;
                        rec709(r, g, b)
                    })
                    .collect(),
            ),
            DynamicImage::ImageRgba16(rgba) => PixelData::Gray16(
                rgba.pixels()
                    .map(|p| {
                        let [r, g, b, _] = p.0;
                        rec709(r, g, b)
                    })
                    .collect(),
            ),
            // 8-bit colour and float formats: convert via luma16
            _ => PixelData::Gray16(img.to_luma16().into_raw()),
        };
        Image {
            width,
            height,
            pixels,
        }
    }

    /// Load a frame or mask from disk (PNG, TIFF).
    pub fn open(path: impl AsRef<std::path::Path>) -> anyhow::Result<Image> {
        use anyhow::Context;
        let img = image::open(path.as_ref())
            .with_context(|| format!("Failed to open image: {}", path.as_ref().display()))?;
        Ok(Image::from_dynamic_image(&img))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_widen_preserves_value() {
        for v in [0u8, 1, 127, 128, 254, 255] {
            assert_eq!(widen_sample(v), v as u16);
        }
    }

    #[test]
    fn test_narrow_saturates() {
        assert_eq!(narrow_sample(0), 0);
        assert_eq!(narrow_sample(200), 200);
        assert_eq!(narrow_sample(255), 255);
        assert_eq!(narrow_sample(256), 255);
        assert_eq!(narrow_sample(u16::MAX), 255);
    }

    #[test]
    fn test_gray8_access_is_widened() {
        let img = Image::from_u8(3, 2, vec![0, 10, 255, 3, 4, 5]).unwrap();
        assert_eq!(img.bits_per_sample(), 8);
        assert_eq!(img.get(2, 0), 255);
        assert_eq!(img.get(0, 1), 3);
        let wide = img.to_gray16();
        assert_eq!(wide.bits_per_sample(), 16);
        for y in 0..2 {
            for x in 0..3 {
                assert_eq!(wide.get(x, y), img.get(x, y));
            }
        }
    }

    #[test]
    fn test_to_gray8_clamps() {
        let img = Image::from_u16(2, 1, vec![100, 4000]).unwrap();
        let narrow = img.to_gray8();
        assert_eq!(narrow.get(0, 0), 100);
        assert_eq!(narrow.get(1, 0), 255);
    }

    #[test]
    fn test_size_mismatch_rejected() {
        let err = Image::from_u16(4, 4, vec![0; 15]).unwrap_err();
        assert_eq!(
            err,
            MkivError::ImageSizeMismatch {
                len: 15,
                width: 4,
                height: 4
            }
        );
    }

    #[test]
    fn test_get_checked_bounds() {
        let img = Image::from_u16(2, 2, vec![1, 2, 3, 4]).unwrap();
        assert_eq!(img.get_checked(1, 1), Some(4));
        assert_eq!(img.get_checked(-1, 0), None);
        assert_eq!(img.get_checked(0, 2), None);
    }

    #[test]
    fn test_annulus_visibility() {
        let screen = ScreenRegion::new(
            &ScreenConfig {
                center: Vector2::new(50.0, 50.0),
                outer_radius: 40.0,
                inner_radius: 5.0,
            },
            None,
        );
        assert!(screen.is_visible(&Vector2::new(70.0, 50.0), 0.0));
        assert!(!screen.is_visible(&Vector2::new(52.0, 50.0), 0.0));
        assert!(screen.is_visible(&Vector2::new(52.0, 50.0), 3.0));
        assert!(!screen.is_visible(&Vector2::new(92.0, 50.0), 1.0));
        assert!(screen.is_visible(&Vector2::new(92.0, 50.0), 3.0));
    }

    #[test]
    fn test_mask_visibility_and_size_check() {
        let mut m = vec![0u8; 16];
        m[5] = 1; // (1, 1)
        let mask = Image::from_u8(4, 4, m).unwrap();
        let screen = ScreenRegion::new(&ScreenConfig::default(), Some(mask));
        assert!(screen.is_visible(&Vector2::new(1.4, 1.7), 0.0));
        assert!(!screen.is_visible(&Vector2::new(2.0, 1.0), 0.0));
        assert!(!screen.is_visible(&Vector2::new(-3.0, 1.0), 0.0));
        assert!(screen.pixel_allowed(1, 1));
        assert!(!screen.pixel_allowed(0, 0));

        let frame = Image::from_u16(5, 4, vec![0; 20]).unwrap();
        assert!(matches!(
            screen.check_frame(&frame),
            Err(MkivError::MaskSizeMismatch { .. })
        ));
    }
}
