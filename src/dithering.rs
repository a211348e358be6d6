use std::path::Path;

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, Rgba, RgbaImage};
use serde::{Deserialize, Serialize};

use crate::error::{FrameError, Result};
use crate::palette::{nearest, validate_palette, ColorMode, PaletteColor};
use crate::protocol::{pack_codes, DEVICE_HEIGHT, DEVICE_WIDTH};

/// How the photo sits on the panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Orientation {
    /// 800x480 canvas, native raster.
    #[default]
    Horizontal,
    /// 480x800 canvas, rotated into the native raster when packed.
    Vertical,
}

impl Orientation {
    /// Working canvas `(width, height)` for this orientation.
    pub fn canvas(self) -> (u32, u32) {
        match self {
            Orientation::Horizontal => (DEVICE_WIDTH as u32, DEVICE_HEIGHT as u32),
            Orientation::Vertical => (DEVICE_HEIGHT as u32, DEVICE_WIDTH as u32),
        }
    }
}

/// A photo converted for the panel.
#[derive(Debug, Clone)]
pub struct ProcessedImage {
    /// Dithered result in palette colors, for display only.
    pub preview: RgbaImage,
    /// Palette codes on the working canvas, row-major.
    pub codes: Vec<u8>,
    /// Always `PACKED_LEN` bytes in the device raster.
    pub packed: Vec<u8>,
    pub orientation: Orientation,
    pub color_mode: ColorMode,
}

impl ProcessedImage {
    /// Writes the preview; format follows the file extension.
    pub fn save_preview(&self, path: impl AsRef<Path>) -> Result<()> {
        self.preview.save(path)?;
        Ok(())
    }
}

/// Loads an image file and runs [`encode`] on it.
pub fn encode_from_path(
    path: impl AsRef<Path>,
    mode: ColorMode,
    orientation: Orientation,
) -> Result<ProcessedImage> {
    let img = image::open(path)?;
    encode(&img, mode, orientation)
}

/// Converts a photo into the panel's packed 2bpp buffer.
///
/// Steps:
/// 1. Center-crop to the canvas aspect ratio
/// 2. Resize to the canvas
/// 3. Floyd-Steinberg dither against the mode's palette
/// 4. Pack codes into the device raster
pub fn encode(img: &DynamicImage, mode: ColorMode, orientation: Orientation) -> Result<ProcessedImage> {
    let palette = mode.palette();
    validate_palette(palette)?;

    let (src_w, src_h) = img.dimensions();
    if src_w == 0 || src_h == 0 {
        return Err(FrameError::InvalidImage("image has no pixels".into()));
    }

    let (width, height) = orientation.canvas();
    let (x, y, w, h) = center_crop(src_w, src_h, width, height);
    let resized = img
        .crop_imm(x, y, w, h)
        .resize_exact(width, height, FilterType::Triangle)
        .to_rgb8();

    let mut work: Vec<[f32; 3]> = resized
        .pixels()
        .map(|p| [p[0] as f32, p[1] as f32, p[2] as f32])
        .collect();
    let codes = floyd_steinberg(&mut work, width as usize, height as usize, palette)?;

    let mut preview = RgbaImage::new(width, height);
    for (pixel, &code) in preview.pixels_mut().zip(&codes) {
        let c = palette[code as usize];
        *pixel = Rgba([c.r, c.g, c.b, 255]);
    }

    let packed = pack_codes(&codes, orientation)?;
    Ok(ProcessedImage {
        preview,
        codes,
        packed,
        orientation,
        color_mode: mode,
    })
}

/// Largest centered region of a `src_w`x`src_h` image with the target aspect
/// ratio, as `(x, y, width, height)`.
pub fn center_crop(src_w: u32, src_h: u32, target_w: u32, target_h: u32) -> (u32, u32, u32, u32) {
    let target_ratio = target_w as f64 / target_h as f64;
    let src_ratio = src_w as f64 / src_h as f64;
    if src_ratio > target_ratio {
        let w = ((src_h as f64 * target_ratio).round() as u32).clamp(1, src_w);
        ((src_w - w) / 2, 0, w, src_h)
    } else {
        let h = ((src_w as f64 / target_ratio).round() as u32).clamp(1, src_h);
        (0, (src_h - h) / 2, src_w, h)
    }
}

/// Floyd-Steinberg error diffusion over an RGB float buffer, in-place.
///
/// Returns the palette code chosen for each pixel. Error is spread
/// 7/16 right, 3/16 below-left, 5/16 below, 1/16 below-right.
pub fn floyd_steinberg(
    buf: &mut [[f32; 3]],
    width: usize,
    height: usize,
    palette: &[PaletteColor],
) -> Result<Vec<u8>> {
    if palette.is_empty() {
        return Err(FrameError::InvalidImage("palette is empty".into()));
    }
    let mut codes = vec![0u8; width * height];
    for y in 0..height {
        for x in 0..width {
            let idx = y * width + x;
            let old = buf[idx].map(|c| c.clamp(0.0, 255.0));
            let Some(chosen) = nearest(old, palette) else {
                continue;
            };
            codes[idx] = chosen.code;

            let new = [chosen.r as f32, chosen.g as f32, chosen.b as f32];
            let err = [old[0] - new[0], old[1] - new[1], old[2] - new[2]];
            buf[idx] = new;

            let mut spread = |i: usize, factor: f32| {
                for c in 0..3 {
                    buf[i][c] += err[c] * factor;
                }
            };
            if x + 1 < width {
                spread(idx + 1, 7.0 / 16.0);
            }
            if y + 1 < height {
                let below = idx + width;
                if x > 0 {
                    spread(below - 1, 3.0 / 16.0);
                }
                spread(below, 5.0 / 16.0);
                if x + 1 < width {
                    spread(below + 1, 1.0 / 16.0);
                }
            }
        }
    }
    Ok(codes)
}
