//! Fixed e-paper palettes and nearest-color lookup.

use serde::{Deserialize, Serialize};

use crate::error::{FrameError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorMode {
    /// White, yellow, red, black.
    #[default]
    Color,
    /// White and black only.
    #[serde(alias = "bw", alias = "mono")]
    BlackWhite,
}

impl ColorMode {
    pub fn palette(self) -> &'static [PaletteColor] {
        match self {
            ColorMode::Color => &COLOR_PALETTE,
            ColorMode::BlackWhite => &MONO_PALETTE,
        }
    }
}

pub type Rgb = [u8; 3];

/// A reference color and the 2-bit code the panel uses for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaletteColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub code: u8,
}

impl PaletteColor {
    pub const fn new(r: u8, g: u8, b: u8, code: u8) -> Self {
        Self { r, g, b, code }
    }

    pub fn rgb(&self) -> Rgb {
        [self.r, self.g, self.b]
    }

    /// Squared Euclidean distance to an RGB sample.
    pub fn distance_sq(&self, [r, g, b]: [f32; 3]) -> f32 {
        let dr = r - self.r as f32;
        let dg = g - self.g as f32;
        let db = b - self.b as f32;
        dr * dr + dg * dg + db * db
    }
}

pub const WHITE: PaletteColor = PaletteColor::new(255, 255, 255, 0);

/// 4-color panel palette, in precedence order.
pub const COLOR_PALETTE: [PaletteColor; 4] = [
    WHITE,
    PaletteColor::new(255, 255, 0, 1),
    PaletteColor::new(255, 0, 0, 2),
    PaletteColor::new(0, 0, 0, 3),
];

pub const MONO_PALETTE: [PaletteColor; 2] = [WHITE, PaletteColor::new(0, 0, 0, 1)];

/// Returns the palette entry closest to `pixel`, or `None` for an empty
/// palette. Ties go to the earlier entry.
pub fn nearest(pixel: [f32; 3], palette: &[PaletteColor]) -> Option<PaletteColor> {
    let (first, rest) = palette.split_first()?;
    let mut best = *first;
    let mut best_dist = best.distance_sq(pixel);
    for candidate in rest {
        let dist = candidate.distance_sq(pixel);
        if dist < best_dist {
            best = *candidate;
            best_dist = dist;
        }
    }
    Some(best)
}

/// Checks that codes are unique, contiguous from 0, fit in 2 bits, and that
/// white leads and black closes the list.
pub fn validate_palette(palette: &[PaletteColor]) -> Result<()> {
    if palette.len() < 2 || palette.len() > 4 {
        return Err(FrameError::InvalidImage(format!(
            "palette must have 2 to 4 entries, got {}",
            palette.len()
        )));
    }
    for (i, color) in palette.iter().enumerate() {
        if color.code as usize != i {
            return Err(FrameError::InvalidImage(format!(
                "palette entry {i} has code {}, expected {i}",
                color.code
            )));
        }
    }
    let first = palette[0];
    let last = palette[palette.len() - 1];
    if first.rgb() != [255, 255, 255] || last.rgb() != [0, 0, 0] {
        return Err(FrameError::InvalidImage(
            "palette must start with white and end with black".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn px(rgb: Rgb) -> [f32; 3] {
        [rgb[0] as f32, rgb[1] as f32, rgb[2] as f32]
    }

    #[test]
    fn exact_palette_colors_map_to_themselves() {
        for mode in [ColorMode::Color, ColorMode::BlackWhite] {
            for color in mode.palette() {
                let hit = nearest(px(color.rgb()), mode.palette()).unwrap();
                assert_eq!(hit, *color);
                assert_eq!(hit.distance_sq(px(color.rgb())), 0.0);
            }
        }
    }

    #[test]
    fn ties_go_to_first_entry() {
        // Equidistant from white and black.
        let mid = [127.5, 127.5, 127.5];
        assert_eq!(nearest(mid, &MONO_PALETTE).unwrap().code, 0);
    }

    #[test]
    fn orange_lands_on_red_or_yellow() {
        let hit = nearest([255.0, 100.0, 0.0], &COLOR_PALETTE).unwrap();
        assert_eq!(hit.code, 2);
        let hit = nearest([250.0, 200.0, 20.0], &COLOR_PALETTE).unwrap();
        assert_eq!(hit.code, 1);
    }

    #[test]
    fn empty_palette_has_no_nearest() {
        assert_eq!(nearest([0.0; 3], &[]), None);
    }

    #[test]
    fn builtin_palettes_are_valid() {
        validate_palette(&COLOR_PALETTE).unwrap();
        validate_palette(&MONO_PALETTE).unwrap();
    }

    #[test]
    fn rejects_bad_palettes() {
        assert!(validate_palette(&[WHITE]).is_err());
        let gapped = [WHITE, PaletteColor::new(0, 0, 0, 2)];
        assert!(validate_palette(&gapped).is_err());
        let black_first = [PaletteColor::new(0, 0, 0, 0), PaletteColor::new(255, 255, 255, 1)];
        assert!(validate_palette(&black_first).is_err());
    }

    #[test]
    fn color_mode_parses_from_config_names() {
        let mode: ColorMode = serde_json::from_str("\"bw\"").unwrap();
        assert_eq!(mode, ColorMode::BlackWhite);
        let mode: ColorMode = serde_json::from_str("\"color\"").unwrap();
        assert_eq!(mode, ColorMode::Color);
    }

    proptest! {
        #[test]
        fn nearest_is_never_beaten(r in 0u8..=255, g in 0u8..=255, b in 0u8..=255) {
            let p = px([r, g, b]);
            for palette in [&COLOR_PALETTE[..], &MONO_PALETTE[..]] {
                let hit = nearest(p, palette).unwrap();
                for other in palette {
                    prop_assert!(hit.distance_sq(p) <= other.distance_sq(p));
                }
            }
        }
    }
}
