//! Continuous color scales for the choropleth fill.
//!
//! Stops follow plotly.py's named sequential scales: ten samples of the matplotlib
//! ramps, and the nine-class ColorBrewer lists (light to dark) for greys, blues and reds.
//! Values between stops are linearly interpolated.

use anyhow::{anyhow, Result};
use image::Rgba;
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;

type Rgb = (u8, u8, u8);

const VIRIDIS: [Rgb; 10] = [
    (0x44, 0x01, 0x54),
    (0x48, 0x28, 0x78),
    (0x3e, 0x49, 0x89),
    (0x31, 0x68, 0x8e),
    (0x26, 0x82, 0x8e),
    (0x1f, 0x9e, 0x89),
    (0x35, 0xb7, 0x79),
    (0x6e, 0xce, 0x58),
    (0xb5, 0xde, 0x2b),
    (0xfd, 0xe7, 0x25),
];

const PLASMA: [Rgb; 10] = [
    (0x0d, 0x08, 0x87),
    (0x46, 0x03, 0x9f),
    (0x72, 0x01, 0xa8),
    (0x9c, 0x17, 0x9e),
    (0xbd, 0x37, 0x86),
    (0xd8, 0x57, 0x6b),
    (0xed, 0x79, 0x53),
    (0xfb, 0x9f, 0x3a),
    (0xfd, 0xca, 0x26),
    (0xf0, 0xf9, 0x21),
];

const INFERNO: [Rgb; 10] = [
    (0x00, 0x00, 0x04),
    (0x1b, 0x0c, 0x41),
    (0x4a, 0x0c, 0x6b),
    (0x78, 0x1c, 0x6d),
    (0xa5, 0x2c, 0x60),
    (0xcf, 0x44, 0x46),
    (0xed, 0x69, 0x25),
    (0xfb, 0x9b, 0x06),
    (0xf7, 0xd1, 0x3d),
    (0xfc, 0xff, 0xa4),
];

const MAGMA: [Rgb; 10] = [
    (0x00, 0x00, 0x04),
    (0x18, 0x0f, 0x3d),
    (0x44, 0x0f, 0x76),
    (0x72, 0x1f, 0x81),
    (0x9e, 0x2f, 0x7f),
    (0xcd, 0x40, 0x71),
    (0xf1, 0x60, 0x5d),
    (0xfd, 0x96, 0x68),
    (0xfe, 0xca, 0x8d),
    (0xfc, 0xfd, 0xbf),
];

const GREYS: [Rgb; 9] = [
    (255, 255, 255),
    (240, 240, 240),
    (217, 217, 217),
    (189, 189, 189),
    (150, 150, 150),
    (115, 115, 115),
    (82, 82, 82),
    (37, 37, 37),
    (0, 0, 0),
];

const BLUES: [Rgb; 9] = [
    (247, 251, 255),
    (222, 235, 247),
    (198, 219, 239),
    (158, 202, 225),
    (107, 174, 214),
    (66, 146, 198),
    (33, 113, 181),
    (8, 81, 156),
    (8, 48, 107),
];

const REDS: [Rgb; 9] = [
    (255, 245, 240),
    (254, 224, 210),
    (252, 187, 161),
    (252, 146, 114),
    (251, 106, 74),
    (239, 59, 44),
    (203, 24, 29),
    (165, 15, 21),
    (103, 0, 13),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Palette {
    Viridis,
    Plasma,
    Inferno,
    Magma,
    Greys,
    Blues,
    Reds,
}

impl Palette {
    fn stops(&self) -> &'static [Rgb] {
        match self {
            Palette::Viridis => &VIRIDIS,
            Palette::Plasma => &PLASMA,
            Palette::Inferno => &INFERNO,
            Palette::Magma => &MAGMA,
            Palette::Greys => &GREYS,
            Palette::Blues => &BLUES,
            Palette::Reds => &REDS,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Palette::Viridis => "viridis",
            Palette::Plasma => "plasma",
            Palette::Inferno => "inferno",
            Palette::Magma => "magma",
            Palette::Greys => "greys",
            Palette::Blues => "blues",
            Palette::Reds => "reds",
        }
    }
}

/// A named palette, optionally reversed (`viridis_r`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct ColorScale {
    pub palette: Palette,
    pub reversed: bool,
}

impl ColorScale {
    pub fn new(palette: Palette) -> Self {
        Self {
            palette,
            reversed: false,
        }
    }

    /// Flips the scale when `reverse` is set, on top of any `_r` suffix.
    pub fn with_reverse(self, reverse: bool) -> Self {
        Self {
            reversed: self.reversed ^ reverse,
            ..self
        }
    }

    /// Color at `t` in [0, 1]; out-of-range input is clamped.
    pub fn sample(&self, t: f64) -> Rgba<u8> {
        let stops = self.palette.stops();
        let t = t.clamp(0.0, 1.0);
        let t = if self.reversed { 1.0 - t } else { t };

        let segs = (stops.len() - 1) as f64;
        let x = t * segs;
        let i = x.floor() as usize;
        if i >= stops.len() - 1 {
            let (r, g, b) = stops[stops.len() - 1];
            return Rgba([r, g, b, 255]);
        }
        let f = x - i as f64;
        let (r0, g0, b0) = stops[i];
        let (r1, g1, b1) = stops[i + 1];
        let lerp = |a: u8, b: u8| (a as f64 + f * (b as f64 - a as f64)).round() as u8;
        Rgba([lerp(r0, r1), lerp(g0, g1), lerp(b0, b1), 255])
    }

    /// Evenly spaced stops as CSS hex colors, low end first.
    pub fn css_stops(&self) -> Vec<String> {
        let n = self.palette.stops().len().max(2);
        (0..n)
            .map(|i| to_hex(self.sample(i as f64 / (n - 1) as f64)))
            .collect()
    }
}

impl FromStr for ColorScale {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.trim().to_lowercase();
        let (base, reversed) = match lower.strip_suffix("_r") {
            Some(base) => (base, true),
            None => (lower.as_str(), false),
        };
        let palette = match base {
            "viridis" => Palette::Viridis,
            "plasma" => Palette::Plasma,
            "inferno" => Palette::Inferno,
            "magma" => Palette::Magma,
            "greys" | "gray" | "grey" => Palette::Greys,
            "blues" => Palette::Blues,
            "reds" => Palette::Reds,
            _ => return Err(anyhow!("Unknown color scale: {}", s)),
        };
        Ok(Self { palette, reversed })
    }
}

impl TryFrom<String> for ColorScale {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl fmt::Display for ColorScale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.palette.name())?;
        if self.reversed {
            write!(f, "_r")?;
        }
        Ok(())
    }
}

/// Value range the scale is stretched over.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorRange {
    pub min: f64,
    pub max: f64,
}

impl ColorRange {
    /// Min/max over the finite values, `None` if there are none.
    pub fn from_values<I: IntoIterator<Item = f64>>(values: I) -> Option<Self> {
        values
            .into_iter()
            .filter(|v| v.is_finite())
            .fold(None, |acc, v| match acc {
                None => Some(ColorRange { min: v, max: v }),
                Some(r) => Some(ColorRange {
                    min: r.min.min(v),
                    max: r.max.max(v),
                }),
            })
    }

    pub fn normalize(&self, value: f64) -> f64 {
        if self.max > self.min {
            ((value - self.min) / (self.max - self.min)).clamp(0.0, 1.0)
        } else {
            0.0
        }
    }
}

pub fn parse_hex(hex: &str) -> Result<Rgba<u8>> {
    let digits = hex.trim().trim_start_matches('#');
    if digits.len() != 6 || !digits.is_ascii() {
        return Err(anyhow!("Expected a #rrggbb color, got {:?}", hex));
    }
    let channel = |range: std::ops::Range<usize>| {
        u8::from_str_radix(&digits[range], 16).map_err(|_| anyhow!("Invalid hex color: {:?}", hex))
    };
    Ok(Rgba([channel(0..2)?, channel(2..4)?, channel(4..6)?, 255]))
}

pub fn to_hex(color: Rgba<u8>) -> String {
    format!("#{:02x}{:02x}{:02x}", color[0], color[1], color[2])
}
