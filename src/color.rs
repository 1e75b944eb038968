use anyhow::{anyhow, Result};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rgb {
    pub r: f32,
    pub g: f32,
    pub b: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hsv {
    pub h: f32,
    pub s: f32,
    pub v: f32,
}

impl Rgb {
    pub const BLACK: Rgb = Rgb::new(0.0, 0.0, 0.0);

    pub const fn new(r: f32, g: f32, b: f32) -> Self {
        Self { r, g, b }
    }

    pub fn from_rgb8(r: u8, g: u8, b: u8) -> Self {
        Self::new(r as f32 / 255.0, g as f32 / 255.0, b as f32 / 255.0)
    }

    pub fn to_rgb8(self) -> [u8; 3] {
        [channel_to_u8(self.r), channel_to_u8(self.g), channel_to_u8(self.b)]
    }

    pub fn to_hsv(self) -> Hsv {
        let max = self.r.max(self.g).max(self.b);
        let min = self.r.min(self.g).min(self.b);
        let delta = max - min;

        let s = if max <= f32::EPSILON { 0.0 } else { delta / max };
        let h = if delta <= f32::EPSILON {
            0.0
        } else if max == self.r {
            ((self.g - self.b) / delta).rem_euclid(6.0) / 6.0
        } else if max == self.g {
            ((self.b - self.r) / delta + 2.0) / 6.0
        } else {
            ((self.r - self.g) / delta + 4.0) / 6.0
        };

        Hsv { h, s, v: max }
    }

    pub fn mix(self, other: Rgb, amount: f32) -> Rgb {
        let t = amount.clamp(0.0, 1.0);
        Rgb::new(
            self.r + (other.r - self.r) * t,
            self.g + (other.g - self.g) * t,
            self.b + (other.b - self.b) * t,
        )
    }

    pub fn darkened(self, amount: f32) -> Rgb {
        self.mix(Rgb::BLACK, amount)
    }

    pub fn distance(self, other: Rgb) -> f32 {
        let dr = self.r - other.r;
        let dg = self.g - other.g;
        let db = self.b - other.b;
        (dr * dr + dg * dg + db * db).sqrt()
    }

    pub fn luminance(self) -> f32 {
        0.2126 * self.r + 0.7152 * self.g + 0.0722 * self.b
    }

    /// Parses `#rrggbb`, `rgb(r, g, b)` with 0-255 channels.
    pub fn parse(value: &str) -> Result<Rgb> {
        let v = value.trim();
        if let Some(hex) = v.strip_prefix('#') {
            return parse_hex(hex);
        }
        if let Some(rest) = v.strip_prefix("rgb(") {
            return parse_rgb_components(rest.trim_end_matches(')'));
        }
        Err(anyhow!("Unsupported color format: {v}"))
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [r, g, b] = self.to_rgb8();
        write!(f, "#{r:02x}{g:02x}{b:02x}")
    }
}

impl Hsv {
    pub fn to_rgb(self) -> Rgb {
        let h = self.h.rem_euclid(1.0) * 6.0;
        let c = self.v * self.s;
        let x = c * (1.0 - (h % 2.0 - 1.0).abs());
        let m = self.v - c;
        let (r, g, b) = match h as u32 {
            0 => (c, x, 0.0),
            1 => (x, c, 0.0),
            2 => (0.0, c, x),
            3 => (0.0, x, c),
            4 => (x, 0.0, c),
            _ => (c, 0.0, x),
        };
        Rgb::new(r + m, g + m, b + m)
    }
}

fn channel_to_u8(value: f32) -> u8 {
    (value.clamp(0.0, 1.0) * 255.0).round() as u8
}

fn parse_hex(hex: &str) -> Result<Rgb> {
    let value = hex.trim();
    if value.len() != 6 {
        return Err(anyhow!("Invalid hex color: #{value}"));
    }
    let bytes =
        u32::from_str_radix(value, 16).map_err(|_| anyhow!("Invalid hex color: #{value}"))?;
    Ok(Rgb::from_rgb8(
        ((bytes >> 16) & 0xFF) as u8,
        ((bytes >> 8) & 0xFF) as u8,
        (bytes & 0xFF) as u8,
    ))
}

fn parse_rgb_components(input: &str) -> Result<Rgb> {
    let parts: Vec<_> = input.split(',').map(|p| p.trim()).collect();
    if parts.len() != 3 {
        return Err(anyhow!("rgb expects 3 components"));
    }
    Ok(Rgb::from_rgb8(
        parse_component(parts[0])?,
        parse_component(parts[1])?,
        parse_component(parts[2])?,
    ))
}

fn parse_component(src: &str) -> Result<u8> {
    let value: f32 = src
        .parse()
        .map_err(|_| anyhow!("Invalid color channel: {src}"))?;
    if !(0.0..=255.0).contains(&value) {
        return Err(anyhow!("Color channel out of range: {src}"));
    }
    Ok(value.round() as u8)
}
