use std::cmp::Ordering;

use image::{imageops::FilterType, RgbaImage};
use tracing::debug;

use crate::{
    color::Rgb,
    error::{ShowcaseError, ShowcaseResult},
};

pub const GRID_SIZE: u32 = 64;
pub const MAX_COLORS: usize = 6;
pub const DISTINCT_THRESHOLD: f32 = 0.2;
pub const DARKEN_AMOUNT: f32 = 0.4;

const MIN_ALPHA: u8 = 25;
const MIN_SATURATION: f32 = 0.18;
const MIN_VALUE: f32 = 0.22;
const HUE_BINS: usize = 24;
const SAT_BINS: usize = 3;
const VAL_BINS: usize = 3;
const BIN_COUNT: usize = HUE_BINS * SAT_BINS * VAL_BINS;

pub const DEFAULT_FALLBACK: Rgb = Rgb::new(75.0 / 255.0, 45.0 / 255.0, 94.0 / 255.0);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Palette {
    pub start: Rgb,
    pub end: Rgb,
}

impl Palette {
    pub fn from_color(color: Rgb) -> Self {
        Self {
            start: color,
            end: color.darkened(DARKEN_AMOUNT),
        }
    }

    pub fn fallback_from(start: Rgb) -> Self {
        Self {
            start,
            end: Rgb::BLACK,
        }
    }
}

impl Default for Palette {
    fn default() -> Self {
        Palette::fallback_from(DEFAULT_FALLBACK)
    }
}

#[derive(Clone, Copy, Default)]
struct Bin {
    weight: f32,
    r: f32,
    g: f32,
    b: f32,
}

impl Bin {
    fn add(&mut self, color: Rgb, weight: f32) {
        self.weight += weight;
        self.r += color.r * weight;
        self.g += color.g * weight;
        self.b += color.b * weight;
    }

    fn average(&self) -> Rgb {
        Rgb::new(self.r / self.weight, self.g / self.weight, self.b / self.weight)
    }
}

#[derive(Debug, Clone)]
pub struct ColorClusterer {
    fallback: Palette,
}

impl Default for ColorClusterer {
    fn default() -> Self {
        Self {
            fallback: Palette::default(),
        }
    }
}

impl ColorClusterer {
    pub fn new(fallback_start: Rgb) -> Self {
        Self {
            fallback: Palette::fallback_from(fallback_start),
        }
    }

    pub fn extract_many<'a, I>(&self, images: I) -> Vec<Palette>
    where
        I: IntoIterator<Item = &'a RgbaImage>,
    {
        let colors = dominant_colors(images);
        if colors.is_empty() {
            debug!("no vivid colors in artwork; using fallback palette");
            return vec![self.fallback];
        }
        colors.into_iter().map(Palette::from_color).collect()
    }
}

pub fn decode_artwork(bytes: &[u8]) -> ShowcaseResult<RgbaImage> {
    let image = image::load_from_memory(bytes)
        .map_err(|e| ShowcaseError::decode(format!("Failed to decode artwork: {e}")))?;
    Ok(image.to_rgba8())
}

pub fn dominant_colors<'a, I>(images: I) -> Vec<Rgb>
where
    I: IntoIterator<Item = &'a RgbaImage>,
{
    let mut bins = vec![Bin::default(); BIN_COUNT];

    for image in images {
        if image.width() == 0 || image.height() == 0 {
            continue;
        }
        let grid;
        let pixels = if image.width() == GRID_SIZE && image.height() == GRID_SIZE {
            image
        } else {
            grid = image::imageops::resize(image, GRID_SIZE, GRID_SIZE, FilterType::Nearest);
            &grid
        };
        accumulate(pixels, &mut bins);
    }

    let mut ranked: Vec<(usize, Bin)> = bins
        .into_iter()
        .enumerate()
        .filter(|(_, bin)| bin.weight > 0.0)
        .collect();
    ranked.sort_by(|(ia, a), (ib, b)| {
        b.weight
            .partial_cmp(&a.weight)
            .unwrap_or(Ordering::Equal)
            .then(ia.cmp(ib))
    });

    let mut chosen: Vec<Rgb> = Vec::with_capacity(MAX_COLORS);
    for (_, bin) in ranked {
        let color = bin.average();
        if chosen
            .iter()
            .all(|&existing| existing.distance(color) > DISTINCT_THRESHOLD)
        {
            chosen.push(color);
            if chosen.len() == MAX_COLORS {
                break;
            }
        }
    }
    chosen
}

fn accumulate(image: &RgbaImage, bins: &mut [Bin]) {
    for pixel in image.pixels() {
        let [r, g, b, a] = pixel.0;
        if a <= MIN_ALPHA {
            continue;
        }
        let color = Rgb::from_rgb8(r, g, b);
        let hsv = color.to_hsv();
        if hsv.s < MIN_SATURATION || hsv.v < MIN_VALUE {
            continue;
        }
        let weight = hsv.s * hsv.s * hsv.v;
        bins[bin_index(hsv.h, hsv.s, hsv.v)].add(color, weight);
    }
}

fn bin_index(h: f32, s: f32, v: f32) -> usize {
    let h_bin = quantize(h, HUE_BINS);
    let s_bin = quantize(s, SAT_BINS);
    let v_bin = quantize(v, VAL_BINS);
    (h_bin * SAT_BINS + s_bin) * VAL_BINS + v_bin
}

fn quantize(value: f32, bins: usize) -> usize {
    ((value.clamp(0.0, 1.0) * bins as f32) as usize).min(bins - 1)
}
