//! Tone, color and sharpness adjustment for still images.
//!
//! Every step blends the image toward a "degenerate" version of itself:
//! a flat gray for contrast, the per-pixel luma for color, black for
//! brightness. A factor of 1.0 leaves the image untouched, larger factors
//! push away from the degenerate image.

use crate::config::{EnhanceConfig, NightConfig};
use crate::error::Result;
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use tracing::{debug, info};

/// Sharpening filter applied as the last enhancement step
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SharpenFilter {
    /// 3x3 kernel `[-2 -2 -2; -2 32 -2; -2 -2 -2] / 16`, borders copied
    Kernel,
    /// Gaussian unsharp mask
    UnsharpMask {
        /// Gaussian sigma
        radius: f32,
        /// Strength of the added detail, in percent
        percent: u32,
        /// Minimum per-channel difference that gets sharpened
        threshold: u8,
    },
}

/// One stage of the enhancement pipeline
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EnhanceStep {
    Contrast(f32),
    Color(f32),
    Brightness(f32),
    Sharpen(SharpenFilter),
}

/// Deterministic, stateless enhancement pipeline
#[derive(Debug, Clone)]
pub struct ImageEnhancer {
    steps: Vec<EnhanceStep>,
    jpeg_quality: u8,
}

impl ImageEnhancer {
    pub fn new(steps: Vec<EnhanceStep>, jpeg_quality: u8) -> Self {
        Self {
            steps,
            jpeg_quality,
        }
    }

    /// Normal-mode pipeline: contrast, color, brightness, then sharpen
    pub fn normal(config: &EnhanceConfig) -> Self {
        let mut steps = vec![
            EnhanceStep::Contrast(config.contrast),
            EnhanceStep::Color(config.color),
            EnhanceStep::Brightness(config.brightness),
        ];
        if let Some(filter) = config.sharpen_filter() {
            steps.push(EnhanceStep::Sharpen(filter));
        }
        Self::new(steps, config.jpeg_quality)
    }

    /// Night-mode pipeline for stacked output: brightness, contrast, then sharpen
    pub fn night(night: &NightConfig, enhance: &EnhanceConfig) -> Self {
        let mut steps = vec![
            EnhanceStep::Brightness(night.brightness),
            EnhanceStep::Contrast(night.contrast),
        ];
        if let Some(filter) = night.sharpen_filter(enhance) {
            steps.push(EnhanceStep::Sharpen(filter));
        }
        Self::new(steps, enhance.jpeg_quality)
    }

    pub fn steps(&self) -> &[EnhanceStep] {
        &self.steps
    }

    pub fn jpeg_quality(&self) -> u8 {
        self.jpeg_quality
    }

    /// Run every step in order and return the enhanced image
    pub fn apply(&self, image: &RgbImage) -> RgbImage {
        let mut current = image.clone();
        for step in &self.steps {
            debug!("Applying enhancement step {:?}", step);
            current = match *step {
                EnhanceStep::Contrast(factor) => adjust_contrast(&current, factor),
                EnhanceStep::Color(factor) => adjust_color(&current, factor),
                EnhanceStep::Brightness(factor) => adjust_brightness(&current, factor),
                EnhanceStep::Sharpen(SharpenFilter::Kernel) => sharpen_kernel(&current),
                EnhanceStep::Sharpen(SharpenFilter::UnsharpMask {
                    radius,
                    percent,
                    threshold,
                }) => unsharp_mask(&current, radius, percent, threshold),
            };
        }
        current
    }

    /// Enhance an image already on disk, replacing it in place
    pub fn enhance_file(&self, path: &Path) -> Result<()> {
        let image = image::open(path)?.to_rgb8();
        let (width, height) = image.dimensions();
        info!("Enhancing {} ({}x{})", path.display(), width, height);

        let enhanced = self.apply(&image);
        self.save(&enhanced, path)
    }

    /// Write an image with this pipeline's quality setting
    pub fn save(&self, image: &RgbImage, path: &Path) -> Result<()> {
        save_image(image, path, self.jpeg_quality)
    }
}

/// Save an RGB image, using JPEG at `quality` for `.jpg`/`.jpeg` targets
pub fn save_image(image: &RgbImage, path: &Path, quality: u8) -> Result<()> {
    let is_jpeg = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("jpg") || ext.eq_ignore_ascii_case("jpeg"))
        .unwrap_or(false);

    if is_jpeg {
        let mut writer = BufWriter::new(File::create(path)?);
        let mut encoder = JpegEncoder::new_with_quality(&mut writer, quality);
        encoder.encode_image(image)?;
    } else {
        image.save(path)?;
    }

    debug!("Saved image to {}", path.display());
    Ok(())
}

/// 16-bit fixed point BT.601 luma, matching the usual RGB to L conversion
fn luma(px: &Rgb<u8>) -> u8 {
    let [r, g, b] = px.0;
    ((r as u32 * 19595 + g as u32 * 38470 + b as u32 * 7471 + 0x8000) >> 16) as u8
}

fn blend(degenerate: f32, value: u8, factor: f32) -> u8 {
    let out = degenerate + factor * (value as f32 - degenerate);
    if out <= 0.0 {
        0
    } else if out >= 255.0 {
        255
    } else {
        out as u8
    }
}

fn adjust_brightness(image: &RgbImage, factor: f32) -> RgbImage {
    let mut out = image.clone();
    for px in out.pixels_mut() {
        for c in px.0.iter_mut() {
            *c = blend(0.0, *c, factor);
        }
    }
    out
}

fn adjust_contrast(image: &RgbImage, factor: f32) -> RgbImage {
    let count = image.width() as u64 * image.height() as u64;
    if count == 0 {
        return image.clone();
    }

    let total: u64 = image.pixels().map(|px| luma(px) as u64).sum();
    let mean = (total as f64 / count as f64 + 0.5).floor() as f32;

    let mut out = image.clone();
    for px in out.pixels_mut() {
        for c in px.0.iter_mut() {
            *c = blend(mean, *c, factor);
        }
    }
    out
}

fn adjust_color(image: &RgbImage, factor: f32) -> RgbImage {
    let mut out = image.clone();
    for px in out.pixels_mut() {
        let gray = luma(px) as f32;
        for c in px.0.iter_mut() {
            *c = blend(gray, *c, factor);
        }
    }
    out
}

fn sharpen_kernel(image: &RgbImage) -> RgbImage {
    let (width, height) = image.dimensions();
    let mut out = image.clone();
    if width < 3 || height < 3 {
        return out;
    }

    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let mut acc = [0i32; 3];
            for ky in 0..3 {
                for kx in 0..3 {
                    let weight = if kx == 1 && ky == 1 { 32 } else { -2 };
                    let px = image.get_pixel(x + kx - 1, y + ky - 1);
                    for c in 0..3 {
                        acc[c] += weight * px[c] as i32;
                    }
                }
            }
            let target = out.get_pixel_mut(x, y);
            for c in 0..3 {
                let value = (acc[c] as f32 / 16.0).round();
                target[c] = value.clamp(0.0, 255.0) as u8;
            }
        }
    }
    out
}

fn unsharp_mask(image: &RgbImage, radius: f32, percent: u32, threshold: u8) -> RgbImage {
    if radius <= 0.0 {
        return image.clone();
    }

    // Normalized kernel: flat regions blur to themselves
    let blurred = image::imageops::blur(image, radius);
    let amount = percent as f32 / 100.0;

    let mut out = image.clone();
    for (px, soft) in out.pixels_mut().zip(blurred.pixels()) {
        for c in 0..3 {
            let diff = px[c] as i32 - soft[c] as i32;
            if diff.unsigned_abs() >= threshold as u32 {
                let value = px[c] as f32 + diff as f32 * amount;
                px[c] = value.round().clamp(0.0, 255.0) as u8;
            }
        }
    }
    out
}
