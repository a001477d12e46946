use crate::error::{ProcessingError, Result};
use image::{DynamicImage, RgbImage};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::SystemTime;

/// Pixel layout of a raw camera frame, always 8 bits per channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameFormat {
    Rgb24,
    Rgba32,
    Bgr24,
    Bgra32,
}

impl FrameFormat {
    /// Get bytes per pixel for the format
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            FrameFormat::Rgb24 | FrameFormat::Bgr24 => 3,
            FrameFormat::Rgba32 | FrameFormat::Bgra32 => 4,
        }
    }

    /// Check if the first three channels are stored blue-first
    pub fn is_bgr(&self) -> bool {
        matches!(self, FrameFormat::Bgr24 | FrameFormat::Bgra32)
    }

    /// Three-channel format with the same channel order
    pub fn without_alpha(&self) -> Self {
        if self.is_bgr() {
            FrameFormat::Bgr24
        } else {
            FrameFormat::Rgb24
        }
    }
}

/// Frame data structure containing raw pixel data and metadata
///
/// The pixel bytes are shared behind an `Arc` and never written after
/// construction, so clones handed to readers cannot observe the producer.
#[derive(Debug, Clone)]
pub struct FrameData {
    /// Unique frame identifier
    pub id: u64,
    /// Timestamp when frame was captured
    pub timestamp: SystemTime,
    /// Raw interleaved pixel data
    pub data: Arc<Vec<u8>>,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Frame format
    pub format: FrameFormat,
}

impl FrameData {
    /// Create a new frame data instance
    pub fn new(
        id: u64,
        timestamp: SystemTime,
        data: Vec<u8>,
        width: u32,
        height: u32,
        format: FrameFormat,
    ) -> Self {
        Self {
            id,
            timestamp,
            data: Arc::new(data),
            width,
            height,
            format,
        }
    }

    /// Build a frame from a decoded RGB image
    pub fn from_rgb_image(id: u64, image: RgbImage) -> Self {
        let (width, height) = image.dimensions();
        Self::new(
            id,
            SystemTime::now(),
            image.into_raw(),
            width,
            height,
            FrameFormat::Rgb24,
        )
    }

    /// Build a frame from any decoded image, keeping an alpha channel if present
    pub fn from_dynamic_image(id: u64, image: DynamicImage) -> Self {
        if image.color().has_alpha() {
            let rgba = image.to_rgba8();
            let (width, height) = rgba.dimensions();
            Self::new(
                id,
                SystemTime::now(),
                rgba.into_raw(),
                width,
                height,
                FrameFormat::Rgba32,
            )
        } else {
            Self::from_rgb_image(id, image.to_rgb8())
        }
    }

    /// Number of interleaved channels
    pub fn channels(&self) -> usize {
        self.format.bytes_per_pixel()
    }

    /// (width, height) in pixels
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Get the expected buffer size in bytes
    pub fn expected_size(&self) -> usize {
        self.width as usize * self.height as usize * self.format.bytes_per_pixel()
    }

    /// Validate frame data size against expected size
    pub fn validate_size(&self) -> bool {
        self.data.len() == self.expected_size()
    }

    /// Return an error unless the buffer matches the declared geometry
    pub fn ensure_valid(&self) -> Result<()> {
        if self.validate_size() {
            Ok(())
        } else {
            Err(ProcessingError::UnsupportedFrame {
                details: format!(
                    "frame {} has {} bytes, expected {} for {}x{} {:?}",
                    self.id,
                    self.data.len(),
                    self.expected_size(),
                    self.width,
                    self.height,
                    self.format
                ),
            }
            .into())
        }
    }

    /// Get frame age in milliseconds
    pub fn age_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(self.timestamp)
            .unwrap_or_default()
            .as_millis() as u64
    }

    /// Check if frame is older than specified duration
    pub fn is_older_than(&self, duration: std::time::Duration) -> bool {
        SystemTime::now()
            .duration_since(self.timestamp)
            .map(|age| age > duration)
            .unwrap_or(false)
    }

    /// Convert to an RGB image, dropping alpha and reordering BGR input
    pub fn to_rgb_image(&self) -> Result<RgbImage> {
        self.ensure_valid()?;

        let channels = self.channels();
        let bgr = self.format.is_bgr();
        let mut rgb = Vec::with_capacity(self.width as usize * self.height as usize * 3);

        for px in self.data.chunks_exact(channels) {
            if bgr {
                rgb.extend_from_slice(&[px[2], px[1], px[0]]);
            } else {
                rgb.extend_from_slice(&px[..3]);
            }
        }

        RgbImage::from_raw(self.width, self.height, rgb).ok_or_else(|| {
            ProcessingError::UnsupportedFrame {
                details: format!("failed to build RGB image from frame {}", self.id),
            }
            .into()
        })
    }

    /// BT.601 luma plane as `f32`, one value per pixel
    pub fn luma_f32(&self) -> Vec<f32> {
        let (r, b) = if self.format.is_bgr() { (2, 0) } else { (0, 2) };
        self.data
            .chunks_exact(self.channels())
            .map(|px| 0.299 * px[r] as f32 + 0.587 * px[1] as f32 + 0.114 * px[b] as f32)
            .collect()
    }
}
