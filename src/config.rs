use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

use crate::enhance::SharpenFilter;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PocketcamConfig {
    pub buffer: BufferConfig,
    pub alignment: AlignmentConfig,
    pub enhance: EnhanceConfig,
    pub night: NightConfig,
    pub stabilization: StabilizationConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BufferConfig {
    /// Number of recent frames kept for zero-shutter-lag capture
    #[serde(default = "default_buffer_capacity")]
    pub capacity: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AlignmentConfig {
    /// Stride used to downsample frames before block matching
    #[serde(default = "default_alignment_scale")]
    pub scale: u32,

    /// Search radius in downsampled pixels
    #[serde(default = "default_alignment_radius")]
    pub radius: u32,
}

/// Sharpening filter selection
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SharpenKind {
    /// Fixed 3x3 sharpen kernel
    Kernel,
    /// Gaussian unsharp mask
    UnsharpMask,
    /// No sharpening
    None,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EnhanceConfig {
    #[serde(default = "default_enhance_contrast")]
    pub contrast: f32,

    /// Saturation factor (1.0 = unchanged)
    #[serde(default = "default_enhance_color")]
    pub color: f32,

    #[serde(default = "default_enhance_brightness")]
    pub brightness: f32,

    #[serde(default = "default_sharpen")]
    pub sharpen: SharpenKind,

    /// Unsharp mask blur radius (Gaussian sigma)
    #[serde(default = "default_unsharp_radius")]
    pub unsharp_radius: f32,

    /// Unsharp mask strength in percent
    #[serde(default = "default_unsharp_percent")]
    pub unsharp_percent: u32,

    /// Minimum difference before the unsharp mask applies
    #[serde(default = "default_unsharp_threshold")]
    pub unsharp_threshold: u8,

    /// JPEG quality used when writing enhanced images
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

impl EnhanceConfig {
    /// Resolve the configured sharpening filter
    pub fn sharpen_filter(&self) -> Option<SharpenFilter> {
        sharpen_filter(self.sharpen, self)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct NightConfig {
    /// Most recent frames used for stacking
    #[serde(default = "default_night_burst_frames")]
    pub burst_frames: usize,

    #[serde(default = "default_night_brightness")]
    pub brightness: f32,

    #[serde(default = "default_night_contrast")]
    pub contrast: f32,

    #[serde(default = "default_sharpen")]
    pub sharpen: SharpenKind,
}

/// Out-of-canvas pixel handling when warping frames
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BorderMode {
    /// Fill with black
    Constant,
    /// Repeat the nearest edge pixel
    Replicate,
}

/// Where the stabilized video is written
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    /// Replace the recorded file
    Overwrite,
    /// Write next to the recording with `sibling_suffix` appended to the stem
    Sibling,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StabilizationConfig {
    /// EMA weight of the previous smoothed value
    #[serde(default = "default_smoothing_factor")]
    pub smoothing_factor: f64,

    #[serde(default = "default_border_mode")]
    pub border: BorderMode,

    #[serde(default = "default_output_mode")]
    pub output_mode: OutputMode,

    #[serde(default = "default_sibling_suffix")]
    pub sibling_suffix: String,

    /// Scale between optical-flow pyramid levels
    #[serde(default = "default_pyramid_scale")]
    pub pyramid_scale: f32,

    #[serde(default = "default_flow_levels")]
    pub levels: u32,

    /// Side of the square integration window
    #[serde(default = "default_window_size")]
    pub window_size: u32,

    /// Refinement iterations per pyramid level
    #[serde(default = "default_flow_iterations")]
    pub iterations: u32,

    /// Target encoder bitrate
    #[serde(default = "default_bitrate_kbps")]
    pub bitrate_kbps: u32,
}

impl PocketcamConfig {
    /// Load configuration from default sources (file + environment variables)
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_file("pocketcam.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().to_string_lossy();
        debug!("Loading configuration from: {}", path_str);

        let settings = Config::builder()
            .set_default("buffer.capacity", default_buffer_capacity() as i64)?
            .set_default("alignment.scale", default_alignment_scale() as i64)?
            .set_default("alignment.radius", default_alignment_radius() as i64)?
            .set_default("enhance.contrast", default_enhance_contrast() as f64)?
            .set_default("enhance.color", default_enhance_color() as f64)?
            .set_default("enhance.brightness", default_enhance_brightness() as f64)?
            .set_default("enhance.sharpen", "kernel")?
            .set_default("enhance.unsharp_radius", default_unsharp_radius() as f64)?
            .set_default("enhance.unsharp_percent", default_unsharp_percent() as i64)?
            .set_default(
                "enhance.unsharp_threshold",
                default_unsharp_threshold() as i64,
            )?
            .set_default("enhance.jpeg_quality", default_jpeg_quality() as i64)?
            .set_default("night.burst_frames", default_night_burst_frames() as i64)?
            .set_default("night.brightness", default_night_brightness() as f64)?
            .set_default("night.contrast", default_night_contrast() as f64)?
            .set_default("night.sharpen", "kernel")?
            .set_default(
                "stabilization.smoothing_factor",
                default_smoothing_factor(),
            )?
            .set_default("stabilization.border", "constant")?
            .set_default("stabilization.output_mode", "overwrite")?
            .set_default("stabilization.sibling_suffix", default_sibling_suffix())?
            .set_default(
                "stabilization.pyramid_scale",
                default_pyramid_scale() as f64,
            )?
            .set_default("stabilization.levels", default_flow_levels() as i64)?
            .set_default("stabilization.window_size", default_window_size() as i64)?
            .set_default("stabilization.iterations", default_flow_iterations() as i64)?
            .set_default("stabilization.bitrate_kbps", default_bitrate_kbps() as i64)?
            // Add configuration file (optional)
            .add_source(File::with_name(&path_str).required(false))
            // Environment overrides, e.g. POCKETCAM_NIGHT__BURST_FRAMES=4
            .add_source(
                Environment::with_prefix("POCKETCAM")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        let config: PocketcamConfig = settings.try_deserialize()?;

        info!("Configuration loaded successfully");
        debug!("Final configuration: {:#?}", config);

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer.capacity == 0 {
            return Err(ConfigError::Message(
                "Buffer capacity must be greater than 0".to_string(),
            ));
        }

        if self.alignment.scale == 0 {
            return Err(ConfigError::Message(
                "Alignment scale must be greater than 0".to_string(),
            ));
        }

        let factors = [
            ("enhance.contrast", self.enhance.contrast),
            ("enhance.color", self.enhance.color),
            ("enhance.brightness", self.enhance.brightness),
            ("night.brightness", self.night.brightness),
            ("night.contrast", self.night.contrast),
        ];
        for (name, value) in factors {
            if !(value > 0.0) {
                return Err(ConfigError::Message(format!(
                    "{} must be greater than 0",
                    name
                )));
            }
        }

        if !(1..=100).contains(&self.enhance.jpeg_quality) {
            return Err(ConfigError::Message(
                "JPEG quality must be between 1 and 100".to_string(),
            ));
        }

        if self.night.burst_frames == 0 {
            return Err(ConfigError::Message(
                "Night burst_frames must be greater than 0".to_string(),
            ));
        }

        let alpha = self.stabilization.smoothing_factor;
        if !(0.0..1.0).contains(&alpha) {
            return Err(ConfigError::Message(
                "Smoothing factor must be in [0, 1)".to_string(),
            ));
        }

        if self.stabilization.levels == 0 || self.stabilization.window_size == 0 {
            return Err(ConfigError::Message(
                "Optical flow levels and window_size must be greater than 0".to_string(),
            ));
        }

        let pyr = self.stabilization.pyramid_scale;
        if !(pyr > 0.0 && pyr < 1.0) {
            return Err(ConfigError::Message(
                "Pyramid scale must be in (0, 1)".to_string(),
            ));
        }

        if self.stabilization.output_mode == OutputMode::Sibling
            && self.stabilization.sibling_suffix.is_empty()
        {
            return Err(ConfigError::Message(
                "Sibling output mode requires a non-empty sibling_suffix".to_string(),
            ));
        }

        Ok(())
    }
}

impl NightConfig {
    /// Resolve the night-mode sharpening filter (unsharp parameters shared with `enhance`)
    pub fn sharpen_filter(&self, enhance: &EnhanceConfig) -> Option<SharpenFilter> {
        sharpen_filter(self.sharpen, enhance)
    }
}

fn sharpen_filter(kind: SharpenKind, enhance: &EnhanceConfig) -> Option<SharpenFilter> {
    match kind {
        SharpenKind::Kernel => Some(SharpenFilter::Kernel),
        SharpenKind::UnsharpMask => Some(SharpenFilter::UnsharpMask {
            radius: enhance.unsharp_radius,
            percent: enhance.unsharp_percent,
            threshold: enhance.unsharp_threshold,
        }),
        SharpenKind::None => None,
    }
}

impl Default for PocketcamConfig {
    fn default() -> Self {
        Self {
            buffer: BufferConfig {
                capacity: default_buffer_capacity(),
            },
            alignment: AlignmentConfig {
                scale: default_alignment_scale(),
                radius: default_alignment_radius(),
            },
            enhance: EnhanceConfig {
                contrast: default_enhance_contrast(),
                color: default_enhance_color(),
                brightness: default_enhance_brightness(),
                sharpen: default_sharpen(),
                unsharp_radius: default_unsharp_radius(),
                unsharp_percent: default_unsharp_percent(),
                unsharp_threshold: default_unsharp_threshold(),
                jpeg_quality: default_jpeg_quality(),
            },
            night: NightConfig {
                burst_frames: default_night_burst_frames(),
                brightness: default_night_brightness(),
                contrast: default_night_contrast(),
                sharpen: default_sharpen(),
            },
            stabilization: StabilizationConfig {
                smoothing_factor: default_smoothing_factor(),
                border: default_border_mode(),
                output_mode: default_output_mode(),
                sibling_suffix: default_sibling_suffix(),
                pyramid_scale: default_pyramid_scale(),
                levels: default_flow_levels(),
                window_size: default_window_size(),
                iterations: default_flow_iterations(),
                bitrate_kbps: default_bitrate_kbps(),
            },
        }
    }
}

// Default value functions
fn default_buffer_capacity() -> usize {
    10
}

fn default_alignment_scale() -> u32 {
    4
}
fn default_alignment_radius() -> u32 {
    5
}

fn default_enhance_contrast() -> f32 {
    1.15
}
fn default_enhance_color() -> f32 {
    1.1
}
fn default_enhance_brightness() -> f32 {
    1.05
}
fn default_sharpen() -> SharpenKind {
    SharpenKind::Kernel
}
fn default_unsharp_radius() -> f32 {
    2.0
}
fn default_unsharp_percent() -> u32 {
    150
}
fn default_unsharp_threshold() -> u8 {
    3
}
fn default_jpeg_quality() -> u8 {
    95
}

fn default_night_burst_frames() -> usize {
    6
}
fn default_night_brightness() -> f32 {
    1.2
}
fn default_night_contrast() -> f32 {
    1.1
}

fn default_smoothing_factor() -> f64 {
    0.9
}
fn default_border_mode() -> BorderMode {
    BorderMode::Constant
}
fn default_output_mode() -> OutputMode {
    OutputMode::Overwrite
}
fn default_sibling_suffix() -> String {
    "_stabilized".to_string()
}
fn default_pyramid_scale() -> f32 {
    0.5
}
fn default_flow_levels() -> u32 {
    3
}
fn default_window_size() -> u32 {
    15
}
fn default_flow_iterations() -> u32 {
    3
}
fn default_bitrate_kbps() -> u32 {
    20_000
}

/// Annotated default configuration, as printed by `pocketcam --print-config`
pub const DEFAULT_CONFIG_TOML: &str = r#"[buffer]
# Number of recent preview frames kept for zero-shutter-lag and night bursts
capacity = 10

[alignment]
# Downsampling stride for block matching
scale = 4
# Search radius in downsampled pixels
radius = 5

[enhance]
contrast = 1.15
color = 1.1
brightness = 1.05
# "kernel", "unsharp_mask" or "none"
sharpen = "kernel"
unsharp_radius = 2.0
unsharp_percent = 150
unsharp_threshold = 3
jpeg_quality = 95

[night]
# Newest frames stacked per night capture
burst_frames = 6
brightness = 1.2
contrast = 1.1
sharpen = "kernel"

[stabilization]
# EMA weight of the previous smoothed motion, in [0, 1)
smoothing_factor = 0.9
# "constant" (black) or "replicate"
border = "constant"
# "overwrite" or "sibling"
output_mode = "overwrite"
sibling_suffix = "_stabilized"
pyramid_scale = 0.5
levels = 3
window_size = 15
iterations = 3
bitrate_kbps = 20000
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = PocketcamConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.buffer.capacity, 10);
        assert_eq!(config.alignment.scale, 4);
        assert_eq!(config.alignment.radius, 5);
        assert_eq!(config.night.burst_frames, 6);
        assert_eq!(config.enhance.jpeg_quality, 95);
        assert_eq!(config.stabilization.smoothing_factor, 0.9);
        assert_eq!(config.enhance.sharpen_filter(), Some(SharpenFilter::Kernel));
    }

    #[test]
    fn test_load_from_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[night]\nburst_frames = 4\n\n[stabilization]\nborder = \"replicate\"\noutput_mode = \"sibling\"\n\n[enhance]\nsharpen = \"unsharp_mask\"\ncontrast = 1.1"
        )
        .unwrap();

        let config = PocketcamConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.night.burst_frames, 4);
        assert_eq!(config.stabilization.border, BorderMode::Replicate);
        assert_eq!(config.stabilization.output_mode, OutputMode::Sibling);
        assert!((config.enhance.contrast - 1.1).abs() < 1e-6);
        // Untouched values keep their defaults
        assert_eq!(config.buffer.capacity, 10);
        assert!((config.enhance.color - 1.1).abs() < 1e-6);
        assert_eq!(
            config.enhance.sharpen_filter(),
            Some(SharpenFilter::UnsharpMask {
                radius: 2.0,
                percent: 150,
                threshold: 3
            })
        );
    }

    #[test]
    fn test_default_template_matches_defaults() {
        let parsed: PocketcamConfig = toml::from_str(DEFAULT_CONFIG_TOML).unwrap();
        let defaults = PocketcamConfig::default();
        assert!(parsed.validate().is_ok());
        assert_eq!(parsed.buffer.capacity, defaults.buffer.capacity);
        assert_eq!(parsed.alignment.radius, defaults.alignment.radius);
        assert_eq!(parsed.enhance.sharpen, defaults.enhance.sharpen);
        assert_eq!(parsed.night.burst_frames, defaults.night.burst_frames);
        assert_eq!(
            parsed.stabilization.smoothing_factor,
            defaults.stabilization.smoothing_factor
        );
        assert_eq!(
            parsed.stabilization.bitrate_kbps,
            defaults.stabilization.bitrate_kbps
        );
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = PocketcamConfig::load_from_file(dir.path().join("absent.toml")).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.stabilization.output_mode, OutputMode::Overwrite);
    }

    #[test]
    fn test_config_validation() {
        let mut config = PocketcamConfig::default();

        config.buffer.capacity = 0;
        assert!(config.validate().is_err());
        config.buffer.capacity = 10;

        config.stabilization.smoothing_factor = 1.0;
        assert!(config.validate().is_err());
        config.stabilization.smoothing_factor = 0.9;

        config.enhance.jpeg_quality = 0;
        assert!(config.validate().is_err());
        config.enhance.jpeg_quality = 95;

        config.night.contrast = 0.0;
        assert!(config.validate().is_err());
        config.night.contrast = 1.1;

        assert!(config.validate().is_ok());
    }
}
