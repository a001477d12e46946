use crate::config::{OutputMode, StabilizationConfig};
use crate::error::Result;
use crate::stabilize::{read_all, VideoBackend, VideoStabilizer};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Where a stabilized video ends up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VideoOutputMode {
    /// Replace the input file
    Overwrite,
    /// Write next to the input with `suffix` appended to the file stem
    Sibling { suffix: String },
}

impl VideoOutputMode {
    pub fn from_config(config: &StabilizationConfig) -> Self {
        match config.output_mode {
            OutputMode::Overwrite => VideoOutputMode::Overwrite,
            OutputMode::Sibling => VideoOutputMode::Sibling {
                suffix: config.sibling_suffix.clone(),
            },
        }
    }

    /// Output path for a given input, e.g. `VID_1.mp4` -> `VID_1_stabilized.mp4`
    pub fn output_path(&self, input: &Path) -> PathBuf {
        match self {
            VideoOutputMode::Overwrite => input.to_path_buf(),
            VideoOutputMode::Sibling { suffix } => {
                let stem = input
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let name = match input.extension() {
                    Some(ext) => format!("{}{}.{}", stem, suffix, ext.to_string_lossy()),
                    None => format!("{}{}", stem, suffix),
                };
                input.with_file_name(name)
            }
        }
    }
}

/// Stabilize the recording at `input`, returning the output path
pub(crate) fn run(
    backend: &dyn VideoBackend,
    stabilizer: &VideoStabilizer,
    output_mode: &VideoOutputMode,
    input: &Path,
    cancel: &CancellationToken,
) -> Result<PathBuf> {
    let started = Instant::now();
    let output = output_mode.output_path(input);

    // The reader is closed before the writer opens, so overwriting is safe
    let (info, frames) = {
        let mut reader = backend.open_reader(input)?;
        let frames = read_all(reader.as_mut(), cancel)?;
        (reader.info(), frames)
    };

    let info = match info {
        Some(info) if !frames.is_empty() => info,
        _ => {
            warn!(
                "{} contains no frames; writing empty output to {}",
                input.display(),
                output.display()
            );
            std::fs::File::create(&output)?;
            return Ok(output);
        }
    };

    info!(
        "Stabilizing {} ({} frames, {}x{}) with {} backend",
        input.display(),
        frames.len(),
        info.width,
        info.height,
        backend.name()
    );

    let mut writer = backend.create_writer(&output, info)?;
    stabilizer.stabilize(&frames, writer.as_mut(), cancel)?;
    writer.finish()?;

    info!(
        "Stabilized video written to {} in {:?}",
        output.display(),
        started.elapsed()
    );
    Ok(output)
}
