use super::smooth::{Trajectory, TrajectoryPoint};
use crate::config::BorderMode;
use crate::error::{ProcessingError, Result};
use crate::frame::FrameData;
use tokio_util::sync::CancellationToken;

/// Shifts frames against their smoothed motion with bilinear sampling
#[derive(Debug, Clone, Copy)]
pub struct StabilizationWarper {
    border: BorderMode,
}

impl StabilizationWarper {
    pub fn new(border: BorderMode) -> Self {
        Self { border }
    }

    pub fn border(&self) -> BorderMode {
        self.border
    }

    /// Translate `frame` by `(-correction.dx, -correction.dy)`, keeping its size
    pub fn warp_frame(&self, frame: &FrameData, correction: TrajectoryPoint) -> Result<FrameData> {
        frame.ensure_valid()?;
        if correction.dx == 0.0 && correction.dy == 0.0 {
            return Ok(frame.clone());
        }

        let width = frame.width as usize;
        let height = frame.height as usize;
        let channels = frame.channels();

        // Output (x, y) reads source (x + dx, y + dy); the fractional part is
        // the same for every pixel of a pure translation.
        let shift_x = correction.dx.floor();
        let shift_y = correction.dy.floor();
        let fx = (correction.dx - shift_x) as f32;
        let fy = (correction.dy - shift_y) as f32;
        let (shift_x, shift_y) = (shift_x as i64, shift_y as i64);

        let mut data = vec![0u8; frame.data.len()];
        let mut px = [0.0f32; 4];
        for y in 0..height {
            let sy = y as i64 + shift_y;
            for x in 0..width {
                let sx = x as i64 + shift_x;

                px[..channels].iter_mut().for_each(|v| *v = 0.0);
                for (ox, oy, weight) in [
                    (0, 0, (1.0 - fx) * (1.0 - fy)),
                    (1, 0, fx * (1.0 - fy)),
                    (0, 1, (1.0 - fx) * fy),
                    (1, 1, fx * fy),
                ] {
                    if weight == 0.0 {
                        continue;
                    }
                    let Some(offset) = self.source_offset(sx + ox, sy + oy, width, height) else {
                        continue;
                    };
                    let src = &frame.data[offset * channels..(offset + 1) * channels];
                    for (acc, &value) in px.iter_mut().zip(src) {
                        *acc += weight * value as f32;
                    }
                }

                let dst = &mut data[(y * width + x) * channels..(y * width + x + 1) * channels];
                for (out, value) in dst.iter_mut().zip(&px) {
                    *out = value.round().clamp(0.0, 255.0) as u8;
                }
            }
        }

        Ok(FrameData::new(
            frame.id,
            frame.timestamp,
            data,
            frame.width,
            frame.height,
            frame.format,
        ))
    }

    /// Warp every frame by its trajectory point
    pub fn warp_all(
        &self,
        frames: &[FrameData],
        trajectory: &Trajectory,
        cancel: &CancellationToken,
    ) -> Result<Vec<FrameData>> {
        ensure_trajectory_len(frames.len(), trajectory)?;

        frames
            .iter()
            .zip(trajectory.points())
            .map(|(frame, point)| {
                if cancel.is_cancelled() {
                    return Err(ProcessingError::Cancelled.into());
                }
                self.warp_frame(frame, *point)
            })
            .collect()
    }

    /// Pixel index for a source coordinate, or `None` for constant-border fill
    fn source_offset(&self, x: i64, y: i64, width: usize, height: usize) -> Option<usize> {
        let (w, h) = (width as i64, height as i64);
        let inside = (0..w).contains(&x) && (0..h).contains(&y);
        match self.border {
            _ if inside => Some(y as usize * width + x as usize),
            BorderMode::Constant => None,
            BorderMode::Replicate => {
                Some(y.clamp(0, h - 1) as usize * width + x.clamp(0, w - 1) as usize)
            }
        }
    }
}

impl Default for StabilizationWarper {
    fn default() -> Self {
        Self::new(BorderMode::Constant)
    }
}

pub(super) fn ensure_trajectory_len(frames: usize, trajectory: &Trajectory) -> Result<()> {
    if frames != trajectory.len() {
        return Err(ProcessingError::UnsupportedFrame {
            details: format!(
                "{} frames but {} trajectory points",
                frames,
                trajectory.len()
            ),
        }
        .into());
    }
    Ok(())
}
