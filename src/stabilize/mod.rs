//! Post-capture video stabilization: dense optical flow, EMA smoothing, and a
//! compensating translation per frame.

mod flow;
mod smooth;
mod warp;
pub mod video;

pub use flow::{dense_flow, FlowField, FlowParams, GrayPlane, MotionEstimator, MotionSample};
pub use smooth::{MotionSmoother, Trajectory, TrajectoryPoint};
pub use video::{
    default_backend, MemoryVideoBackend, MemoryVideoReader, MemoryVideoWriter,
    UnavailableBackend, VideoBackend, VideoInfo, VideoReader, VideoWriter,
};
pub use warp::StabilizationWarper;

use crate::config::{PocketcamConfig, StabilizationConfig};
use crate::error::{ProcessingError, Result};
use crate::frame::FrameData;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Summary of a stabilization pass
#[derive(Debug, Clone)]
pub struct StabilizationReport {
    pub frames: usize,
    pub trajectory: Trajectory,
}

/// Estimator, smoother and warper wired together from configuration
#[derive(Debug, Clone)]
pub struct VideoStabilizer {
    estimator: MotionEstimator,
    smoother: MotionSmoother,
    warper: StabilizationWarper,
}

impl VideoStabilizer {
    pub fn new(
        estimator: MotionEstimator,
        smoother: MotionSmoother,
        warper: StabilizationWarper,
    ) -> Self {
        Self {
            estimator,
            smoother,
            warper,
        }
    }

    pub fn from_config(config: &StabilizationConfig) -> Self {
        Self::new(
            MotionEstimator::from_config(config),
            MotionSmoother::from_config(config),
            StabilizationWarper::new(config.border),
        )
    }

    /// Estimate and smooth motion without touching any pixels
    pub fn trajectory(&self, frames: &[FrameData], cancel: &CancellationToken) -> Result<Trajectory> {
        let samples = self.estimator.estimate_cancellable(frames, cancel)?;
        Ok(self.smoother.smooth(&samples))
    }

    /// Stabilize `frames` and stream the result into `writer`
    ///
    /// The writer is not finished here; the caller owns its lifetime.
    pub fn stabilize<W: VideoWriter + ?Sized>(
        &self,
        frames: &[FrameData],
        writer: &mut W,
        cancel: &CancellationToken,
    ) -> Result<StabilizationReport> {
        let trajectory = self.trajectory(frames, cancel)?;
        warp::ensure_trajectory_len(frames.len(), &trajectory)?;

        for (index, (frame, point)) in frames.iter().zip(trajectory.points()).enumerate() {
            if cancel.is_cancelled() {
                return Err(ProcessingError::Cancelled.into());
            }
            let warped = self.warper.warp_frame(frame, *point)?;
            writer.write_frame(&warped)?;
            if index > 0 && index % 100 == 0 {
                debug!("Stabilized {}/{} frames", index, frames.len());
            }
        }

        info!(
            "Stabilized {} frames (max correction {:.2}px)",
            frames.len(),
            trajectory.max_correction()
        );

        Ok(StabilizationReport {
            frames: frames.len(),
            trajectory,
        })
    }
}

impl Default for VideoStabilizer {
    fn default() -> Self {
        Self::from_config(&PocketcamConfig::default().stabilization)
    }
}

/// Drain a reader into memory, checking `cancel` between frames
pub fn read_all(reader: &mut dyn VideoReader, cancel: &CancellationToken) -> Result<Vec<FrameData>> {
    let mut frames = Vec::new();
    while let Some(frame) = reader.next_frame()? {
        if cancel.is_cancelled() {
            return Err(ProcessingError::Cancelled.into());
        }
        frames.push(frame);
    }
    Ok(frames)
}
