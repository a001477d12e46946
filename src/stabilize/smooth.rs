use super::flow::MotionSample;
use crate::config::StabilizationConfig;
use serde::{Deserialize, Serialize};

/// Smoothed correction applied to one frame
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TrajectoryPoint {
    pub dx: f64,
    pub dy: f64,
}

/// Per-frame corrections, one point per input frame
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    points: Vec<TrajectoryPoint>,
}

impl Trajectory {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<TrajectoryPoint> {
        self.points.get(index).copied()
    }

    pub fn points(&self) -> &[TrajectoryPoint] {
        &self.points
    }

    /// Largest correction magnitude along the trajectory
    pub fn max_correction(&self) -> f64 {
        self.points
            .iter()
            .map(|p| p.dx.hypot(p.dy))
            .fold(0.0, f64::max)
    }
}

impl FromIterator<TrajectoryPoint> for Trajectory {
    fn from_iter<I: IntoIterator<Item = TrajectoryPoint>>(iter: I) -> Self {
        Self {
            points: iter.into_iter().collect(),
        }
    }
}

/// Exponential moving average over raw per-frame motion
///
/// `s[i] = alpha * s[i-1] + (1 - alpha) * raw[i]`, starting from zero.
#[derive(Debug, Clone, Copy)]
pub struct MotionSmoother {
    alpha: f64,
}

impl MotionSmoother {
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha: alpha.clamp(0.0, 1.0),
        }
    }

    pub fn from_config(config: &StabilizationConfig) -> Self {
        Self::new(config.smoothing_factor)
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn smooth(&self, samples: &[MotionSample]) -> Trajectory {
        let mut state = TrajectoryPoint::default();
        samples
            .iter()
            .map(|raw| {
                state = TrajectoryPoint {
                    dx: self.alpha * state.dx + (1.0 - self.alpha) * raw.dx,
                    dy: self.alpha * state.dy + (1.0 - self.alpha) * raw.dy,
                };
                state
            })
            .collect()
    }
}

impl Default for MotionSmoother {
    fn default() -> Self {
        Self::new(0.9)
    }
}
