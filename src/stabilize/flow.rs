use crate::config::StabilizationConfig;
use crate::error::{ProcessingError, Result};
use crate::frame::FrameData;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Mean optical flow between a frame and its predecessor
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MotionSample {
    /// Mean horizontal flow in pixels
    pub dx: f64,
    /// Mean vertical flow in pixels
    pub dy: f64,
}

impl MotionSample {
    pub fn new(dx: f64, dy: f64) -> Self {
        Self { dx, dy }
    }
}

/// Dense optical flow parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlowParams {
    /// Size ratio between consecutive pyramid levels
    pub pyramid_scale: f32,
    /// Number of pyramid levels including full resolution
    pub levels: u32,
    /// Side of the square integration window
    pub window_size: u32,
    /// Refinement passes per level
    pub iterations: u32,
}

impl Default for FlowParams {
    fn default() -> Self {
        Self {
            pyramid_scale: 0.5,
            levels: 3,
            window_size: 15,
            iterations: 3,
        }
    }
}

impl FlowParams {
    pub fn from_config(config: &StabilizationConfig) -> Self {
        Self {
            pyramid_scale: config.pyramid_scale,
            levels: config.levels.max(1),
            window_size: config.window_size.max(1),
            iterations: config.iterations,
        }
    }
}

/// Coarsest pyramid level side; smaller levels are not built
const MIN_LEVEL_SIDE: usize = 8;

/// Single-channel `f32` image
#[derive(Debug, Clone)]
pub struct GrayPlane {
    pub width: usize,
    pub height: usize,
    pub data: Vec<f32>,
}

impl GrayPlane {
    pub fn new(width: usize, height: usize, data: Vec<f32>) -> Self {
        debug_assert_eq!(data.len(), width * height);
        Self {
            width,
            height,
            data,
        }
    }

    pub fn from_frame(frame: &FrameData) -> Self {
        Self::new(frame.width as usize, frame.height as usize, frame.luma_f32())
    }

    fn at(&self, x: isize, y: isize) -> f32 {
        let x = x.clamp(0, self.width as isize - 1) as usize;
        let y = y.clamp(0, self.height as isize - 1) as usize;
        self.data[y * self.width + x]
    }

    /// Bilinear sample with edge clamping
    fn sample(&self, x: f32, y: f32) -> f32 {
        let x0 = x.floor();
        let y0 = y.floor();
        let fx = x - x0;
        let fy = y - y0;
        let (ix, iy) = (x0 as isize, y0 as isize);

        let top = self.at(ix, iy) * (1.0 - fx) + self.at(ix + 1, iy) * fx;
        let bottom = self.at(ix, iy + 1) * (1.0 - fx) + self.at(ix + 1, iy + 1) * fx;
        top * (1.0 - fy) + bottom * fy
    }

    /// 5-tap binomial blur, separable, edges clamped
    fn blurred(&self) -> Self {
        const TAPS: [f32; 5] = [1.0 / 16.0, 4.0 / 16.0, 6.0 / 16.0, 4.0 / 16.0, 1.0 / 16.0];
        let (w, h) = (self.width, self.height);

        let mut horizontal = vec![0.0f32; w * h];
        for y in 0..h {
            for x in 0..w {
                horizontal[y * w + x] = TAPS
                    .iter()
                    .enumerate()
                    .map(|(k, t)| t * self.at(x as isize + k as isize - 2, y as isize))
                    .sum();
            }
        }

        let horizontal = GrayPlane::new(w, h, horizontal);
        let mut out = vec![0.0f32; w * h];
        for y in 0..h {
            for x in 0..w {
                out[y * w + x] = TAPS
                    .iter()
                    .enumerate()
                    .map(|(k, t)| t * horizontal.at(x as isize, y as isize + k as isize - 2))
                    .sum();
            }
        }
        GrayPlane::new(w, h, out)
    }

    /// Resample to `width` x `height` with pixel-center alignment
    fn resized(&self, width: usize, height: usize) -> Self {
        let sx = self.width as f32 / width as f32;
        let sy = self.height as f32 / height as f32;
        let mut data = Vec::with_capacity(width * height);
        for y in 0..height {
            let src_y = (y as f32 + 0.5) * sy - 0.5;
            for x in 0..width {
                let src_x = (x as f32 + 0.5) * sx - 0.5;
                data.push(self.sample(src_x, src_y));
            }
        }
        GrayPlane::new(width, height, data)
    }
}

/// Per-pixel flow vectors at full resolution
#[derive(Debug, Clone)]
pub struct FlowField {
    pub width: usize,
    pub height: usize,
    pub u: Vec<f32>,
    pub v: Vec<f32>,
}

impl FlowField {
    fn zeros(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            u: vec![0.0; width * height],
            v: vec![0.0; width * height],
        }
    }

    /// Mean flow per axis over the whole field
    pub fn mean(&self) -> MotionSample {
        let count = self.u.len();
        if count == 0 {
            return MotionSample::default();
        }
        let sum_u: f64 = self.u.iter().map(|&u| u as f64).sum();
        let sum_v: f64 = self.v.iter().map(|&v| v as f64).sum();
        MotionSample::new(sum_u / count as f64, sum_v / count as f64)
    }

    /// Bring a coarse field up to `width` x `height`, rescaling the vectors
    fn upscaled(&self, width: usize, height: usize) -> Self {
        let gain_x = width as f32 / self.width as f32;
        let gain_y = height as f32 / self.height as f32;
        let u = GrayPlane::new(self.width, self.height, self.u.clone()).resized(width, height);
        let v = GrayPlane::new(self.width, self.height, self.v.clone()).resized(width, height);
        Self {
            width,
            height,
            u: u.data.into_iter().map(|x| x * gain_x).collect(),
            v: v.data.into_iter().map(|y| y * gain_y).collect(),
        }
    }
}

/// Summed-area table for constant-time window sums
struct Integral {
    width: usize,
    sums: Vec<f64>,
}

impl Integral {
    fn new(width: usize, height: usize, mut values: impl Iterator<Item = f64>) -> Self {
        let stride = width + 1;
        let mut sums = vec![0.0f64; stride * (height + 1)];
        for y in 0..height {
            let mut row = 0.0;
            for x in 0..width {
                row += values.next().unwrap_or(0.0);
                sums[(y + 1) * stride + x + 1] = sums[y * stride + x + 1] + row;
            }
        }
        Self { width, sums }
    }

    /// Sum over the window centred on (x, y), clipped to the image
    fn window(&self, x: usize, y: usize, radius: usize, height: usize) -> f64 {
        let stride = self.width + 1;
        let x0 = x.saturating_sub(radius);
        let y0 = y.saturating_sub(radius);
        let x1 = (x + radius + 1).min(self.width);
        let y1 = (y + radius + 1).min(height);
        self.sums[y1 * stride + x1] - self.sums[y0 * stride + x1] - self.sums[y1 * stride + x0]
            + self.sums[y0 * stride + x0]
    }
}

/// Pyramidal, iterative Lucas-Kanade flow evaluated at every pixel
pub fn dense_flow(prev: &GrayPlane, next: &GrayPlane, params: &FlowParams) -> FlowField {
    let prev_pyramid = build_pyramid(prev, params);
    let next_pyramid = build_pyramid(next, params);
    let radius = (params.window_size / 2) as usize;

    let mut flow: Option<FlowField> = None;
    for (prev_level, next_level) in prev_pyramid.iter().zip(&next_pyramid).rev() {
        let mut field = match flow.take() {
            Some(coarse) => coarse.upscaled(prev_level.width, prev_level.height),
            None => FlowField::zeros(prev_level.width, prev_level.height),
        };
        refine_level(prev_level, next_level, &mut field, radius, params.iterations);
        flow = Some(field);
    }

    flow.unwrap_or_else(|| FlowField::zeros(prev.width, prev.height))
}

fn build_pyramid(base: &GrayPlane, params: &FlowParams) -> Vec<GrayPlane> {
    let mut levels = vec![base.clone()];
    for _ in 1..params.levels {
        let Some(last) = levels.last() else { break };
        let width = (last.width as f32 * params.pyramid_scale).round() as usize;
        let height = (last.height as f32 * params.pyramid_scale).round() as usize;
        if width < MIN_LEVEL_SIDE || height < MIN_LEVEL_SIDE {
            break;
        }
        let next = last.blurred().resized(width, height);
        levels.push(next);
    }
    levels
}

fn refine_level(
    prev: &GrayPlane,
    next: &GrayPlane,
    field: &mut FlowField,
    radius: usize,
    iterations: u32,
) {
    let (w, h) = (prev.width, prev.height);
    if w == 0 || h == 0 {
        return;
    }

    // Spatial gradients of the previous frame are fixed for the whole level
    let mut gx = vec![0.0f32; w * h];
    let mut gy = vec![0.0f32; w * h];
    for y in 0..h {
        for x in 0..w {
            let (xi, yi) = (x as isize, y as isize);
            gx[y * w + x] = 0.5 * (prev.at(xi + 1, yi) - prev.at(xi - 1, yi));
            gy[y * w + x] = 0.5 * (prev.at(xi, yi + 1) - prev.at(xi, yi - 1));
        }
    }

    let sxx = Integral::new(w, h, gx.iter().map(|&g| (g * g) as f64));
    let sxy = Integral::new(w, h, gx.iter().zip(&gy).map(|(&a, &b)| (a * b) as f64));
    let syy = Integral::new(w, h, gy.iter().map(|&g| (g * g) as f64));

    for _ in 0..iterations {
        let mut dt = vec![0.0f32; w * h];
        for y in 0..h {
            for x in 0..w {
                let i = y * w + x;
                let warped = next.sample(x as f32 + field.u[i], y as f32 + field.v[i]);
                dt[i] = warped - prev.data[i];
            }
        }

        let sxt = Integral::new(w, h, gx.iter().zip(&dt).map(|(&a, &t)| (a * t) as f64));
        let syt = Integral::new(w, h, gy.iter().zip(&dt).map(|(&b, &t)| (b * t) as f64));

        for y in 0..h {
            for x in 0..w {
                let a = sxx.window(x, y, radius, h);
                let c = sxy.window(x, y, radius, h);
                let e = syy.window(x, y, radius, h);
                let bx = sxt.window(x, y, radius, h);
                let by = syt.window(x, y, radius, h);

                let det = a * e - c * c;
                if det <= 1e-6 {
                    continue;
                }
                let i = y * w + x;
                field.u[i] += ((-e * bx + c * by) / det) as f32;
                field.v[i] += ((c * bx - a * by) / det) as f32;
            }
        }
    }
}

/// Per-frame camera motion from dense optical flow
#[derive(Debug, Clone, Default)]
pub struct MotionEstimator {
    params: FlowParams,
}

impl MotionEstimator {
    pub fn new(params: FlowParams) -> Self {
        Self { params }
    }

    pub fn from_config(config: &StabilizationConfig) -> Self {
        Self::new(FlowParams::from_config(config))
    }

    pub fn params(&self) -> &FlowParams {
        &self.params
    }

    /// Mean flow from `prev` to `next`
    pub fn estimate_pair(&self, prev: &GrayPlane, next: &GrayPlane) -> MotionSample {
        dense_flow(prev, next, &self.params).mean()
    }

    /// One sample per frame; the first frame gets (0, 0)
    pub fn estimate(&self, frames: &[FrameData]) -> Result<Vec<MotionSample>> {
        self.estimate_cancellable(frames, &CancellationToken::new())
    }

    pub fn estimate_cancellable(
        &self,
        frames: &[FrameData],
        cancel: &CancellationToken,
    ) -> Result<Vec<MotionSample>> {
        let Some(first) = frames.first() else {
            return Ok(Vec::new());
        };
        first.ensure_valid()?;

        debug!(
            "Estimating motion across {} frames ({}x{})",
            frames.len(),
            first.width,
            first.height
        );

        let mut samples = Vec::with_capacity(frames.len());
        samples.push(MotionSample::default());

        let mut prev = GrayPlane::from_frame(first);
        for (index, frame) in frames.iter().enumerate().skip(1) {
            if cancel.is_cancelled() {
                return Err(ProcessingError::Cancelled.into());
            }
            if frame.dimensions() != first.dimensions() {
                return Err(ProcessingError::DimensionMismatch {
                    expected: first.dimensions(),
                    got: frame.dimensions(),
                }
                .into());
            }
            frame.ensure_valid()?;

            let gray = GrayPlane::from_frame(frame);
            let sample = self.estimate_pair(&prev, &gray);
            trace!(
                "Frame {} motion: dx={:.3} dy={:.3}",
                index,
                sample.dx,
                sample.dy
            );
            samples.push(sample);
            prev = gray;
        }

        Ok(samples)
    }
}
