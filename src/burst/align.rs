use crate::config::AlignmentConfig;
use crate::error::{ProcessingError, Result};
use crate::frame::FrameData;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Full-resolution translation of a candidate frame relative to the reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AlignmentOffset {
    pub dy: i32,
    pub dx: i32,
}

impl AlignmentOffset {
    pub fn new(dy: i32, dx: i32) -> Self {
        Self { dy, dx }
    }

    pub fn is_zero(&self) -> bool {
        self.dy == 0 && self.dx == 0
    }
}

/// Winning offset of a block-matching search, in downsampled pixels
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlockMatch {
    pub dy: i32,
    pub dx: i32,
    /// Mean squared luma difference over the overlap
    pub mse: f64,
}

/// Single-channel plane sampled every `scale` pixels
#[derive(Debug, Clone)]
pub struct LumaPlane {
    pub width: usize,
    pub height: usize,
    pub data: Vec<f32>,
}

impl LumaPlane {
    /// Stride-sample a frame and average its first three channels
    pub fn downsample(frame: &FrameData, scale: usize) -> Self {
        let scale = scale.max(1);
        let channels = frame.channels();
        let (full_w, full_h) = (frame.width as usize, frame.height as usize);
        let width = (full_w + scale - 1) / scale;
        let height = (full_h + scale - 1) / scale;

        let mut data = Vec::with_capacity(width * height);
        for y in (0..full_h).step_by(scale) {
            let row = &frame.data[y * full_w * channels..(y + 1) * full_w * channels];
            for x in (0..full_w).step_by(scale) {
                let px = &row[x * channels..x * channels + 3];
                data.push((px[0] as f32 + px[1] as f32 + px[2] as f32) / 3.0);
            }
        }

        Self {
            width,
            height,
            data,
        }
    }

    fn row(&self, y: usize) -> &[f32] {
        &self.data[y * self.width..(y + 1) * self.width]
    }
}

/// Estimates integer translations between burst frames by downsampled block matching
#[derive(Debug, Clone)]
pub struct FrameAligner {
    scale: u32,
    radius: u32,
}

impl FrameAligner {
    pub fn new(scale: u32, radius: u32) -> Self {
        Self {
            scale: scale.max(1),
            radius,
        }
    }

    pub fn from_config(config: &AlignmentConfig) -> Self {
        Self::new(config.scale, config.radius)
    }

    pub fn scale(&self) -> u32 {
        self.scale
    }

    pub fn radius(&self) -> u32 {
        self.radius
    }

    /// Compute one full-resolution offset per candidate
    pub fn align(
        &self,
        reference: &FrameData,
        candidates: &[FrameData],
    ) -> Result<Vec<AlignmentOffset>> {
        self.align_cancellable(reference, candidates, &CancellationToken::new())
    }

    /// Same as [`FrameAligner::align`], checking `cancel` between candidates
    pub fn align_cancellable(
        &self,
        reference: &FrameData,
        candidates: &[FrameData],
        cancel: &CancellationToken,
    ) -> Result<Vec<AlignmentOffset>> {
        reference.ensure_valid()?;
        let base = LumaPlane::downsample(reference, self.scale as usize);

        debug!(
            "Aligning {} frames against reference {} ({}x{} -> {}x{})",
            candidates.len(),
            reference.id,
            reference.width,
            reference.height,
            base.width,
            base.height
        );

        let mut offsets = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            if cancel.is_cancelled() {
                return Err(ProcessingError::Cancelled.into());
            }

            if candidate.dimensions() != reference.dimensions() {
                return Err(ProcessingError::DimensionMismatch {
                    expected: reference.dimensions(),
                    got: candidate.dimensions(),
                }
                .into());
            }
            candidate.ensure_valid()?;

            let plane = LumaPlane::downsample(candidate, self.scale as usize);
            let offset = match self.search(&base, &plane) {
                Some(found) => {
                    trace!(
                        "Frame {} best match ({}, {}) mse {:.3}",
                        candidate.id,
                        found.dy,
                        found.dx,
                        found.mse
                    );
                    AlignmentOffset::new(
                        found.dy * self.scale as i32,
                        found.dx * self.scale as i32,
                    )
                }
                None => {
                    debug!(
                        "No overlapping offset for frame {}; using zero shift",
                        candidate.id
                    );
                    AlignmentOffset::default()
                }
            };
            offsets.push(offset);
        }

        Ok(offsets)
    }

    /// Exhaustive search over `[-radius, radius]²` in raster order
    ///
    /// Returns `None` only when no offset overlaps the reference at all.
    /// Ties keep the first offset found (dy ascending, then dx ascending).
    pub fn search(&self, reference: &LumaPlane, candidate: &LumaPlane) -> Option<BlockMatch> {
        let radius = self.radius as i32;
        let (h, w) = (reference.height as i32, reference.width as i32);
        let mut best: Option<BlockMatch> = None;

        for dy in -radius..=radius {
            for dx in -radius..=radius {
                let y1 = dy.max(0);
                let y2 = h.min(h + dy);
                let x1 = dx.max(0);
                let x2 = w.min(w + dx);
                if y2 <= y1 || x2 <= x1 {
                    continue;
                }

                let mut sum = 0.0f64;
                for y in y1..y2 {
                    let ref_row = &reference.row(y as usize)[x1 as usize..x2 as usize];
                    let cmp_row = &candidate.row((y - dy) as usize)
                        [(x1 - dx) as usize..(x2 - dx) as usize];
                    sum += ref_row
                        .iter()
                        .zip(cmp_row)
                        .map(|(a, b)| {
                            let d = a - b;
                            (d * d) as f64
                        })
                        .sum::<f64>();
                }
                let mse = sum / ((y2 - y1) as f64 * (x2 - x1) as f64);

                if best.map_or(true, |b| mse < b.mse) {
                    best = Some(BlockMatch { dy, dx, mse });
                }
            }
        }

        best
    }
}

impl Default for FrameAligner {
    fn default() -> Self {
        Self::new(4, 5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameFormat;
    use std::time::SystemTime;

    /// Deterministic texture with strong structure in both axes
    fn textured_frame(id: u64, width: u32, height: u32, shift: (i32, i32)) -> FrameData {
        let mut data = Vec::with_capacity((width * height * 3) as usize);
        for y in 0..height as i32 {
            for x in 0..width as i32 {
                let sx = (x - shift.1).rem_euclid(width as i32);
                let sy = (y - shift.0).rem_euclid(height as i32);
                let v = ((sx * 37 + sy * 91) ^ (sx * sy)) as u8;
                data.extend_from_slice(&[v, v.wrapping_add(40), v.wrapping_mul(3)]);
            }
        }
        FrameData::new(id, SystemTime::now(), data, width, height, FrameFormat::Rgb24)
    }

    fn plane(data: Vec<f32>, width: usize, height: usize) -> LumaPlane {
        LumaPlane {
            width,
            height,
            data,
        }
    }

    #[test]
    fn test_downsample_uses_stride_and_channel_mean() {
        let frame = FrameData::new(
            1,
            SystemTime::now(),
            vec![
                3, 6, 9, 100, 100, 100, 30, 60, 90, //
                0, 0, 0, 0, 0, 0, 0, 0, 0,
            ],
            3,
            2,
            FrameFormat::Rgb24,
        );
        let plane = LumaPlane::downsample(&frame, 2);
        assert_eq!((plane.width, plane.height), (2, 1));
        assert_eq!(plane.data, vec![6.0, 60.0]);
    }

    #[test]
    fn test_identical_frames_align_to_zero() {
        let frame = textured_frame(0, 64, 48, (0, 0));
        let aligner = FrameAligner::default();

        let base = LumaPlane::downsample(&frame, 4);
        let found = aligner.search(&base, &base).unwrap();
        assert_eq!((found.dy, found.dx), (0, 0));
        assert_eq!(found.mse, 0.0);

        let offsets = aligner.align(&frame, &[frame.clone()]).unwrap();
        assert_eq!(offsets, vec![AlignmentOffset::new(0, 0)]);
    }

    #[test]
    fn test_recovers_known_translation() {
        let reference = textured_frame(0, 96, 64, (0, 0));
        let moved = textured_frame(1, 96, 64, (8, -12));

        let offsets = FrameAligner::default().align(&reference, &[moved]).unwrap();
        assert_eq!(offsets, vec![AlignmentOffset::new(-8, 12)]);
    }

    #[test]
    fn test_offsets_stay_within_radius() {
        let reference = textured_frame(0, 64, 64, (0, 0));
        let far = textured_frame(1, 64, 64, (40, 40));
        let aligner = FrameAligner::new(4, 2);

        let offsets = aligner.align(&reference, &[far]).unwrap();
        assert!(offsets[0].dy.abs() <= 8 && offsets[0].dx.abs() <= 8);
        assert_eq!(offsets[0].dy % 4, 0);
        assert_eq!(offsets[0].dx % 4, 0);
    }

    #[test]
    fn test_ties_resolve_to_first_in_raster_order() {
        let flat = plane(vec![5.0; 16], 4, 4);
        let found = FrameAligner::new(1, 2).search(&flat, &flat).unwrap();
        assert_eq!((found.dy, found.dx), (-2, -2));
        assert_eq!(found.mse, 0.0);
    }

    #[test]
    fn test_single_row_overlap_can_win_tie() {
        // Rows 0 and 5 are equal; everything else is distinct along x and y
        let (w, h) = (8usize, 6usize);
        let data: Vec<f32> = (0..h)
            .flat_map(|y| {
                let row_base = if y == 0 || y == h - 1 { 100.0 } else { y as f32 };
                (0..w).map(move |x| row_base + 10.0 * x as f32)
            })
            .collect();
        let base = plane(data, w, h);

        // dy = -5 overlaps only the reference's row 0 with the candidate's
        // row 5, scores exactly zero and precedes (0, 0) in raster order
        let found = FrameAligner::new(1, 5).search(&base, &base).unwrap();
        assert_eq!((found.dy, found.dx), (-5, 0));
        assert_eq!(found.mse, 0.0);

        // A radius that cannot reach the repeated row keeps the true offset
        let found = FrameAligner::new(1, 4).search(&base, &base).unwrap();
        assert_eq!((found.dy, found.dx), (0, 0));
    }

    #[test]
    fn test_degenerate_window_falls_back_to_zero() {
        // A 1x1 plane only overlaps at (0, 0)
        let single = plane(vec![1.0], 1, 1);
        let found = FrameAligner::new(1, 3).search(&single, &single).unwrap();
        assert_eq!((found.dy, found.dx), (0, 0));

        let empty = plane(Vec::new(), 0, 0);
        assert!(FrameAligner::new(1, 3).search(&empty, &empty).is_none());

        let tiny = FrameData::new(0, SystemTime::now(), Vec::new(), 0, 0, FrameFormat::Rgb24);
        let offsets = FrameAligner::default().align(&tiny, &[tiny.clone()]).unwrap();
        assert_eq!(offsets, vec![AlignmentOffset::default()]);
    }

    #[test]
    fn test_dimension_mismatch_is_rejected() {
        let reference = textured_frame(0, 32, 32, (0, 0));
        let other = textured_frame(1, 16, 32, (0, 0));
        assert!(FrameAligner::default().align(&reference, &[other]).is_err());
    }

    #[test]
    fn test_cancelled_alignment_stops() {
        let frame = textured_frame(0, 32, 32, (0, 0));
        let token = CancellationToken::new();
        token.cancel();

        let result = FrameAligner::default().align_cancellable(&frame, &[frame.clone()], &token);
        assert!(matches!(result, Err(e) if e.is_cancelled()));
    }
}
