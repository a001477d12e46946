use super::align::AlignmentOffset;
use crate::error::{ProcessingError, Result};
use crate::frame::FrameData;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Averages aligned burst frames into a single low-noise frame
///
/// Candidates are moved with a cyclic shift, so pixels pushed past one edge
/// come back in on the opposite edge. Only the first three channels are
/// stacked; the result is a three-channel frame in the reference's channel
/// order.
#[derive(Debug, Clone, Default)]
pub struct BurstFuser;

impl BurstFuser {
    pub fn new() -> Self {
        Self
    }

    pub fn fuse(
        &self,
        reference: &FrameData,
        candidates: &[FrameData],
        offsets: &[AlignmentOffset],
    ) -> Result<FrameData> {
        self.fuse_cancellable(reference, candidates, offsets, &CancellationToken::new())
    }

    /// Stack the reference with every shifted candidate, checking `cancel` between frames
    pub fn fuse_cancellable(
        &self,
        reference: &FrameData,
        candidates: &[FrameData],
        offsets: &[AlignmentOffset],
        cancel: &CancellationToken,
    ) -> Result<FrameData> {
        if candidates.len() != offsets.len() {
            return Err(ProcessingError::UnsupportedFrame {
                details: format!(
                    "{} candidates but {} offsets",
                    candidates.len(),
                    offsets.len()
                ),
            }
            .into());
        }
        reference.ensure_valid()?;

        let width = reference.width as usize;
        let height = reference.height as usize;
        let mut sum = vec![0.0f32; width * height * 3];

        accumulate(&mut sum, reference, AlignmentOffset::default());
        for (candidate, offset) in candidates.iter().zip(offsets) {
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
            accumulate(&mut sum, candidate, *offset);
        }

        let count = (candidates.len() + 1) as f32;
        let data: Vec<u8> = sum
            .into_iter()
            .map(|total| (total / count).clamp(0.0, 255.0) as u8)
            .collect();

        debug!(
            "Fused {} frames into {}x{} output",
            candidates.len() + 1,
            width,
            height
        );

        Ok(FrameData::new(
            reference.id,
            reference.timestamp,
            data,
            reference.width,
            reference.height,
            reference.format.without_alpha(),
        ))
    }
}

/// Add `frame` rolled by `offset` into the running RGB sum
fn accumulate(sum: &mut [f32], frame: &FrameData, offset: AlignmentOffset) {
    let width = frame.width as usize;
    let height = frame.height as usize;
    let channels = frame.channels();
    if width == 0 || height == 0 {
        return;
    }

    let shift_y = (offset.dy as i64).rem_euclid(height as i64) as usize;
    let shift_x = (offset.dx as i64).rem_euclid(width as i64) as usize;

    for y in 0..height {
        let src_y = (y + height - shift_y) % height;
        let src_row = &frame.data[src_y * width * channels..(src_y + 1) * width * channels];
        let dst_row = &mut sum[y * width * 3..(y + 1) * width * 3];

        for x in 0..width {
            let src_x = (x + width - shift_x) % width;
            let src = &src_row[src_x * channels..src_x * channels + 3];
            let dst = &mut dst_row[x * 3..x * 3 + 3];
            dst[0] += src[0] as f32;
            dst[1] += src[1] as f32;
            dst[2] += src[2] as f32;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameFormat;
    use std::time::SystemTime;

    fn frame_from(data: Vec<u8>, width: u32, height: u32, format: FrameFormat) -> FrameData {
        FrameData::new(0, SystemTime::now(), data, width, height, format)
    }

    fn numbered(width: u32, height: u32) -> FrameData {
        let data = (0..width * height)
            .flat_map(|i| [i as u8, (i * 2) as u8, (i * 3) as u8])
            .collect();
        frame_from(data, width, height, FrameFormat::Rgb24)
    }

    #[test]
    fn test_single_frame_is_unchanged() {
        let frame = numbered(5, 4);
        let fused = BurstFuser::new().fuse(&frame, &[], &[]).unwrap();
        assert_eq!(fused.dimensions(), frame.dimensions());
        assert_eq!(fused.data, frame.data);
    }

    #[test]
    fn test_alpha_is_dropped_and_order_kept() {
        let frame = frame_from(vec![1, 2, 3, 255, 4, 5, 6, 255], 2, 1, FrameFormat::Bgra32);
        let fused = BurstFuser::new().fuse(&frame, &[], &[]).unwrap();
        assert_eq!(fused.format, FrameFormat::Bgr24);
        assert_eq!(*fused.data, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_average_truncates() {
        let a = frame_from(vec![10, 0, 255], 1, 1, FrameFormat::Rgb24);
        let b = frame_from(vec![13, 1, 255], 1, 1, FrameFormat::Rgb24);
        let fused = BurstFuser::new()
            .fuse(&a, &[b], &[AlignmentOffset::default()])
            .unwrap();
        assert_eq!(*fused.data, vec![11, 0, 255]);
    }

    #[test]
    fn test_shift_wraps_around_edges() {
        // Row of 3 pixels: values 0, 1, 2 in every channel
        let row = frame_from(vec![0, 0, 0, 30, 30, 30, 60, 60, 60], 3, 1, FrameFormat::Rgb24);
        let mut sum = vec![0.0f32; 9];
        accumulate(&mut sum, &row, AlignmentOffset::new(0, 1));

        // Rolled by +1: the last pixel reappears at the start
        assert_eq!(sum, vec![60.0, 60.0, 60.0, 0.0, 0.0, 0.0, 30.0, 30.0, 30.0]);
    }

    #[test]
    fn test_shift_undoes_motion() {
        let reference = numbered(6, 5);
        // Candidate content rolled down 2 rows and left 1 column
        let mut moved = Vec::new();
        for y in 0..5usize {
            for x in 0..6usize {
                let sy = (y + 5 - 2) % 5;
                let sx = (x + 1) % 6;
                let i = (sy * 6 + sx) * 3;
                moved.extend_from_slice(&reference.data[i..i + 3]);
            }
        }
        let candidate = frame_from(moved, 6, 5, FrameFormat::Rgb24);

        let fused = BurstFuser::new()
            .fuse(&reference, &[candidate], &[AlignmentOffset::new(-2, 1)])
            .unwrap();
        assert_eq!(fused.data, reference.data);
    }

    #[test]
    fn test_mismatched_inputs_are_rejected() {
        let frame = numbered(4, 4);
        let small = numbered(2, 2);

        assert!(BurstFuser::new().fuse(&frame, &[frame.clone()], &[]).is_err());
        assert!(BurstFuser::new()
            .fuse(&frame, &[small], &[AlignmentOffset::default()])
            .is_err());
    }
}
