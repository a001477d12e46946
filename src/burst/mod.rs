//! Multi-frame night-mode stacking: align a burst to its first frame, then average.

mod align;
mod fuse;

pub use align::{AlignmentOffset, BlockMatch, FrameAligner, LumaPlane};
pub use fuse::BurstFuser;

use crate::error::{ProcessingError, Result};
use crate::frame::FrameData;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Align every frame after the first to the first one and fuse the burst
pub fn stack_burst(
    aligner: &FrameAligner,
    fuser: &BurstFuser,
    frames: &[FrameData],
    cancel: &CancellationToken,
) -> Result<FrameData> {
    let (reference, candidates) = frames.split_first().ok_or(ProcessingError::EmptyBurst)?;

    let offsets = aligner.align_cancellable(reference, candidates, cancel)?;
    info!(
        "Stacking {} frames (offsets: {:?})",
        frames.len(),
        offsets
    );

    fuser.fuse_cancellable(reference, candidates, &offsets, cancel)
}
