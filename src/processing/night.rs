use crate::burst::{stack_burst, BurstFuser, FrameAligner};
use crate::enhance::ImageEnhancer;
use crate::error::Result;
use crate::frame::FrameData;
use std::path::Path;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Keep only the newest `max_frames` of a burst
pub(crate) fn trim_burst(mut burst: Vec<FrameData>, max_frames: usize) -> Vec<FrameData> {
    if burst.len() > max_frames {
        let excess = burst.len() - max_frames;
        debug!("Dropping {} oldest burst frames", excess);
        burst.drain(..excess);
    }
    burst
}

/// Align, fuse and enhance a non-empty burst, writing the result to `path`
pub(crate) fn run(
    aligner: &FrameAligner,
    fuser: &BurstFuser,
    enhancer: &ImageEnhancer,
    burst: &[FrameData],
    path: &Path,
    cancel: &CancellationToken,
) -> Result<()> {
    let started = Instant::now();

    let fused = stack_burst(aligner, fuser, burst, cancel)?;
    let image = fused.to_rgb_image()?;
    let enhanced = enhancer.apply(&image);
    enhancer.save(&enhanced, path)?;

    info!(
        "Night stack of {} frames written to {} in {:?}",
        burst.len(),
        path.display(),
        started.elapsed()
    );
    Ok(())
}
