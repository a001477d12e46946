use crate::enhance::ImageEnhancer;
use crate::error::{ProcessingError, Result};
use std::path::Path;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Enhance the still at `path` in place
pub(crate) fn run(enhancer: &ImageEnhancer, path: &Path, cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(ProcessingError::Cancelled.into());
    }

    let started = Instant::now();
    enhancer.enhance_file(path)?;
    info!(
        "Normal processing of {} finished in {:?}",
        path.display(),
        started.elapsed()
    );
    Ok(())
}
