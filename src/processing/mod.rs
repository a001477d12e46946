mod dispatcher;
mod job;
mod night;
mod normal;
mod video;

#[cfg(test)]
mod tests;

pub use dispatcher::{DispatcherStats, DispatcherStatsSnapshot, PostProcessingDispatcher};
pub use job::{CaptureJob, CaptureMode, JobHandle, JobOutcome, PipelineKind};
pub use video::VideoOutputMode;
