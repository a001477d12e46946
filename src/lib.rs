pub mod burst;
pub mod capture;
pub mod config;
pub mod enhance;
pub mod error;
pub mod frame;
pub mod processing;
pub mod ring_buffer;
pub mod stabilize;

pub use burst::{stack_burst, AlignmentOffset, BurstFuser, FrameAligner};
pub use capture::{CaptureController, CaptureKind, StillCamera};
pub use config::PocketcamConfig;
pub use enhance::{ImageEnhancer, SharpenFilter};
pub use error::{PocketcamError, ProcessingError, Result, VideoError};
pub use frame::{FrameData, FrameFormat};
pub use processing::{
    CaptureJob, CaptureMode, JobHandle, JobOutcome, PipelineKind, PostProcessingDispatcher,
    VideoOutputMode,
};
pub use ring_buffer::{RingBuffer, RingBufferBuilder};
pub use stabilize::{
    MotionEstimator, MotionSample, MotionSmoother, StabilizationWarper, Trajectory, VideoBackend,
    VideoInfo, VideoReader, VideoStabilizer, VideoWriter,
};
