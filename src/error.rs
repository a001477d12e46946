use thiserror::Error;

#[derive(Error, Debug)]
pub enum PocketcamError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Processing error: {0}")]
    Processing(#[from] ProcessingError),

    #[error("Video error: {0}")]
    Video(#[from] VideoError),

    #[error("System error: {message}")]
    System { message: String },

    #[error("Component error in {component}: {message}")]
    Component { component: String, message: String },
}

impl PocketcamError {
    pub fn system<S: Into<String>>(message: S) -> Self {
        Self::System {
            message: message.into(),
        }
    }

    pub fn component<S: Into<String>>(component: S, message: S) -> Self {
        Self::Component {
            component: component.into(),
            message: message.into(),
        }
    }

    /// True when the job was stopped by the dispatcher's cancellation token
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Processing(ProcessingError::Cancelled))
    }
}

/// Errors raised by the burst and enhancement pipelines
#[derive(Error, Debug)]
pub enum ProcessingError {
    #[error("Frame buffer holds no frames")]
    EmptyBuffer,

    #[error("Burst contains no frames")]
    EmptyBurst,

    #[error("Frame dimensions {got:?} do not match reference {expected:?}")]
    DimensionMismatch {
        expected: (u32, u32),
        got: (u32, u32),
    },

    #[error("Unsupported frame: {details}")]
    UnsupportedFrame { details: String },

    #[error("Processing cancelled")]
    Cancelled,

    #[error("Worker failed: {details}")]
    Worker { details: String },
}

/// Errors raised while decoding or encoding video streams
#[derive(Error, Debug)]
pub enum VideoError {
    #[error("Video support not available in this build")]
    Unavailable,

    #[error("Pipeline error: {details}")]
    Pipeline { details: String },

    #[error("Decode error: {details}")]
    Decode { details: String },

    #[error("Encode error: {details}")]
    Encode { details: String },
}

pub type Result<T> = std::result::Result<T, PocketcamError>;
