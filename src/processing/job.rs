use crate::frame::FrameData;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::sync::oneshot;
use uuid::Uuid;

/// What the user captured, and the data the matching pipeline needs
#[derive(Debug, Clone)]
pub enum CaptureMode {
    /// A still already saved at the job path
    Normal,
    /// Frames collected around the trigger, oldest first
    Night { burst: Vec<FrameData> },
    /// A finished recording at the job path
    Video,
}

impl CaptureMode {
    pub fn name(&self) -> &'static str {
        match self {
            CaptureMode::Normal => "normal",
            CaptureMode::Night { .. } => "night",
            CaptureMode::Video => "video",
        }
    }
}

/// Unit of post-processing work, consumed by the dispatcher
#[derive(Debug, Clone)]
pub struct CaptureJob {
    pub id: Uuid,
    pub path: PathBuf,
    pub mode: CaptureMode,
}

impl CaptureJob {
    pub fn new<P: Into<PathBuf>>(path: P, mode: CaptureMode) -> Self {
        Self {
            id: Uuid::new_v4(),
            path: path.into(),
            mode,
        }
    }

    pub fn normal<P: Into<PathBuf>>(path: P) -> Self {
        Self::new(path, CaptureMode::Normal)
    }

    pub fn night<P: Into<PathBuf>>(path: P, burst: Vec<FrameData>) -> Self {
        Self::new(path, CaptureMode::Night { burst })
    }

    pub fn video<P: Into<PathBuf>>(path: P) -> Self {
        Self::new(path, CaptureMode::Video)
    }
}

/// Pipeline that actually ran for a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineKind {
    Normal,
    Night,
    /// Night job with no buffered frames, served by a direct capture
    NightFallback,
    Video,
}

impl PipelineKind {
    /// Pipeline a mode starts on before any fallback
    pub fn for_mode(mode: &CaptureMode) -> Self {
        match mode {
            CaptureMode::Normal => PipelineKind::Normal,
            CaptureMode::Night { .. } => PipelineKind::Night,
            CaptureMode::Video => PipelineKind::Video,
        }
    }
}

impl fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineKind::Normal => "normal",
            PipelineKind::Night => "night",
            PipelineKind::NightFallback => "night_fallback",
            PipelineKind::Video => "video",
        };
        f.write_str(name)
    }
}

/// Terminal result of a job, delivered once
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOutcome {
    pub job_id: Uuid,
    /// Final output location
    pub path: PathBuf,
    pub pipeline: PipelineKind,
    pub completed_at: DateTime<Utc>,
    /// Failure reason, `None` on success
    pub error: Option<String>,
}

impl JobOutcome {
    pub fn success(job_id: Uuid, path: PathBuf, pipeline: PipelineKind) -> Self {
        Self {
            job_id,
            path,
            pipeline,
            completed_at: Utc::now(),
            error: None,
        }
    }

    pub fn failure<E: fmt::Display>(
        job_id: Uuid,
        path: PathBuf,
        pipeline: PipelineKind,
        error: E,
    ) -> Self {
        Self {
            job_id,
            path,
            pipeline,
            completed_at: Utc::now(),
            error: Some(error.to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Completion handle for a submitted job
#[derive(Debug)]
pub struct JobHandle {
    job_id: Uuid,
    path: PathBuf,
    pipeline: PipelineKind,
    receiver: oneshot::Receiver<JobOutcome>,
}

impl JobHandle {
    pub(crate) fn new(
        job_id: Uuid,
        path: &Path,
        pipeline: PipelineKind,
        receiver: oneshot::Receiver<JobOutcome>,
    ) -> Self {
        Self {
            job_id,
            path: path.to_path_buf(),
            pipeline,
            receiver,
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Wait for the job's outcome
    ///
    /// If the worker vanished without reporting, a failure outcome is
    /// synthesized so callers always get exactly one result.
    pub async fn wait(self) -> JobOutcome {
        match self.receiver.await {
            Ok(outcome) => outcome,
            Err(_) => JobOutcome::failure(
                self.job_id,
                self.path,
                self.pipeline,
                "worker exited without reporting an outcome",
            ),
        }
    }
}
