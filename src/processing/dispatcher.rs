use super::job::{CaptureJob, CaptureMode, JobHandle, JobOutcome, PipelineKind};
use super::video::VideoOutputMode;
use super::{night, normal, video};
use crate::burst::{BurstFuser, FrameAligner};
use crate::capture::StillCamera;
use crate::config::PocketcamConfig;
use crate::enhance::ImageEnhancer;
use crate::error::{ProcessingError, Result};
use crate::stabilize::{default_backend, VideoBackend, VideoStabilizer};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Job counters for the dispatcher
#[derive(Debug, Default)]
pub struct DispatcherStats {
    pub submitted: AtomicU64,
    pub succeeded: AtomicU64,
    pub failed: AtomicU64,
}

impl DispatcherStats {
    pub fn snapshot(&self) -> DispatcherStatsSnapshot {
        DispatcherStatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherStatsSnapshot {
    pub submitted: u64,
    pub succeeded: u64,
    pub failed: u64,
}

impl DispatcherStatsSnapshot {
    /// Jobs submitted but not yet reported
    pub fn in_flight(&self) -> u64 {
        self.submitted
            .saturating_sub(self.succeeded + self.failed)
    }
}

/// Everything a pipeline needs, shared by all jobs
struct PipelineContext {
    burst_frames: usize,
    aligner: FrameAligner,
    fuser: BurstFuser,
    normal_enhancer: ImageEnhancer,
    night_enhancer: ImageEnhancer,
    stabilizer: VideoStabilizer,
    output_mode: VideoOutputMode,
    still_camera: Arc<dyn StillCamera>,
    video: Arc<dyn VideoBackend>,
    cancel: CancellationToken,
}

/// Routes capture jobs to their pipeline off the caller's thread
///
/// Each job runs as its own tokio task; pixel work goes to the blocking
/// pool. Every submitted job reports exactly one [`JobOutcome`].
///
/// The runtime is captured at construction, so `submit` may be called from
/// any thread, including ones outside the runtime.
pub struct PostProcessingDispatcher {
    context: Arc<PipelineContext>,
    stats: Arc<DispatcherStats>,
    runtime: Option<Handle>,
}

impl PostProcessingDispatcher {
    /// Dispatcher using the build's default video backend
    pub fn new(config: &PocketcamConfig, still_camera: Arc<dyn StillCamera>) -> Self {
        let video = default_backend(config.stabilization.bitrate_kbps);
        Self::with_video_backend(config, still_camera, video)
    }

    /// Dispatcher on the runtime this is called from
    ///
    /// Outside a runtime every submitted job fails immediately; use
    /// [`PostProcessingDispatcher::with_runtime`] to name one explicitly.
    pub fn with_video_backend(
        config: &PocketcamConfig,
        still_camera: Arc<dyn StillCamera>,
        video: Arc<dyn VideoBackend>,
    ) -> Self {
        let runtime = Handle::try_current().ok();
        if runtime.is_none() {
            warn!("Post-processing dispatcher created outside a tokio runtime");
        }
        Self::build(config, still_camera, video, runtime)
    }

    /// Dispatcher that spawns its jobs on `runtime`
    pub fn with_runtime(
        config: &PocketcamConfig,
        still_camera: Arc<dyn StillCamera>,
        video: Arc<dyn VideoBackend>,
        runtime: Handle,
    ) -> Self {
        Self::build(config, still_camera, video, Some(runtime))
    }

    fn build(
        config: &PocketcamConfig,
        still_camera: Arc<dyn StillCamera>,
        video: Arc<dyn VideoBackend>,
        runtime: Option<Handle>,
    ) -> Self {
        let context = PipelineContext {
            burst_frames: config.night.burst_frames,
            aligner: FrameAligner::from_config(&config.alignment),
            fuser: BurstFuser::new(),
            normal_enhancer: ImageEnhancer::normal(&config.enhance),
            night_enhancer: ImageEnhancer::night(&config.night, &config.enhance),
            stabilizer: VideoStabilizer::from_config(&config.stabilization),
            output_mode: VideoOutputMode::from_config(&config.stabilization),
            still_camera,
            video,
            cancel: CancellationToken::new(),
        };

        debug!(
            "Post-processing dispatcher ready (video backend: {})",
            context.video.name()
        );

        Self {
            context: Arc::new(context),
            stats: Arc::new(DispatcherStats::default()),
            runtime,
        }
    }

    /// Start processing `job` in the background
    pub fn submit(&self, job: CaptureJob) -> JobHandle {
        let (tx, rx) = oneshot::channel();
        let initial_kind = PipelineKind::for_mode(&job.mode);
        let handle = JobHandle::new(job.id, &job.path, initial_kind, rx);

        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        info!(
            "Submitted {} job {} for {}",
            job.mode.name(),
            job.id,
            job.path.display()
        );

        let Some(runtime) = self.runtime.clone() else {
            let error = ProcessingError::Worker {
                details: "no tokio runtime to run the job on".to_string(),
            };
            report(&self.stats, tx, job.id, job.path, initial_kind, Err(error.into()));
            return handle;
        };

        let context = Arc::clone(&self.context);
        let stats = Arc::clone(&self.stats);
        let worker_runtime = runtime.clone();
        runtime.spawn(async move {
            let job_id = job.id;
            let path = job.path.clone();
            let resolved = Arc::new(Mutex::new(initial_kind));

            // A panic anywhere in the pipeline surfaces here as a JoinError
            let worker = worker_runtime.spawn(run_job(context, job, Arc::clone(&resolved)));
            let (pipeline, result) = match worker.await {
                Ok(finished) => finished,
                Err(e) => (
                    *resolved.lock(),
                    Err(ProcessingError::Worker {
                        details: e.to_string(),
                    }
                    .into()),
                ),
            };

            report(&stats, tx, job_id, path, pipeline, result);
        });

        handle
    }

    pub fn stats(&self) -> DispatcherStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.context.cancel.clone()
    }

    /// Ask running and future jobs to stop at their next frame boundary
    pub fn shutdown(&self) {
        info!("Cancelling post-processing jobs");
        self.context.cancel.cancel();
    }

    pub fn video_backend(&self) -> &str {
        self.context.video.name()
    }
}

/// Count and deliver the single outcome of a job
fn report(
    stats: &DispatcherStats,
    tx: oneshot::Sender<JobOutcome>,
    job_id: uuid::Uuid,
    path: PathBuf,
    pipeline: PipelineKind,
    result: Result<PathBuf>,
) {
    let outcome = match result {
        Ok(output) => {
            stats.succeeded.fetch_add(1, Ordering::Relaxed);
            info!("Job {} ({}) finished: {}", job_id, pipeline, output.display());
            JobOutcome::success(job_id, output, pipeline)
        }
        Err(e) => {
            stats.failed.fetch_add(1, Ordering::Relaxed);
            error!("Job {} ({}) failed: {}", job_id, pipeline, e);
            JobOutcome::failure(job_id, path, pipeline, e)
        }
    };

    if tx.send(outcome).is_err() {
        debug!("Job {} completed after its handle was dropped", job_id);
    }
}

/// Run a CPU-bound closure on the blocking pool
async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| ProcessingError::Worker {
            details: e.to_string(),
        })?
}

/// `resolved` tracks the pipeline actually running, for panic reports
async fn run_job(
    context: Arc<PipelineContext>,
    job: CaptureJob,
    resolved: Arc<Mutex<PipelineKind>>,
) -> (PipelineKind, Result<PathBuf>) {
    let CaptureJob { id, path, mode } = job;
    debug!("Running job {}", id);

    match mode {
        CaptureMode::Normal => {
            let result = {
                let context = Arc::clone(&context);
                let path = path.clone();
                blocking(move || normal::run(&context.normal_enhancer, &path, &context.cancel))
                    .await
            };
            (PipelineKind::Normal, result.map(|_| path))
        }

        CaptureMode::Night { burst } => {
            let burst = night::trim_burst(burst, context.burst_frames);
            if burst.is_empty() {
                warn!("Night job {} has no buffered frames; using direct capture", id);
                *resolved.lock() = PipelineKind::NightFallback;
                let result = night_fallback(context, path.clone()).await;
                return (PipelineKind::NightFallback, result.map(|_| path));
            }

            let result = {
                let context = Arc::clone(&context);
                let path = path.clone();
                blocking(move || {
                    night::run(
                        &context.aligner,
                        &context.fuser,
                        &context.night_enhancer,
                        &burst,
                        &path,
                        &context.cancel,
                    )
                })
                .await
            };
            (PipelineKind::Night, result.map(|_| path))
        }

        CaptureMode::Video => {
            let result = blocking(move || {
                video::run(
                    context.video.as_ref(),
                    &context.stabilizer,
                    &context.output_mode,
                    &path,
                    &context.cancel,
                )
            })
            .await;
            (PipelineKind::Video, result)
        }
    }
}

/// Direct still capture followed by the normal enhancement pass
async fn night_fallback(context: Arc<PipelineContext>, path: PathBuf) -> Result<()> {
    if context.cancel.is_cancelled() {
        return Err(ProcessingError::Cancelled.into());
    }
    context.still_camera.capture_still(&path).await?;
    blocking(move || normal::run(&context.normal_enhancer, &path, &context.cancel)).await
}
