//! Turning a shutter press into a post-processing job.

use crate::config::PocketcamConfig;
use crate::enhance::save_image;
use crate::error::{PocketcamError, ProcessingError, Result};
use crate::frame::FrameData;
use crate::processing::{CaptureJob, JobHandle, PostProcessingDispatcher};
use crate::ring_buffer::RingBuffer;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Camera able to take a fresh exposure straight to a file
#[async_trait::async_trait]
pub trait StillCamera: Send + Sync {
    /// Capture one still image to `path`
    async fn capture_still(&self, path: &Path) -> Result<()>;

    fn camera_name(&self) -> &str {
        "still"
    }
}

/// Capture requested by the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureKind {
    Normal,
    Night,
    Video,
}

/// Glue between the live frame buffer, the still camera and the dispatcher
pub struct CaptureController {
    ring_buffer: Arc<RingBuffer>,
    still_camera: Arc<dyn StillCamera>,
    burst_frames: usize,
    jpeg_quality: u8,
}

impl CaptureController {
    pub fn new(
        config: &PocketcamConfig,
        ring_buffer: Arc<RingBuffer>,
        still_camera: Arc<dyn StillCamera>,
    ) -> Self {
        Self {
            ring_buffer,
            still_camera,
            burst_frames: config.night.burst_frames,
            jpeg_quality: config.enhance.jpeg_quality,
        }
    }

    /// Controller with its own buffer sized from `[buffer]`
    pub fn from_config(config: &PocketcamConfig, still_camera: Arc<dyn StillCamera>) -> Self {
        let ring_buffer = Arc::new(RingBuffer::new(config.buffer.capacity.max(1)));
        Self::new(config, ring_buffer, still_camera)
    }

    pub fn ring_buffer(&self) -> &Arc<RingBuffer> {
        &self.ring_buffer
    }

    /// Callback for the camera driver; pushes each delivered frame
    pub fn frame_sink(&self) -> impl Fn(FrameData) + Send + Sync + 'static {
        let ring_buffer = Arc::clone(&self.ring_buffer);
        move |frame| ring_buffer.push_frame(frame)
    }

    /// Produce the job for a capture of `kind` targeting `path`
    ///
    /// Normal captures save the newest buffered frame (zero shutter lag),
    /// falling back to a direct exposure when the buffer is empty. Night
    /// captures collect the newest burst. Video captures expect the
    /// recording to already exist at `path`.
    pub async fn trigger(&self, kind: CaptureKind, path: &Path) -> Result<CaptureJob> {
        let job = match kind {
            CaptureKind::Normal => {
                match self.save_latest(path).await {
                    Ok(()) => {}
                    Err(PocketcamError::Processing(ProcessingError::EmptyBuffer)) => {
                        warn!("Frame buffer empty; capturing {} directly", path.display());
                        self.still_camera.capture_still(path).await?;
                    }
                    Err(e) => return Err(e),
                }
                CaptureJob::normal(path)
            }
            CaptureKind::Night => {
                let burst = self.ring_buffer.recent(self.burst_frames);
                debug!("Collected night burst of {} frames", burst.len());
                CaptureJob::night(path, burst)
            }
            CaptureKind::Video => CaptureJob::video(path),
        };

        info!(
            "Capture {:?} -> job {} ({})",
            kind,
            job.id,
            job.path.display()
        );
        Ok(job)
    }

    /// Trigger a capture and hand the job straight to `dispatcher`
    pub async fn capture(
        &self,
        kind: CaptureKind,
        path: &Path,
        dispatcher: &PostProcessingDispatcher,
    ) -> Result<JobHandle> {
        let job = self.trigger(kind, path).await?;
        Ok(dispatcher.submit(job))
    }

    async fn save_latest(&self, path: &Path) -> Result<()> {
        let frame = self
            .ring_buffer
            .latest()
            .ok_or(ProcessingError::EmptyBuffer)?;
        let path: PathBuf = path.to_path_buf();
        let quality = self.jpeg_quality;

        debug!("Saving buffered frame {} to {}", frame.id, path.display());
        tokio::task::spawn_blocking(move || {
            let image = frame.to_rgb_image()?;
            save_image(&image, &path, quality)
        })
        .await
        .map_err(|e| ProcessingError::Worker {
            details: e.to_string(),
        })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameFormat;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::SystemTime;
    use tempfile::TempDir;

    #[derive(Default)]
    struct CountingCamera {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl StillCamera for CountingCamera {
        async fn capture_still(&self, path: &Path) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let image = image::RgbImage::from_pixel(4, 4, image::Rgb([90, 90, 90]));
            save_image(&image, path, 95)
        }
    }

    fn bgra_frame(id: u64) -> FrameData {
        let data = (0..16).flat_map(|_| [10u8, 20, 30, 255]).collect();
        FrameData::new(id, SystemTime::now(), data, 4, 4, FrameFormat::Bgra32)
    }

    fn controller(camera: Arc<CountingCamera>) -> CaptureController {
        let config = PocketcamConfig::default();
        CaptureController::new(&config, Arc::new(RingBuffer::new(10)), camera)
    }

    #[tokio::test]
    async fn test_normal_capture_uses_buffered_frame() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("IMG_1.jpg");
        let camera = Arc::new(CountingCamera::default());
        let controller = controller(Arc::clone(&camera));

        let sink = controller.frame_sink();
        sink(bgra_frame(0));
        sink(bgra_frame(1));

        let job = controller.trigger(CaptureKind::Normal, &path).await.unwrap();
        assert_eq!(job.path, path);
        assert_eq!(camera.calls.load(Ordering::SeqCst), 0);

        let saved = image::open(&path).unwrap().to_rgb8();
        assert_eq!(saved.dimensions(), (4, 4));
        // BGR 10/20/30 reaches disk as RGB 30/20/10 (JPEG tolerance)
        let px = saved.get_pixel(1, 1);
        assert!((px[0] as i32 - 30).abs() <= 4);
        assert!((px[2] as i32 - 10).abs() <= 4);
    }

    #[tokio::test]
    async fn test_normal_capture_falls_back_to_camera() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("IMG_2.jpg");
        let camera = Arc::new(CountingCamera::default());
        let controller = controller(Arc::clone(&camera));

        controller.trigger(CaptureKind::Normal, &path).await.unwrap();
        assert_eq!(camera.calls.load(Ordering::SeqCst), 1);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_night_capture_collects_newest_burst() {
        let camera = Arc::new(CountingCamera::default());
        let controller = controller(camera);
        let sink = controller.frame_sink();
        for id in 0..9 {
            sink(bgra_frame(id));
        }

        let job = controller
            .trigger(CaptureKind::Night, Path::new("/tmp/IMG_night.jpg"))
            .await
            .unwrap();
        match job.mode {
            crate::processing::CaptureMode::Night { burst } => {
                let ids: Vec<u64> = burst.iter().map(|f| f.id).collect();
                assert_eq!(ids, vec![3, 4, 5, 6, 7, 8]);
            }
            other => panic!("unexpected mode {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_capture_submits_to_dispatcher() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("IMG_3.png");
        let camera = Arc::new(CountingCamera::default());
        let config = PocketcamConfig::default();
        let controller = CaptureController::from_config(&config, camera.clone());
        assert_eq!(controller.ring_buffer().capacity(), 10);

        let dispatcher = PostProcessingDispatcher::with_video_backend(
            &config,
            camera,
            Arc::new(crate::stabilize::UnavailableBackend),
        );
        controller.frame_sink()(bgra_frame(7));

        let outcome = controller
            .capture(CaptureKind::Normal, &path, &dispatcher)
            .await
            .unwrap()
            .wait()
            .await;
        assert!(outcome.is_success(), "{:?}", outcome.error);
        assert_eq!(image::open(&path).unwrap().to_rgb8().dimensions(), (4, 4));
    }

    #[tokio::test]
    async fn test_video_capture_creates_job() {
        let controller = controller(Arc::new(CountingCamera::default()));
        let job = controller
            .trigger(CaptureKind::Video, Path::new("/tmp/VID_1.mp4"))
            .await
            .unwrap();
        assert_eq!(job.mode.name(), "video");
    }
}
