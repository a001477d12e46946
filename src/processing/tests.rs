use super::*;
use crate::capture::StillCamera;
use crate::config::{OutputMode, PocketcamConfig};
use crate::enhance::save_image;
use crate::error::Result;
use crate::frame::{FrameData, FrameFormat};
use crate::stabilize::{MemoryVideoBackend, VideoInfo};
use image::{Rgb, RgbImage};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tempfile::TempDir;

/// Still camera that writes a flat gray image and counts exposures
#[derive(Default)]
struct MockStillCamera {
    calls: AtomicUsize,
    fail: bool,
}

#[async_trait::async_trait]
impl StillCamera for MockStillCamera {
    async fn capture_still(&self, path: &Path) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(crate::error::PocketcamError::component(
                "still_camera",
                "sensor unavailable",
            ));
        }
        save_image(&RgbImage::from_pixel(16, 12, Rgb([100, 110, 120])), path, 95)
    }
}

/// Panics on every call
struct PanickingCamera;

#[async_trait::async_trait]
impl StillCamera for PanickingCamera {
    async fn capture_still(&self, _path: &Path) -> Result<()> {
        panic!("camera driver crashed");
    }
}

fn textured_frame(id: u64, width: u32, height: u32) -> FrameData {
    let mut data = Vec::with_capacity((width * height * 3) as usize);
    for y in 0..height {
        for x in 0..width {
            let v = ((x * 13 + y * 29) % 200 + 20) as u8;
            data.extend_from_slice(&[v, v / 2, 255 - v]);
        }
    }
    FrameData::new(id, SystemTime::now(), data, width, height, FrameFormat::Rgb24)
}

fn dispatcher_with(
    camera: Arc<dyn StillCamera>,
    config: &PocketcamConfig,
) -> (PostProcessingDispatcher, MemoryVideoBackend) {
    let video = MemoryVideoBackend::new();
    let dispatcher =
        PostProcessingDispatcher::with_video_backend(config, camera, Arc::new(video.clone()));
    (dispatcher, video)
}

#[tokio::test]
async fn test_normal_job_enhances_in_place() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("IMG_1.png");
    let original = RgbImage::from_fn(8, 8, |x, y| Rgb([(x * 20) as u8, (y * 20) as u8, 90]));
    original.save(&path).unwrap();

    let (dispatcher, _) = dispatcher_with(
        Arc::new(MockStillCamera::default()),
        &PocketcamConfig::default(),
    );
    let outcome = dispatcher.submit(CaptureJob::normal(&path)).wait().await;

    assert!(outcome.is_success(), "{:?}", outcome.error);
    assert_eq!(outcome.pipeline, PipelineKind::Normal);
    assert_eq!(outcome.path, path);

    let enhanced = image::open(&path).unwrap().to_rgb8();
    assert_eq!(enhanced.dimensions(), (8, 8));
    assert_ne!(enhanced, original);
    assert_eq!(dispatcher.stats().succeeded, 1);
}

#[tokio::test]
async fn test_night_job_stacks_burst() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("IMG_night.png");
    let burst: Vec<FrameData> = (0..8).map(|i| textured_frame(i, 32, 24)).collect();

    let camera = Arc::new(MockStillCamera::default());
    let (dispatcher, _) = dispatcher_with(camera.clone(), &PocketcamConfig::default());
    let outcome = dispatcher.submit(CaptureJob::night(&path, burst)).wait().await;

    assert!(outcome.is_success(), "{:?}", outcome.error);
    assert_eq!(outcome.pipeline, PipelineKind::Night);
    assert_eq!(camera.calls.load(Ordering::SeqCst), 0);

    let written = image::open(&path).unwrap().to_rgb8();
    assert_eq!(written.dimensions(), (32, 24));
}

#[tokio::test]
async fn test_empty_night_burst_uses_direct_capture() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("IMG_fallback.jpg");

    let camera = Arc::new(MockStillCamera::default());
    let (dispatcher, _) = dispatcher_with(camera.clone(), &PocketcamConfig::default());
    let outcome = dispatcher
        .submit(CaptureJob::night(&path, Vec::new()))
        .wait()
        .await;

    assert!(outcome.is_success(), "{:?}", outcome.error);
    assert_eq!(outcome.pipeline, PipelineKind::NightFallback);
    assert_eq!(camera.calls.load(Ordering::SeqCst), 1);
    assert_eq!(image::open(&path).unwrap().to_rgb8().dimensions(), (16, 12));
}

#[tokio::test]
async fn test_failed_capture_still_reports_outcome() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("IMG_fail.jpg");

    let camera = Arc::new(MockStillCamera {
        calls: AtomicUsize::new(0),
        fail: true,
    });
    let (dispatcher, _) = dispatcher_with(camera, &PocketcamConfig::default());
    let outcome = dispatcher
        .submit(CaptureJob::night(&path, Vec::new()))
        .wait()
        .await;

    assert!(!outcome.is_success());
    assert_eq!(outcome.pipeline, PipelineKind::NightFallback);
    assert!(outcome.error.unwrap().contains("sensor unavailable"));

    let stats = dispatcher.stats();
    assert_eq!(stats.submitted, 1);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.in_flight(), 0);
}

#[tokio::test]
async fn test_missing_file_fails_job() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("missing.jpg");

    let (dispatcher, _) = dispatcher_with(
        Arc::new(MockStillCamera::default()),
        &PocketcamConfig::default(),
    );
    let outcome = dispatcher.submit(CaptureJob::normal(&path)).wait().await;

    assert!(!outcome.is_success());
    assert_eq!(outcome.pipeline, PipelineKind::Normal);
}

#[tokio::test]
async fn test_panicking_worker_reports_failure() {
    let (dispatcher, _) = dispatcher_with(Arc::new(PanickingCamera), &PocketcamConfig::default());
    let outcome = dispatcher
        .submit(CaptureJob::night("/tmp/never.jpg", Vec::new()))
        .wait()
        .await;

    assert!(!outcome.is_success());
    // The panic happened inside the direct-capture path
    assert_eq!(outcome.pipeline, PipelineKind::NightFallback);
    assert!(outcome.error.unwrap().contains("Worker failed"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_submit_from_thread_outside_runtime() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("IMG_ui.png");
    RgbImage::from_pixel(6, 6, Rgb([40, 80, 120])).save(&path).unwrap();

    let (dispatcher, _) = dispatcher_with(
        Arc::new(MockStillCamera::default()),
        &PocketcamConfig::default(),
    );
    let dispatcher = Arc::new(dispatcher);

    let submitter = Arc::clone(&dispatcher);
    let job_path = path.clone();
    let handle = std::thread::spawn(move || submitter.submit(CaptureJob::normal(job_path)))
        .join()
        .expect("submit must not panic off the runtime");

    let outcome = handle.wait().await;
    assert!(outcome.is_success(), "{:?}", outcome.error);
    assert_eq!(outcome.path, path);
    assert_eq!(dispatcher.stats().succeeded, 1);
}

#[test]
fn test_dispatcher_built_without_runtime_fails_jobs() {
    let dispatcher = PostProcessingDispatcher::with_video_backend(
        &PocketcamConfig::default(),
        Arc::new(MockStillCamera::default()),
        Arc::new(MemoryVideoBackend::new()),
    );
    let handle = dispatcher.submit(CaptureJob::normal("/tmp/IMG_orphan.jpg"));

    let runtime = tokio::runtime::Runtime::new().unwrap();
    let outcome = runtime.block_on(handle.wait());
    assert!(!outcome.is_success());
    assert!(outcome.error.unwrap().contains("no tokio runtime"));
    assert_eq!(dispatcher.stats().failed, 1);
}

#[test]
fn test_dispatcher_with_explicit_runtime() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("IMG_rt.png");
    RgbImage::from_pixel(6, 6, Rgb([10, 20, 30])).save(&path).unwrap();

    let dispatcher = PostProcessingDispatcher::with_runtime(
        &PocketcamConfig::default(),
        Arc::new(MockStillCamera::default()),
        Arc::new(MemoryVideoBackend::new()),
        runtime.handle().clone(),
    );
    let handle = dispatcher.submit(CaptureJob::normal(&path));
    let outcome = runtime.block_on(handle.wait());
    assert!(outcome.is_success(), "{:?}", outcome.error);
}

#[tokio::test]
async fn test_static_video_is_pixel_identical() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("VID_static.mp4");
    let frames: Vec<FrameData> = (0..5).map(|i| textured_frame(i, 24, 16)).collect();

    let (dispatcher, video) = dispatcher_with(
        Arc::new(MockStillCamera::default()),
        &PocketcamConfig::default(),
    );
    video.insert(&path, Some(VideoInfo::new(24, 16, 30, 1)), frames.clone());

    let outcome = dispatcher.submit(CaptureJob::video(&path)).wait().await;
    assert!(outcome.is_success(), "{:?}", outcome.error);
    assert_eq!(outcome.pipeline, PipelineKind::Video);
    assert_eq!(outcome.path, path);

    let written = video.frames(&path).unwrap();
    assert_eq!(written.len(), frames.len());
    for (out, input) in written.iter().zip(&frames) {
        assert_eq!(out.data, input.data);
    }
    assert_eq!(video.info(&path), Some(VideoInfo::new(24, 16, 30, 1)));
}

#[tokio::test]
async fn test_sibling_output_mode() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("VID_x.mp4");
    let mut config = PocketcamConfig::default();
    config.stabilization.output_mode = OutputMode::Sibling;

    let (dispatcher, video) = dispatcher_with(Arc::new(MockStillCamera::default()), &config);
    video.insert(
        &path,
        Some(VideoInfo::new(12, 12, 25, 1)),
        (0..3).map(|i| textured_frame(i, 12, 12)).collect(),
    );

    let outcome = dispatcher.submit(CaptureJob::video(&path)).wait().await;
    let expected = dir.path().join("VID_x_stabilized.mp4");
    assert!(outcome.is_success(), "{:?}", outcome.error);
    assert_eq!(outcome.path, expected);
    assert_eq!(video.frames(&expected).unwrap().len(), 3);
    assert_eq!(video.frames(&path).unwrap().len(), 3);
}

#[tokio::test]
async fn test_zero_frame_video_writes_empty_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("VID_empty.mp4");

    let (dispatcher, video) = dispatcher_with(
        Arc::new(MockStillCamera::default()),
        &PocketcamConfig::default(),
    );
    video.insert(&path, None, Vec::new());

    let outcome = dispatcher.submit(CaptureJob::video(&path)).wait().await;
    assert!(outcome.is_success(), "{:?}", outcome.error);
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
}

#[tokio::test]
async fn test_cancelled_dispatcher_fails_jobs() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("IMG_c.png");
    RgbImage::from_pixel(4, 4, Rgb([1, 2, 3])).save(&path).unwrap();

    let (dispatcher, _) = dispatcher_with(
        Arc::new(MockStillCamera::default()),
        &PocketcamConfig::default(),
    );
    dispatcher.shutdown();
    assert!(dispatcher.cancellation_token().is_cancelled());

    let outcome = dispatcher.submit(CaptureJob::normal(&path)).wait().await;
    assert!(!outcome.is_success());
    assert!(outcome.error.unwrap().contains("cancelled"));
}

#[tokio::test]
async fn test_unavailable_video_backend_reports_failure() {
    let dispatcher = PostProcessingDispatcher::with_video_backend(
        &PocketcamConfig::default(),
        Arc::new(MockStillCamera::default()),
        Arc::new(crate::stabilize::UnavailableBackend),
    );
    let outcome = dispatcher
        .submit(CaptureJob::video("/tmp/VID_none.mp4"))
        .wait()
        .await;

    assert!(!outcome.is_success());
    assert_eq!(outcome.pipeline, PipelineKind::Video);
    assert_eq!(dispatcher.video_backend(), "unavailable");
}
