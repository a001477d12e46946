//! Video decode/encode seams.
//!
//! Stabilization only sees [`VideoReader`] and [`VideoWriter`]. On Linux with
//! the `video_encoding` feature the GStreamer backend decodes any container
//! `decodebin` understands and encodes H.264 into MP4; the in-memory backend
//! serves tests and embedders that already hold decoded frames.

use crate::error::{Result, VideoError};
use crate::frame::FrameData;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Stream geometry and frame rate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    pub fps_num: i32,
    pub fps_den: i32,
}

impl VideoInfo {
    pub fn new(width: u32, height: u32, fps_num: i32, fps_den: i32) -> Self {
        Self {
            width,
            height,
            fps_num,
            fps_den,
        }
    }

    /// Duration of one frame in nanoseconds, 30 fps when the rate is unknown
    pub fn frame_duration_ns(&self) -> u64 {
        if self.fps_num <= 0 || self.fps_den <= 0 {
            return 1_000_000_000 / 30;
        }
        1_000_000_000u64 * self.fps_den as u64 / self.fps_num as u64
    }
}

/// Sequential frame source
pub trait VideoReader {
    /// Stream info, `None` when the stream holds no frames
    fn info(&self) -> Option<VideoInfo>;

    fn next_frame(&mut self) -> Result<Option<FrameData>>;
}

/// Sequential frame sink
pub trait VideoWriter {
    fn write_frame(&mut self, frame: &FrameData) -> Result<()>;

    /// Flush and close the output; no frames may follow
    fn finish(&mut self) -> Result<()>;
}

/// Opens readers and writers by path
pub trait VideoBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn open_reader(&self, path: &Path) -> Result<Box<dyn VideoReader>>;

    fn create_writer(&self, path: &Path, info: VideoInfo) -> Result<Box<dyn VideoWriter>>;
}

/// Default backend for this build
pub fn default_backend(bitrate_kbps: u32) -> Arc<dyn VideoBackend> {
    #[cfg(all(feature = "video_encoding", target_os = "linux"))]
    {
        Arc::new(gst::GstVideoBackend::new(bitrate_kbps))
    }

    #[cfg(not(all(feature = "video_encoding", target_os = "linux")))]
    {
        let _ = bitrate_kbps;
        Arc::new(UnavailableBackend)
    }
}

/// Backend for builds without video support
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableBackend;

impl VideoBackend for UnavailableBackend {
    fn name(&self) -> &'static str {
        "unavailable"
    }

    fn open_reader(&self, _path: &Path) -> Result<Box<dyn VideoReader>> {
        Err(VideoError::Unavailable.into())
    }

    fn create_writer(&self, _path: &Path, _info: VideoInfo) -> Result<Box<dyn VideoWriter>> {
        Err(VideoError::Unavailable.into())
    }
}

#[derive(Debug, Clone)]
struct StoredVideo {
    info: Option<VideoInfo>,
    frames: Vec<FrameData>,
}

type VideoStore = Arc<Mutex<HashMap<PathBuf, StoredVideo>>>;

/// Keeps decoded videos in memory, keyed by path
#[derive(Debug, Default, Clone)]
pub struct MemoryVideoBackend {
    store: VideoStore,
}

impl MemoryVideoBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<P: Into<PathBuf>>(&self, path: P, info: Option<VideoInfo>, frames: Vec<FrameData>) {
        self.store
            .lock()
            .insert(path.into(), StoredVideo { info, frames });
    }

    /// Frames last written to `path`
    pub fn frames(&self, path: &Path) -> Option<Vec<FrameData>> {
        self.store.lock().get(path).map(|v| v.frames.clone())
    }

    pub fn info(&self, path: &Path) -> Option<VideoInfo> {
        self.store.lock().get(path).and_then(|v| v.info)
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.store.lock().contains_key(path)
    }
}

impl VideoBackend for MemoryVideoBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn open_reader(&self, path: &Path) -> Result<Box<dyn VideoReader>> {
        let video = self
            .store
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| VideoError::Decode {
                details: format!("no video stored at {}", path.display()),
            })?;
        Ok(Box::new(MemoryVideoReader::new(video.info, video.frames)))
    }

    fn create_writer(&self, path: &Path, info: VideoInfo) -> Result<Box<dyn VideoWriter>> {
        Ok(Box::new(MemoryVideoWriter {
            path: path.to_path_buf(),
            info,
            frames: Vec::new(),
            finished: false,
            store: Arc::clone(&self.store),
        }))
    }
}

/// Reader over frames already in memory
#[derive(Debug)]
pub struct MemoryVideoReader {
    info: Option<VideoInfo>,
    frames: VecDeque<FrameData>,
}

impl MemoryVideoReader {
    pub fn new(info: Option<VideoInfo>, frames: Vec<FrameData>) -> Self {
        Self {
            info,
            frames: frames.into(),
        }
    }
}

impl VideoReader for MemoryVideoReader {
    fn info(&self) -> Option<VideoInfo> {
        self.info
    }

    fn next_frame(&mut self) -> Result<Option<FrameData>> {
        Ok(self.frames.pop_front())
    }
}

/// Writer that publishes its frames to the backend store on finish
#[derive(Debug)]
pub struct MemoryVideoWriter {
    path: PathBuf,
    info: VideoInfo,
    frames: Vec<FrameData>,
    finished: bool,
    store: VideoStore,
}

impl VideoWriter for MemoryVideoWriter {
    fn write_frame(&mut self, frame: &FrameData) -> Result<()> {
        if self.finished {
            return Err(VideoError::Encode {
                details: "writer already finished".to_string(),
            }
            .into());
        }
        if frame.dimensions() != (self.info.width, self.info.height) {
            return Err(VideoError::Encode {
                details: format!(
                    "frame {}x{} does not match stream {}x{}",
                    frame.width, frame.height, self.info.width, self.info.height
                ),
            }
            .into());
        }
        self.frames.push(frame.clone());
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if !self.finished {
            self.finished = true;
            self.store.lock().insert(
                self.path.clone(),
                StoredVideo {
                    info: Some(self.info),
                    frames: std::mem::take(&mut self.frames),
                },
            );
        }
        Ok(())
    }
}

/// Move a finished encode over `target`, or discard it
///
/// An unfinalized MP4 is unplayable, so without end-of-stream the partial
/// file is removed and `target` keeps its previous contents.
#[cfg_attr(
    not(all(feature = "video_encoding", target_os = "linux")),
    allow(dead_code)
)]
fn commit_partial(partial: &Path, target: &Path, finalized: bool) -> Result<()> {
    if !finalized {
        let _ = std::fs::remove_file(partial);
        return Err(VideoError::Encode {
            details: format!(
                "encoder did not reach end of stream for {}",
                target.display()
            ),
        }
        .into());
    }
    std::fs::rename(partial, target)?;
    Ok(())
}

/// Niceness of encoder threads
#[cfg(target_os = "linux")]
const ENCODER_NICE: libc::c_int = 10;

/// Run `work` on a dedicated thread reniced to [`ENCODER_NICE`]
///
/// Niceness is per thread on Linux, so the caller's priority is untouched.
#[cfg(target_os = "linux")]
#[cfg_attr(not(feature = "video_encoding"), allow(dead_code))]
fn run_at_low_priority<T, F>(name: &str, work: F) -> Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let _ = unsafe { libc::setpriority(libc::PRIO_PROCESS as _, 0, ENCODER_NICE) };
            work()
        })
        .map_err(|e| VideoError::Pipeline {
            details: format!("Failed to spawn {} thread: {}", name, e),
        })?
        .join()
        .map_err(|_| {
            VideoError::Pipeline {
                details: format!("{} thread panicked", name),
            }
            .into()
        })
}

#[cfg(all(feature = "video_encoding", target_os = "linux"))]
pub use gst::{GstVideoBackend, GstVideoReader, GstVideoWriter};

#[cfg(all(feature = "video_encoding", target_os = "linux"))]
mod gst {
    use super::{
        commit_partial, run_at_low_priority, VideoBackend, VideoInfo, VideoReader, VideoWriter,
    };
    use crate::error::{Result, VideoError};
    use crate::frame::{FrameData, FrameFormat};
    use gstreamer::prelude::*;
    use gstreamer::Pipeline;
    use gstreamer_app::{AppSink, AppSrc};
    use std::path::{Path, PathBuf};
    use std::time::SystemTime;
    use tracing::{debug, info, warn};

    fn init() -> Result<()> {
        gstreamer::init().map_err(|e| {
            VideoError::Pipeline {
                details: format!("Failed to initialize GStreamer: {}", e),
            }
            .into()
        })
    }

    fn launch(description: &str) -> Result<Pipeline> {
        gstreamer::parse::launch(description)
            .map_err(|e| VideoError::Pipeline {
                details: format!("Failed to create pipeline: {}", e),
            })?
            .downcast::<Pipeline>()
            .map_err(|_| {
                VideoError::Pipeline {
                    details: "Failed to downcast to pipeline".to_string(),
                }
                .into()
            })
    }

    fn element(pipeline: &Pipeline, name: &str) -> Result<gstreamer::Element> {
        pipeline.by_name(name).ok_or_else(|| {
            VideoError::Pipeline {
                details: format!("Failed to get {} element", name),
            }
            .into()
        })
    }

    /// Decodes any `decodebin`-supported file into BGR frames
    #[derive(Debug, Clone, Copy)]
    pub struct GstVideoBackend {
        bitrate_kbps: u32,
    }

    impl GstVideoBackend {
        pub fn new(bitrate_kbps: u32) -> Self {
            Self { bitrate_kbps }
        }
    }

    impl VideoBackend for GstVideoBackend {
        fn name(&self) -> &'static str {
            "gstreamer"
        }

        fn open_reader(&self, path: &Path) -> Result<Box<dyn VideoReader>> {
            Ok(Box::new(GstVideoReader::open(path)?))
        }

        fn create_writer(&self, path: &Path, info: VideoInfo) -> Result<Box<dyn VideoWriter>> {
            Ok(Box::new(GstVideoWriter::create(
                path,
                info,
                self.bitrate_kbps,
            )?))
        }
    }

    pub struct GstVideoReader {
        pipeline: Pipeline,
        appsink: AppSink,
        info: Option<VideoInfo>,
        pending: Option<FrameData>,
        next_id: u64,
    }

    impl GstVideoReader {
        pub fn open(path: &Path) -> Result<Self> {
            init()?;
            if !path.exists() {
                return Err(VideoError::Decode {
                    details: format!("{} does not exist", path.display()),
                }
                .into());
            }

            let pipeline = launch(
                "filesrc name=src ! decodebin ! videoconvert ! \
                 video/x-raw,format=BGRx ! appsink name=sink sync=false",
            )?;
            element(&pipeline, "src")?.set_property("location", path.to_string_lossy().as_ref());
            let appsink = element(&pipeline, "sink")?
                .downcast::<AppSink>()
                .map_err(|_| VideoError::Pipeline {
                    details: "Failed to downcast to AppSink".to_string(),
                })?;

            pipeline
                .set_state(gstreamer::State::Playing)
                .map_err(|e| VideoError::Pipeline {
                    details: format!("Failed to start decode pipeline: {}", e),
                })?;

            let mut reader = Self {
                pipeline,
                appsink,
                info: None,
                pending: None,
                next_id: 0,
            };

            // Pull the first frame now so the stream info is known up front
            reader.pending = reader.pull()?;
            debug!(
                "Opened {} for decoding ({:?})",
                path.display(),
                reader.info
            );
            Ok(reader)
        }

        fn pull(&mut self) -> Result<Option<FrameData>> {
            let sample = match self.appsink.pull_sample() {
                Ok(sample) => sample,
                Err(_) if self.appsink.is_eos() => return Ok(None),
                Err(_) => return Err(self.bus_error()),
            };

            let caps = sample.caps().ok_or_else(|| VideoError::Decode {
                details: "No caps in sample".to_string(),
            })?;
            let video_info =
                gstreamer_video::VideoInfo::from_caps(caps).map_err(|e| VideoError::Decode {
                    details: format!("Failed to get video info: {}", e),
                })?;
            let buffer = sample.buffer().ok_or_else(|| VideoError::Decode {
                details: "No buffer in sample".to_string(),
            })?;
            let map = buffer.map_readable().map_err(|e| VideoError::Decode {
                details: format!("Failed to map buffer: {}", e),
            })?;

            let width = video_info.width() as usize;
            let height = video_info.height() as usize;
            let stride = video_info.stride()[0] as usize;
            let bytes = map.as_slice();
            if bytes.len() < stride * (height.saturating_sub(1)) + width * 4 {
                return Err(VideoError::Decode {
                    details: format!("short buffer: {} bytes", bytes.len()),
                }
                .into());
            }

            let mut data = Vec::with_capacity(width * height * 3);
            for row in 0..height {
                let line = &bytes[row * stride..row * stride + width * 4];
                for px in line.chunks_exact(4) {
                    data.extend_from_slice(&px[..3]);
                }
            }

            let fps = video_info.fps();
            self.info.get_or_insert(VideoInfo::new(
                width as u32,
                height as u32,
                fps.numer(),
                fps.denom(),
            ));

            let id = self.next_id;
            self.next_id += 1;
            Ok(Some(FrameData::new(
                id,
                SystemTime::now(),
                data,
                width as u32,
                height as u32,
                FrameFormat::Bgr24,
            )))
        }

        fn bus_error(&self) -> crate::error::PocketcamError {
            if let Some(bus) = self.pipeline.bus() {
                while let Some(msg) = bus.pop() {
                    if let gstreamer::MessageView::Error(err) = msg.view() {
                        return VideoError::Decode {
                            details: format!(
                                "{} ({})",
                                err.error(),
                                err.debug().unwrap_or_default()
                            ),
                        }
                        .into();
                    }
                }
            }
            VideoError::Decode {
                details: "Decoder stopped before end of stream".to_string(),
            }
            .into()
        }
    }

    impl VideoReader for GstVideoReader {
        fn info(&self) -> Option<VideoInfo> {
            self.info
        }

        fn next_frame(&mut self) -> Result<Option<FrameData>> {
            match self.pending.take() {
                Some(frame) => Ok(Some(frame)),
                None => self.pull(),
            }
        }
    }

    impl Drop for GstVideoReader {
        fn drop(&mut self) {
            let _ = self.pipeline.set_state(gstreamer::State::Null);
        }
    }

    /// Encodes BGR frames to H.264 in MP4
    ///
    /// Output goes to a partial file that replaces `path` only after the
    /// muxer has finalized, so the target never holds a truncated video.
    pub struct GstVideoWriter {
        pipeline: Pipeline,
        appsrc: AppSrc,
        info: VideoInfo,
        frame_index: u64,
        final_path: PathBuf,
        partial_path: PathBuf,
        finished: bool,
    }

    impl GstVideoWriter {
        pub fn create(path: &Path, info: VideoInfo, bitrate_kbps: u32) -> Result<Self> {
            init()?;

            let (fps_num, fps_den) = if info.fps_num > 0 && info.fps_den > 0 {
                (info.fps_num, info.fps_den)
            } else {
                (30, 1)
            };
            // Pushes block once a few frames are queued ahead of the encoder
            let queue_bytes = info.width as u64 * info.height as u64 * 4 * QUEUED_FRAMES;
            let description = format!(
                "appsrc name=src format=time is-live=false block=true max-bytes={} \
                 caps=video/x-raw,format=BGRx,width={},height={},framerate={}/{} ! \
                 videoconvert ! video/x-raw,format=I420 ! \
                 x264enc speed-preset=medium bitrate={} key-int-max=60 ! \
                 h264parse ! mp4mux faststart=true ! filesink name=sink",
                queue_bytes, info.width, info.height, fps_num, fps_den, bitrate_kbps
            );

            let partial_path = partial_path_for(path);
            let location = partial_path.to_string_lossy().into_owned();

            // Streaming threads are started from the low-priority thread
            let (pipeline, appsrc) = run_at_low_priority("pocketcam-encode", move || {
                let pipeline = launch(&description)?;
                element(&pipeline, "sink")?.set_property("location", location.as_str());
                let appsrc = element(&pipeline, "src")?
                    .downcast::<AppSrc>()
                    .map_err(|_| VideoError::Pipeline {
                        details: "Failed to downcast to AppSrc".to_string(),
                    })?;

                pipeline
                    .set_state(gstreamer::State::Playing)
                    .map_err(|e| VideoError::Pipeline {
                        details: format!("Failed to start encode pipeline: {}", e),
                    })?;
                Ok::<_, crate::error::PocketcamError>((pipeline, appsrc))
            })??;

            info!(
                "Started encoding pipeline for {} ({}x{} @ {}/{})",
                path.display(),
                info.width,
                info.height,
                fps_num,
                fps_den
            );

            Ok(Self {
                pipeline,
                appsrc,
                info: VideoInfo::new(info.width, info.height, fps_num, fps_den),
                frame_index: 0,
                final_path: path.to_path_buf(),
                partial_path,
                finished: false,
            })
        }
    }

    /// Frames appsrc may hold before `push_buffer` blocks
    const QUEUED_FRAMES: u64 = 4;

    /// Longest silence on the bus while draining before giving up
    const DRAIN_TIMEOUT_SECS: u64 = 60;

    fn partial_path_for(path: &Path) -> PathBuf {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "video.mp4".to_string());
        path.with_file_name(format!(".{}.partial", name))
    }

    fn to_bgrx(frame: &FrameData) -> Vec<u8> {
        let channels = frame.channels();
        let (r, b) = if frame.format.is_bgr() { (2, 0) } else { (0, 2) };
        let mut out = Vec::with_capacity(frame.width as usize * frame.height as usize * 4);
        for px in frame.data.chunks_exact(channels) {
            out.extend_from_slice(&[px[b], px[1], px[r], 0xff]);
        }
        out
    }

    impl VideoWriter for GstVideoWriter {
        fn write_frame(&mut self, frame: &FrameData) -> Result<()> {
            if self.finished {
                return Err(VideoError::Encode {
                    details: "writer already finished".to_string(),
                }
                .into());
            }
            if frame.dimensions() != (self.info.width, self.info.height) {
                return Err(VideoError::Encode {
                    details: format!(
                        "frame {}x{} does not match stream {}x{}",
                        frame.width, frame.height, self.info.width, self.info.height
                    ),
                }
                .into());
            }

            let duration = self.info.frame_duration_ns();
            let mut buffer = gstreamer::Buffer::from_mut_slice(to_bgrx(frame));
            {
                let buffer = buffer.make_mut();
                buffer.set_pts(gstreamer::ClockTime::from_nseconds(
                    self.frame_index * duration,
                ));
                buffer.set_duration(gstreamer::ClockTime::from_nseconds(duration));
            }

            self.appsrc.push_buffer(buffer).map_err(|e| VideoError::Encode {
                details: format!("Failed to push buffer: {:?}", e),
            })?;

            self.frame_index += 1;
            if self.frame_index % 30 == 0 {
                debug!("Encoded {} frames", self.frame_index);
            }
            Ok(())
        }

        fn finish(&mut self) -> Result<()> {
            if self.finished {
                return Ok(());
            }
            self.finished = true;

            self.appsrc.end_of_stream().map_err(|e| VideoError::Encode {
                details: format!("Failed to signal EOS: {:?}", e),
            })?;

            let bus = self.pipeline.bus().ok_or_else(|| VideoError::Pipeline {
                details: "Pipeline has no bus".to_string(),
            })?;
            let mut finalized = false;
            for msg in bus.iter_timed(gstreamer::ClockTime::from_seconds(DRAIN_TIMEOUT_SECS)) {
                match msg.view() {
                    gstreamer::MessageView::Eos(..) => {
                        finalized = true;
                        break;
                    }
                    gstreamer::MessageView::Error(err) => {
                        let _ = self.pipeline.set_state(gstreamer::State::Null);
                        let _ = std::fs::remove_file(&self.partial_path);
                        return Err(VideoError::Encode {
                            details: format!(
                                "{} ({})",
                                err.error(),
                                err.debug().unwrap_or_default()
                            ),
                        }
                        .into());
                    }
                    _ => {}
                }
            }

            if !finalized {
                warn!(
                    "No end of stream from encoder for {} within {}s",
                    self.final_path.display(),
                    DRAIN_TIMEOUT_SECS
                );
            }

            if let Err(e) = self.pipeline.set_state(gstreamer::State::Null) {
                let _ = std::fs::remove_file(&self.partial_path);
                return Err(VideoError::Pipeline {
                    details: format!("Failed to stop encode pipeline: {}", e),
                }
                .into());
            }
            commit_partial(&self.partial_path, &self.final_path, finalized)?;
            info!(
                "Encoded {} frames to {}",
                self.frame_index,
                self.final_path.display()
            );
            Ok(())
        }
    }

    impl Drop for GstVideoWriter {
        fn drop(&mut self) {
            if !self.finished {
                warn!(
                    "Encoder for {} dropped before finish; discarding output",
                    self.final_path.display()
                );
                let _ = self.pipeline.set_state(gstreamer::State::Null);
                let _ = std::fs::remove_file(&self.partial_path);
            }
        }
    }
}
