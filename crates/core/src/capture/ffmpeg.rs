//! Camera, microphone and video-file capture through ffmpeg child processes.
//!
//! Each feed runs one ffmpeg process that writes raw frames (rgb24) or raw samples (s16le) to
//! stdout. A reader task owns stdout and publishes into the feed. The process is killed when
//! its track is stopped or dropped.

use crate::capture::audio_file::playback_track;
use crate::capture::{
    samples_for_duration, AudioChunk, AudioFeed, AudioRecorder, CaptureError, MediaDevices,
    MediaStream, MediaTrack, Playback, PlaybackState, TrackKind, VideoFeed, VideoFrame,
};
use crate::config::DeviceConfig;
use crate::encode::DrawingSurface;
use ffmpeg_sidecar::{download, paths::ffmpeg_path};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

pub const MIC_SAMPLE_RATE: u32 = 16_000;
const MIC_BLOCK: Duration = Duration::from_millis(100);
const DEFAULT_SOURCE_FPS: u32 = 15;
const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
pub struct FfmpegMediaDevices {
    devices: DeviceConfig,
    surface: DrawingSurface,
    source_fps: u32,
    startup_timeout: Duration,
}

impl FfmpegMediaDevices {
    pub fn new(devices: DeviceConfig, surface: DrawingSurface) -> Self {
        Self {
            devices,
            surface,
            source_fps: DEFAULT_SOURCE_FPS,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
        }
    }

    pub fn with_source_fps(mut self, fps: u32) -> Self {
        self.source_fps = fps.max(1);
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    async fn ensure_ffmpeg_available() -> Result<(), CaptureError> {
        tokio::task::spawn_blocking(download::auto_download)
            .await
            .map_err(|e| CaptureError::FfmpegUnavailable(e.to_string()))?
            .map_err(|e| CaptureError::FfmpegUnavailable(e.to_string()))
    }

    async fn open_video(
        &self,
        args: Vec<String>,
        pacing: Option<Playback>,
    ) -> Result<VideoFeed, CaptureError> {
        Self::ensure_ffmpeg_available().await?;
        let mut process = FfmpegProcess::spawn(&args)?;
        let stdout = process.take_stdout()?;

        let (frame_tx, frames) = watch::channel(None);
        let (ready_tx, ready_rx) = oneshot::channel();
        let reader = tokio::spawn(read_frames(
            stdout,
            self.surface,
            frame_tx,
            pacing.clone().map(|pb| (pb, frame_interval(self.source_fps))),
            ready_tx,
        ));

        let track = process.into_track(TrackKind::Video, reader);
        let track = wait_for_startup(track, ready_rx, self.startup_timeout).await?;

        let mut tracks: Vec<Box<dyn MediaTrack>> = vec![Box::new(track)];
        if let Some(pb) = &pacing {
            tracks.push(playback_track(TrackKind::Video, pb.clone()));
        }
        Ok(VideoFeed {
            frames,
            stream: MediaStream::new(tracks),
            playback: pacing,
        })
    }
}

impl MediaDevices for FfmpegMediaDevices {
    fn open_camera(&self) -> BoxFuture<'_, Result<VideoFeed, CaptureError>> {
        async move {
            tracing::info!(camera = %self.devices.camera, format = %self.devices.video_format, "opening camera");
            self.open_video(camera_args(&self.devices, self.surface, self.source_fps), None)
                .await
        }
        .boxed()
    }

    fn open_video_file(&self, path: PathBuf) -> BoxFuture<'_, Result<VideoFeed, CaptureError>> {
        async move {
            if !path.is_file() {
                return Err(CaptureError::Unreadable(format!(
                    "{}: no such file",
                    path.display()
                )));
            }
            tracing::info!(path = %path.display(), "opening video file");
            let playback = Playback::new(PlaybackState::Playing);
            self.open_video(
                video_file_args(&path, self.surface, self.source_fps),
                Some(playback),
            )
            .await
        }
        .boxed()
    }

    fn open_microphone(&self) -> BoxFuture<'_, Result<AudioFeed, CaptureError>> {
        async move {
            tracing::info!(microphone = %self.devices.microphone, format = %self.devices.audio_format, "opening microphone");
            Self::ensure_ffmpeg_available().await?;
            let mut process = FfmpegProcess::spawn(&microphone_args(&self.devices, MIC_SAMPLE_RATE))?;
            let stdout = process.take_stdout()?;

            let (block_tx, block_rx) = mpsc::channel(64);
            let (ready_tx, ready_rx) = oneshot::channel();
            let reader = tokio::spawn(read_samples(
                stdout,
                samples_for_duration(MIC_SAMPLE_RATE, MIC_BLOCK),
                block_tx,
                ready_tx,
            ));

            let track = process.into_track(TrackKind::Audio, reader);
            let track = wait_for_startup(track, ready_rx, self.startup_timeout).await?;
            Ok(AudioFeed {
                recorder: Box::new(FfmpegRecorder::new(MIC_SAMPLE_RATE, block_rx)),
                stream: MediaStream::new(vec![Box::new(track)]),
                playback: None,
            })
        }
        .boxed()
    }
}

fn frame_interval(fps: u32) -> Duration {
    Duration::from_secs(1) / fps.max(1)
}

fn base_args() -> Vec<String> {
    ["-hide_banner", "-nostdin", "-loglevel", "error"]
        .into_iter()
        .map(str::to_owned)
        .collect()
}

fn rawvideo_output(args: &mut Vec<String>, surface: DrawingSurface, fps: u32) {
    args.extend([
        "-an".to_owned(),
        "-vf".to_owned(),
        format!("fps={fps},scale={}:{}", surface.width, surface.height),
        "-pix_fmt".to_owned(),
        "rgb24".to_owned(),
        "-f".to_owned(),
        "rawvideo".to_owned(),
        "pipe:1".to_owned(),
    ]);
}

pub fn camera_args(devices: &DeviceConfig, surface: DrawingSurface, fps: u32) -> Vec<String> {
    let mut args = base_args();
    args.extend([
        "-f".to_owned(),
        devices.video_format.clone(),
        "-i".to_owned(),
        devices.camera.clone(),
    ]);
    rawvideo_output(&mut args, surface, fps.max(1));
    args
}

pub fn video_file_args(path: &Path, surface: DrawingSurface, fps: u32) -> Vec<String> {
    let mut args = base_args();
    args.extend(["-i".to_owned(), path.display().to_string()]);
    rawvideo_output(&mut args, surface, fps.max(1));
    args
}

pub fn microphone_args(devices: &DeviceConfig, sample_rate: u32) -> Vec<String> {
    let mut args = base_args();
    args.extend([
        "-f".to_owned(),
        devices.audio_format.clone(),
        "-i".to_owned(),
        devices.microphone.clone(),
        "-vn".to_owned(),
        "-ac".to_owned(),
        "1".to_owned(),
        "-ar".to_owned(),
        sample_rate.to_string(),
        "-f".to_owned(),
        "s16le".to_owned(),
        "pipe:1".to_owned(),
    ]);
    args
}

pub fn s16le_to_samples(raw: &[u8]) -> Vec<i16> {
    raw.chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect()
}

struct FfmpegProcess {
    child: Child,
    stderr_tail: Arc<Mutex<String>>,
    stderr_task: Option<JoinHandle<()>>,
}

impl FfmpegProcess {
    fn spawn(args: &[String]) -> Result<Self, CaptureError> {
        tracing::debug!(args = ?args, "spawning ffmpeg");
        let mut child = tokio::process::Command::new(ffmpeg_path())
            .args(args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CaptureError::FfmpegUnavailable(e.to_string()))?;

        let stderr_tail = Arc::new(Mutex::new(String::new()));
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(drain_stderr(stderr, stderr_tail.clone())));

        Ok(Self {
            child,
            stderr_tail,
            stderr_task,
        })
    }

    fn take_stdout(&mut self) -> Result<tokio::process::ChildStdout, CaptureError> {
        self.child.stdout.take().ok_or_else(|| {
            CaptureError::FfmpegUnavailable("ffmpeg stdout unavailable (pipe not created)".to_owned())
        })
    }

    fn into_track(self, kind: TrackKind, reader: JoinHandle<()>) -> FfmpegTrack {
        let mut tasks = vec![reader];
        tasks.extend(self.stderr_task);
        FfmpegTrack {
            kind,
            child: Some(self.child),
            tasks,
            stderr_tail: self.stderr_tail,
        }
    }
}

async fn drain_stderr(stderr: ChildStderr, tail: Arc<Mutex<String>>) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim().to_owned();
        if line.is_empty() {
            continue;
        }
        tracing::debug!(target: "ffmpeg", "{line}");
        if let Ok(mut last) = tail.lock() {
            *last = line;
        }
    }
}

pub struct FfmpegTrack {
    kind: TrackKind,
    child: Option<Child>,
    tasks: Vec<JoinHandle<()>>,
    stderr_tail: Arc<Mutex<String>>,
}

impl FfmpegTrack {
    fn last_error(&self) -> String {
        let tail = self
            .stderr_tail
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default();
        if tail.is_empty() {
            "ffmpeg exited before producing output".to_owned()
        } else {
            tail
        }
    }
}

impl MediaTrack for FfmpegTrack {
    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.start_kill() {
                tracing::debug!(error = %e, "ffmpeg already exited");
            }
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for FfmpegTrack {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn wait_for_startup(
    mut track: FfmpegTrack,
    ready: oneshot::Receiver<()>,
    timeout: Duration,
) -> Result<FfmpegTrack, CaptureError> {
    let reason = match tokio::time::timeout(timeout, ready).await {
        Ok(Ok(())) => return Ok(track),
        Ok(Err(_)) => {
            // Give the stderr drain a moment to record why ffmpeg quit.
            tokio::time::sleep(Duration::from_millis(50)).await;
            track.last_error()
        }
        Err(_) => format!("no data within {timeout:?}"),
    };
    track.stop();
    tracing::warn!(kind = ?track.kind, reason = %reason, "capture device failed to start");
    Err(CaptureError::DeviceUnavailable(reason))
}

async fn read_frames<R: AsyncRead + Unpin>(
    mut stdout: R,
    surface: DrawingSurface,
    frames: watch::Sender<Option<Arc<VideoFrame>>>,
    pacing: Option<(Playback, Duration)>,
    ready: oneshot::Sender<()>,
) {
    let mut ready = Some(ready);
    let mut buf = vec![0u8; VideoFrame::expected_len(surface.width, surface.height)];

    loop {
        if let Some((playback, _)) = &pacing {
            if playback.wait_until_playing().await == PlaybackState::Ended {
                break;
            }
        }
        if let Err(e) = stdout.read_exact(&mut buf).await {
            tracing::debug!(error = %e, "video stream closed");
            break;
        }
        frames.send_replace(Some(Arc::new(VideoFrame {
            width: surface.width,
            height: surface.height,
            rgb: buf.clone(),
        })));
        if let Some(tx) = ready.take() {
            let _ = tx.send(());
        }
        if let Some((_, interval)) = &pacing {
            tokio::time::sleep(*interval).await;
        }
    }

    if let Some((playback, _)) = &pacing {
        playback.end();
    }
}

async fn read_samples<R: AsyncRead + Unpin>(
    mut stdout: R,
    block_samples: usize,
    blocks: mpsc::Sender<Vec<i16>>,
    ready: oneshot::Sender<()>,
) {
    let mut ready = Some(ready);
    let mut buf = vec![0u8; block_samples.max(1) * 2];

    loop {
        if let Err(e) = stdout.read_exact(&mut buf).await {
            tracing::debug!(error = %e, "audio stream closed");
            return;
        }
        if blocks.send(s16le_to_samples(&buf)).await.is_err() {
            return;
        }
        if let Some(tx) = ready.take() {
            let _ = tx.send(());
        }
    }
}

/// Assembles fixed-length chunks from the microphone's 100 ms blocks.
pub struct FfmpegRecorder {
    sample_rate: u32,
    blocks: mpsc::Receiver<Vec<i16>>,
    carry: Vec<i16>,
}

impl FfmpegRecorder {
    pub fn new(sample_rate: u32, blocks: mpsc::Receiver<Vec<i16>>) -> Self {
        Self {
            sample_rate,
            blocks,
            carry: Vec::new(),
        }
    }
}

impl AudioRecorder for FfmpegRecorder {
    fn record(&mut self, length: Duration) -> BoxFuture<'_, Result<Option<AudioChunk>, CaptureError>> {
        async move {
            let wanted = samples_for_duration(self.sample_rate, length).max(1);
            while self.carry.len() < wanted {
                match self.blocks.recv().await {
                    Some(block) => self.carry.extend(block),
                    None if self.carry.is_empty() => return Err(CaptureError::DeviceLost),
                    None => break,
                }
            }
            let take = wanted.min(self.carry.len());
            let samples: Vec<i16> = self.carry.drain(..take).collect();
            Ok(Some(AudioChunk {
                sample_rate: self.sample_rate,
                samples,
            }))
        }
        .boxed()
    }
}
