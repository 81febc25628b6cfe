//! Media capture adapters.
//!
//! A [`MediaDevices`] implementation opens a camera, a microphone, or an uploaded file and
//! hands back a feed. The feed pairs the data source with the [`MediaStream`] that owns the
//! underlying device. The capture loops in [`video`] and [`audio`] turn a feed into
//! [`CaptureEvent`]s for the coordinator.

pub mod audio;
pub mod audio_file;
#[cfg(feature = "ffmpeg-sidecar")]
pub mod ffmpeg;
mod playback;
pub mod video;

use crate::encode::EncodedFrame;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

#[cfg(feature = "ffmpeg-sidecar")]
pub use ffmpeg::FfmpegMediaDevices;
pub use playback::{Playback, PlaybackState};

/// One decoded RGB24 frame, row-major, no padding.
#[derive(Clone, PartialEq, Eq)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    pub rgb: Vec<u8>,
}

impl VideoFrame {
    pub fn expected_len(width: u32, height: u32) -> usize {
        width as usize * height as usize * 3
    }
}

impl fmt::Debug for VideoFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VideoFrame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.rgb.len())
            .finish()
    }
}

/// Mono signed 16-bit PCM.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AudioChunk {
    pub sample_rate: u32,
    pub samples: Vec<i16>,
}

impl AudioChunk {
    pub fn duration(&self) -> Duration {
        duration_from_samples(self.sample_rate, self.samples.len())
    }
}

pub fn duration_from_samples(sample_rate_hz: u32, samples: usize) -> Duration {
    if sample_rate_hz == 0 {
        return Duration::from_secs(0);
    }
    let micros = (u128::from(samples as u64) * 1_000_000u128) / u128::from(sample_rate_hz);
    Duration::from_micros(micros.min(u128::from(u64::MAX)) as u64)
}

pub fn samples_for_duration(sample_rate_hz: u32, length: Duration) -> usize {
    let n = (u128::from(sample_rate_hz) * length.as_micros()) / 1_000_000u128;
    usize::try_from(n).unwrap_or(usize::MAX)
}

#[derive(thiserror::Error, Debug)]
pub enum CaptureError {
    #[error("capture device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("capture device stopped producing data")]
    DeviceLost,

    #[error("media file unreadable: {0}")]
    Unreadable(String),

    #[error("ffmpeg unavailable: {0}")]
    FfmpegUnavailable(String),

    #[error("capture backend not available in this build")]
    Unsupported,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaptureState {
    Idle,
    Starting,
    Active,
    /// Last start or run failed; stays visible until the next start.
    Failed(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceKind {
    Live,
    Upload,
}

impl SourceKind {
    pub fn toggled(self) -> Self {
        match self {
            SourceKind::Live => SourceKind::Upload,
            SourceKind::Upload => SourceKind::Live,
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Live => f.write_str("live"),
            SourceKind::Upload => f.write_str("upload"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackKind {
    Video,
    Audio,
}

/// A single device or decode pipeline backing a stream.
pub trait MediaTrack: Send {
    fn kind(&self) -> TrackKind;

    /// Releases the underlying device. Must be idempotent.
    fn stop(&mut self);
}

/// Owns the tracks of one capture; stopping or dropping it releases all of them.
#[derive(Default)]
pub struct MediaStream {
    tracks: Vec<Box<dyn MediaTrack>>,
}

impl MediaStream {
    pub fn new(tracks: Vec<Box<dyn MediaTrack>>) -> Self {
        Self { tracks }
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn stop(&mut self) {
        for mut track in self.tracks.drain(..) {
            tracing::debug!(kind = ?track.kind(), "stopping media track");
            track.stop();
        }
    }
}

impl Drop for MediaStream {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaStream")
            .field("tracks", &self.tracks.len())
            .finish()
    }
}

pub type FrameReceiver = watch::Receiver<Option<Arc<VideoFrame>>>;

/// Live or decoded video. `frames` always holds the most recent frame, like a playing
/// video element that can be snapshotted at any time.
pub struct VideoFeed {
    pub frames: FrameReceiver,
    pub stream: MediaStream,
    /// Present for uploaded files only.
    pub playback: Option<Playback>,
}

pub trait AudioRecorder: Send {
    /// Records the next `length` of audio. `Ok(None)` means the source has ended.
    fn record(&mut self, length: Duration) -> BoxFuture<'_, Result<Option<AudioChunk>, CaptureError>>;
}

pub struct AudioFeed {
    pub recorder: Box<dyn AudioRecorder>,
    pub stream: MediaStream,
    pub playback: Option<Playback>,
}

pub trait MediaDevices: Send + Sync {
    fn open_camera(&self) -> BoxFuture<'_, Result<VideoFeed, CaptureError>>;

    fn open_video_file(&self, path: PathBuf) -> BoxFuture<'_, Result<VideoFeed, CaptureError>>;

    fn open_microphone(&self) -> BoxFuture<'_, Result<AudioFeed, CaptureError>>;

    fn open_audio_file(&self, path: PathBuf) -> BoxFuture<'_, Result<AudioFeed, CaptureError>> {
        audio_file::open(path).boxed()
    }
}

#[derive(Debug)]
pub enum CaptureEventKind {
    Frame(EncodedFrame),
    Audio(AudioChunk),
    Ended,
    Failed(CaptureError),
}

/// Tagged with the generation of the capture that produced it, so events from a capture
/// that has since been stopped can be recognised and ignored.
#[derive(Debug)]
pub struct CaptureEvent {
    pub generation: u64,
    pub kind: CaptureEventKind,
}

#[derive(Clone, Debug)]
pub struct CaptureSink {
    generation: u64,
    tx: mpsc::Sender<CaptureEvent>,
}

impl CaptureSink {
    pub fn new(generation: u64, tx: mpsc::Sender<CaptureEvent>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns false once nobody is listening.
    pub async fn emit(&self, kind: CaptureEventKind) -> bool {
        self.tx
            .send(CaptureEvent {
                generation: self.generation,
                kind,
            })
            .await
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingTrack {
        stops: Arc<AtomicUsize>,
    }

    impl MediaTrack for CountingTrack {
        fn kind(&self) -> TrackKind {
            TrackKind::Video
        }

        fn stop(&mut self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn stream_stop_releases_each_track_once() {
        let stops = Arc::new(AtomicUsize::new(0));
        let mut stream = MediaStream::new(vec![
            Box::new(CountingTrack {
                stops: stops.clone(),
            }),
            Box::new(CountingTrack {
                stops: stops.clone(),
            }),
        ]);
        assert_eq!(stream.len(), 2);

        stream.stop();
        assert_eq!(stops.load(Ordering::SeqCst), 2);
        assert!(stream.is_empty());

        drop(stream);
        assert_eq!(stops.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn dropping_stream_stops_tracks() {
        let stops = Arc::new(AtomicUsize::new(0));
        let stream = MediaStream::new(vec![Box::new(CountingTrack {
            stops: stops.clone(),
        })]);
        drop(stream);
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn sample_duration_conversions() {
        assert_eq!(samples_for_duration(16_000, Duration::from_millis(500)), 8_000);
        assert_eq!(duration_from_samples(16_000, 8_000), Duration::from_millis(500));
        assert_eq!(duration_from_samples(0, 8_000), Duration::ZERO);

        let chunk = AudioChunk {
            sample_rate: 8_000,
            samples: vec![0; 4_000],
        };
        assert_eq!(chunk.duration(), Duration::from_millis(500));
    }

    #[test]
    fn source_kind_toggles() {
        assert_eq!(SourceKind::Live.toggled(), SourceKind::Upload);
        assert_eq!(SourceKind::Upload.toggled(), SourceKind::Live);
    }
}
