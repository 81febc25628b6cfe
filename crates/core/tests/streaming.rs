//! End-to-end runs of the coordinator against an in-process stand-in for the streaming
//! models endpoint, with fake capture devices.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use emotion_stream_core::capture::{
    samples_for_duration, AudioChunk, AudioFeed, AudioRecorder, CaptureError, CaptureState,
    MediaDevices, MediaStream, MediaTrack, Playback, PlaybackState, SourceKind, TrackKind,
    VideoFeed, VideoFrame,
};
use emotion_stream_core::coordinator::{
    Coordinator, CoordinatorConfig, SessionView, StreamController,
};
use emotion_stream_core::encode::{DrawingSurface, FrameEncoder};
use emotion_stream_core::protocol::AnalysisMode;
use emotion_stream_core::session::SessionConfig;
use emotion_stream_core::util::RetryConfig;
use futures::future::BoxFuture;
use futures::{FutureExt, SinkExt, StreamExt};
use serde_json::Value;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

const WAIT: Duration = Duration::from_secs(5);

type Responder = Arc<dyn Fn(&Value) -> Option<(Duration, String)> + Send + Sync>;

struct MockService {
    url: Url,
    received: mpsc::UnboundedReceiver<Value>,
    connections: Arc<AtomicUsize>,
}

impl MockService {
    async fn start(responder: Responder, drop_first_connection: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (tx, received) = mpsc::unbounded_channel();
        let connections = Arc::new(AtomicUsize::new(0));

        let accepted = connections.clone();
        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                let index = accepted.fetch_add(1, Ordering::SeqCst);
                let responder = responder.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let Ok(mut ws) = tokio_tungstenite::accept_async(tcp).await else {
                        return;
                    };
                    while let Some(Ok(msg)) = ws.next().await {
                        let Message::Text(text) = msg else {
                            continue;
                        };
                        let payload: Value =
                            serde_json::from_str(text.as_str()).expect("payload is json");
                        let _ = tx.send(payload.clone());
                        if drop_first_connection && index == 0 {
                            let _ = ws.close(None).await;
                            return;
                        }
                        if let Some((delay, reply)) = responder(&payload) {
                            tokio::time::sleep(delay).await;
                            if ws.send(Message::Text(reply.into())).await.is_err() {
                                return;
                            }
                        }
                    }
                });
            }
        });

        let url = Url::parse(&format!("ws://{addr}/v0/stream/models?api_key=test")).expect("url");
        Self {
            url,
            received,
            connections,
        }
    }

    async fn next_payload(&mut self) -> Value {
        tokio::time::timeout(WAIT, self.received.recv())
            .await
            .expect("payload in time")
            .expect("service running")
    }

    fn drain(&mut self) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(payload) = self.received.try_recv() {
            out.push(payload);
        }
        out
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WireEvent {
    Request(usize),
    Reply(usize),
}

/// Reads and answers on separate tasks, so requests keep arriving while a reply is delayed.
/// Replies go out in request order, each no earlier than `delay_for(n)` after request `n`.
struct PipelinedService {
    url: Url,
    log: Arc<Mutex<Vec<WireEvent>>>,
}

impl PipelinedService {
    async fn start(reply: &'static str, delay_for: fn(usize) -> Duration) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let log = Arc::new(Mutex::new(Vec::new()));

        let writer_log = log.clone();
        tokio::spawn(async move {
            let Ok((tcp, _)) = listener.accept().await else {
                return;
            };
            let Ok(ws) = tokio_tungstenite::accept_async(tcp).await else {
                return;
            };
            let (mut sink, mut stream) = ws.split();
            let (tx, mut pending) = mpsc::unbounded_channel::<(usize, Instant)>();

            let reader_log = writer_log.clone();
            tokio::spawn(async move {
                let mut index = 0;
                while let Some(Ok(msg)) = stream.next().await {
                    if !matches!(msg, Message::Text(_)) {
                        continue;
                    }
                    index += 1;
                    reader_log
                        .lock()
                        .expect("log")
                        .push(WireEvent::Request(index));
                    if tx.send((index, Instant::now())).is_err() {
                        return;
                    }
                }
            });

            while let Some((index, arrived)) = pending.recv().await {
                tokio::time::sleep_until(arrived + delay_for(index)).await;
                writer_log.lock().expect("log").push(WireEvent::Reply(index));
                if sink.send(Message::Text(reply.to_owned().into())).await.is_err() {
                    return;
                }
            }
        });

        let url = Url::parse(&format!("ws://{addr}/v0/stream/models?api_key=test")).expect("url");
        Self { url, log }
    }

    fn events(&self) -> Vec<WireEvent> {
        self.log.lock().expect("log").clone()
    }
}

fn model_of(payload: &Value) -> Option<String> {
    payload["models"]
        .as_object()
        .and_then(|models| models.keys().next().cloned())
}

fn reply_to(model: &'static str, reply: &'static str, delay: Duration) -> Responder {
    Arc::new(move |payload: &Value| {
        (model_of(payload).as_deref() == Some(model)).then(|| (delay, reply.to_owned()))
    })
}

/// Answers any model with a single-emotion prediction keyed by that model.
fn echo_scores(name: &'static str, score: f64) -> Responder {
    Arc::new(move |payload: &Value| {
        let model = model_of(payload)?;
        let reply = format!(
            r#"{{"{model}":{{"predictions":[{{"emotions":[{{"name":"{name}","score":{score}}}]}}]}}}}"#
        );
        Some((Duration::ZERO, reply))
    })
}

/// Like [`echo_scores`], but holds the first reply back for `delay`.
fn slow_first_reply(delay: Duration) -> Responder {
    let answered = Arc::new(AtomicUsize::new(0));
    let echo = echo_scores("Calmness", 0.3);
    Arc::new(move |payload: &Value| {
        let (_, reply) = echo(payload)?;
        let first = answered.fetch_add(1, Ordering::SeqCst) == 0;
        Some((if first { delay } else { Duration::ZERO }, reply))
    })
}

fn silent() -> Responder {
    Arc::new(|_: &Value| -> Option<(Duration, String)> { None })
}

struct CountingTrack {
    kind: TrackKind,
    stops: Arc<AtomicUsize>,
    _frames: Option<watch::Sender<Option<Arc<VideoFrame>>>>,
    playback: Option<Playback>,
}

impl MediaTrack for CountingTrack {
    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn stop(&mut self) {
        if let Some(playback) = &self.playback {
            playback.pause();
        }
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

const CHUNK: Duration = Duration::from_millis(40);
const CHUNK_SAMPLES: usize = 640;

/// Every sample of the n-th chunk is `n`, so a payload shows which chunks it carries.
#[derive(Default)]
struct NumberedMicrophone {
    recorded: i16,
}

impl AudioRecorder for NumberedMicrophone {
    fn record(
        &mut self,
        length: Duration,
    ) -> BoxFuture<'_, Result<Option<AudioChunk>, CaptureError>> {
        async move {
            tokio::time::sleep(length).await;
            self.recorded += 1;
            Ok(Some(AudioChunk {
                sample_rate: 16_000,
                samples: vec![self.recorded; samples_for_duration(16_000, length)],
            }))
        }
        .boxed()
    }
}

/// Chunk numbers carried by an audio payload, in order.
fn chunk_numbers(payload: &Value) -> Vec<i16> {
    let wav = BASE64
        .decode(payload["data"].as_str().expect("data string"))
        .expect("base64");
    let reader = hound::WavReader::new(Cursor::new(wav)).expect("wav");
    assert_eq!(reader.spec().channels, 1);
    let samples: Vec<i16> = reader
        .into_samples::<i16>()
        .collect::<Result<_, _>>()
        .expect("samples");
    assert_eq!(samples.len() % CHUNK_SAMPLES, 0, "whole chunks only");
    samples
        .chunks(CHUNK_SAMPLES)
        .map(|chunk| {
            assert!(chunk.iter().all(|s| *s == chunk[0]), "chunk kept intact");
            chunk[0]
        })
        .collect()
}

#[derive(Default)]
struct FakeDevices {
    video_stops: Arc<AtomicUsize>,
    audio_stops: Arc<AtomicUsize>,
}

impl FakeDevices {
    fn video_feed(&self, playback: Option<Playback>) -> VideoFeed {
        let frame = VideoFrame {
            width: 8,
            height: 8,
            rgb: vec![128; VideoFrame::expected_len(8, 8)],
        };
        let (tx, frames) = watch::channel(Some(Arc::new(frame)));
        VideoFeed {
            frames,
            stream: MediaStream::new(vec![Box::new(CountingTrack {
                kind: TrackKind::Video,
                stops: self.video_stops.clone(),
                _frames: Some(tx),
                playback: playback.clone(),
            })]),
            playback,
        }
    }
}

impl MediaDevices for FakeDevices {
    fn open_camera(&self) -> BoxFuture<'_, Result<VideoFeed, CaptureError>> {
        async move { Ok(self.video_feed(None)) }.boxed()
    }

    fn open_video_file(&self, _path: PathBuf) -> BoxFuture<'_, Result<VideoFeed, CaptureError>> {
        async move { Ok(self.video_feed(Some(Playback::new(PlaybackState::Playing)))) }.boxed()
    }

    fn open_microphone(&self) -> BoxFuture<'_, Result<AudioFeed, CaptureError>> {
        async move {
            Ok(AudioFeed {
                recorder: Box::<NumberedMicrophone>::default(),
                stream: MediaStream::new(vec![Box::new(CountingTrack {
                    kind: TrackKind::Audio,
                    stops: self.audio_stops.clone(),
                    _frames: None,
                    playback: None,
                })]),
                playback: None,
            })
        }
        .boxed()
    }
}

fn coordinator_config(url: Url, mode: AnalysisMode) -> CoordinatorConfig {
    let mut session = SessionConfig::new(url);
    session.reconnect = RetryConfig {
        max_attempts: 3,
        initial_delay: Duration::from_millis(20),
        backoff_multiplier: 2.0,
        max_delay: Duration::from_millis(200),
    };
    CoordinatorConfig {
        session,
        initial_mode: mode,
        video_period: Duration::from_millis(40),
        audio_chunk: CHUNK,
        max_audio_chunks: 10,
        reply_timeout: Duration::from_secs(5),
        encoder: FrameEncoder::new(DrawingSurface::new(8, 8), 80),
    }
}

async fn wait_for_view(
    controller: &StreamController,
    mut pred: impl FnMut(&SessionView) -> bool,
) -> SessionView {
    let mut rx = controller.subscribe();
    let view = tokio::time::timeout(WAIT, rx.wait_for(|v| pred(v)))
        .await
        .expect("view reached expected state in time")
        .expect("coordinator running");
    view.clone()
}

async fn connected(controller: &StreamController) {
    controller.connect().await.expect("connect");
    wait_for_view(controller, |v| v.status() == "Connected").await;
}

#[tokio::test]
async fn face_frame_reply_populates_scores() {
    let mut service = MockService::start(
        reply_to(
            "face",
            r#"{"face":{"predictions":[{"emotions":[{"name":"Joy","score":0.8}]}]}}"#,
            Duration::ZERO,
        ),
        false,
    )
    .await;
    let devices = Arc::new(FakeDevices::default());
    let (controller, _task) =
        Coordinator::spawn(coordinator_config(service.url.clone(), AnalysisMode::Face), devices);

    connected(&controller).await;
    controller.start().await.expect("camera");

    let payload = service.next_payload().await;
    assert_eq!(payload["models"], serde_json::json!({"face": {}}));
    let data = payload["data"].as_str().expect("data string");
    assert!(!data.starts_with("data:"));
    let jpeg = BASE64.decode(data).expect("base64");
    assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);

    let view = wait_for_view(&controller, |v| v.scores.is_some()).await;
    let scores = view.scores.expect("scores");
    assert_eq!(scores.len(), 1);
    assert_eq!(scores.get("Joy"), Some(0.8));
    assert!(view.warning.is_none());
}

#[tokio::test]
async fn prosody_warning_clears_scores() {
    let mut service = MockService::start(
        reply_to(
            "prosody",
            r#"{"prosody":{"warning":"No speech detected"}}"#,
            Duration::ZERO,
        ),
        false,
    )
    .await;
    let devices = Arc::new(FakeDevices::default());
    let (controller, _task) = Coordinator::spawn(
        coordinator_config(service.url.clone(), AnalysisMode::Prosody),
        devices,
    );

    connected(&controller).await;
    controller.start().await.expect("microphone");

    let payload = service.next_payload().await;
    assert_eq!(model_of(&payload).as_deref(), Some("prosody"));
    let wav = BASE64
        .decode(payload["data"].as_str().expect("data string"))
        .expect("base64");
    assert_eq!(&wav[..4], b"RIFF");

    let view = wait_for_view(&controller, |v| v.warning.is_some()).await;
    assert!(view.scores.is_none());
    assert_eq!(view.warning.as_deref(), Some("No speech detected"));
}

#[tokio::test]
async fn switching_face_to_burst_releases_camera_and_stops_face_sends() {
    let mut service = MockService::start(echo_scores("Joy", 0.8), false).await;
    let devices = Arc::new(FakeDevices::default());
    let video_stops = devices.video_stops.clone();
    let (controller, _task) =
        Coordinator::spawn(coordinator_config(service.url.clone(), AnalysisMode::Face), devices);

    connected(&controller).await;
    controller.start().await.expect("camera");
    wait_for_view(&controller, |v| v.scores.is_some()).await;

    controller
        .change_mode(AnalysisMode::Burst)
        .await
        .expect("mode change");
    assert_eq!(video_stops.load(Ordering::SeqCst), 1);

    let view = controller.view();
    assert_eq!(view.mode, AnalysisMode::Burst);
    assert_eq!(view.capture, CaptureState::Idle);
    assert!(view.scores.is_none());
    assert!(view.warning.is_none());

    tokio::time::sleep(Duration::from_millis(100)).await;
    service.drain();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(
        service.drain().is_empty(),
        "nothing is sent after the switch until capture restarts"
    );

    controller.start().await.expect("microphone");
    let first = service.next_payload().await;
    assert_eq!(model_of(&first).as_deref(), Some("burst"));
    tokio::time::sleep(Duration::from_millis(300)).await;
    let later = service.drain();
    assert!(!later.is_empty(), "burst capture keeps sending");
    assert!(later
        .iter()
        .all(|payload| model_of(payload).as_deref() == Some("burst")));
    assert_eq!(video_stops.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn toggling_source_releases_live_tracks() {
    let service = MockService::start(silent(), false).await;
    let devices = Arc::new(FakeDevices::default());
    let audio_stops = devices.audio_stops.clone();
    let (controller, _task) = Coordinator::spawn(
        coordinator_config(service.url.clone(), AnalysisMode::Burst),
        devices,
    );

    controller.start().await.expect("microphone");
    assert_eq!(controller.view().capture, CaptureState::Active);

    controller.toggle_live_or_upload().await.expect("toggle");
    assert_eq!(audio_stops.load(Ordering::SeqCst), 1);
    let view = controller.view();
    assert_eq!(view.source, SourceKind::Upload);
    assert_eq!(view.mode, AnalysisMode::Burst);
    assert_eq!(view.capture, CaptureState::Idle);
}

#[tokio::test]
async fn frames_are_dropped_while_a_reply_is_outstanding() {
    let mut service = MockService::start(silent(), false).await;
    let devices = Arc::new(FakeDevices::default());
    let (controller, _task) =
        Coordinator::spawn(coordinator_config(service.url.clone(), AnalysisMode::Face), devices);

    connected(&controller).await;
    controller.start().await.expect("camera");
    service.next_payload().await;

    let view = wait_for_view(&controller, |v| v.stats.dropped_frames >= 3).await;
    assert_eq!(view.stats.sent, 1);
    assert!(service.drain().is_empty());
}

#[tokio::test]
async fn reply_to_superseded_request_is_discarded() {
    let mut service = MockService::start(
        reply_to(
            "face",
            r#"{"face":{"predictions":[{"emotions":[{"name":"Joy","score":0.8}]}]}}"#,
            Duration::from_millis(300),
        ),
        false,
    )
    .await;
    let devices = Arc::new(FakeDevices::default());
    let (controller, _task) =
        Coordinator::spawn(coordinator_config(service.url.clone(), AnalysisMode::Face), devices);

    connected(&controller).await;
    controller.start().await.expect("camera");
    service.next_payload().await;
    controller
        .change_mode(AnalysisMode::Prosody)
        .await
        .expect("mode change");

    let view = wait_for_view(&controller, |v| v.stats.stale_replies == 1).await;
    assert!(view.scores.is_none());
    assert_eq!(view.mode, AnalysisMode::Prosody);
}

#[tokio::test]
async fn dropped_connection_reconnects_without_stopping_capture() {
    let mut service = MockService::start(
        reply_to(
            "face",
            r#"{"face":{"predictions":[{"emotions":[{"name":"Calmness","score":0.4}]}]}}"#,
            Duration::ZERO,
        ),
        true,
    )
    .await;
    let devices = Arc::new(FakeDevices::default());
    let video_stops = devices.video_stops.clone();
    let (controller, _task) =
        Coordinator::spawn(coordinator_config(service.url.clone(), AnalysisMode::Face), devices);

    connected(&controller).await;
    controller.start().await.expect("camera");
    service.next_payload().await;

    let view = wait_for_view(&controller, |v| v.scores.is_some()).await;
    assert_eq!(view.scores.and_then(|s| s.get("Calmness")), Some(0.4));
    assert_eq!(view.capture, CaptureState::Active);
    assert!(service.connections.load(Ordering::SeqCst) >= 2);
    assert_eq!(video_stops.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn paused_upload_sends_nothing() {
    let mut service = MockService::start(
        reply_to(
            "face",
            r#"{"face":{"predictions":[{"emotions":[{"name":"Joy","score":0.5}]}]}}"#,
            Duration::ZERO,
        ),
        false,
    )
    .await;
    let devices = Arc::new(FakeDevices::default());
    let (controller, _task) =
        Coordinator::spawn(coordinator_config(service.url.clone(), AnalysisMode::Face), devices);

    connected(&controller).await;
    controller.toggle_live_or_upload().await.expect("toggle");
    controller
        .start_from_upload(PathBuf::from("clip.mp4"))
        .await
        .expect("upload");
    assert_eq!(controller.view().playback, Some(PlaybackState::Playing));
    service.next_payload().await;

    controller.pause().await.expect("pause");
    assert_eq!(controller.view().playback, Some(PlaybackState::Paused));
    tokio::time::sleep(Duration::from_millis(100)).await;
    service.drain();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(service.drain().is_empty());

    controller.play().await.expect("play");
    let payload = service.next_payload().await;
    assert_eq!(model_of(&payload).as_deref(), Some("face"));
}

#[tokio::test]
async fn disconnect_stops_capture() {
    let service = MockService::start(silent(), false).await;
    let devices = Arc::new(FakeDevices::default());
    let video_stops = devices.video_stops.clone();
    let (controller, _task) =
        Coordinator::spawn(coordinator_config(service.url.clone(), AnalysisMode::Face), devices);

    connected(&controller).await;
    controller.start().await.expect("camera");
    controller.disconnect().await.expect("disconnect");

    let view = controller.view();
    assert_eq!(view.status(), "Disconnected");
    assert_eq!(view.capture, CaptureState::Idle);
    assert_eq!(video_stops.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn late_reply_after_timeout_is_not_credited_to_the_next_request() {
    const REPLY: &str = r#"{"face":{"predictions":[{"emotions":[{"name":"Joy","score":0.8}]}]}}"#;
    let service = PipelinedService::start(REPLY, |request| {
        if request == 1 {
            Duration::from_millis(300)
        } else {
            Duration::from_millis(40)
        }
    })
    .await;
    let devices = Arc::new(FakeDevices::default());
    let mut config = coordinator_config(service.url.clone(), AnalysisMode::Face);
    config.video_period = Duration::from_millis(20);
    config.reply_timeout = Duration::from_millis(200);
    let (controller, _task) = Coordinator::spawn(config, devices);

    connected(&controller).await;
    controller.start().await.expect("camera");

    let view = wait_for_view(&controller, |v| v.stats.replies >= 8).await;
    assert_eq!(view.stats.timeouts, 1);
    assert_eq!(view.stats.stale_replies, 1, "the late reply is discarded");
    assert_eq!(view.scores.and_then(|s| s.get("Joy")), Some(0.8));

    // Request 2 replaced the abandoned request 1; from there on each request waits for the
    // reply to the one before it.
    let events = service.events();
    let position = |event| events.iter().position(|e| *e == event);
    let mut checked = 0;
    for k in 2.. {
        let Some(next) = position(WireEvent::Request(k + 1)) else {
            break;
        };
        let reply = position(WireEvent::Reply(k)).expect("reply precedes the next request");
        assert!(reply < next, "request {} sent before reply {k}: {events:?}", k + 1);
        checked += 1;
    }
    assert!(checked >= 5, "{events:?}");
}

#[tokio::test]
async fn audio_buffered_during_a_reply_goes_out_as_one_clip() {
    let mut service = MockService::start(slow_first_reply(Duration::from_millis(250)), false).await;
    let devices = Arc::new(FakeDevices::default());
    let (controller, _task) = Coordinator::spawn(
        coordinator_config(service.url.clone(), AnalysisMode::Prosody),
        devices,
    );

    connected(&controller).await;
    controller.start().await.expect("microphone");

    let first = service.next_payload().await;
    assert_eq!(chunk_numbers(&first), vec![1]);

    let second = service.next_payload().await;
    assert_eq!(model_of(&second).as_deref(), Some("prosody"));
    let numbers = chunk_numbers(&second);
    assert!(numbers.len() >= 3, "chunks piled up behind the reply: {numbers:?}");
    let expected: Vec<i16> = (2..2 + numbers.len() as i16).collect();
    assert_eq!(numbers, expected);

    let view = wait_for_view(&controller, |v| v.stats.sent >= 2).await;
    assert_eq!(view.stats.dropped_audio, 0);
}

#[tokio::test]
async fn full_audio_buffer_drops_the_oldest_chunks() {
    let mut service = MockService::start(slow_first_reply(Duration::from_millis(600)), false).await;
    let devices = Arc::new(FakeDevices::default());
    let mut config = coordinator_config(service.url.clone(), AnalysisMode::Burst);
    config.max_audio_chunks = 3;
    let (controller, _task) = Coordinator::spawn(config, devices);

    connected(&controller).await;
    controller.start().await.expect("microphone");

    assert_eq!(chunk_numbers(&service.next_payload().await), vec![1]);
    let numbers = chunk_numbers(&service.next_payload().await);
    assert_eq!(numbers.len(), 3);
    let oldest = numbers[0];
    assert!(oldest > 2, "older chunks were dropped: {numbers:?}");
    assert_eq!(numbers, vec![oldest, oldest + 1, oldest + 2]);

    // Chunks 2 through oldest-1 were pushed out of the buffer.
    let view = wait_for_view(&controller, |v| v.stats.dropped_audio >= (oldest - 2) as u64).await;
    assert_eq!(view.stats.dropped_audio, (oldest - 2) as u64);
}
