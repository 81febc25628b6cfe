//! The mode coordinator.
//!
//! One task owns the inference session, the single active capture and the view state. Commands
//! from [`StreamController`], session events and capture events are all handled on that task, so
//! state changes never interleave. Every change is published to a `watch` channel as a
//! [`SessionView`].

use crate::capture::{
    audio, video, AudioChunk, CaptureError, CaptureEvent, CaptureEventKind, CaptureSink,
    CaptureState, MediaDevices, MediaStream, Playback, PlaybackState, SourceKind,
};
use crate::config::AppConfig;
use crate::emotion::EmotionScoreMap;
use crate::encode::{encode_audio_payload, EncodedFrame, FrameEncoder};
use crate::protocol::{AnalysisMode, InboundMessage, OutboundPayload, ReplyOutcome};
use crate::session::{
    ConnectionState, InferenceSession, SessionConfig, SessionEvent, SessionUpdate,
};
use crate::util::{RetryConfig, RingBuffer};
use serde::Serialize;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

const CHANNEL_CAPACITY: usize = 64;

/// Abandoned requests older than this many reply timeouts are assumed to get no reply.
const LATE_REPLY_WINDOW: u32 = 3;

#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    pub session: SessionConfig,
    pub initial_mode: AnalysisMode,
    pub video_period: Duration,
    pub audio_chunk: Duration,
    /// Chunks held while a reply is outstanding; older ones are dropped first.
    pub max_audio_chunks: usize,
    pub reply_timeout: Duration,
    pub encoder: FrameEncoder,
}

impl CoordinatorConfig {
    pub fn from_app(app: &AppConfig) -> Self {
        let mut session = SessionConfig::new(app.socket_url());
        session.reconnect = RetryConfig {
            max_attempts: app.reconnect_attempts,
            ..RetryConfig::default()
        };
        Self {
            session,
            initial_mode: app.initial_mode,
            video_period: app.video_period.duration(),
            audio_chunk: app.audio_chunk.duration(),
            max_audio_chunks: app.max_audio_buffer.chunks_of(app.audio_chunk),
            reply_timeout: app.reply_timeout.duration(),
            encoder: FrameEncoder::new(app.frame_size.surface(), app.jpeg_quality.get()),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StreamStats {
    pub sent: u64,
    pub replies: u64,
    pub dropped_frames: u64,
    pub dropped_audio: u64,
    pub stale_replies: u64,
    pub timeouts: u64,
}

/// Everything a renderer needs, as of the last state change.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SessionView {
    pub connection: ConnectionState,
    pub connection_error: Option<String>,
    pub mode: AnalysisMode,
    pub source: SourceKind,
    pub capture: CaptureState,
    pub playback: Option<PlaybackState>,
    /// `None` until a reply with predictions arrives, and again after a warning or a reset.
    pub scores: Option<EmotionScoreMap>,
    pub warning: Option<String>,
    pub stats: StreamStats,
}

impl SessionView {
    fn new(mode: AnalysisMode) -> Self {
        Self {
            connection: ConnectionState::Closed,
            connection_error: None,
            mode,
            source: SourceKind::Live,
            capture: CaptureState::Idle,
            playback: None,
            scores: None,
            warning: None,
            stats: StreamStats::default(),
        }
    }

    pub fn status(&self) -> &'static str {
        self.connection.status_label()
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ControlError {
    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error("upload mode needs a file to analyse")]
    MissingUpload,

    #[error("live mode does not take a file; toggle to upload first")]
    UnexpectedUpload,

    #[error("no uploaded file is playing")]
    NoPlayback,

    #[error("coordinator has shut down")]
    Closed,
}

#[derive(Debug)]
enum CommandKind {
    Connect,
    Disconnect,
    ChangeMode(AnalysisMode),
    ToggleSource,
    Start { upload: Option<PathBuf> },
    Stop,
    Play,
    Pause,
    Shutdown,
}

struct Command {
    kind: CommandKind,
    reply: oneshot::Sender<Result<(), ControlError>>,
}

/// Handle for driving a running coordinator. Cheap to clone.
#[derive(Clone, Debug)]
pub struct StreamController {
    commands: mpsc::Sender<Command>,
    view: watch::Receiver<SessionView>,
}

impl StreamController {
    async fn request(&self, kind: CommandKind) -> Result<(), ControlError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command { kind, reply })
            .await
            .map_err(|_| ControlError::Closed)?;
        rx.await.map_err(|_| ControlError::Closed)?
    }

    pub async fn connect(&self) -> Result<(), ControlError> {
        self.request(CommandKind::Connect).await
    }

    pub async fn disconnect(&self) -> Result<(), ControlError> {
        self.request(CommandKind::Disconnect).await
    }

    /// Stops the outgoing mode's capture and clears scores and warning. Capture is not
    /// restarted in the new mode.
    pub async fn change_mode(&self, mode: AnalysisMode) -> Result<(), ControlError> {
        self.request(CommandKind::ChangeMode(mode)).await
    }

    pub async fn toggle_live_or_upload(&self) -> Result<(), ControlError> {
        self.request(CommandKind::ToggleSource).await
    }

    /// Starts live capture for the current mode.
    pub async fn start(&self) -> Result<(), ControlError> {
        self.request(CommandKind::Start { upload: None }).await
    }

    pub async fn start_from_upload(&self, path: PathBuf) -> Result<(), ControlError> {
        self.request(CommandKind::Start { upload: Some(path) }).await
    }

    pub async fn stop(&self) -> Result<(), ControlError> {
        self.request(CommandKind::Stop).await
    }

    pub async fn play(&self) -> Result<(), ControlError> {
        self.request(CommandKind::Play).await
    }

    pub async fn pause(&self) -> Result<(), ControlError> {
        self.request(CommandKind::Pause).await
    }

    /// Stops capture, closes the socket and ends the coordinator task.
    pub async fn shutdown(&self) -> Result<(), ControlError> {
        self.request(CommandKind::Shutdown).await
    }

    pub fn view(&self) -> SessionView {
        self.view.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionView> {
        self.view.clone()
    }
}

struct ActiveCapture {
    generation: u64,
    mode: AnalysisMode,
    stream: MediaStream,
    playback: Option<Playback>,
    task: JoinHandle<()>,
}

impl ActiveCapture {
    fn release(mut self) {
        self.task.abort();
        self.stream.stop();
    }
}

/// The one request allowed on the wire at a time.
#[derive(Clone, Copy, Debug)]
struct InFlight {
    id: u64,
    mode: AnalysisMode,
    sent_at: Instant,
    /// Set when the mode changed or capture stopped after sending; the reply is discarded.
    stale: bool,
}

pub struct Coordinator {
    config: CoordinatorConfig,
    devices: Arc<dyn MediaDevices>,
    session: InferenceSession,
    view: SessionView,
    view_tx: watch::Sender<SessionView>,
    capture: Option<ActiveCapture>,
    capture_tx: mpsc::Sender<CaptureEvent>,
    generation: u64,
    in_flight: Option<InFlight>,
    /// Timed-out requests whose replies may still arrive, oldest first.
    abandoned: VecDeque<InFlight>,
    next_request: u64,
    pending_audio: RingBuffer<AudioChunk>,
}

impl Coordinator {
    pub fn spawn(
        config: CoordinatorConfig,
        devices: Arc<dyn MediaDevices>,
    ) -> (StreamController, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (session_tx, session_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (capture_tx, capture_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let view = SessionView::new(config.initial_mode);
        let (view_tx, view_rx) = watch::channel(view.clone());

        let coordinator = Coordinator {
            session: InferenceSession::new(config.session.clone(), session_tx),
            pending_audio: RingBuffer::new(config.max_audio_chunks),
            config,
            devices,
            view,
            view_tx,
            capture: None,
            capture_tx,
            generation: 0,
            in_flight: None,
            abandoned: VecDeque::new(),
            next_request: 0,
        };

        let handle = tokio::spawn(coordinator.run(command_rx, session_rx, capture_rx));
        let controller = StreamController {
            commands: command_tx,
            view: view_rx,
        };
        (controller, handle)
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut session_events: mpsc::Receiver<SessionEvent>,
        mut capture_events: mpsc::Receiver<CaptureEvent>,
    ) {
        tracing::info!(mode = %self.view.mode, "coordinator started");
        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(Command { kind, reply }) = command else {
                        break;
                    };
                    if matches!(kind, CommandKind::Shutdown) {
                        self.shutdown().await;
                        let _ = reply.send(Ok(()));
                        return;
                    }
                    let result = self.handle_command(kind).await;
                    self.publish();
                    let _ = reply.send(result);
                }
                Some(event) = session_events.recv() => {
                    self.handle_session_event(event).await;
                    self.publish();
                }
                Some(event) = capture_events.recv() => {
                    self.handle_capture_event(event).await;
                    self.publish();
                }
            }
        }
        self.shutdown().await;
    }

    async fn shutdown(&mut self) {
        tracing::info!("coordinator shutting down");
        self.stop_capture();
        self.session.disconnect().await;
        self.publish();
    }

    fn publish(&mut self) {
        self.view.connection = self.session.state();
        self.view_tx.send_replace(self.view.clone());
    }

    async fn handle_command(&mut self, kind: CommandKind) -> Result<(), ControlError> {
        tracing::debug!(command = ?kind, "command received");
        match kind {
            CommandKind::Connect => {
                if !self.session.connect() {
                    tracing::debug!("already connected or connecting");
                }
                Ok(())
            }
            CommandKind::Disconnect => {
                self.stop_capture();
                self.session.begin_close();
                self.publish();
                self.session.disconnect().await;
                self.forget_requests();
                self.view.connection_error = None;
                Ok(())
            }
            CommandKind::ChangeMode(mode) => {
                self.change_mode(mode);
                Ok(())
            }
            CommandKind::ToggleSource => {
                self.stop_capture();
                self.view.source = self.view.source.toggled();
                tracing::info!(source = %self.view.source, "capture source toggled");
                Ok(())
            }
            CommandKind::Start { upload } => {
                match (self.view.source, &upload) {
                    (SourceKind::Live, Some(_)) => return Err(ControlError::UnexpectedUpload),
                    (SourceKind::Upload, None) => return Err(ControlError::MissingUpload),
                    _ => {}
                }
                self.start_capture(upload).await
            }
            CommandKind::Stop => {
                self.stop_capture();
                Ok(())
            }
            CommandKind::Play | CommandKind::Pause => {
                let playback = self
                    .capture
                    .as_ref()
                    .and_then(|c| c.playback.clone())
                    .ok_or(ControlError::NoPlayback)?;
                if matches!(kind, CommandKind::Play) {
                    playback.play();
                } else {
                    playback.pause();
                }
                self.view.playback = Some(playback.state());
                Ok(())
            }
            CommandKind::Shutdown => Ok(()),
        }
    }

    fn change_mode(&mut self, mode: AnalysisMode) {
        if mode == self.view.mode {
            return;
        }
        self.stop_capture();
        self.view.scores = None;
        self.view.warning = None;
        self.view.mode = mode;
        tracing::info!(mode = %mode, "analysis mode changed");
    }

    async fn start_capture(&mut self, upload: Option<PathBuf>) -> Result<(), ControlError> {
        self.stop_capture();

        self.generation += 1;
        let generation = self.generation;
        let mode = self.view.mode;
        self.view.capture = CaptureState::Starting;
        self.publish();
        tracing::info!(generation, mode = %mode, source = %self.view.source, "starting capture");

        let sink = CaptureSink::new(generation, self.capture_tx.clone());
        let devices = self.devices.as_ref();
        let opened = if mode.is_audio() {
            open_audio(devices, &self.config, upload, sink).await
        } else {
            open_video(devices, &self.config, upload, sink).await
        };

        match opened {
            Ok((stream, playback, task)) => {
                self.view.playback = playback.as_ref().map(Playback::state);
                self.view.capture = CaptureState::Active;
                self.capture = Some(ActiveCapture {
                    generation,
                    mode,
                    stream,
                    playback,
                    task,
                });
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, mode = %mode, "capture failed to start");
                self.view.capture = CaptureState::Failed(e.to_string());
                Err(e.into())
            }
        }
    }

    fn release_capture(&mut self) -> bool {
        match self.capture.take() {
            Some(active) => {
                tracing::info!(generation = active.generation, mode = %active.mode, "releasing capture");
                active.release();
                true
            }
            None => false,
        }
    }

    /// Releases the device or pauses the upload, drops buffered audio and resets scores.
    fn stop_capture(&mut self) {
        self.release_capture();
        self.pending_audio.clear();
        if let Some(request) = self.in_flight.as_mut() {
            request.stale = true;
        }
        self.view.capture = CaptureState::Idle;
        self.view.playback = None;
        self.view.scores = None;
    }

    async fn handle_capture_event(&mut self, event: CaptureEvent) {
        let Some((generation, mode)) = self.capture.as_ref().map(|c| (c.generation, c.mode))
        else {
            tracing::debug!(generation = event.generation, "capture event with no active capture");
            return;
        };
        if event.generation != generation {
            tracing::debug!(
                event_generation = event.generation,
                generation,
                "ignoring event from a stopped capture"
            );
            return;
        }

        match event.kind {
            CaptureEventKind::Frame(frame) => self.dispatch_frame(mode, frame).await,
            CaptureEventKind::Audio(chunk) => self.queue_audio(chunk).await,
            CaptureEventKind::Ended => {
                tracing::info!(generation, "upload finished");
                self.release_capture();
                self.view.capture = CaptureState::Idle;
                self.view.playback = Some(PlaybackState::Ended);
            }
            CaptureEventKind::Failed(e) => {
                tracing::warn!(generation, error = %e, "capture failed");
                self.release_capture();
                self.pending_audio.clear();
                self.view.capture = CaptureState::Failed(e.to_string());
                self.view.playback = None;
            }
        }
    }

    async fn dispatch_frame(&mut self, mode: AnalysisMode, frame: EncodedFrame) {
        if !self.session.is_open() {
            self.view.stats.dropped_frames += 1;
            tracing::debug!("socket not open, dropping frame");
            return;
        }
        if !self.ready_to_send() {
            self.view.stats.dropped_frames += 1;
            tracing::debug!("reply outstanding, dropping frame");
            return;
        }
        self.send_tracked(mode, frame.base64).await;
    }

    async fn queue_audio(&mut self, chunk: AudioChunk) {
        if self.pending_audio.push(chunk).is_some() {
            self.view.stats.dropped_audio += 1;
            tracing::debug!("audio buffer full, dropped oldest chunk");
        }
        self.flush_audio().await;
    }

    /// Sends everything buffered as one clip, if the socket is free.
    async fn flush_audio(&mut self) {
        if self.pending_audio.is_empty() || !self.session.is_open() || !self.ready_to_send() {
            return;
        }
        let mode = self.view.mode;
        let chunks = self.pending_audio.drain();
        match encode_audio_payload(&chunks) {
            Ok(data) => self.send_tracked(mode, data).await,
            Err(e) => tracing::warn!(error = %e, chunks = chunks.len(), "audio encoding failed"),
        }
    }

    /// True when nothing is outstanding. A request older than the reply timeout is abandoned.
    fn ready_to_send(&mut self) -> bool {
        match self.in_flight {
            None => true,
            Some(request) if request.sent_at.elapsed() >= self.config.reply_timeout => {
                tracing::warn!(
                    request = request.id,
                    mode = %request.mode,
                    "no reply within {:?}, abandoning request",
                    self.config.reply_timeout
                );
                self.abandoned.push_back(request);
                self.in_flight = None;
                self.view.stats.timeouts += 1;
                true
            }
            Some(_) => false,
        }
    }

    /// Replies to requests sent on a closed socket never arrive.
    fn forget_requests(&mut self) {
        self.in_flight = None;
        self.abandoned.clear();
    }

    /// Pops the oldest abandoned request still waiting for its reply.
    fn take_abandoned(&mut self) -> Option<InFlight> {
        let window = self.config.reply_timeout * LATE_REPLY_WINDOW;
        while let Some(request) = self.abandoned.pop_front() {
            if request.sent_at.elapsed() < window {
                return Some(request);
            }
            tracing::debug!(request = request.id, "abandoned request never answered");
        }
        None
    }

    async fn send_tracked(&mut self, mode: AnalysisMode, data: String) {
        let payload = OutboundPayload::new(mode, data);
        match self.session.send(&payload).await {
            Ok(true) => {
                self.next_request += 1;
                let id = self.next_request;
                self.in_flight = Some(InFlight {
                    id,
                    mode,
                    sent_at: Instant::now(),
                    stale: false,
                });
                self.view.stats.sent += 1;
                tracing::debug!(request = id, mode = %mode, bytes = payload.data.len(), "payload sent");
            }
            Ok(false) => {
                self.view.stats.dropped_frames += 1;
                tracing::debug!("socket not open, payload dropped");
            }
            Err(e) => {
                self.view.stats.dropped_frames += 1;
                tracing::warn!(error = %e, mode = %mode, "send failed");
            }
        }
    }

    async fn handle_session_event(&mut self, event: SessionEvent) {
        let Some(update) = self.session.handle_event(event) else {
            return;
        };
        match update {
            SessionUpdate::Opened => {
                self.view.connection_error = None;
                self.flush_audio().await;
            }
            SessionUpdate::Inbound(text) => self.handle_inbound(&text).await,
            SessionUpdate::Reconnecting { reason } => {
                self.forget_requests();
                self.view.connection_error = Some(reason);
            }
            SessionUpdate::Failed { reason } => {
                self.forget_requests();
                self.view.connection_error = Some(reason);
                if self.capture.is_some() {
                    tracing::info!("connection lost, stopping capture");
                    self.stop_capture();
                }
            }
        }
    }

    async fn handle_inbound(&mut self, text: &str) {
        let message = match InboundMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "ignoring malformed reply");
                return;
            }
        };
        self.view.stats.replies += 1;

        // Replies come back in request order, so a late reply answers the oldest abandoned request.
        if let Some(request) = self.take_abandoned() {
            self.view.stats.stale_replies += 1;
            tracing::debug!(request = request.id, mode = %request.mode, "discarding late reply");
            self.flush_audio().await;
            return;
        }

        let (mode, stale) = match self.in_flight.take() {
            Some(request) => (request.mode, request.stale),
            None => (self.view.mode, false),
        };

        if stale {
            self.view.stats.stale_replies += 1;
            tracing::debug!(mode = %mode, "discarding reply to a superseded request");
        } else {
            match message.outcome_for(mode) {
                ReplyOutcome::Scores(scores) => {
                    tracing::debug!(mode = %mode, emotions = scores.len(), "scores received");
                    self.view.scores = Some(scores);
                    self.view.warning = None;
                }
                ReplyOutcome::Warning(warning) => {
                    tracing::debug!(mode = %mode, warning = %warning, "reply without predictions");
                    self.view.scores = None;
                    self.view.warning = Some(warning);
                }
                ReplyOutcome::Stale => {
                    self.view.stats.stale_replies += 1;
                    tracing::debug!(mode = %mode, "reply for another model discarded");
                }
            }
        }

        self.flush_audio().await;
    }
}

type OpenedCapture = (MediaStream, Option<Playback>, JoinHandle<()>);

async fn open_video(
    devices: &dyn MediaDevices,
    config: &CoordinatorConfig,
    upload: Option<PathBuf>,
    sink: CaptureSink,
) -> Result<OpenedCapture, CaptureError> {
    let feed = match upload {
        Some(path) => devices.open_video_file(path).await?,
        None => devices.open_camera().await?,
    };
    let lp = video::VideoLoop {
        period: config.video_period,
        encoder: config.encoder,
        sink,
    };
    let task = match feed.playback.clone() {
        Some(playback) => tokio::spawn(video::run_playback(feed.frames, playback, lp)),
        None => tokio::spawn(video::run_live(feed.frames, lp)),
    };
    Ok((feed.stream, feed.playback, task))
}

async fn open_audio(
    devices: &dyn MediaDevices,
    config: &CoordinatorConfig,
    upload: Option<PathBuf>,
    sink: CaptureSink,
) -> Result<OpenedCapture, CaptureError> {
    let feed = match upload {
        Some(path) => devices.open_audio_file(path).await?,
        None => devices.open_microphone().await?,
    };
    let task = tokio::spawn(audio::run(
        feed.recorder,
        feed.playback.clone(),
        config.audio_chunk,
        sink,
    ));
    Ok((feed.stream, feed.playback, task))
}
