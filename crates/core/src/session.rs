//! The inference session: one WebSocket to the streaming models endpoint.
//!
//! A background task owns the read half and the (re)connect loop. Every connection attempt
//! started by [`InferenceSession::connect`] gets a fresh epoch, and each [`SessionEvent`] carries
//! the epoch it belongs to, so events from a torn-down connection are recognised and ignored.
//! The write half is handed to the session through [`SessionEvent::Opened`].

use crate::protocol::{OutboundPayload, ProtocolError};
use crate::util::{is_http_retryable, retry_with_backoff, RetryConfig};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub type WsSink = SplitSink<WsStream, Message>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
    Error,
}

impl ConnectionState {
    pub fn status_label(self) -> &'static str {
        match self {
            ConnectionState::Connecting => "Connecting...",
            ConnectionState::Open => "Connected",
            ConnectionState::Closing => "Closing...",
            ConnectionState::Closed => "Disconnected",
            ConnectionState::Error => "Error",
        }
    }
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Full socket url, credentials included.
    pub url: Url,
    pub reconnect: RetryConfig,
    pub connect_timeout: Duration,
}

impl SessionConfig {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            reconnect: RetryConfig::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    #[error("websocket connect failed: {0}")]
    Connect(#[from] tungstenite::Error),

    #[error("websocket connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("websocket send failed: {0}")]
    Send(tungstenite::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Raw notifications from the connection task.
pub enum SessionEvent {
    Opened { epoch: u64, sink: WsSink },
    Message { epoch: u64, text: String },
    /// The socket went away; the task is about to reconnect.
    Dropped { epoch: u64, reason: String },
    /// The task gave up; no further events for this epoch.
    Failed { epoch: u64, error: String },
}

impl SessionEvent {
    pub fn epoch(&self) -> u64 {
        match self {
            SessionEvent::Opened { epoch, .. }
            | SessionEvent::Message { epoch, .. }
            | SessionEvent::Dropped { epoch, .. }
            | SessionEvent::Failed { epoch, .. } => *epoch,
        }
    }
}

/// What a current-epoch event means for the owner of the session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionUpdate {
    Opened,
    Inbound(String),
    Reconnecting { reason: String },
    Failed { reason: String },
}

pub struct InferenceSession {
    config: SessionConfig,
    events: mpsc::Sender<SessionEvent>,
    state: ConnectionState,
    epoch: u64,
    sink: Option<WsSink>,
    task: Option<JoinHandle<()>>,
    last_error: Option<String>,
}

impl InferenceSession {
    pub fn new(config: SessionConfig, events: mpsc::Sender<SessionEvent>) -> Self {
        Self {
            config,
            events,
            state: ConnectionState::Closed,
            epoch: 0,
            sink: None,
            task: None,
            last_error: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open && self.sink.is_some()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Starts connecting in the background. Returns false if a connection is already live or
    /// in progress.
    pub fn connect(&mut self) -> bool {
        if matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Open
        ) {
            return false;
        }

        self.epoch += 1;
        self.state = ConnectionState::Connecting;
        self.last_error = None;
        tracing::info!(epoch = self.epoch, "connecting to inference service");
        self.task = Some(tokio::spawn(run_connection(
            self.config.clone(),
            self.epoch,
            self.events.clone(),
        )));
        true
    }

    pub fn begin_close(&mut self) {
        if self.state != ConnectionState::Closed {
            self.state = ConnectionState::Closing;
        }
    }

    /// Closes the socket and stops reconnecting. Events already queued for the old epoch
    /// are ignored afterwards.
    pub async fn disconnect(&mut self) {
        self.begin_close();
        self.epoch += 1;
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if let Some(mut sink) = self.sink.take() {
            match tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::debug!(error = %e, "close handshake failed"),
                Err(_) => tracing::debug!("close handshake timed out"),
            }
        }
        self.state = ConnectionState::Closed;
        tracing::info!("disconnected from inference service");
    }

    /// Sends one payload. A no-op returning `Ok(false)` unless the socket is open.
    pub async fn send(&mut self, payload: &OutboundPayload) -> Result<bool, SessionError> {
        if self.state != ConnectionState::Open {
            return Ok(false);
        }
        let Some(sink) = self.sink.as_mut() else {
            return Ok(false);
        };
        let json = payload.to_json()?;
        sink.send(Message::Text(json.into()))
            .await
            .map_err(SessionError::Send)?;
        Ok(true)
    }

    pub fn handle_event(&mut self, event: SessionEvent) -> Option<SessionUpdate> {
        if event.epoch() != self.epoch {
            tracing::debug!(
                event_epoch = event.epoch(),
                epoch = self.epoch,
                "ignoring event from a previous connection"
            );
            return None;
        }

        match event {
            SessionEvent::Opened { sink, .. } => {
                tracing::info!(epoch = self.epoch, "inference socket open");
                self.sink = Some(sink);
                self.state = ConnectionState::Open;
                Some(SessionUpdate::Opened)
            }
            SessionEvent::Message { text, .. } => Some(SessionUpdate::Inbound(text)),
            SessionEvent::Dropped { reason, .. } => {
                tracing::warn!(reason = %reason, "inference socket dropped, reconnecting");
                self.sink = None;
                self.state = ConnectionState::Connecting;
                Some(SessionUpdate::Reconnecting { reason })
            }
            SessionEvent::Failed { error, .. } => {
                tracing::warn!(error = %error, "inference socket failed");
                self.sink = None;
                self.task = None;
                self.state = ConnectionState::Error;
                self.last_error = Some(error.clone());
                Some(SessionUpdate::Failed { reason: error })
            }
        }
    }
}

impl Drop for InferenceSession {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Authentication failures and malformed urls are permanent; everything else is worth
/// another try.
pub fn is_retryable_connect_error(err: &SessionError) -> bool {
    match err {
        SessionError::Connect(tungstenite::Error::Http(resp)) => {
            let code = resp.status().as_u16();
            code != 401 && code != 403 && is_http_retryable(code)
        }
        SessionError::Connect(tungstenite::Error::Url(_)) => false,
        SessionError::Connect(_) | SessionError::ConnectTimeout(_) => true,
        SessionError::Send(_) | SessionError::Protocol(_) => false,
    }
}

async fn open_socket(config: &SessionConfig) -> Result<WsStream, SessionError> {
    // A no-op when a provider is already installed.
    let _ = rustls::crypto::ring::default_provider().install_default();

    match tokio::time::timeout(config.connect_timeout, connect_async(config.url.as_str())).await {
        Ok(result) => {
            let (stream, _response) = result?;
            Ok(stream)
        }
        Err(_) => Err(SessionError::ConnectTimeout(config.connect_timeout)),
    }
}

async fn run_connection(config: SessionConfig, epoch: u64, events: mpsc::Sender<SessionEvent>) {
    let mut drops = 0u32;

    loop {
        let connected =
            retry_with_backoff(&config.reconnect, || open_socket(&config), is_retryable_connect_error)
                .await;
        let stream = match connected {
            Ok(stream) => stream,
            Err(e) => {
                let _ = events
                    .send(SessionEvent::Failed {
                        epoch,
                        error: e.to_string(),
                    })
                    .await;
                return;
            }
        };

        let (sink, mut source) = stream.split();
        if events
            .send(SessionEvent::Opened { epoch, sink })
            .await
            .is_err()
        {
            return;
        }

        let reason = loop {
            match source.next().await {
                Some(Ok(Message::Text(text))) => {
                    drops = 0;
                    let text = text.as_str().to_owned();
                    if events
                        .send(SessionEvent::Message { epoch, text })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    break frame
                        .map(|f| format!("closed by server ({}): {}", f.code, f.reason.as_str()))
                        .unwrap_or_else(|| "closed by server".to_owned());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break e.to_string(),
                None => break "connection ended".to_owned(),
            }
        };

        drops += 1;
        if drops > config.reconnect.max_attempts {
            let _ = events
                .send(SessionEvent::Failed {
                    epoch,
                    error: format!("{reason} (gave up after {} reconnects)", drops - 1),
                })
                .await;
            return;
        }
        if events
            .send(SessionEvent::Dropped { epoch, reason })
            .await
            .is_err()
        {
            return;
        }
        tokio::time::sleep(config.reconnect.delay_for_attempt(drops)).await;
    }
}
