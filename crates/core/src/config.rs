use crate::encode::{DrawingSurface, DEFAULT_JPEG_QUALITY};
use crate::protocol::AnalysisMode;
use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};
use url::Url;

pub const DEFAULT_ENDPOINT: &str = "wss://api.hume.ai/v0/stream/models";
pub const DEFAULT_VIDEO_PERIOD_MS: u64 = 2000;
pub const DEFAULT_AUDIO_CHUNK_MS: u64 = 500;
pub const DEFAULT_MAX_AUDIO_BUFFER_MS: u64 = 5000;
pub const DEFAULT_REPLY_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_RECONNECT_ATTEMPTS: u32 = 3;
pub const DEFAULT_FRAME_WIDTH: u32 = 640;
pub const DEFAULT_FRAME_HEIGHT: u32 = 480;
pub const ENV_HUME_API_KEY: &str = "HUME_API_KEY";
pub const ENV_HUME_ENDPOINT: &str = "HUME_ENDPOINT";
pub const ENV_CAMERA: &str = "EMOTION_STREAM_CAMERA";
pub const ENV_MICROPHONE: &str = "EMOTION_STREAM_MICROPHONE";

const API_KEY_PARAM: &str = "api_key";

#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new<S: Into<String>>(value: S) -> Result<Self, ConfigError> {
        let v = value.into();
        if v.trim().is_empty() {
            return Err(ConfigError::EmptyApiKey);
        }
        Ok(Self(v))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(**redacted**)")
    }
}

/// A strictly positive period in milliseconds.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Cadence {
    pub millis: u64,
}

impl Cadence {
    pub fn new(name: &'static str, millis: u64) -> Result<Self, ConfigError> {
        if millis == 0 {
            return Err(ConfigError::ZeroPeriod(name));
        }
        Ok(Self { millis })
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.millis)
    }

    /// How many whole `chunk`s fit in this period, at least one.
    pub fn chunks_of(&self, chunk: Cadence) -> usize {
        usize::try_from(self.millis / chunk.millis)
            .unwrap_or(usize::MAX)
            .max(1)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct JpegQuality(u8);

impl JpegQuality {
    pub fn new(value: u8) -> Result<Self, ConfigError> {
        if !(1..=100).contains(&value) {
            return Err(ConfigError::JpegQuality(value));
        }
        Ok(Self(value))
    }

    pub fn get(&self) -> u8 {
        self.0
    }
}

impl Default for JpegQuality {
    fn default() -> Self {
        Self(DEFAULT_JPEG_QUALITY)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct FrameSize {
    pub width: u32,
    pub height: u32,
}

impl FrameSize {
    pub fn new(width: u32, height: u32) -> Result<Self, ConfigError> {
        if width == 0 || height == 0 {
            return Err(ConfigError::EmptyFrame { width, height });
        }
        Ok(Self { width, height })
    }

    pub fn surface(&self) -> DrawingSurface {
        DrawingSurface::new(self.width, self.height)
    }
}

impl Default for FrameSize {
    fn default() -> Self {
        Self {
            width: DEFAULT_FRAME_WIDTH,
            height: DEFAULT_FRAME_HEIGHT,
        }
    }
}

/// ffmpeg input device names and demuxers for live capture.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceConfig {
    pub camera: String,
    pub microphone: String,
    pub video_format: String,
    pub audio_format: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        if cfg!(target_os = "macos") {
            Self {
                camera: "0".to_owned(),
                microphone: ":0".to_owned(),
                video_format: "avfoundation".to_owned(),
                audio_format: "avfoundation".to_owned(),
            }
        } else if cfg!(target_os = "windows") {
            Self {
                camera: "video=Integrated Camera".to_owned(),
                microphone: "audio=Microphone".to_owned(),
                video_format: "dshow".to_owned(),
                audio_format: "dshow".to_owned(),
            }
        } else {
            Self {
                camera: "/dev/video0".to_owned(),
                microphone: "default".to_owned(),
                video_format: "v4l2".to_owned(),
                audio_format: "pulse".to_owned(),
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppConfig {
    pub api_key: ApiKey,
    pub endpoint: Url,
    pub initial_mode: AnalysisMode,
    pub video_period: Cadence,
    pub audio_chunk: Cadence,
    pub max_audio_buffer: Cadence,
    pub reply_timeout: Cadence,
    pub reconnect_attempts: u32,
    pub jpeg_quality: JpegQuality,
    pub frame_size: FrameSize,
    pub devices: DeviceConfig,
}

impl AppConfig {
    /// Defaults for everything except the key and endpoint.
    pub fn new(api_key: ApiKey, endpoint: Url) -> Self {
        Self {
            api_key,
            endpoint,
            initial_mode: AnalysisMode::Face,
            video_period: Cadence {
                millis: DEFAULT_VIDEO_PERIOD_MS,
            },
            audio_chunk: Cadence {
                millis: DEFAULT_AUDIO_CHUNK_MS,
            },
            max_audio_buffer: Cadence {
                millis: DEFAULT_MAX_AUDIO_BUFFER_MS,
            },
            reply_timeout: Cadence {
                millis: DEFAULT_REPLY_TIMEOUT_MS,
            },
            reconnect_attempts: DEFAULT_RECONNECT_ATTEMPTS,
            jpeg_quality: JpegQuality::default(),
            frame_size: FrameSize::default(),
            devices: DeviceConfig::default(),
        }
    }

    /// The endpoint with the api key attached, ready to dial.
    pub fn socket_url(&self) -> Url {
        with_api_key(&self.endpoint, &self.api_key)
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("api key must not be empty")]
    EmptyApiKey,
    #[error("{0} must be > 0 ms")]
    ZeroPeriod(&'static str),
    #[error("jpeg quality must be within 1..=100, got {0}")]
    JpegQuality(u8),
    #[error("frame size must be non-zero, got {width}x{height}")]
    EmptyFrame { width: u32, height: u32 },
    #[error("invalid endpoint url: {0}")]
    InvalidEndpoint(String),
    #[error("endpoint must use ws:// or wss://, got {0}://")]
    UnsupportedScheme(String),
}

/// Parses and validates the streaming endpoint. Any `api_key` already present is dropped.
pub fn parse_endpoint(value: &str) -> Result<Url, ConfigError> {
    let mut url = Url::parse(value.trim()).map_err(|e| ConfigError::InvalidEndpoint(e.to_string()))?;
    match url.scheme() {
        "ws" | "wss" => {}
        other => return Err(ConfigError::UnsupportedScheme(other.to_owned())),
    }

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != API_KEY_PARAM)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }
    Ok(url)
}

pub fn with_api_key(endpoint: &Url, key: &ApiKey) -> Url {
    let mut url = endpoint.clone();
    url.query_pairs_mut().append_pair(API_KEY_PARAM, key.expose());
    url
}

/// Renders a socket url for logs with the key masked.
pub fn redact_endpoint(url: &Url) -> String {
    let mut shown = url.clone();
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| {
            if k == API_KEY_PARAM {
                (k.into_owned(), "**redacted**".to_owned())
            } else {
                (k.into_owned(), v.into_owned())
            }
        })
        .collect();
    if !pairs.is_empty() {
        shown.query_pairs_mut().clear().extend_pairs(pairs);
    }
    shown.to_string()
}

pub trait Env {
    fn var(&self, key: &str) -> Option<String>;
}

#[derive(Clone, Debug, Default)]
pub struct StdEnv;

impl Env for StdEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

#[derive(Clone, Debug, Default)]
pub struct MapEnv {
    vars: std::collections::BTreeMap<String, String>,
}

impl MapEnv {
    pub fn with_var(mut self, key: &str, value: &str) -> Self {
        self.vars.insert(key.to_owned(), value.to_owned());
        self
    }
}

impl Env for MapEnv {
    fn var(&self, key: &str) -> Option<String> {
        self.vars.get(key).cloned()
    }
}

pub fn resolve_api_key(
    cli_value: Option<String>,
    env_key: &str,
    env: &impl Env,
) -> Result<Option<ApiKey>, ConfigError> {
    match cli_value {
        Some(v) => Ok(Some(ApiKey::new(v)?)),
        None => match env.var(env_key) {
            Some(v) => Ok(Some(ApiKey::new(v)?)),
            None => Ok(None),
        },
    }
}

pub fn resolve_string_with_default(
    cli_value: Option<String>,
    env_key: &str,
    env: &impl Env,
    default: &str,
) -> String {
    match cli_value {
        Some(v) => v,
        None => env.var(env_key).unwrap_or_else(|| default.to_owned()),
    }
}

pub fn resolve_optional_string(
    cli_value: Option<String>,
    env_key: &str,
    env: &impl Env,
) -> Option<String> {
    match cli_value {
        Some(v) => Some(v),
        None => env.var(env_key),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_key_cli_takes_precedence_over_env() {
        let env = MapEnv::default().with_var(ENV_HUME_API_KEY, "env-key");
        let key = resolve_api_key(Some("cli-key".to_owned()), ENV_HUME_API_KEY, &env)
            .expect("valid key")
            .expect("present");
        assert_eq!(key.expose(), "cli-key");
    }

    #[test]
    fn api_key_env_used_when_cli_missing() {
        let env = MapEnv::default().with_var(ENV_HUME_API_KEY, "env-key");
        let key = resolve_api_key(None, ENV_HUME_API_KEY, &env)
            .expect("valid key")
            .expect("present");
        assert_eq!(key.expose(), "env-key");
    }

    #[test]
    fn blank_api_key_rejected() {
        let env = MapEnv::default().with_var(ENV_HUME_API_KEY, "   ");
        assert_eq!(
            resolve_api_key(None, ENV_HUME_API_KEY, &env),
            Err(ConfigError::EmptyApiKey)
        );
    }

    #[test]
    fn api_key_debug_is_redacted() {
        let key = ApiKey::new("secret").expect("valid");
        assert!(!format!("{key:?}").contains("secret"));
    }

    #[test]
    fn cadence_rejects_zero() {
        assert_eq!(
            Cadence::new("video period", 0),
            Err(ConfigError::ZeroPeriod("video period"))
        );
        let c = Cadence::new("video period", 2000).expect("nonzero");
        assert_eq!(c.duration(), Duration::from_secs(2));
    }

    #[test]
    fn cadence_chunk_count() {
        let buffer = Cadence::new("buffer", 5000).expect("nonzero");
        let chunk = Cadence::new("chunk", 500).expect("nonzero");
        assert_eq!(buffer.chunks_of(chunk), 10);

        let tiny = Cadence::new("buffer", 100).expect("nonzero");
        assert_eq!(tiny.chunks_of(chunk), 1);
    }

    #[test]
    fn jpeg_quality_bounds() {
        assert_eq!(JpegQuality::new(0), Err(ConfigError::JpegQuality(0)));
        assert_eq!(JpegQuality::new(101), Err(ConfigError::JpegQuality(101)));
        assert_eq!(JpegQuality::new(100).expect("valid").get(), 100);
        assert_eq!(JpegQuality::default().get(), 80);
    }

    #[test]
    fn frame_size_rejects_zero() {
        assert!(FrameSize::new(0, 480).is_err());
        assert_eq!(FrameSize::default().surface(), DrawingSurface::new(640, 480));
    }

    #[test]
    fn endpoint_requires_websocket_scheme() {
        assert_eq!(
            parse_endpoint("https://api.hume.ai/v0/stream/models"),
            Err(ConfigError::UnsupportedScheme("https".to_owned()))
        );
        assert!(matches!(
            parse_endpoint("not a url"),
            Err(ConfigError::InvalidEndpoint(_))
        ));
        assert!(parse_endpoint(DEFAULT_ENDPOINT).is_ok());
    }

    #[test]
    fn socket_url_carries_single_api_key() {
        let endpoint = parse_endpoint("ws://127.0.0.1:9000/stream?api_key=old&x=1").expect("valid");
        assert_eq!(endpoint.as_str(), "ws://127.0.0.1:9000/stream?x=1");

        let key = ApiKey::new("k&y").expect("valid");
        let url = with_api_key(&endpoint, &key);
        assert_eq!(url.as_str(), "ws://127.0.0.1:9000/stream?x=1&api_key=k%26y");

        let shown = redact_endpoint(&url);
        assert!(!shown.contains("k%26y"));
        assert!(shown.contains("redacted"));
    }

    #[test]
    fn app_config_defaults() {
        let key = ApiKey::new("key").expect("valid");
        let cfg = AppConfig::new(key, parse_endpoint(DEFAULT_ENDPOINT).expect("valid"));
        assert_eq!(cfg.video_period.millis, DEFAULT_VIDEO_PERIOD_MS);
        assert_eq!(cfg.audio_chunk.millis, DEFAULT_AUDIO_CHUNK_MS);
        assert_eq!(cfg.reconnect_attempts, 3);
        assert_eq!(
            cfg.socket_url().as_str(),
            "wss://api.hume.ai/v0/stream/models?api_key=key"
        );
    }

    #[test]
    fn resolve_string_with_default_precedence() {
        let env = MapEnv::default().with_var(ENV_CAMERA, "env");
        assert_eq!(
            resolve_string_with_default(Some("cli".to_owned()), ENV_CAMERA, &env, "def"),
            "cli"
        );
        assert_eq!(resolve_string_with_default(None, ENV_CAMERA, &env, "def"), "env");
        assert_eq!(
            resolve_string_with_default(None, ENV_CAMERA, &MapEnv::default(), "def"),
            "def"
        );
    }

    #[test]
    fn resolve_optional_string_falls_back_to_env() {
        let env = MapEnv::default().with_var(ENV_HUME_ENDPOINT, "ws://x");
        assert_eq!(
            resolve_optional_string(None, ENV_HUME_ENDPOINT, &env).as_deref(),
            Some("ws://x")
        );
        assert_eq!(resolve_optional_string(None, ENV_MICROPHONE, &env), None);
    }
}
