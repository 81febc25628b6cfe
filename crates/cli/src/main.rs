#![deny(warnings)]

use anyhow::Context;
use clap::Parser;
use emotion_stream_core::capture::MediaDevices;
use emotion_stream_core::config::{
    parse_endpoint, redact_endpoint, resolve_api_key, resolve_string_with_default, AppConfig,
    Cadence, DeviceConfig, Env, FrameSize, JpegQuality, StdEnv, DEFAULT_AUDIO_CHUNK_MS,
    DEFAULT_ENDPOINT, DEFAULT_FRAME_HEIGHT, DEFAULT_FRAME_WIDTH, DEFAULT_MAX_AUDIO_BUFFER_MS,
    DEFAULT_RECONNECT_ATTEMPTS, DEFAULT_REPLY_TIMEOUT_MS, DEFAULT_VIDEO_PERIOD_MS,
    ENV_CAMERA, ENV_HUME_API_KEY, ENV_HUME_ENDPOINT, ENV_MICROPHONE,
};
use emotion_stream_core::coordinator::{
    Coordinator, CoordinatorConfig, SessionView, StreamController,
};
use emotion_stream_core::display::{
    bar, levels, radar, top_emotions, DominantTimeline, ExpressionTracker,
    TIMELINE_SAMPLE_PERIOD, TOP_EMOTIONS,
};
use emotion_stream_core::encode::DEFAULT_JPEG_QUALITY;
use emotion_stream_core::protocol::AnalysisMode;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "emotion-stream")]
#[command(about = "Stream camera or microphone to a real-time emotion inference service")]
struct Args {
    /// Falls back to HUME_API_KEY.
    #[arg(long)]
    api_key: Option<String>,

    /// Falls back to HUME_ENDPOINT.
    #[arg(long)]
    endpoint: Option<String>,

    #[arg(long, default_value = "face")]
    mode: AnalysisMode,

    #[arg(long, default_value_t = DEFAULT_VIDEO_PERIOD_MS)]
    video_period_ms: u64,

    #[arg(long, default_value_t = DEFAULT_AUDIO_CHUNK_MS)]
    audio_chunk_ms: u64,

    #[arg(long, default_value_t = DEFAULT_JPEG_QUALITY)]
    jpeg_quality: u8,

    #[arg(long, default_value_t = DEFAULT_FRAME_WIDTH)]
    frame_width: u32,

    #[arg(long, default_value_t = DEFAULT_FRAME_HEIGHT)]
    frame_height: u32,

    #[arg(long, default_value_t = DEFAULT_MAX_AUDIO_BUFFER_MS)]
    max_audio_buffer_ms: u64,

    #[arg(long, default_value_t = DEFAULT_REPLY_TIMEOUT_MS)]
    reply_timeout_ms: u64,

    #[arg(long, default_value_t = DEFAULT_RECONNECT_ATTEMPTS)]
    reconnect_attempts: u32,

    /// ffmpeg input name of the camera. Falls back to EMOTION_STREAM_CAMERA.
    #[arg(long)]
    camera: Option<String>,

    /// ffmpeg input name of the microphone. Falls back to EMOTION_STREAM_MICROPHONE.
    #[arg(long)]
    microphone: Option<String>,

    /// ffmpeg demuxer for the camera, e.g. v4l2, avfoundation, dshow.
    #[arg(long)]
    video_input_format: Option<String>,

    /// ffmpeg demuxer for the microphone, e.g. pulse, alsa, avfoundation, dshow.
    #[arg(long)]
    audio_input_format: Option<String>,

    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level)?;

    let env = StdEnv;
    let cfg = build_config(args, &env)?;

    tracing::info!(
        endpoint = %redact_endpoint(&cfg.socket_url()),
        mode = %cfg.initial_mode,
        video_period_ms = cfg.video_period.millis,
        audio_chunk_ms = cfg.audio_chunk.millis,
        "config loaded"
    );

    run_console(cfg).await
}

#[cfg(feature = "ffmpeg-sidecar")]
fn media_devices(cfg: &AppConfig) -> anyhow::Result<Arc<dyn MediaDevices>> {
    use emotion_stream_core::capture::FfmpegMediaDevices;
    Ok(Arc::new(FfmpegMediaDevices::new(
        cfg.devices.clone(),
        cfg.frame_size.surface(),
    )))
}

#[cfg(not(feature = "ffmpeg-sidecar"))]
fn media_devices(_cfg: &AppConfig) -> anyhow::Result<Arc<dyn MediaDevices>> {
    anyhow::bail!("built without capture support; rebuild with --features ffmpeg-sidecar")
}

async fn run_console(cfg: AppConfig) -> anyhow::Result<()> {
    let devices = media_devices(&cfg)?;
    let (controller, coordinator) = Coordinator::spawn(CoordinatorConfig::from_app(&cfg), devices);

    let charts = Arc::new(Mutex::new(Charts::default()));
    let renderer = tokio::spawn(render_loop(controller.subscribe(), charts.clone()));

    print_help();
    println!("{}", describe_mode(cfg.initial_mode));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("reading stdin")? {
        match run_command(&controller, &charts, line.trim()).await {
            Ok(Flow::Continue) => {}
            Ok(Flow::Quit) => break,
            Err(e) => println!("error: {e:#}"),
        }
    }

    controller
        .shutdown()
        .await
        .context("shutting down coordinator")?;
    coordinator.await.context("coordinator task panicked")?;
    renderer.abort();
    Ok(())
}

enum Flow {
    Continue,
    Quit,
}

async fn run_command(
    controller: &StreamController,
    charts: &Arc<Mutex<Charts>>,
    line: &str,
) -> anyhow::Result<Flow> {
    let mut parts = line.splitn(2, char::is_whitespace);
    let command = parts.next().unwrap_or_default();
    let rest = parts.next().map(str::trim).filter(|s| !s.is_empty());

    match command {
        "" => {}
        "help" | "?" => print_help(),
        "connect" => controller.connect().await?,
        "disconnect" => controller.disconnect().await?,
        "mode" => {
            let mode: AnalysisMode = rest
                .context("usage: mode <face|burst|prosody>")?
                .parse()?;
            controller.change_mode(mode).await?;
            if let Ok(mut charts) = charts.lock() {
                charts.reset();
            }
            println!("{}", describe_mode(mode));
        }
        "toggle" => {
            controller.toggle_live_or_upload().await?;
            println!("source: {}", controller.view().source);
        }
        "start" => match rest {
            Some(path) => controller.start_from_upload(PathBuf::from(path)).await?,
            None => controller.start().await?,
        },
        "stop" => controller.stop().await?,
        "play" => controller.play().await?,
        "pause" => controller.pause().await?,
        "status" => print_view(&controller.view()),
        "history" => {
            if let Ok(charts) = charts.lock() {
                charts.print();
            }
        }
        "quit" | "exit" => return Ok(Flow::Quit),
        other => println!("unknown command `{other}`; type `help`"),
    }
    Ok(Flow::Continue)
}

/// Timeline and change history kept across renders.
struct Charts {
    started: Instant,
    timeline: DominantTimeline,
    tracker: ExpressionTracker,
}

impl Default for Charts {
    fn default() -> Self {
        Self {
            started: Instant::now(),
            timeline: DominantTimeline::default(),
            tracker: ExpressionTracker::default(),
        }
    }
}

impl Charts {
    fn reset(&mut self) {
        self.timeline.clear();
        self.tracker.reset();
    }

    fn print(&self) {
        println!("timeline (dominant emotion, 1 s samples):");
        for point in self.timeline.points() {
            println!(
                "  {:>6.1}s  {:<20} {:.2}",
                point.at.as_secs_f64(),
                point.name,
                point.score
            );
        }
        println!("changes:");
        for change in self.tracker.history() {
            println!(
                "  {:>6.1}s  -> {} ({:.2})",
                change.at.as_secs_f64(),
                change.name,
                change.score
            );
        }
    }
}

async fn render_loop(mut view: watch::Receiver<SessionView>, charts: Arc<Mutex<Charts>>) {
    let mut ticker = tokio::time::interval(TIMELINE_SAMPLE_PERIOD);
    let mut last_rendered: Option<SessionView> = None;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let current = view.borrow().clone();
                if let Ok(mut charts) = charts.lock() {
                    let at = charts.started.elapsed();
                    charts.timeline.sample(at, current.scores.as_ref());
                }
            }
            changed = view.changed() => {
                if changed.is_err() {
                    return;
                }
                let current = view.borrow_and_update().clone();
                if last_rendered.as_ref().is_some_and(|last| same_display(last, &current)) {
                    continue;
                }
                if let (Some(scores), Ok(mut charts)) = (current.scores.as_ref(), charts.lock()) {
                    let at = charts.started.elapsed();
                    if let Some(change) = charts.tracker.observe(at, scores) {
                        tracing::info!(emotion = %change.name, score = change.score, "dominant expression changed");
                    }
                }
                print_view(&current);
                last_rendered = Some(current);
            }
        }
    }
}

/// Stats tick on every frame; only redraw when something visible changed.
fn same_display(a: &SessionView, b: &SessionView) -> bool {
    a.connection == b.connection
        && a.connection_error == b.connection_error
        && a.mode == b.mode
        && a.source == b.source
        && a.capture == b.capture
        && a.playback == b.playback
        && a.scores == b.scores
        && a.warning == b.warning
}

fn print_view(view: &SessionView) {
    println!();
    println!(
        "[{}] mode={} source={} capture={:?}{}",
        view.status(),
        view.mode,
        view.source,
        view.capture,
        view.playback
            .map(|p| format!(" playback={p:?}"))
            .unwrap_or_default()
    );
    if let Some(error) = &view.connection_error {
        println!("  connection: {error}");
    }
    if let Some(warning) = &view.warning {
        if !warning.is_empty() {
            println!("  warning: {warning}");
        }
    }
    if let Some(scores) = &view.scores {
        for emotion in top_emotions(scores, TOP_EMOTIONS) {
            println!(
                "  {}. {:<20} {} {}",
                emotion.rank,
                emotion.name,
                emotion.score_text(),
                emotion.descriptor.unwrap_or_default()
            );
        }
    }
    if let Some(scores) = &view.scores {
        let axes: Vec<String> = radar(scores)
            .iter()
            .map(|p| format!("{} {:.2}", p.axis, p.value))
            .collect();
        println!("  radar: {}", axes.join(" | "));
    }
    for level in levels(view.mode, view.scores.as_ref()) {
        println!("  {:<16} {} {:>5.1}%", level.name, bar(level.percent / 100.0, 20), level.percent);
    }
    println!(
        "  sent={} replies={} dropped_frames={} dropped_audio={} stale={} timeouts={}",
        view.stats.sent,
        view.stats.replies,
        view.stats.dropped_frames,
        view.stats.dropped_audio,
        view.stats.stale_replies,
        view.stats.timeouts
    );
}

fn describe_mode(mode: AnalysisMode) -> String {
    format!("{}: {}", mode.label(), mode.summary())
}

fn print_help() {
    println!("commands:");
    println!("  connect | disconnect        open or close the inference socket");
    println!("  mode <face|burst|prosody>   switch analysis mode (stops capture)");
    println!("  toggle                      switch between live capture and upload");
    println!("  start [file]                start capture; upload mode needs a file");
    println!("  stop                        stop capture");
    println!("  play | pause                control an uploaded file");
    println!("  status | history            show the current view or the timeline");
    println!("  quit");
}

fn init_tracing(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(
            level
                .parse()
                .with_context(|| format!("invalid --log-level: {level}"))?,
        )
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

fn build_config(args: Args, env: &impl Env) -> anyhow::Result<AppConfig> {
    let api_key = resolve_api_key(args.api_key, ENV_HUME_API_KEY, env)?
        .with_context(|| format!("an api key is required (--api-key or {ENV_HUME_API_KEY})"))?;
    let endpoint = parse_endpoint(&resolve_string_with_default(
        args.endpoint,
        ENV_HUME_ENDPOINT,
        env,
        DEFAULT_ENDPOINT,
    ))?;

    let defaults = DeviceConfig::default();
    let devices = DeviceConfig {
        camera: resolve_string_with_default(args.camera, ENV_CAMERA, env, &defaults.camera),
        microphone: resolve_string_with_default(
            args.microphone,
            ENV_MICROPHONE,
            env,
            &defaults.microphone,
        ),
        video_format: args.video_input_format.unwrap_or(defaults.video_format),
        audio_format: args.audio_input_format.unwrap_or(defaults.audio_format),
    };

    let mut cfg = AppConfig::new(api_key, endpoint);
    cfg.initial_mode = args.mode;
    cfg.video_period = Cadence::new("video period", args.video_period_ms)?;
    cfg.audio_chunk = Cadence::new("audio chunk", args.audio_chunk_ms)?;
    cfg.max_audio_buffer = Cadence::new("max audio buffer", args.max_audio_buffer_ms)?;
    cfg.reply_timeout = Cadence::new("reply timeout", args.reply_timeout_ms)?;
    cfg.reconnect_attempts = args.reconnect_attempts;
    cfg.jpeg_quality = JpegQuality::new(args.jpeg_quality)?;
    cfg.frame_size = FrameSize::new(args.frame_width, args.frame_height)?;
    cfg.devices = devices;
    Ok(cfg)
}
