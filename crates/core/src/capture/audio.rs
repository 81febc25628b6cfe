use crate::capture::{AudioRecorder, CaptureEventKind, CaptureSink, Playback, PlaybackState};
use std::time::Duration;

/// Records back-to-back chunks of `chunk` length and forwards each one.
///
/// For uploads, recording waits while playback is paused.
pub async fn run(
    mut recorder: Box<dyn AudioRecorder>,
    playback: Option<Playback>,
    chunk: Duration,
    sink: CaptureSink,
) {
    loop {
        if let Some(pb) = &playback {
            if pb.wait_until_playing().await == PlaybackState::Ended {
                tracing::info!(generation = sink.generation(), "audio playback ended");
                sink.emit(CaptureEventKind::Ended).await;
                return;
            }
        }

        match recorder.record(chunk).await {
            Ok(Some(audio)) => {
                tracing::trace!(samples = audio.samples.len(), "audio chunk recorded");
                if !sink.emit(CaptureEventKind::Audio(audio)).await {
                    return;
                }
            }
            Ok(None) => {
                sink.emit(CaptureEventKind::Ended).await;
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "audio recording failed");
                sink.emit(CaptureEventKind::Failed(e)).await;
                return;
            }
        }
    }
}
