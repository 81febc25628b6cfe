//! Video capture loops.
//!
//! Live feeds are sampled on a fixed timer. Uploaded files are sampled on the same timer but
//! only while playing: pausing or reaching the end tears the timer down.

use crate::capture::{
    CaptureError, CaptureEventKind, CaptureSink, FrameReceiver, Playback, PlaybackState,
};
use crate::encode::FrameEncoder;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};

#[derive(Clone, Debug)]
pub struct VideoLoop {
    pub period: Duration,
    pub encoder: FrameEncoder,
    pub sink: CaptureSink,
}

enum Snapshot {
    Sent,
    NoFrameYet,
    SourceGone,
    ListenerGone,
}

impl VideoLoop {
    async fn capture_once(&self, frames: &FrameReceiver) -> Snapshot {
        let source_gone = frames.has_changed().is_err();
        let frame = frames.borrow().clone();
        let Some(frame) = frame else {
            return if source_gone {
                Snapshot::SourceGone
            } else {
                Snapshot::NoFrameYet
            };
        };

        let encoder = self.encoder;
        let encoded = tokio::task::spawn_blocking(move || encoder.encode(&frame)).await;
        let delivered = match encoded {
            Ok(Ok(encoded)) => {
                tracing::trace!(bytes = encoded.jpeg.len(), "frame encoded");
                self.sink.emit(CaptureEventKind::Frame(encoded)).await
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "frame encoding failed, skipping frame");
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "frame encoder task failed");
                true
            }
        };

        if !delivered {
            Snapshot::ListenerGone
        } else if source_gone {
            Snapshot::SourceGone
        } else {
            Snapshot::Sent
        }
    }
}

/// Samples the camera every `period` until the source disappears or the loop is aborted.
pub async fn run_live(frames: FrameReceiver, lp: VideoLoop) {
    let mut ticker = interval(lp.period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        match lp.capture_once(&frames).await {
            Snapshot::Sent | Snapshot::NoFrameYet => {}
            Snapshot::SourceGone => {
                tracing::warn!(generation = lp.sink.generation(), "camera feed ended");
                lp.sink
                    .emit(CaptureEventKind::Failed(CaptureError::DeviceLost))
                    .await;
                return;
            }
            Snapshot::ListenerGone => return,
        }
    }
}

/// Samples an uploaded video while it plays.
pub async fn run_playback(frames: FrameReceiver, playback: Playback, lp: VideoLoop) {
    let mut state = playback.subscribe();

    loop {
        if playback.wait_until_playing().await == PlaybackState::Ended {
            tracing::info!(generation = lp.sink.generation(), "video playback ended");
            lp.sink.emit(CaptureEventKind::Ended).await;
            return;
        }

        tracing::debug!(generation = lp.sink.generation(), "playback running, frame timer armed");
        state.borrow_and_update();
        let mut ticker = interval(lp.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match lp.capture_once(&frames).await {
                        Snapshot::Sent | Snapshot::NoFrameYet | Snapshot::SourceGone => {}
                        Snapshot::ListenerGone => return,
                    }
                }
                changed = state.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    if *state.borrow_and_update() != PlaybackState::Playing {
                        tracing::debug!(generation = lp.sink.generation(), "playback stopped, frame timer cleared");
                        break;
                    }
                }
            }
        }
    }
}
