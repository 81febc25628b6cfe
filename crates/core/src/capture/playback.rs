use std::sync::Arc;
use tokio::sync::watch;

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum PlaybackState {
    Playing,
    Paused,
    Ended,
}

/// Shared play/pause/ended state of an uploaded file.
///
/// The consumer (capture loop) and the producer (decoder) hold clones. `Ended` is terminal.
#[derive(Clone, Debug)]
pub struct Playback {
    state: Arc<watch::Sender<PlaybackState>>,
}

impl Playback {
    pub fn new(initial: PlaybackState) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self {
            state: Arc::new(tx),
        }
    }

    pub fn state(&self) -> PlaybackState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<PlaybackState> {
        self.state.subscribe()
    }

    /// Returns true if the state changed.
    pub fn play(&self) -> bool {
        self.state.send_if_modified(|s| {
            if *s == PlaybackState::Paused {
                *s = PlaybackState::Playing;
                true
            } else {
                false
            }
        })
    }

    pub fn pause(&self) -> bool {
        self.state.send_if_modified(|s| {
            if *s == PlaybackState::Playing {
                *s = PlaybackState::Paused;
                true
            } else {
                false
            }
        })
    }

    pub fn end(&self) {
        self.state.send_if_modified(|s| {
            if *s == PlaybackState::Ended {
                false
            } else {
                *s = PlaybackState::Ended;
                true
            }
        });
    }

    /// Waits while paused. Returns `Playing` or `Ended`.
    pub async fn wait_until_playing(&self) -> PlaybackState {
        let mut rx = self.subscribe();
        let result = rx
            .wait_for(|s| *s != PlaybackState::Paused)
            .await
            .map(|s| *s);
        result.unwrap_or(PlaybackState::Ended)
    }
}
