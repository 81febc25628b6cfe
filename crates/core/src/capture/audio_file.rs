//! Uploaded audio files.
//!
//! The file is decoded up front to mono 16-bit PCM and then replayed at real-time pace, so the
//! recording loop sees the same cadence it would from a microphone.

use crate::capture::{
    samples_for_duration, AudioChunk, AudioFeed, AudioRecorder, CaptureError, MediaStream,
    MediaTrack, Playback, PlaybackState, TrackKind,
};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

fn unreadable(path: &Path, e: impl std::fmt::Display) -> CaptureError {
    CaptureError::Unreadable(format!("{}: {e}", path.display()))
}

/// Decodes the first audio track of `path`, averaging all channels down to mono.
pub fn decode_file(path: &Path) -> Result<AudioChunk, CaptureError> {
    let file = std::fs::File::open(path).map_err(|e| unreadable(path, e))?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| unreadable(path, e))?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| unreadable(path, "no audio track"))?;
    let track_id = track.id;
    let params = track.codec_params.clone();

    let mut decoder = symphonia::default::get_codecs()
        .make(&params, &DecoderOptions::default())
        .map_err(|e| unreadable(path, e))?;

    let mut sample_rate = params.sample_rate.unwrap_or(0);
    let mut samples = Vec::new();

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(unreadable(path, e)),
        };
        if packet.track_id() != track_id {
            continue;
        }

        match decoder.decode(&packet) {
            Ok(decoded) => {
                let spec = *decoded.spec();
                if sample_rate == 0 {
                    sample_rate = spec.rate;
                }
                let channels = spec.channels.count().max(1);
                let mut buf = SampleBuffer::<i16>::new(decoded.capacity() as u64, spec);
                buf.copy_interleaved_ref(decoded);
                downmix_into(buf.samples(), channels, &mut samples);
            }
            Err(SymphoniaError::DecodeError(msg)) => {
                tracing::warn!(path = %path.display(), error = msg, "skipping undecodable packet");
            }
            Err(e) => return Err(unreadable(path, e)),
        }
    }

    if sample_rate == 0 {
        return Err(unreadable(path, "unknown sample rate"));
    }

    tracing::debug!(
        path = %path.display(),
        sample_rate,
        samples = samples.len(),
        "decoded audio file"
    );
    Ok(AudioChunk {
        sample_rate,
        samples,
    })
}

fn downmix_into(interleaved: &[i16], channels: usize, out: &mut Vec<i16>) {
    if channels == 1 {
        out.extend_from_slice(interleaved);
        return;
    }
    out.extend(interleaved.chunks_exact(channels).map(|frame| {
        let sum: i32 = frame.iter().map(|&s| i32::from(s)).sum();
        (sum / channels as i32) as i16
    }));
}

/// Replays decoded audio in real time while playback is running.
pub struct FileRecorder {
    audio: AudioChunk,
    cursor: usize,
    playback: Playback,
}

impl FileRecorder {
    pub fn new(audio: AudioChunk, playback: Playback) -> Self {
        Self {
            audio,
            cursor: 0,
            playback,
        }
    }

    pub fn remaining(&self) -> usize {
        self.audio.samples.len().saturating_sub(self.cursor)
    }
}

impl AudioRecorder for FileRecorder {
    fn record(&mut self, length: Duration) -> BoxFuture<'_, Result<Option<AudioChunk>, CaptureError>> {
        async move {
            if self.playback.wait_until_playing().await == PlaybackState::Ended {
                return Ok(None);
            }
            if self.remaining() == 0 {
                self.playback.end();
                return Ok(None);
            }

            let wanted = samples_for_duration(self.audio.sample_rate, length).max(1);
            let end = (self.cursor + wanted).min(self.audio.samples.len());
            let chunk = AudioChunk {
                sample_rate: self.audio.sample_rate,
                samples: self.audio.samples[self.cursor..end].to_vec(),
            };

            tokio::time::sleep(chunk.duration()).await;
            self.cursor = end;
            Ok(Some(chunk))
        }
        .boxed()
    }
}

/// Stopping an uploaded file pauses it; the decoded data has no device to release.
struct PlaybackTrack {
    kind: TrackKind,
    playback: Playback,
}

impl MediaTrack for PlaybackTrack {
    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn stop(&mut self) {
        self.playback.pause();
    }
}

pub(crate) fn playback_track(kind: TrackKind, playback: Playback) -> Box<dyn MediaTrack> {
    Box::new(PlaybackTrack { kind, playback })
}

pub async fn open(path: PathBuf) -> Result<AudioFeed, CaptureError> {
    tracing::info!(path = %path.display(), "opening audio file");
    let decode_path = path.clone();
    let audio = tokio::task::spawn_blocking(move || decode_file(&decode_path))
        .await
        .map_err(|e| unreadable(&path, e))??;
    if audio.samples.is_empty() {
        return Err(unreadable(&path, "file contains no audio"));
    }

    let playback = Playback::new(PlaybackState::Playing);
    Ok(AudioFeed {
        recorder: Box::new(FileRecorder::new(audio, playback.clone())),
        stream: MediaStream::new(vec![playback_track(TrackKind::Audio, playback.clone())]),
        playback: Some(playback),
    })
}
