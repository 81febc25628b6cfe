//! Frame and chunk encoding for the wire.
//!
//! Video frames are drawn onto a fixed-size surface, compressed to JPEG and base64-encoded
//! without any `data:` URL prefix. Audio chunks are concatenated into one WAV file and
//! base64-encoded.

use crate::capture::{AudioChunk, VideoFrame};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::RgbImage;
use std::io::Cursor;

pub const DEFAULT_JPEG_QUALITY: u8 = 80;

#[derive(thiserror::Error, Debug)]
pub enum EncodeError {
    #[error("frame buffer is {actual} bytes, expected {expected} for {width}x{height} rgb24")]
    FrameSize {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },

    #[error("jpeg encoding failed: {0}")]
    Jpeg(#[from] image::ImageError),

    #[error("wav encoding failed: {0}")]
    Wav(#[from] hound::Error),

    #[error("no audio to encode")]
    EmptyAudio,

    #[error("audio chunks disagree on sample rate ({0} Hz vs {1} Hz)")]
    SampleRateMismatch(u32, u32),
}

/// An encoded frame ready to go into an outbound payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodedFrame {
    pub jpeg: Bytes,
    pub base64: String,
}

/// Off-screen surface a frame is drawn onto before compression.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DrawingSurface {
    pub width: u32,
    pub height: u32,
}

impl Default for DrawingSurface {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
        }
    }
}

impl DrawingSurface {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Draws the frame stretched to fill the surface.
    pub fn snapshot(&self, frame: &VideoFrame) -> Result<RgbImage, EncodeError> {
        let expected = VideoFrame::expected_len(frame.width, frame.height);
        let image = RgbImage::from_raw(frame.width, frame.height, frame.rgb.clone()).ok_or(
            EncodeError::FrameSize {
                width: frame.width,
                height: frame.height,
                expected,
                actual: frame.rgb.len(),
            },
        )?;
        if image.width() == self.width && image.height() == self.height {
            return Ok(image);
        }
        Ok(imageops::resize(
            &image,
            self.width,
            self.height,
            FilterType::Triangle,
        ))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameEncoder {
    surface: DrawingSurface,
    quality: u8,
}

impl Default for FrameEncoder {
    fn default() -> Self {
        Self::new(DrawingSurface::default(), DEFAULT_JPEG_QUALITY)
    }
}

impl FrameEncoder {
    /// `quality` is clamped to 1..=100.
    pub fn new(surface: DrawingSurface, quality: u8) -> Self {
        Self {
            surface,
            quality: quality.clamp(1, 100),
        }
    }

    pub fn surface(&self) -> DrawingSurface {
        self.surface
    }

    pub fn encode(&self, frame: &VideoFrame) -> Result<EncodedFrame, EncodeError> {
        let image = self.surface.snapshot(frame)?;
        let mut jpeg = Vec::new();
        JpegEncoder::new_with_quality(&mut jpeg, self.quality).encode_image(&image)?;
        let base64 = BASE64.encode(&jpeg);
        Ok(EncodedFrame {
            jpeg: Bytes::from(jpeg),
            base64,
        })
    }
}

/// Concatenates chunks into a single mono 16-bit WAV file.
pub fn encode_wav(chunks: &[AudioChunk]) -> Result<Vec<u8>, EncodeError> {
    let first = chunks.first().ok_or(EncodeError::EmptyAudio)?;
    if let Some(other) = chunks.iter().find(|c| c.sample_rate != first.sample_rate) {
        return Err(EncodeError::SampleRateMismatch(
            first.sample_rate,
            other.sample_rate,
        ));
    }

    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: first.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for sample in chunks.iter().flat_map(|c| c.samples.iter()) {
            writer.write_sample(*sample)?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

pub fn encode_audio_payload(chunks: &[AudioChunk]) -> Result<String, EncodeError> {
    Ok(BASE64.encode(encode_wav(chunks)?))
}
