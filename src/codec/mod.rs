//! # Codec Backends
//!
//! Interfaccia unica verso i codec nativi. Ogni backend implementa `CodecBackend`
//! e dichiara solo le capacità che possiede; le altre restituiscono
//! `EncodeError::Unsupported`.
//!
//! ## Varianti:
//! - `image_codec`: codec in-process basati sul crate `image` (JPEG, GIF, decoder
//!   generico, AV1 nativo)
//! - `external`: encoder di sistema pilotati via riga di comando (MozJPEG, libwebp,
//!   libavif, libheif)
//! - `ffmpeg`: transcoder esterno, solo per decode-to-preview e pipeline GIF a filtri
//! - `registry`: ordine di priorità per formato e preferenza utente
//!
//! Tutte le chiamate sono bloccanti: l'orchestratore le esegue in `spawn_blocking`.

pub mod external;
pub mod ffmpeg;
pub mod image_codec;
pub mod registry;

use std::fmt;

use image::DynamicImage;
use serde::{Deserialize, Serialize};

use crate::error::{DecodeError, EncodeError};
use crate::quality::{AvifSpeed, QualitySetting};

pub use registry::BackendRegistry;

/// Identifies the implementation that produced a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendId {
    MozJpeg,
    ImageJpeg,
    ImageGif,
    ImageDecoder,
    Rav1e,
    Cwebp,
    Img2Webp,
    AvifEnc,
    HeifEnc,
    HeifConvert,
    Ffmpeg,
    FfmpegGif,
    PngHeuristic,
    Zopflipng,
    Pngquant,
    /// Source bytes returned unchanged.
    Passthrough,
    /// Caller-supplied backend.
    Custom(&'static str),
}

impl BackendId {
    pub fn name(&self) -> &'static str {
        match self {
            Self::MozJpeg => "mozjpeg",
            Self::ImageJpeg => "image-jpeg",
            Self::ImageGif => "image-gif",
            Self::ImageDecoder => "image-decoder",
            Self::Rav1e => "rav1e",
            Self::Cwebp => "cwebp",
            Self::Img2Webp => "img2webp",
            Self::AvifEnc => "avifenc",
            Self::HeifEnc => "heif-enc",
            Self::HeifConvert => "heif-convert",
            Self::Ffmpeg => "ffmpeg",
            Self::FfmpegGif => "ffmpeg-gif",
            Self::PngHeuristic => "png-heuristic",
            Self::Zopflipng => "zopflipng",
            Self::Pngquant => "pngquant",
            Self::Passthrough => "passthrough",
            Self::Custom(name) => name,
        }
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Where a backend's codec lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Platform codec library, reached through its reference encoder.
    System,
    /// Codec linked into this process.
    Native,
    /// General-purpose transcoder, decode and filter pipelines only.
    ExternalProcess,
}

/// Which still-image backend family the user wants tried first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendPreference {
    #[default]
    System,
    Native,
}

impl BackendPreference {
    pub fn preferred_kind(self) -> BackendKind {
        match self {
            Self::System => BackendKind::System,
            Self::Native => BackendKind::Native,
        }
    }
}

impl std::str::FromStr for BackendPreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "system" => Ok(Self::System),
            "native" => Ok(Self::Native),
            other => Err(format!("unknown backend preference: {other}")),
        }
    }
}

/// GIF filter-pipeline knobs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GifOptions {
    pub scale: f32,
    pub dithering: bool,
    /// Resample to this frame rate. `None` keeps source timing.
    pub frame_rate: Option<f32>,
}

impl Default for GifOptions {
    fn default() -> Self {
        Self {
            scale: 1.0,
            dithering: true,
            frame_rate: None,
        }
    }
}

/// Resolved encoder parameters for one request.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeParams {
    pub quality: QualitySetting,
    pub speed: AvifSpeed,
    pub gif: GifOptions,
}

impl EncodeParams {
    pub fn new(quality: QualitySetting) -> Self {
        Self {
            quality,
            speed: AvifSpeed::default(),
            gif: GifOptions::default(),
        }
    }
}

/// One decoded frame with its display time in the sequence's timescale.
#[derive(Debug, Clone)]
pub struct FrameRecord {
    pub image: DynamicImage,
    pub duration_ticks: u64,
}

/// Decoded frames in playback order.
#[derive(Debug, Clone)]
pub struct FrameSequence {
    pub frames: Vec<FrameRecord>,
    /// Ticks per second.
    pub timescale: u32,
}

impl FrameSequence {
    pub fn still(image: DynamicImage) -> Self {
        Self {
            frames: vec![FrameRecord {
                image,
                duration_ticks: 0,
            }],
            timescale: 1000,
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn duration_seconds(&self, index: usize) -> Option<f64> {
        let frame = self.frames.get(index)?;
        Some(frame.duration_ticks as f64 / self.timescale.max(1) as f64)
    }
}

/// Incremental sequence encoder. Frames must be appended in playback order.
pub trait SequenceWriter: Send {
    fn append(&mut self, frame: &FrameRecord) -> Result<(), EncodeError>;

    fn finish(self: Box<Self>) -> Result<Vec<u8>, EncodeError>;
}

/// Capability object for one codec implementation.
pub trait CodecBackend: Send + Sync {
    fn id(&self) -> BackendId;

    fn kind(&self) -> BackendKind;

    fn encode_still(
        &self,
        _image: &DynamicImage,
        _params: &EncodeParams,
    ) -> Result<Vec<u8>, EncodeError> {
        Err(EncodeError::unsupported(self.id(), "still encoding"))
    }

    fn supports_sequences(&self) -> bool {
        false
    }

    fn sequence_writer(
        &self,
        _timescale: u32,
        _params: &EncodeParams,
    ) -> Result<Box<dyn SequenceWriter>, EncodeError> {
        Err(EncodeError::unsupported(self.id(), "sequence encoding"))
    }

    /// Encodes a whole sequence. A failing frame aborts the sequence.
    fn encode_sequence(
        &self,
        frames: &[FrameRecord],
        timescale: u32,
        params: &EncodeParams,
    ) -> Result<Vec<u8>, EncodeError> {
        write_frames(self, frames, timescale, params, |_| {})
    }

    fn decode_sequence(&self, _bytes: &[u8]) -> Result<FrameSequence, DecodeError> {
        Err(DecodeError::Backend {
            backend: self.id(),
            message: "decoding not supported".to_string(),
        })
    }
}

/// Appends `frames` in order through a fresh writer, calling `on_frame` with the
/// number of frames appended so far. The writer is returned unfinished.
pub fn append_frames<B: CodecBackend + ?Sized>(
    backend: &B,
    frames: &[FrameRecord],
    timescale: u32,
    params: &EncodeParams,
    mut on_frame: impl FnMut(usize),
) -> Result<Box<dyn SequenceWriter>, EncodeError> {
    let mut writer = backend.sequence_writer(timescale, params)?;
    for (index, frame) in frames.iter().enumerate() {
        writer
            .append(frame)
            .map_err(|e| EncodeError::FrameAppend {
                index,
                message: e.to_string(),
            })?;
        on_frame(index + 1);
    }
    Ok(writer)
}

/// `append_frames` followed by `finish`. No bytes are returned unless every frame made it.
pub fn write_frames<B: CodecBackend + ?Sized>(
    backend: &B,
    frames: &[FrameRecord],
    timescale: u32,
    params: &EncodeParams,
    on_frame: impl FnMut(usize),
) -> Result<Vec<u8>, EncodeError> {
    append_frames(backend, frames, timescale, params, on_frame)?.finish()
}

/// Converts a duration between timescales, rounding to the nearest tick.
pub fn rescale_ticks(ticks: u64, from: u32, to: u32) -> u64 {
    if from == to || from == 0 {
        return ticks;
    }
    ((ticks as u128 * to as u128 + from as u128 / 2) / from as u128) as u64
}
