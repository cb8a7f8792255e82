//! # Format Sniffer
//!
//! Classifica i byte grezzi in un `MediaFormat` leggendo solo i magic number del
//! container. Nessuna dipendenza da estensioni di file.
//!
//! ## Regole:
//! - Ispeziona al massimo i primi 30 byte (`SNIFF_WINDOW`)
//! - Ordine: PNG, HEIC, JPEG, WebP, AVIF, GIF, audio, video
//! - Buffer troppo corti o pattern sconosciuti ricadono su JPEG (`recognized = false`)
//! - WebP: il bit di animazione del chunk VP8X viene letto qui; il numero di frame
//!   decodificati viene confrontato più avanti dall'orchestratore
//! - AVIF: il brand `avis` indica una sequenza di frame

use std::fmt;
use std::str::FromStr;

/// Number of leading bytes the sniffer may look at.
pub const SNIFF_WINDOW: usize = 30;

const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
const EBML_MAGIC: [u8; 4] = [0x1A, 0x45, 0xDF, 0xA3];
const VP8X_ANIMATION_FLAG: u8 = 0x02;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AudioFormat {
    Mp3,
    Aac,
    M4a,
    Opus,
    Flac,
    Wav,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VideoContainer {
    Mp4,
    Mov,
    M4v,
    Matroska,
    Avi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaCategory {
    Image,
    Audio,
    Video,
}

/// Closed set of formats the pipeline understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaFormat {
    Jpeg,
    Png,
    Heic,
    WebP,
    Avif,
    Gif,
    Audio(AudioFormat),
    Video(VideoContainer),
}

impl MediaFormat {
    pub fn category(&self) -> MediaCategory {
        match self {
            Self::Audio(_) => MediaCategory::Audio,
            Self::Video(_) => MediaCategory::Video,
            _ => MediaCategory::Image,
        }
    }

    /// Containers that can carry more than one frame.
    pub fn supports_animation(&self) -> bool {
        matches!(self, Self::WebP | Self::Avif | Self::Gif)
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Png => "png",
            Self::Heic => "heic",
            Self::WebP => "webp",
            Self::Avif => "avif",
            Self::Gif => "gif",
            Self::Audio(audio) => match audio {
                AudioFormat::Mp3 => "mp3",
                AudioFormat::Aac => "aac",
                AudioFormat::M4a => "m4a",
                AudioFormat::Opus => "opus",
                AudioFormat::Flac => "flac",
                AudioFormat::Wav => "wav",
            },
            Self::Video(video) => match video {
                VideoContainer::Mp4 => "mp4",
                VideoContainer::Mov => "mov",
                VideoContainer::M4v => "m4v",
                VideoContainer::Matroska => "mkv",
                VideoContainer::Avi => "avi",
            },
        }
    }
}

impl fmt::Display for MediaFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Jpeg => "JPEG",
            Self::Png => "PNG",
            Self::Heic => "HEIC",
            Self::WebP => "WebP",
            Self::Avif => "AVIF",
            Self::Gif => "GIF",
            Self::Audio(AudioFormat::Mp3) => "MP3",
            Self::Audio(AudioFormat::Aac) => "AAC",
            Self::Audio(AudioFormat::M4a) => "M4A",
            Self::Audio(AudioFormat::Opus) => "Opus",
            Self::Audio(AudioFormat::Flac) => "FLAC",
            Self::Audio(AudioFormat::Wav) => "WAV",
            Self::Video(VideoContainer::Mp4) => "MP4",
            Self::Video(VideoContainer::Mov) => "MOV",
            Self::Video(VideoContainer::M4v) => "M4V",
            Self::Video(VideoContainer::Matroska) => "Matroska",
            Self::Video(VideoContainer::Avi) => "AVI",
        };
        f.write_str(name)
    }
}

impl FromStr for MediaFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let format = match s.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Self::Jpeg,
            "png" => Self::Png,
            "heic" | "heif" => Self::Heic,
            "webp" => Self::WebP,
            "avif" => Self::Avif,
            "gif" => Self::Gif,
            "mp3" => Self::Audio(AudioFormat::Mp3),
            "aac" => Self::Audio(AudioFormat::Aac),
            "m4a" => Self::Audio(AudioFormat::M4a),
            "opus" | "ogg" => Self::Audio(AudioFormat::Opus),
            "flac" => Self::Audio(AudioFormat::Flac),
            "wav" => Self::Audio(AudioFormat::Wav),
            "mp4" => Self::Video(VideoContainer::Mp4),
            "mov" => Self::Video(VideoContainer::Mov),
            "m4v" => Self::Video(VideoContainer::M4v),
            "mkv" | "webm" => Self::Video(VideoContainer::Matroska),
            "avi" => Self::Video(VideoContainer::Avi),
            other => return Err(format!("unknown media format: {other}")),
        };
        Ok(format)
    }
}

/// Result of sniffing a buffer. Computed once per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatTag {
    pub format: MediaFormat,
    pub is_animated: bool,
    /// `false` when the JPEG fallback was taken.
    pub recognized: bool,
}

impl FormatTag {
    fn positive(format: MediaFormat, is_animated: bool) -> Self {
        Self {
            format,
            is_animated,
            recognized: true,
        }
    }

    fn fallback() -> Self {
        Self {
            format: MediaFormat::Jpeg,
            is_animated: false,
            recognized: false,
        }
    }
}

/// Classify `bytes` by container magic.
pub fn detect(bytes: &[u8]) -> FormatTag {
    let head = &bytes[..bytes.len().min(SNIFF_WINDOW)];
    if head.len() <= 12 {
        return FormatTag::fallback();
    }

    if head.starts_with(&PNG_SIGNATURE) {
        return FormatTag::positive(MediaFormat::Png, false);
    }

    let brand = ftyp_brand(head);
    if let Some(brand) = brand {
        if matches!(&brand, b"heic" | b"heix" | b"hevc" | b"mif1") {
            return FormatTag::positive(MediaFormat::Heic, false);
        }
    }

    if head.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return FormatTag::positive(MediaFormat::Jpeg, false);
    }

    if riff_form(head) == Some(*b"WEBP") {
        return FormatTag::positive(MediaFormat::WebP, webp_animation_flag(head));
    }

    if let Some(brand) = brand {
        match &brand {
            b"avif" => return FormatTag::positive(MediaFormat::Avif, false),
            b"avis" => return FormatTag::positive(MediaFormat::Avif, true),
            _ => {}
        }
    }

    if head.starts_with(b"GIF87a") || head.starts_with(b"GIF89a") {
        return FormatTag::positive(MediaFormat::Gif, false);
    }

    if let Some(audio) = sniff_audio(head, brand) {
        return FormatTag::positive(MediaFormat::Audio(audio), false);
    }

    if let Some(video) = sniff_video(head, brand) {
        return FormatTag::positive(MediaFormat::Video(video), false);
    }

    FormatTag::fallback()
}

/// Reads the VP8X flags byte. Only meaningful for `RIFF....WEBP` buffers.
pub fn webp_animation_flag(head: &[u8]) -> bool {
    head.len() > 20 && &head[12..16] == b"VP8X" && head[20] & VP8X_ANIMATION_FLAG != 0
}

fn ftyp_brand(head: &[u8]) -> Option<[u8; 4]> {
    if head.len() < 12 || &head[4..8] != b"ftyp" {
        return None;
    }
    let mut brand = [0u8; 4];
    brand.copy_from_slice(&head[8..12]);
    Some(brand)
}

fn riff_form(head: &[u8]) -> Option<[u8; 4]> {
    if head.len() < 12 || &head[0..4] != b"RIFF" {
        return None;
    }
    let mut form = [0u8; 4];
    form.copy_from_slice(&head[8..12]);
    Some(form)
}

fn sniff_audio(head: &[u8], brand: Option<[u8; 4]>) -> Option<AudioFormat> {
    if head.starts_with(b"ID3") {
        return Some(AudioFormat::Mp3);
    }
    if head.starts_with(b"fLaC") {
        return Some(AudioFormat::Flac);
    }
    if head.starts_with(b"OggS") {
        return Some(AudioFormat::Opus);
    }
    if riff_form(head) == Some(*b"WAVE") {
        return Some(AudioFormat::Wav);
    }
    if matches!(brand.as_ref(), Some(b"M4A ") | Some(b"M4B ")) {
        return Some(AudioFormat::M4a);
    }
    if head[0] == 0xFF {
        // ADTS: 12-bit sync with layer bits 00
        if head[1] & 0xF6 == 0xF0 {
            return Some(AudioFormat::Aac);
        }
        // MPEG audio frame sync
        if head[1] & 0xE0 == 0xE0 {
            return Some(AudioFormat::Mp3);
        }
    }
    None
}

fn sniff_video(head: &[u8], brand: Option<[u8; 4]>) -> Option<VideoContainer> {
    if let Some(brand) = brand {
        return match &brand {
            b"qt  " => Some(VideoContainer::Mov),
            b"M4V " | b"M4VH" | b"M4VP" => Some(VideoContainer::M4v),
            b"isom" | b"iso2" | b"iso4" | b"iso5" | b"iso6" | b"mp41" | b"mp42" | b"avc1"
            | b"dash" | b"MSNV" => Some(VideoContainer::Mp4),
            _ => None,
        };
    }
    if head.starts_with(&EBML_MAGIC) {
        return Some(VideoContainer::Matroska);
    }
    if riff_form(head) == Some(*b"AVI ") {
        return Some(VideoContainer::Avi);
    }
    None
}
