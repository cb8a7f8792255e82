//! # Audio/Video Processing Module
//!
//! Ricodifica audio e video con FFmpeg. Nessuna catena di fallback: se ffmpeg fallisce
//! l'item ricade sui byte originali.
//!
//! ## Video:
//! - Codec: `libx265` (default, con `-tag:v hvc1`) o `libx264`
//! - CRF configurabile (default 23), preset (default `medium`)
//! - Audio AAC al bitrate configurato, `-movflags +faststart`
//! - Container: MP4/MOV/M4V. Matroska e AVI non sono ammessi come target
//!
//! ## Audio:
//! | Target | Codec        | Bitrate |
//! |--------|--------------|---------|
//! | MP3    | `libmp3lame` | sì      |
//! | AAC    | `aac`        | sì      |
//! | M4A    | `aac`        | sì      |
//! | Opus   | `libopus`    | sì      |
//! | FLAC   | `flac`       | no      |
//! | WAV    | `pcm_s16le`  | no      |
//!
//! ## Progresso:
//! `-progress pipe:1` riporta `out_time_us`; rapportato alla durata letta con ffprobe.
//! Se la durata non è nota si usa il heartbeat.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::args;
use crate::codec::external::task_dir;
use crate::codec::ffmpeg::{probe, probe_duration};
use crate::codec::BackendId;
use crate::error::{CompressError, EncodeError};
use crate::format::{AudioFormat, MediaCategory, MediaFormat, VideoContainer};
use crate::outcome::{EncodeReport, EncodedCandidate, SourceAsset};
use crate::progress::{Heartbeat, HeartbeatConfig, StageReporter};
use crate::tools::{read_tool_output, ToolCommand};
use crate::utils::path_arg;

const PRESETS: [&str; 10] = [
    "ultrafast",
    "superfast",
    "veryfast",
    "faster",
    "fast",
    "medium",
    "slow",
    "slower",
    "veryslow",
    "placebo",
];

/// libopus only accepts 8/12/16/24/48 kHz.
const OPUS_SAMPLE_RATE: u32 = 48_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VideoCodec {
    H264,
    #[default]
    H265,
}

impl VideoCodec {
    pub fn encoder(self) -> &'static str {
        match self {
            Self::H264 => "libx264",
            Self::H265 => "libx265",
        }
    }
}

/// Audio and video encoder settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AvSettings {
    pub video_codec: VideoCodec,
    /// 0-51, lower is better quality.
    pub video_crf: u8,
    pub video_preset: String,
    pub audio_bitrate: String,
    pub audio_sample_rate: u32,
    pub audio_channels: u8,
}

impl Default for AvSettings {
    fn default() -> Self {
        Self {
            video_codec: VideoCodec::H265,
            video_crf: 23,
            video_preset: "medium".to_string(),
            audio_bitrate: "128k".to_string(),
            audio_sample_rate: 44_100,
            audio_channels: 2,
        }
    }
}

impl AvSettings {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.video_crf > 51 {
            return Err(anyhow::anyhow!("Video CRF must be between 0 and 51"));
        }
        if !PRESETS.contains(&self.video_preset.as_str()) {
            return Err(anyhow::anyhow!("Unknown video preset: {}", self.video_preset));
        }
        if !is_bitrate(&self.audio_bitrate) {
            return Err(anyhow::anyhow!(
                "Audio bitrate must look like 128k or 1M, got {}",
                self.audio_bitrate
            ));
        }
        if !(8_000..=192_000).contains(&self.audio_sample_rate) {
            return Err(anyhow::anyhow!("Audio sample rate must be between 8000 and 192000"));
        }
        if !(1..=8).contains(&self.audio_channels) {
            return Err(anyhow::anyhow!("Audio channels must be between 1 and 8"));
        }
        Ok(())
    }
}

fn is_bitrate(value: &str) -> bool {
    let digits = value.trim_end_matches(['k', 'K', 'm', 'M']);
    !digits.is_empty() && digits.len() + 1 >= value.len() && digits.bytes().all(|b| b.is_ascii_digit())
}

/// Output format for an audio or video source.
///
/// Without an explicit target, audio keeps its format and video keeps MP4/MOV/M4V
/// or moves to MP4.
pub fn resolve_target(source: MediaFormat, target: Option<MediaFormat>) -> Result<MediaFormat, CompressError> {
    let target = target.unwrap_or(match source {
        MediaFormat::Video(VideoContainer::Matroska | VideoContainer::Avi) => MediaFormat::Video(VideoContainer::Mp4),
        other => other,
    });

    if source.category() == MediaCategory::Image || source.category() != target.category() {
        return Err(CompressError::UnsupportedContainer(format!(
            "cannot convert {source} to {target}"
        )));
    }
    if let MediaFormat::Video(VideoContainer::Matroska | VideoContainer::Avi) = target {
        return Err(CompressError::UnsupportedContainer(format!(
            "{target} cannot carry H.264/H.265 with AAC audio"
        )));
    }
    Ok(target)
}

/// ffmpeg arguments for `target`, progress written to stdout.
pub fn ffmpeg_arguments(
    settings: &AvSettings,
    target: MediaFormat,
    input: &Path,
    output: &Path,
) -> Result<Vec<String>, EncodeError> {
    let mut arguments = args!["-hide_banner", "-v", "error", "-nostats", "-progress", "pipe:1", "-i", path_arg(input)];

    match target {
        MediaFormat::Video(_) => {
            arguments.extend(args![
                "-c:v",
                settings.video_codec.encoder(),
                "-crf",
                settings.video_crf,
                "-preset",
                settings.video_preset
            ]);
            if settings.video_codec == VideoCodec::H265 {
                arguments.extend(args!["-tag:v", "hvc1"]);
            }
            arguments.extend(args![
                "-c:a",
                "aac",
                "-b:a",
                settings.audio_bitrate,
                "-movflags",
                "+faststart"
            ]);
        }
        MediaFormat::Audio(audio) => {
            let (codec, uses_bitrate) = match audio {
                AudioFormat::Mp3 => ("libmp3lame", true),
                AudioFormat::Aac | AudioFormat::M4a => ("aac", true),
                AudioFormat::Opus => ("libopus", true),
                AudioFormat::Flac => ("flac", false),
                AudioFormat::Wav => ("pcm_s16le", false),
            };
            let sample_rate = if audio == AudioFormat::Opus {
                OPUS_SAMPLE_RATE
            } else {
                settings.audio_sample_rate
            };
            arguments.extend(args!["-vn", "-c:a", codec]);
            if uses_bitrate {
                arguments.extend(args!["-b:a", settings.audio_bitrate]);
            }
            arguments.extend(args!["-ar", sample_rate, "-ac", settings.audio_channels]);
        }
        _ => return Err(EncodeError::unsupported(BackendId::Ffmpeg, "image targets")),
    }

    arguments.extend(args!["-y", path_arg(output)]);
    Ok(arguments)
}

/// Seconds of output written so far, from one `-progress` line.
pub fn out_time_seconds(line: &str) -> Option<f64> {
    let (key, value) = line.trim().split_once('=')?;
    if key != "out_time_us" && key != "out_time_ms" {
        return None;
    }
    value.parse::<i64>().ok().filter(|us| *us >= 0).map(|us| us as f64 / 1_000_000.0)
}

/// Transcodes audio and video sources through ffmpeg.
pub struct AvProcessor {
    settings: AvSettings,
}

impl AvProcessor {
    pub fn new(settings: AvSettings) -> Self {
        Self { settings }
    }

    /// Candidate in `target`, or a degraded passthrough when ffmpeg fails.
    pub async fn transcode(
        &self,
        source: &SourceAsset,
        source_format: MediaFormat,
        target: MediaFormat,
        stage: StageReporter,
    ) -> EncodedCandidate {
        match self.run(source, source_format, target, stage).await {
            Ok(candidate) => candidate,
            Err(e) => {
                warn!("⚠️  ffmpeg failed on {} -> {}: {}", source_format, target, e);
                let mut report = EncodeReport::new("passthrough");
                report.note(format!("ffmpeg: {e}"));
                EncodedCandidate::passthrough(source, source_format).with_report(report)
            }
        }
    }

    async fn run(
        &self,
        source: &SourceAsset,
        source_format: MediaFormat,
        target: MediaFormat,
        stage: StageReporter,
    ) -> Result<EncodedCandidate, EncodeError> {
        let bytes = source.shared();
        let input_name = format!("input.{}", source_format.extension());
        let (dir, input, duration) = tokio::task::spawn_blocking(
            move || -> Result<(TempDir, PathBuf, Option<f64>), EncodeError> {
                let dir = task_dir()?;
                let input = dir.path().join(input_name);
                std::fs::write(&input, &bytes)?;
                let duration = probe(&input, &[]).ok().as_ref().and_then(probe_duration);
                Ok((dir, input, duration))
            },
        )
        .await
        .map_err(|e| EncodeError::Join(e.to_string()))??;

        let output = dir.path().join(format!("output.{}", target.extension()));
        let arguments = ffmpeg_arguments(&self.settings, target, &input, &output)?;
        debug!("🎬 {} -> {} (duration {:?}s)", source_format, target, duration);

        let heartbeat = duration
            .is_none()
            .then(|| Heartbeat::start(stage.clone(), HeartbeatConfig::still()));
        let progress = stage.clone();
        let result = tokio::task::spawn_blocking(move || {
            ToolCommand::new("ffmpeg", arguments).run_streaming(|line| {
                if let (Some(total), Some(done)) = (duration, out_time_seconds(line)) {
                    progress.report((done / total) as f32);
                }
            })?;
            let bytes = read_tool_output("ffmpeg", &output);
            drop(dir);
            bytes
        })
        .await
        .map_err(|e| EncodeError::Join(e.to_string()));
        if let Some(heartbeat) = heartbeat {
            heartbeat.stop().await;
        }
        let bytes = result??;

        info!("🎬 ffmpeg produced {} bytes of {}", bytes.len(), target);
        Ok(EncodedCandidate::new(bytes, target, BackendId::Ffmpeg).with_report(self.report(target)))
    }

    fn report(&self, target: MediaFormat) -> EncodeReport {
        let settings = &self.settings;
        let report = EncodeReport::new("ffmpeg");
        match target {
            MediaFormat::Video(_) => report
                .with_parameter("video_codec", settings.video_codec.encoder())
                .with_parameter("crf", settings.video_crf)
                .with_parameter("preset", &settings.video_preset)
                .with_parameter("audio_bitrate", &settings.audio_bitrate),
            _ => report
                .with_parameter("audio_bitrate", &settings.audio_bitrate)
                .with_parameter("sample_rate", settings.audio_sample_rate)
                .with_parameter("channels", settings.audio_channels),
        }
    }
}
