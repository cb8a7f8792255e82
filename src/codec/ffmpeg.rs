//! # FFmpeg Backends
//!
//! Il transcoder esterno non è mai l'encoder primario per le immagini statiche.
//! Viene usato solo per:
//! - **Decode-to-preview** (`FfmpegTranscoder`): estrae i frame di sequenze AVIF/HEIC
//!   come PNG, con le durate lette da ffprobe nel time base dello stream
//! - **Pipeline GIF a filtri** (`FfmpegGif`): `palettegen` + `paletteuse` con dithering
//!   Bayer, scala e frame rate opzionali
//!
//! `probe()` è condiviso con `av_processor` per durata e stream.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use super::external::{task_dir, FrameSpool};
use super::{BackendId, BackendKind, CodecBackend, EncodeParams, FrameRecord, FrameSequence, GifOptions, SequenceWriter};
use crate::args;
use crate::error::{DecodeError, EncodeError};
use crate::quality::{gif_palette_size, QualitySetting};
use crate::tools::{read_tool_output, ToolCommand};
use crate::utils::path_arg;

/// Timescale assumed when the stream carries no time base.
pub const DEFAULT_SEQUENCE_TIMESCALE: u32 = 30;

/// Runs ffprobe and returns its JSON report.
pub fn probe(path: &Path, extra: &[&str]) -> Result<Value, EncodeError> {
    let mut arguments = args!["-v", "quiet", "-print_format", "json", "-show_format", "-show_streams"];
    arguments.extend(extra.iter().map(|a| a.to_string()));
    arguments.push(path_arg(path));

    let output = ToolCommand::new("ffprobe", arguments).run()?;
    serde_json::from_slice(&output.stdout)
        .map_err(|e| EncodeError::backend(BackendId::Ffmpeg, format!("unreadable ffprobe output: {e}")))
}

/// Container duration in seconds, when ffprobe knows it.
pub fn probe_duration(info: &Value) -> Option<f64> {
    info["format"]["duration"]
        .as_str()
        .and_then(|d| d.parse::<f64>().ok())
        .filter(|d| *d > 0.0)
}

/// Parses an ffprobe rational such as `1/30`.
fn parse_rational(value: &str) -> Option<(u64, u64)> {
    let (num, den) = value.split_once('/')?;
    let num = num.trim().parse::<u64>().ok()?;
    let den = den.trim().parse::<u64>().ok()?;
    (num > 0 && den > 0).then_some((num, den))
}

fn as_ticks(value: &Value) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_str().and_then(|s| s.parse::<u64>().ok()))
}

/// Timescale and per-frame durations of the first video stream.
fn sequence_timing(info: &Value) -> (u32, Vec<u64>) {
    let stream = info["streams"]
        .as_array()
        .and_then(|streams| streams.iter().find(|s| s["codec_type"] == "video"))
        .unwrap_or(&Value::Null);

    // a time base of N/D means ticks of N at a timescale of D
    let (numerator, timescale) = stream["time_base"]
        .as_str()
        .and_then(parse_rational)
        .filter(|(_, den)| *den <= u32::MAX as u64)
        .map(|(num, den)| (num, den as u32))
        .unwrap_or((1, DEFAULT_SEQUENCE_TIMESCALE));

    let durations = info["frames"]
        .as_array()
        .map(|frames| {
            frames
                .iter()
                .map(|frame| {
                    as_ticks(&frame["duration"])
                        .or_else(|| as_ticks(&frame["pkt_duration"]))
                        .unwrap_or(0)
                        * numerator
                })
                .collect()
        })
        .unwrap_or_default();

    (timescale, durations)
}

/// Decode-only transcoder for sequences the `image` crate cannot read.
pub struct FfmpegTranscoder;

impl CodecBackend for FfmpegTranscoder {
    fn id(&self) -> BackendId {
        BackendId::Ffmpeg
    }

    fn kind(&self) -> BackendKind {
        BackendKind::ExternalProcess
    }

    fn decode_sequence(&self, bytes: &[u8]) -> Result<FrameSequence, DecodeError> {
        let to_decode_error = |e: EncodeError| DecodeError::Backend {
            backend: BackendId::Ffmpeg,
            message: e.to_string(),
        };

        let dir = task_dir()?;
        let input = dir.path().join("input.bin");
        std::fs::write(&input, bytes)?;

        let info = probe(&input, &["-select_streams", "v:0", "-show_frames"]).map_err(to_decode_error)?;
        let (timescale, durations) = sequence_timing(&info);

        let pattern = dir.path().join("frame_%05d.png");
        ToolCommand::new(
            "ffmpeg",
            args!["-v", "error", "-i", path_arg(&input), "-vsync", 0, path_arg(&pattern)],
        )
        .run()
        .map_err(to_decode_error)?;

        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir.path())?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("frame_") && n.ends_with(".png"))
            })
            .collect();
        paths.sort();

        let frames = paths
            .iter()
            .enumerate()
            .map(|(index, path)| -> Result<FrameRecord, DecodeError> {
                Ok(FrameRecord {
                    image: image::open(path)?,
                    duration_ticks: durations.get(index).copied().unwrap_or(0),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        if frames.is_empty() {
            return Err(DecodeError::Empty);
        }
        debug!("ffmpeg decoded {} frame(s) at timescale {}", frames.len(), timescale);
        Ok(FrameSequence { frames, timescale })
    }
}

/// Animated GIF through ffmpeg's palette filters.
pub struct FfmpegGif;

impl CodecBackend for FfmpegGif {
    fn id(&self) -> BackendId {
        BackendId::FfmpegGif
    }

    fn kind(&self) -> BackendKind {
        BackendKind::ExternalProcess
    }

    fn supports_sequences(&self) -> bool {
        true
    }

    fn sequence_writer(
        &self,
        timescale: u32,
        params: &EncodeParams,
    ) -> Result<Box<dyn SequenceWriter>, EncodeError> {
        Ok(Box::new(FfmpegGifWriter {
            spool: FrameSpool::new(BackendId::FfmpegGif)?,
            timescale: timescale.max(1),
            filter: gif_filter(params.quality, &params.gif),
        }))
    }
}

/// `[fps=F,]scale=...,split,palettegen,paletteuse` filter graph.
pub fn gif_filter(quality: QualitySetting, options: &GifOptions) -> String {
    let fps = options
        .frame_rate
        .filter(|rate| *rate > 0.0)
        .map(|rate| format!("fps={rate},"))
        .unwrap_or_default();
    let scale = if options.scale > 0.0 { options.scale } else { 1.0 };
    let dither = if options.dithering {
        "bayer:bayer_scale=5"
    } else {
        "none"
    };
    format!(
        "{fps}scale=iw*{scale}:-1:flags=lanczos,split[s0][s1];[s0]palettegen=max_colors={}[p];[s1][p]paletteuse=dither={dither}",
        gif_palette_size(quality)
    )
}

struct FfmpegGifWriter {
    spool: FrameSpool,
    timescale: u32,
    filter: String,
}

impl FfmpegGifWriter {
    /// Concat demuxer script. The last entry is repeated so its duration is honored.
    fn concat_script(&self) -> String {
        let mut script = String::from("ffconcat version 1.0\n");
        for (path, ticks) in &self.spool.frames {
            let name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
            script.push_str(&format!(
                "file '{name}'\nduration {:.3}\n",
                *ticks as f64 / self.timescale as f64
            ));
        }
        if let Some((path, _)) = self.spool.frames.last() {
            let name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
            script.push_str(&format!("file '{name}'\n"));
        }
        script
    }
}

impl SequenceWriter for FfmpegGifWriter {
    fn append(&mut self, frame: &FrameRecord) -> Result<(), EncodeError> {
        self.spool.push(frame)
    }

    fn finish(self: Box<Self>) -> Result<Vec<u8>, EncodeError> {
        self.spool.ensure_not_empty()?;
        let list = self.spool.dir().join("frames.txt");
        let output = self.spool.dir().join("output.gif");
        std::fs::write(&list, self.concat_script())?;

        ToolCommand::new(
            "ffmpeg",
            args![
                "-v",
                "error",
                "-f",
                "concat",
                "-safe",
                0,
                "-i",
                path_arg(&list),
                "-filter_complex",
                self.filter,
                "-loop",
                0,
                "-y",
                path_arg(&output)
            ],
        )
        .run()?;
        read_tool_output("ffmpeg", &output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::DynamicImage;
    use serde_json::json;

    #[test]
    fn test_gif_filter_with_defaults() {
        let filter = gif_filter(QualitySetting::new(1.0), &GifOptions::default());
        assert_eq!(
            filter,
            "scale=iw*1:-1:flags=lanczos,split[s0][s1];[s0]palettegen=max_colors=256[p];[s1][p]paletteuse=dither=bayer:bayer_scale=5"
        );
    }

    #[test]
    fn test_gif_filter_with_frame_rate_and_no_dither() {
        let options = GifOptions {
            scale: 0.5,
            dithering: false,
            frame_rate: Some(12.0),
        };
        let filter = gif_filter(QualitySetting::new(0.1), &options);
        assert!(filter.starts_with("fps=12,scale=iw*0.5:-1"));
        assert!(filter.contains("max_colors=25"));
        assert!(filter.ends_with("dither=none"));
    }

    #[test]
    fn test_sequence_timing_reads_time_base_and_durations() {
        let info = json!({
            "streams": [
                { "codec_type": "audio", "time_base": "1/44100" },
                { "codec_type": "video", "time_base": "1/600" }
            ],
            "frames": [
                { "duration": 60 },
                { "pkt_duration": "30" },
                {}
            ]
        });
        let (timescale, durations) = sequence_timing(&info);
        assert_eq!(timescale, 600);
        assert_eq!(durations, vec![60, 30, 0]);
    }

    #[test]
    fn test_sequence_timing_defaults_without_time_base() {
        let (timescale, durations) = sequence_timing(&json!({}));
        assert_eq!(timescale, DEFAULT_SEQUENCE_TIMESCALE);
        assert!(durations.is_empty());
    }

    #[test]
    fn test_non_unit_time_base_scales_ticks() {
        let info = json!({
            "streams": [{ "codec_type": "video", "time_base": "2/50" }],
            "frames": [{ "duration": 3 }]
        });
        assert_eq!(sequence_timing(&info), (50, vec![6]));
    }

    #[test]
    fn test_concat_script_repeats_last_frame() {
        let mut writer = FfmpegGifWriter {
            spool: FrameSpool::new(BackendId::FfmpegGif).unwrap(),
            timescale: 1000,
            filter: String::new(),
        };
        for ticks in [100, 250] {
            writer
                .append(&FrameRecord {
                    image: DynamicImage::new_rgba8(4, 4),
                    duration_ticks: ticks,
                })
                .unwrap();
        }
        let script = writer.concat_script();
        assert!(script.contains("file 'frame_00000.png'\nduration 0.100\n"));
        assert!(script.contains("duration 0.250\n"));
        assert!(script.ends_with("file 'frame_00001.png'\n"));
    }

    #[test]
    fn test_probe_duration_ignores_missing_values() {
        assert_eq!(probe_duration(&json!({ "format": { "duration": "12.5" } })), Some(12.5));
        assert_eq!(probe_duration(&json!({ "format": {} })), None);
    }
}
