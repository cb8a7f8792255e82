//! # System Codec Encoders
//!
//! Encoder di riferimento delle librerie codec di sistema, pilotati come processi:
//!
//! | Backend      | Tool          | Capacità                    |
//! |--------------|---------------|-----------------------------|
//! | `MozJpeg`    | cjpeg         | still JPEG                  |
//! | `Cwebp`      | cwebp         | still WebP                  |
//! | `Img2Webp`   | img2webp      | sequenze WebP animate       |
//! | `AvifEnc`    | avifenc       | still AVIF + sequenze AVIF  |
//! | `HeifEnc`    | heif-enc      | still HEIC                  |
//! | `HeifConvert`| heif-convert  | decode HEIC                 |
//!
//! L'I/O passa da una `TempDir` univoca per chiamata, eliminata al drop su ogni
//! percorso di uscita (successo, errore, panic del thread bloccante).

use std::path::{Path, PathBuf};

use image::{DynamicImage, ImageFormat};
use tempfile::TempDir;
use tracing::debug;

use super::image_codec::WEBP_TIMESCALE;
use super::{
    rescale_ticks, BackendId, BackendKind, CodecBackend, EncodeParams, FrameRecord, FrameSequence, SequenceWriter,
};
use crate::args;
use crate::error::{DecodeError, EncodeError};
use crate::quality::{lossy_percent, quantizer};
use crate::tools::{read_tool_output, ToolCommand};
use crate::utils::path_arg;

pub(crate) fn task_dir() -> Result<TempDir, std::io::Error> {
    tempfile::Builder::new().prefix("media-recompress-").tempdir()
}

fn write_png(image: &DynamicImage, path: &Path) -> Result<(), EncodeError> {
    image.save_with_format(path, ImageFormat::Png)?;
    Ok(())
}

/// Frames written to disk as they are appended, for tools that take file lists.
pub(crate) struct FrameSpool {
    dir: TempDir,
    pub(crate) frames: Vec<(PathBuf, u64)>,
    dimensions: Option<(u32, u32)>,
    backend: BackendId,
}

impl FrameSpool {
    pub(crate) fn new(backend: BackendId) -> Result<Self, EncodeError> {
        Ok(Self {
            dir: task_dir()?,
            frames: Vec::new(),
            dimensions: None,
            backend,
        })
    }

    pub(crate) fn dir(&self) -> &Path {
        self.dir.path()
    }

    pub(crate) fn push(&mut self, frame: &FrameRecord) -> Result<(), EncodeError> {
        let dimensions = (frame.image.width(), frame.image.height());
        match self.dimensions {
            None => self.dimensions = Some(dimensions),
            Some(expected) if expected != dimensions => {
                return Err(EncodeError::backend(
                    self.backend,
                    format!("frame is {dimensions:?}, sequence is {expected:?}"),
                ));
            }
            Some(_) => {}
        }
        let path = self
            .dir
            .path()
            .join(format!("frame_{:05}.png", self.frames.len()));
        write_png(&frame.image, &path)?;
        self.frames.push((path, frame.duration_ticks.max(1)));
        Ok(())
    }

    pub(crate) fn ensure_not_empty(&self) -> Result<(), EncodeError> {
        if self.frames.is_empty() {
            return Err(EncodeError::backend(self.backend, "sequence has no frames"));
        }
        Ok(())
    }
}

/// MozJPEG through `cjpeg`.
pub struct MozJpeg;

impl CodecBackend for MozJpeg {
    fn id(&self) -> BackendId {
        BackendId::MozJpeg
    }

    fn kind(&self) -> BackendKind {
        BackendKind::System
    }

    fn encode_still(&self, image: &DynamicImage, params: &EncodeParams) -> Result<Vec<u8>, EncodeError> {
        let dir = task_dir()?;
        let input = dir.path().join("input.ppm");
        let output = dir.path().join("output.jpg");
        DynamicImage::ImageRgb8(image.to_rgb8()).save_with_format(&input, ImageFormat::Pnm)?;

        ToolCommand::new(
            "cjpeg",
            args![
                "-quality",
                lossy_percent(params.quality.value()),
                "-optimize",
                "-progressive",
                "-outfile",
                path_arg(&output),
                path_arg(&input)
            ],
        )
        .run()?;
        read_tool_output("cjpeg", &output)
    }
}

/// libwebp still encoder.
pub struct Cwebp;

impl CodecBackend for Cwebp {
    fn id(&self) -> BackendId {
        BackendId::Cwebp
    }

    fn kind(&self) -> BackendKind {
        BackendKind::System
    }

    fn encode_still(&self, image: &DynamicImage, params: &EncodeParams) -> Result<Vec<u8>, EncodeError> {
        let dir = task_dir()?;
        let input = dir.path().join("input.png");
        let output = dir.path().join("output.webp");
        write_png(image, &input)?;

        ToolCommand::new(
            "cwebp",
            args![
                "-q",
                lossy_percent(params.quality.value()),
                "-m",
                6,
                "-mt",
                "-metadata",
                "none",
                path_arg(&input),
                "-o",
                path_arg(&output)
            ],
        )
        .run()?;
        read_tool_output("cwebp", &output)
    }
}

/// libwebp animation encoder.
pub struct Img2Webp;

impl CodecBackend for Img2Webp {
    fn id(&self) -> BackendId {
        BackendId::Img2Webp
    }

    fn kind(&self) -> BackendKind {
        BackendKind::System
    }

    fn supports_sequences(&self) -> bool {
        true
    }

    fn sequence_writer(
        &self,
        timescale: u32,
        params: &EncodeParams,
    ) -> Result<Box<dyn SequenceWriter>, EncodeError> {
        Ok(Box::new(Img2WebpWriter {
            spool: FrameSpool::new(BackendId::Img2Webp)?,
            timescale: timescale.max(1),
            quality: lossy_percent(params.quality.value()),
        }))
    }
}

struct Img2WebpWriter {
    spool: FrameSpool,
    timescale: u32,
    quality: u8,
}

impl Img2WebpWriter {
    fn arguments(&self, output: &Path) -> Vec<String> {
        let mut arguments = args!["-loop", 0, "-lossy", "-q", self.quality, "-m", 4];
        for (path, ticks) in &self.spool.frames {
            let ms = rescale_ticks(*ticks, self.timescale, WEBP_TIMESCALE).max(1);
            arguments.extend(args!["-d", ms, path_arg(path)]);
        }
        arguments.extend(args!["-o", path_arg(output)]);
        arguments
    }
}

impl SequenceWriter for Img2WebpWriter {
    fn append(&mut self, frame: &FrameRecord) -> Result<(), EncodeError> {
        self.spool.push(frame)
    }

    fn finish(self: Box<Self>) -> Result<Vec<u8>, EncodeError> {
        self.spool.ensure_not_empty()?;
        let output = self.spool.dir().join("output.webp");
        ToolCommand::new("img2webp", self.arguments(&output)).run()?;
        read_tool_output("img2webp", &output)
    }
}

/// libavif reference encoder, stills and image sequences.
pub struct AvifEnc;

impl AvifEnc {
    fn quality_arguments(params: &EncodeParams) -> Vec<String> {
        let q = quantizer(params.quality);
        args![
            "--min",
            q,
            "--max",
            q,
            "--speed",
            params.speed.cpu_used(),
            "--jobs",
            "all"
        ]
    }
}

impl CodecBackend for AvifEnc {
    fn id(&self) -> BackendId {
        BackendId::AvifEnc
    }

    fn kind(&self) -> BackendKind {
        BackendKind::System
    }

    fn encode_still(&self, image: &DynamicImage, params: &EncodeParams) -> Result<Vec<u8>, EncodeError> {
        let dir = task_dir()?;
        let input = dir.path().join("input.png");
        let output = dir.path().join("output.avif");
        write_png(image, &input)?;

        let mut arguments = Self::quality_arguments(params);
        arguments.extend(args![path_arg(&input), path_arg(&output)]);
        ToolCommand::new("avifenc", arguments).run()?;
        read_tool_output("avifenc", &output)
    }

    fn supports_sequences(&self) -> bool {
        true
    }

    fn sequence_writer(
        &self,
        timescale: u32,
        params: &EncodeParams,
    ) -> Result<Box<dyn SequenceWriter>, EncodeError> {
        Ok(Box::new(AvifSequenceWriter {
            spool: FrameSpool::new(BackendId::AvifEnc)?,
            timescale: timescale.max(1),
            base_arguments: Self::quality_arguments(params),
        }))
    }
}

struct AvifSequenceWriter {
    spool: FrameSpool,
    timescale: u32,
    base_arguments: Vec<String>,
}

impl AvifSequenceWriter {
    fn arguments(&self, output: &Path) -> Vec<String> {
        let mut arguments = self.base_arguments.clone();
        arguments.extend(args!["--timescale", self.timescale]);
        for (path, ticks) in &self.spool.frames {
            arguments.extend(args!["--duration", ticks, path_arg(path)]);
        }
        arguments.push(path_arg(output));
        arguments
    }
}

impl SequenceWriter for AvifSequenceWriter {
    fn append(&mut self, frame: &FrameRecord) -> Result<(), EncodeError> {
        self.spool.push(frame)
    }

    fn finish(self: Box<Self>) -> Result<Vec<u8>, EncodeError> {
        self.spool.ensure_not_empty()?;
        let output = self.spool.dir().join("output.avif");
        debug!("Encoding {} AVIF frames at timescale {}", self.spool.frames.len(), self.timescale);
        ToolCommand::new("avifenc", self.arguments(&output)).run()?;
        read_tool_output("avifenc", &output)
    }
}

/// libheif encoder.
pub struct HeifEnc;

impl CodecBackend for HeifEnc {
    fn id(&self) -> BackendId {
        BackendId::HeifEnc
    }

    fn kind(&self) -> BackendKind {
        BackendKind::System
    }

    fn encode_still(&self, image: &DynamicImage, params: &EncodeParams) -> Result<Vec<u8>, EncodeError> {
        let dir = task_dir()?;
        let input = dir.path().join("input.png");
        let output = dir.path().join("output.heic");
        write_png(image, &input)?;

        ToolCommand::new(
            "heif-enc",
            args![
                "-q",
                lossy_percent(params.quality.value()),
                "-o",
                path_arg(&output),
                path_arg(&input)
            ],
        )
        .run()?;
        read_tool_output("heif-enc", &output)
    }
}

/// libheif decoder, primary image only.
pub struct HeifConvert;

impl CodecBackend for HeifConvert {
    fn id(&self) -> BackendId {
        BackendId::HeifConvert
    }

    fn kind(&self) -> BackendKind {
        BackendKind::System
    }

    fn decode_sequence(&self, bytes: &[u8]) -> Result<FrameSequence, DecodeError> {
        let dir = task_dir()?;
        let input = dir.path().join("input.heic");
        let output = dir.path().join("decoded.png");
        std::fs::write(&input, bytes)?;

        ToolCommand::new("heif-convert", args![path_arg(&input), path_arg(&output)])
            .run()
            .map_err(|e| DecodeError::Backend {
                backend: BackendId::HeifConvert,
                message: e.to_string(),
            })?;
        Ok(FrameSequence::still(image::open(&output)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quality::QualitySetting;

    fn frame(ticks: u64) -> FrameRecord {
        FrameRecord {
            image: DynamicImage::new_rgba8(8, 8),
            duration_ticks: ticks,
        }
    }

    #[test]
    fn test_avif_sequence_arguments_carry_timescale_and_durations() {
        let params = EncodeParams::new(QualitySetting::new(1.0));
        let mut writer = AvifSequenceWriter {
            spool: FrameSpool::new(BackendId::AvifEnc).unwrap(),
            timescale: 600,
            base_arguments: AvifEnc::quality_arguments(&params),
        };
        writer.append(&frame(60)).unwrap();
        writer.append(&frame(0)).unwrap();

        let output = writer.spool.dir().join("output.avif");
        let arguments = writer.arguments(&output);
        let joined = arguments.join(" ");
        assert!(joined.starts_with("--min 10 --max 10 --speed 4"));
        assert!(joined.contains("--timescale 600"));
        assert!(joined.contains("--duration 60"));
        // zero durations become one tick
        assert!(joined.contains("--duration 1"));
        assert!(joined.ends_with("output.avif"));
    }

    #[test]
    fn test_img2webp_arguments_convert_ticks_to_ms() {
        let params = EncodeParams::new(QualitySetting::new(0.8));
        let mut writer = Img2WebpWriter {
            spool: FrameSpool::new(BackendId::Img2Webp).unwrap(),
            timescale: 600,
            quality: lossy_percent(params.quality.value()),
        };
        writer.append(&frame(60)).unwrap();
        writer.append(&frame(30)).unwrap();
        writer.append(&frame(25)).unwrap();

        let arguments = writer.arguments(Path::new("out.webp")).join(" ");
        assert!(arguments.starts_with("-loop 0 -lossy -q 80"));
        assert!(arguments.contains("-d 100"));
        assert!(arguments.contains("-d 50"));
        // 24 fps rounds up to 42 ms instead of truncating to 41
        assert!(arguments.contains("-d 42 "));
    }

    #[test]
    fn test_spool_rejects_frames_of_different_size() {
        let mut spool = FrameSpool::new(BackendId::Img2Webp).unwrap();
        spool.push(&frame(1)).unwrap();
        let bigger = FrameRecord {
            image: DynamicImage::new_rgba8(9, 8),
            duration_ticks: 1,
        };
        assert!(spool.push(&bigger).is_err());
        assert_eq!(spool.frames.len(), 1);
    }

    #[test]
    fn test_spool_directory_is_removed_on_drop() {
        let spool = FrameSpool::new(BackendId::AvifEnc).unwrap();
        let dir = spool.dir().to_path_buf();
        assert!(dir.exists());
        drop(spool);
        assert!(!dir.exists());
    }
}
