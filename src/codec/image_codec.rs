//! In-process codecs built on the `image` crate.

use std::io::Cursor;

use image::codecs::avif::AvifEncoder;
use image::codecs::gif::{GifDecoder, GifEncoder, Repeat};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::webp::WebPDecoder;
use image::imageops::{self, ColorMap};
use image::{AnimationDecoder, ColorType, Delay, DynamicImage, Frame, ImageEncoder, ImageFormat, RgbaImage};
use tracing::debug;

use super::{
    rescale_ticks, BackendId, BackendKind, CodecBackend, EncodeParams, FrameRecord, FrameSequence, SequenceWriter,
};
use crate::error::{DecodeError, EncodeError};
use crate::quality::{av1_quality_percent, gif_palette_size, lossy_percent, quantizer};

/// WebP frame delays are whole milliseconds.
pub const WEBP_TIMESCALE: u32 = 1000;

/// GIF frame delays are whole centiseconds.
pub const GIF_TIMESCALE: u32 = 100;

/// NeuQuant sampling factor, 1 (best) to 30 (fastest).
const NEUQUANT_SAMPLE: i32 = 10;

/// Decoder for every format the `image` crate reads, animation aware for GIF and WebP.
pub struct ImageDecoder;

impl CodecBackend for ImageDecoder {
    fn id(&self) -> BackendId {
        BackendId::ImageDecoder
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Native
    }

    fn decode_sequence(&self, bytes: &[u8]) -> Result<FrameSequence, DecodeError> {
        decode_with_image(bytes)
    }
}

pub(crate) fn decode_with_image(bytes: &[u8]) -> Result<FrameSequence, DecodeError> {
    let sequence = match image::guess_format(bytes)? {
        ImageFormat::Gif => frames_to_sequence(GifDecoder::new(Cursor::new(bytes))?, GIF_TIMESCALE)?,
        ImageFormat::WebP => frames_to_sequence(WebPDecoder::new(Cursor::new(bytes))?, WEBP_TIMESCALE)?,
        _ => FrameSequence::still(image::load_from_memory(bytes)?),
    };
    if sequence.is_empty() {
        return Err(DecodeError::Empty);
    }
    debug!("Decoded {} frame(s)", sequence.len());
    Ok(sequence)
}

fn frames_to_sequence<'a>(decoder: impl AnimationDecoder<'a>, timescale: u32) -> Result<FrameSequence, DecodeError> {
    let frames = decoder
        .into_frames()
        .collect_frames()?
        .into_iter()
        .map(|frame| {
            let duration_ticks = delay_to_ticks(frame.delay(), timescale);
            FrameRecord {
                image: DynamicImage::ImageRgba8(frame.into_buffer()),
                duration_ticks,
            }
        })
        .collect();
    Ok(FrameSequence { frames, timescale })
}

fn delay_to_ticks(delay: Delay, timescale: u32) -> u64 {
    let (numer, denom) = delay.numer_denom_ms();
    if denom == 0 {
        return 0;
    }
    (numer as f64 * timescale as f64 / (denom as f64 * 1000.0)).round() as u64
}

/// Reduces `image` to the quality-derived palette, dithered when asked.
fn quantize_for_gif(image: &DynamicImage, params: &EncodeParams) -> RgbaImage {
    let mut rgba = image.to_rgba8();
    let colors = gif_palette_size(params.quality) as usize;
    let palette = color_quant::NeuQuant::new(NEUQUANT_SAMPLE, colors, rgba.as_raw());
    if params.gif.dithering {
        imageops::dither(&mut rgba, &palette);
    } else {
        for pixel in rgba.pixels_mut() {
            palette.map_color(pixel);
        }
    }
    rgba
}

/// Baseline JPEG encoder.
pub struct ImageJpegEncoder;

impl CodecBackend for ImageJpegEncoder {
    fn id(&self) -> BackendId {
        BackendId::ImageJpeg
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Native
    }

    fn encode_still(&self, image: &DynamicImage, params: &EncodeParams) -> Result<Vec<u8>, EncodeError> {
        let rgb = image.to_rgb8();
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, lossy_percent(params.quality.value())).encode(
            rgb.as_raw(),
            rgb.width(),
            rgb.height(),
            ColorType::Rgb8,
        )?;
        Ok(out)
    }
}

/// GIF encoder and decoder. Frames are reduced to the quality-derived palette first.
pub struct ImageGifCodec;

impl CodecBackend for ImageGifCodec {
    fn id(&self) -> BackendId {
        BackendId::ImageGif
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Native
    }

    fn encode_still(&self, image: &DynamicImage, params: &EncodeParams) -> Result<Vec<u8>, EncodeError> {
        let frame = Frame::new(quantize_for_gif(image, params));
        encode_gif_frames(vec![frame])
    }

    fn supports_sequences(&self) -> bool {
        true
    }

    fn sequence_writer(
        &self,
        timescale: u32,
        params: &EncodeParams,
    ) -> Result<Box<dyn SequenceWriter>, EncodeError> {
        Ok(Box::new(GifSequenceWriter {
            timescale: timescale.max(1),
            params: params.clone(),
            dimensions: None,
            frames: Vec::new(),
        }))
    }

    fn decode_sequence(&self, bytes: &[u8]) -> Result<FrameSequence, DecodeError> {
        frames_to_sequence(GifDecoder::new(Cursor::new(bytes))?, GIF_TIMESCALE)
    }
}

struct GifSequenceWriter {
    timescale: u32,
    params: EncodeParams,
    dimensions: Option<(u32, u32)>,
    frames: Vec<Frame>,
}

impl SequenceWriter for GifSequenceWriter {
    fn append(&mut self, frame: &FrameRecord) -> Result<(), EncodeError> {
        let dimensions = (frame.image.width(), frame.image.height());
        match self.dimensions {
            None => self.dimensions = Some(dimensions),
            Some(expected) if expected != dimensions => {
                return Err(EncodeError::backend(
                    BackendId::ImageGif,
                    format!("frame is {dimensions:?}, sequence is {expected:?}"),
                ));
            }
            Some(_) => {}
        }
        // the encoder truncates to centiseconds, so round here and hand it an exact multiple of 10 ms
        let centis = rescale_ticks(frame.duration_ticks, self.timescale, GIF_TIMESCALE).clamp(1, u16::MAX as u64);
        let delay = Delay::from_numer_denom_ms(centis as u32 * 10, 1);
        let rgba = quantize_for_gif(&frame.image, &self.params);
        self.frames.push(Frame::from_parts(rgba, 0, 0, delay));
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<Vec<u8>, EncodeError> {
        encode_gif_frames(self.frames)
    }
}

fn encode_gif_frames(frames: Vec<Frame>) -> Result<Vec<u8>, EncodeError> {
    let mut out = Vec::new();
    {
        let mut encoder = GifEncoder::new(&mut out);
        encoder.set_repeat(Repeat::Infinite)?;
        encoder.encode_frames(frames)?;
    }
    Ok(out)
}

/// AV1 still encoder linked into the process (rav1e through `image`).
pub struct Rav1eAvifEncoder;

impl CodecBackend for Rav1eAvifEncoder {
    fn id(&self) -> BackendId {
        BackendId::Rav1e
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Native
    }

    fn encode_still(&self, image: &DynamicImage, params: &EncodeParams) -> Result<Vec<u8>, EncodeError> {
        let rgba = image.to_rgba8();
        // rav1e speeds run 1 (slowest) to 10
        let speed = params.speed.cpu_used().clamp(1, 10);
        let quality = av1_quality_percent(quantizer(params.quality));
        let mut out = Vec::new();
        AvifEncoder::new_with_speed_quality(&mut out, speed, quality).write_image(
            rgba.as_raw(),
            rgba.width(),
            rgba.height(),
            ColorType::Rgba8,
        )?;
        Ok(out)
    }
}
