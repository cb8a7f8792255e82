//! # Heuristic PNG Strategy
//!
//! Analizza i pixel e sceglie il layout lossless più economico consentito dal contenuto:
//!
//! 1. **Grayscale** (opaco, r == g == b), con bit depth ridotta se i livelli lo permettono
//! 2. **Indexed** (≤ 256 colori, tRNS se serve), bit-packed a 1/2/4/8 bit
//! 3. **Grayscale + alpha**
//! 4. **RGB** (opaco)
//! 5. **RGBA**
//!
//! Le sorgenti a 16 bit restano a 16 bit, a meno che ogni campione sia un 8 bit esatto.
//! Per ogni layout vengono provate le strategie di filtro per riga (adaptive, None, Sub,
//! Up, Average, Paeth) e si tiene l'output più piccolo. Il risultato è deterministico.

use std::collections::HashMap;

use image::{DynamicImage, Rgba, RgbaImage};
use png::{AdaptiveFilterType, BitDepth, ColorType, Compression, FilterType};
use tracing::debug;

use super::{PngOptions, PngReport, PngSource, PngStrategy, PngStrategyKind};
use crate::codec::BackendId;
use crate::error::EncodeError;

const FILTERS: [(&str, Option<FilterType>); 6] = [
    ("adaptive", None),
    ("none", Some(FilterType::NoFilter)),
    ("sub", Some(FilterType::Sub)),
    ("up", Some(FilterType::Up)),
    ("average", Some(FilterType::Avg)),
    ("paeth", Some(FilterType::Paeth)),
];

pub struct HeuristicStrategy;

impl PngStrategy for HeuristicStrategy {
    fn kind(&self) -> PngStrategyKind {
        PngStrategyKind::Heuristic
    }

    fn backend(&self) -> BackendId {
        BackendId::PngHeuristic
    }

    fn compress(&self, source: &PngSource, _options: &PngOptions) -> Result<(Vec<u8>, PngReport), EncodeError> {
        let plan = plan_layout(&source.image, source.has_alpha);
        let (width, height) = (source.image.width(), source.image.height());

        let mut best: Option<(Vec<u8>, &str)> = None;
        for (name, filter) in FILTERS {
            let bytes = encode(&plan, width, height, filter)?;
            debug!("PNG heuristic {} filter {}: {} bytes", plan.mode, name, bytes.len());
            if best.as_ref().map_or(true, |(b, _)| bytes.len() < b.len()) {
                best = Some((bytes, name));
            }
        }
        let (bytes, filter) = best.ok_or_else(|| EncodeError::backend(BackendId::PngHeuristic, "no filter produced output"))?;

        let mut report = PngReport::new(PngStrategyKind::Heuristic);
        report.color_mode = Some(plan.mode.to_string());
        report.bit_depth = Some(plan.depth as u8);
        report.palette_size = plan.palette_size;
        report.filter = Some(filter.to_string());
        report.optimizations = plan.optimizations;
        Ok((bytes, report))
    }
}

/// Chosen pixel layout with its packed scanlines.
struct LayoutPlan {
    mode: &'static str,
    color: ColorType,
    depth: BitDepth,
    palette: Option<Vec<u8>>,
    trns: Option<Vec<u8>>,
    palette_size: Option<usize>,
    data: Vec<u8>,
    optimizations: Vec<String>,
}

struct PixelStats {
    opaque: bool,
    gray: bool,
    /// Distinct colors in first-seen order, `None` past 256.
    palette: Option<Vec<[u8; 4]>>,
}

fn analyze(rgba: &RgbaImage) -> PixelStats {
    let mut opaque = true;
    let mut gray = true;
    let mut order: Vec<[u8; 4]> = Vec::new();
    let mut seen: HashMap<[u8; 4], u8> = HashMap::new();
    let mut overflow = false;
    let mut last: Option<[u8; 4]> = None;

    for Rgba(px) in rgba.pixels() {
        opaque &= px[3] == 255;
        gray &= px[0] == px[1] && px[1] == px[2];
        if overflow || last == Some(*px) {
            continue;
        }
        last = Some(*px);
        if !seen.contains_key(px) {
            if order.len() == 256 {
                overflow = true;
                continue;
            }
            seen.insert(*px, order.len() as u8);
            order.push(*px);
        }
    }

    PixelStats {
        opaque,
        gray,
        palette: (!overflow).then_some(order),
    }
}

fn plan_layout(image: &DynamicImage, source_has_alpha: bool) -> LayoutPlan {
    let color = image.color();
    let source_is_color = color.channel_count() >= 3;
    let wide = color.bytes_per_pixel() / color.channel_count() > 1;

    if wide {
        let rgba16 = image.to_rgba16();
        if rgba16.as_raw().iter().all(|v| v % 257 == 0) {
            let mut plan = plan_8bit(&image.to_rgba8(), source_has_alpha, source_is_color);
            plan.optimizations.insert(0, "reduced 16-bit samples to 8-bit (exact)".to_string());
            return plan;
        }
        return plan_16bit(&rgba16, source_has_alpha, source_is_color);
    }

    plan_8bit(&image.to_rgba8(), source_has_alpha, source_is_color)
}

fn plan_8bit(rgba: &RgbaImage, source_has_alpha: bool, source_is_color: bool) -> LayoutPlan {
    let stats = analyze(rgba);
    let (width, height) = rgba.dimensions();
    let mut optimizations = Vec::new();
    if source_has_alpha && stats.opaque {
        optimizations.push("dropped opaque alpha channel".to_string());
    }
    if source_is_color && stats.gray {
        optimizations.push("converted to grayscale".to_string());
    }

    if stats.opaque && stats.gray {
        let depth = gray_depth(rgba);
        let bits = depth as u8;
        let scale = 255 / ((1u16 << bits) - 1) as u8;
        if bits < 8 {
            optimizations.push(format!("packed to {bits}-bit samples"));
        }
        return LayoutPlan {
            mode: "grayscale",
            color: ColorType::Grayscale,
            depth,
            palette: None,
            trns: None,
            palette_size: None,
            data: pack_rows(width, height, bits, |x, y| rgba.get_pixel(x, y)[0] / scale),
            optimizations,
        };
    }

    if let Some(palette) = stats.palette {
        let index: HashMap<[u8; 4], u8> = palette.iter().enumerate().map(|(i, c)| (*c, i as u8)).collect();
        let bits = index_bits(palette.len());
        optimizations.push(format!("reduced to {}-color palette", palette.len()));
        if bits < 8 {
            optimizations.push(format!("packed to {bits}-bit indices"));
        }
        let plte = palette.iter().flat_map(|c| [c[0], c[1], c[2]]).collect();
        let trns = (!stats.opaque).then(|| palette.iter().map(|c| c[3]).collect());
        let data = pack_rows(width, height, bits, |x, y| {
            index.get(&rgba.get_pixel(x, y).0).copied().unwrap_or_default()
        });
        return LayoutPlan {
            mode: "indexed",
            color: ColorType::Indexed,
            depth: bit_depth(bits),
            palette: Some(plte),
            trns,
            palette_size: Some(palette.len()),
            data,
            optimizations,
        };
    }

    let (mode, color, channels): (&'static str, ColorType, &[usize]) = if stats.gray {
        ("grayscale+alpha", ColorType::GrayscaleAlpha, &[0, 3])
    } else if stats.opaque {
        ("rgb", ColorType::Rgb, &[0, 1, 2])
    } else {
        ("rgba", ColorType::Rgba, &[0, 1, 2, 3])
    };
    let data = rgba
        .pixels()
        .flat_map(|px| channels.iter().map(move |&c| px[c]))
        .collect();

    LayoutPlan {
        mode,
        color,
        depth: BitDepth::Eight,
        palette: None,
        trns: None,
        palette_size: None,
        data,
        optimizations,
    }
}

fn plan_16bit(rgba: &image::ImageBuffer<Rgba<u16>, Vec<u16>>, source_has_alpha: bool, source_is_color: bool) -> LayoutPlan {
    let opaque = rgba.pixels().all(|px| px[3] == u16::MAX);
    let gray = rgba.pixels().all(|px| px[0] == px[1] && px[1] == px[2]);
    let mut optimizations = Vec::new();
    if source_has_alpha && opaque {
        optimizations.push("dropped opaque alpha channel".to_string());
    }
    if source_is_color && gray {
        optimizations.push("converted to grayscale".to_string());
    }

    let (mode, color, channels): (&'static str, ColorType, &[usize]) = match (gray, opaque) {
        (true, true) => ("grayscale", ColorType::Grayscale, &[0]),
        (true, false) => ("grayscale+alpha", ColorType::GrayscaleAlpha, &[0, 3]),
        (false, true) => ("rgb", ColorType::Rgb, &[0, 1, 2]),
        (false, false) => ("rgba", ColorType::Rgba, &[0, 1, 2, 3]),
    };
    let data = rgba
        .pixels()
        .flat_map(|px| channels.iter().flat_map(move |&c| px[c].to_be_bytes()))
        .collect();

    LayoutPlan {
        mode,
        color,
        depth: BitDepth::Sixteen,
        palette: None,
        trns: None,
        palette_size: None,
        data,
        optimizations,
    }
}

/// Smallest gray depth whose levels represent every sample exactly.
fn gray_depth(rgba: &RgbaImage) -> BitDepth {
    for bits in [1u8, 2, 4] {
        let step = 255 / ((1u16 << bits) - 1) as u8;
        if rgba.pixels().all(|px| px[0] % step == 0) {
            return bit_depth(bits);
        }
    }
    BitDepth::Eight
}

fn index_bits(colors: usize) -> u8 {
    match colors {
        0..=2 => 1,
        3..=4 => 2,
        5..=16 => 4,
        _ => 8,
    }
}

fn bit_depth(bits: u8) -> BitDepth {
    match bits {
        1 => BitDepth::One,
        2 => BitDepth::Two,
        4 => BitDepth::Four,
        _ => BitDepth::Eight,
    }
}

/// Packs one sample per pixel MSB-first, each row padded to a whole byte.
fn pack_rows(width: u32, height: u32, bits: u8, sample: impl Fn(u32, u32) -> u8) -> Vec<u8> {
    if bits == 8 {
        return (0..height)
            .flat_map(|y| (0..width).map(move |x| (x, y)))
            .map(|(x, y)| sample(x, y))
            .collect();
    }

    let per_byte = 8 / bits as u32;
    let row_bytes = width.div_ceil(per_byte) as usize;
    let mut data = Vec::with_capacity(row_bytes * height as usize);
    for y in 0..height {
        let mut byte = 0u8;
        let mut filled = 0u32;
        for x in 0..width {
            byte |= sample(x, y) << (8 - bits as u32 * (filled + 1));
            filled += 1;
            if filled == per_byte {
                data.push(byte);
                byte = 0;
                filled = 0;
            }
        }
        if filled > 0 {
            data.push(byte);
        }
    }
    data
}

fn encode(plan: &LayoutPlan, width: u32, height: u32, filter: Option<FilterType>) -> Result<Vec<u8>, EncodeError> {
    let mut out = Vec::new();
    {
        let mut encoder = png::Encoder::new(&mut out, width, height);
        encoder.set_color(plan.color);
        encoder.set_depth(plan.depth);
        encoder.set_compression(Compression::Best);
        match filter {
            Some(filter) => {
                encoder.set_adaptive_filter(AdaptiveFilterType::NonAdaptive);
                encoder.set_filter(filter);
            }
            None => encoder.set_adaptive_filter(AdaptiveFilterType::Adaptive),
        }
        if let Some(palette) = &plan.palette {
            encoder.set_palette(palette.clone());
        }
        if let Some(trns) = &plan.trns {
            encoder.set_trns(trns.clone());
        }
        let mut writer = encoder.write_header()?;
        writer.write_image_data(&plan.data)?;
        writer.finish()?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::codecs::png::PngEncoder;
    use image::{ImageEncoder, Rgb, RgbImage};

    const COLORS: [[u8; 4]; 3] = [[220, 30, 30, 255], [30, 200, 60, 255], [20, 40, 210, 255]];

    fn three_color_source(width: u32, height: u32) -> PngSource {
        let image = RgbaImage::from_fn(width, height, |x, y| Rgba(COLORS[((x / 100 + y / 100) % 3) as usize]));
        PngSource::from_image(DynamicImage::ImageRgba8(image)).unwrap()
    }

    fn decoded(bytes: &[u8]) -> RgbaImage {
        image::load_from_memory(bytes).unwrap().to_rgba8()
    }

    #[test]
    fn test_three_color_photo_becomes_small_palette() {
        let source = three_color_source(1200, 1600);
        let (bytes, report) = HeuristicStrategy.compress(&source, &PngOptions::default()).unwrap();

        assert_eq!(report.palette_size, Some(3));
        assert_eq!(report.color_mode.as_deref(), Some("indexed"));
        assert_eq!(report.bit_depth, Some(2));
        assert!(report.optimizations.iter().any(|o| o == "dropped opaque alpha channel"));

        let rgba = source.image.to_rgba8();
        let mut naive = Vec::new();
        PngEncoder::new(&mut naive)
            .write_image(rgba.as_raw(), 1200, 1600, image::ColorType::Rgba8)
            .unwrap();
        assert!(bytes.len() < naive.len(), "{} >= {}", bytes.len(), naive.len());
        assert_eq!(decoded(&bytes), rgba);
    }

    #[test]
    fn test_same_input_gives_identical_bytes() {
        let source = three_color_source(300, 200);
        let (first, _) = HeuristicStrategy.compress(&source, &PngOptions::default()).unwrap();
        let (second, _) = HeuristicStrategy.compress(&source, &PngOptions::default()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_translucent_palette_keeps_alpha() {
        let image = RgbaImage::from_fn(33, 7, |x, _| if x % 2 == 0 { Rgba([10, 20, 30, 128]) } else { Rgba([0, 0, 0, 0]) });
        let source = PngSource::from_image(DynamicImage::ImageRgba8(image.clone())).unwrap();
        let (bytes, report) = HeuristicStrategy.compress(&source, &PngOptions::default()).unwrap();

        assert_eq!(report.color_mode.as_deref(), Some("indexed"));
        assert_eq!(report.bit_depth, Some(1));
        assert_eq!(decoded(&bytes), image);
    }

    #[test]
    fn test_black_and_white_becomes_one_bit_gray() {
        let image = RgbImage::from_fn(17, 9, |x, y| if (x + y) % 2 == 0 { Rgb([0, 0, 0]) } else { Rgb([255, 255, 255]) });
        let source = PngSource::from_image(DynamicImage::ImageRgb8(image.clone())).unwrap();
        let (bytes, report) = HeuristicStrategy.compress(&source, &PngOptions::default()).unwrap();

        assert_eq!(report.color_mode.as_deref(), Some("grayscale"));
        assert_eq!(report.bit_depth, Some(1));
        assert_eq!(image::load_from_memory(&bytes).unwrap().to_rgb8(), image);
    }

    #[test]
    fn test_many_colors_fall_back_to_rgb() {
        let image = RgbImage::from_fn(64, 64, |x, y| Rgb([(x * 4) as u8, (y * 4) as u8, 7]));
        let source = PngSource::from_image(DynamicImage::ImageRgb8(image.clone())).unwrap();
        let (bytes, report) = HeuristicStrategy.compress(&source, &PngOptions::default()).unwrap();

        assert_eq!(report.color_mode.as_deref(), Some("rgb"));
        assert_eq!(report.palette_size, None);
        assert_eq!(image::load_from_memory(&bytes).unwrap().to_rgb8(), image);
    }

    #[test]
    fn test_pack_rows_pads_each_row() {
        let data = pack_rows(3, 2, 2, |x, y| (x + y) as u8);
        assert_eq!(data, vec![0b0001_1000, 0b0110_1100]);
    }
}
