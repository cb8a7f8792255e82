//! # Quantize Strategy
//!
//! Quantizzazione della palette con `pngquant` (libimagequant). Lossy: l'output è
//! sempre un PNG indicizzato. La banda di qualità percettiva, la velocità e il
//! livello di dithering Floyd-Steinberg arrivano da `PngOptions`.

use std::io::Cursor;
use std::path::Path;

use super::{PngOptions, PngReport, PngSource, PngStrategy, PngStrategyKind};
use crate::args;
use crate::codec::external::task_dir;
use crate::codec::BackendId;
use crate::error::EncodeError;
use crate::quality::{quantization_speed, QuantizationBand};
use crate::tools::{read_tool_output, ToolCommand};
use crate::utils::path_arg;

pub struct QuantizeStrategy;

/// pngquant flags for the configured band, speed and dithering.
pub fn quantize_arguments(options: &PngOptions) -> (Vec<String>, QuantizationBand, u8, f32) {
    let band = QuantizationBand::from_fractions(options.quantize_min_quality, options.quantize_max_quality);
    let speed = quantization_speed(options.quantize_speed);
    let dithering = if options.quantize_dithering.is_nan() {
        0.0
    } else {
        options.quantize_dithering.clamp(0.0, 1.0)
    };

    let mut arguments = args![format!("--quality={}-{}", band.min, band.max), "--speed", speed];
    if dithering > 0.0 {
        arguments.push(format!("--floyd={dithering}"));
    } else {
        arguments.push("--nofs".to_string());
    }
    arguments.push("--force".to_string());
    (arguments, band, speed, dithering)
}

/// Output and input operands; `--` keeps dash-leading paths from reading as flags.
fn file_arguments(input: &Path, output: &Path) -> Vec<String> {
    args!["--output", path_arg(output), "--", path_arg(input)]
}

fn palette_entries(bytes: &[u8]) -> Option<usize> {
    let reader = png::Decoder::new(Cursor::new(bytes)).read_info().ok()?;
    reader.info().palette.as_ref().map(|palette| palette.len() / 3)
}

impl PngStrategy for QuantizeStrategy {
    fn kind(&self) -> PngStrategyKind {
        PngStrategyKind::Quantize
    }

    fn backend(&self) -> BackendId {
        BackendId::Pngquant
    }

    fn compress(&self, source: &PngSource, options: &PngOptions) -> Result<(Vec<u8>, PngReport), EncodeError> {
        let (mut arguments, band, speed, dithering) = quantize_arguments(options);
        let dir = task_dir()?;
        let input = dir.path().join("input.png");
        let output = dir.path().join("output.png");
        std::fs::write(&input, &source.bytes)?;

        arguments.extend(file_arguments(&input, &output));
        ToolCommand::new("pngquant", arguments).run()?;
        let bytes = read_tool_output("pngquant", &output)?;

        let mut report = PngReport::new(PngStrategyKind::Quantize);
        report.color_mode = Some("indexed".to_string());
        report.palette_size = palette_entries(&bytes);
        report.quality_band = Some(band);
        report.speed = Some(speed);
        report.dithering = Some(dithering);
        Ok((bytes, report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::png::HeuristicStrategy;
    use image::{DynamicImage, Rgba, RgbaImage};

    #[test]
    fn test_default_arguments() {
        let (arguments, band, speed, dithering) = quantize_arguments(&PngOptions::default());
        assert_eq!(arguments, vec!["--quality=60-95", "--speed", "3", "--floyd=1", "--force"]);
        assert_eq!(band, QuantizationBand { min: 60, max: 95 });
        assert_eq!(speed, 3);
        assert_eq!(dithering, 1.0);
    }

    #[test]
    fn test_zero_dithering_and_out_of_range_speed() {
        let options = PngOptions {
            quantize_min_quality: 0.9,
            quantize_max_quality: 0.5,
            quantize_speed: 42,
            quantize_dithering: 0.0,
            ..PngOptions::default()
        };
        let (arguments, band, speed, _) = quantize_arguments(&options);
        assert_eq!(band, QuantizationBand { min: 90, max: 90 });
        assert_eq!(speed, 10);
        assert!(arguments.contains(&"--nofs".to_string()));
        assert!(!arguments.iter().any(|a| a.starts_with("--floyd")));
    }

    #[test]
    fn test_file_arguments_end_with_input_after_separator() {
        let arguments = file_arguments(Path::new("/tmp/task dir/-in.png"), Path::new("/tmp/task dir/out.png"));
        assert_eq!(arguments, vec!["--output", "/tmp/task dir/out.png", "--", "/tmp/task dir/-in.png"]);
    }

    #[test]
    fn test_palette_size_is_read_back() {
        let image = RgbaImage::from_fn(8, 8, |x, _| Rgba([x as u8 * 30, 0, 0, 255]));
        let source = PngSource::from_image(DynamicImage::ImageRgba8(image)).unwrap();
        let (indexed, _) = HeuristicStrategy.compress(&source, &PngOptions::default()).unwrap();
        assert_eq!(palette_entries(&indexed), Some(8));
        assert_eq!(palette_entries(&source.bytes), None);
    }
}
