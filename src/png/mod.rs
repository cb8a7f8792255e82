//! # PNG Strategy Selector
//!
//! Tre strategie indipendenti competono sullo stesso sorgente PNG:
//!
//! | Strategia   | Implementazione              | Tipo      |
//! |-------------|------------------------------|-----------|
//! | `heuristic` | crate `png`, layout minimo   | lossless  |
//! | `zopfli`    | `zopflipng`                  | lossless* |
//! | `quantize`  | `pngquant`                   | lossy     |
//!
//! \* i toggle lossy di zopflipng sono applicati solo quando hanno senso per l'immagine.
//!
//! Ogni strategia restituisce `(bytes, PngReport)` con i parametri **effettivi**.
//! `Auto` le esegue tutte e tiene il candidato più piccolo; il confronto finale con il
//! PNG originale viene registrato nel report (`decision`).

pub mod heuristic;
pub mod quantize;
pub mod zopfli;

use std::fmt;
use std::io::Cursor;
use std::sync::Arc;

use image::DynamicImage;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::codec::BackendId;
use crate::error::{DecodeError, EncodeError};
use crate::file_manager::FileManager;
use crate::format::MediaFormat;
use crate::outcome::{EncodeReport, EncodedCandidate, SourceAsset};
use crate::progress::StageReporter;
use crate::quality::QuantizationBand;

pub use heuristic::HeuristicStrategy;
pub use quantize::QuantizeStrategy;
pub use zopfli::ZopfliStrategy;

/// Which PNG strategies run for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PngStrategyChoice {
    #[default]
    Auto,
    Heuristic,
    Zopfli,
    Quantize,
}

impl std::str::FromStr for PngStrategyChoice {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "heuristic" => Ok(Self::Heuristic),
            "zopfli" | "zopflipng" => Ok(Self::Zopfli),
            "quantize" | "pngquant" => Ok(Self::Quantize),
            other => Err(format!("unknown PNG strategy: {other}")),
        }
    }
}

/// Identifies the strategy that produced a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PngStrategyKind {
    Heuristic,
    Zopfli,
    Quantize,
}

impl fmt::Display for PngStrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Heuristic => "heuristic",
            Self::Zopfli => "zopfli",
            Self::Quantize => "quantize",
        })
    }
}

/// PNG knobs from the settings file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PngOptions {
    pub strategy: PngStrategyChoice,
    /// zopflipng iterations for sources below `zopfli::LARGE_SOURCE_BYTES`.
    pub iterations: u32,
    pub iterations_large: u32,
    pub lossy_transparent: bool,
    pub lossy_8bit: bool,
    pub quantize_min_quality: f32,
    pub quantize_max_quality: f32,
    pub quantize_speed: u8,
    /// Floyd-Steinberg dithering level, 0 disables dithering.
    pub quantize_dithering: f32,
}

impl Default for PngOptions {
    fn default() -> Self {
        Self {
            strategy: PngStrategyChoice::Auto,
            iterations: 3,
            iterations_large: 1,
            lossy_transparent: false,
            lossy_8bit: false,
            quantize_min_quality: 0.6,
            quantize_max_quality: 0.95,
            quantize_speed: 3,
            quantize_dithering: 1.0,
        }
    }
}

/// Applied parameters of one PNG strategy run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PngReport {
    pub strategy: PngStrategyKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bit_depth: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub palette_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub optimizations: Vec<String>,
    /// zopflipng iterations actually run for this source.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iterations: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lossy_transparent: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lossy_8bit: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality_band: Option<QuantizationBand>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dithering: Option<f32>,
    /// Outcome of the comparison against the source PNG.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<String>,
}

impl PngReport {
    pub fn new(strategy: PngStrategyKind) -> Self {
        Self {
            strategy,
            color_mode: None,
            bit_depth: None,
            palette_size: None,
            filter: None,
            optimizations: Vec::new(),
            iterations: None,
            lossy_transparent: None,
            lossy_8bit: None,
            quality_band: None,
            speed: None,
            dithering: None,
            decision: None,
        }
    }
}

/// Decoded PNG plus the header facts strategies need.
#[derive(Debug, Clone)]
pub struct PngSource {
    /// PNG bytes handed to file-based tools.
    pub bytes: Arc<[u8]>,
    pub image: DynamicImage,
    pub bits_per_channel: u8,
    pub has_alpha: bool,
}

impl PngSource {
    /// Reads header facts from `bytes` and decodes the pixels.
    pub fn from_bytes(bytes: Arc<[u8]>) -> Result<Self, DecodeError> {
        let reader = png::Decoder::new(Cursor::new(&bytes[..])).read_info()?;
        let info = reader.info();
        let bits_per_channel = info.bit_depth as u8;
        let has_alpha = info.color_type.samples() == 2 || info.color_type.samples() == 4 || info.trns.is_some();
        let image = image::load_from_memory_with_format(&bytes, image::ImageFormat::Png)?;
        Ok(Self {
            bytes,
            image,
            bits_per_channel,
            has_alpha,
        })
    }

    /// Wraps already-decoded pixels, re-encoding them for file-based tools.
    pub fn from_image(image: DynamicImage) -> Result<Self, EncodeError> {
        let mut bytes = Vec::new();
        image.write_to(&mut Cursor::new(&mut bytes), image::ImageOutputFormat::Png)?;
        let bits_per_channel = (image.color().bits_per_pixel() / image.color().channel_count() as u16) as u8;
        let has_alpha = image.color().has_alpha();
        Ok(Self {
            bytes: bytes.into(),
            image,
            bits_per_channel,
            has_alpha,
        })
    }
}

/// One PNG encoding strategy. Calls are blocking.
pub trait PngStrategy: Send + Sync {
    fn kind(&self) -> PngStrategyKind;

    fn backend(&self) -> BackendId;

    fn compress(&self, source: &PngSource, options: &PngOptions) -> Result<(Vec<u8>, PngReport), EncodeError>;
}

/// Runs the configured strategies and keeps the smallest candidate.
pub struct StrategySelector {
    strategies: Vec<Arc<dyn PngStrategy>>,
}

impl StrategySelector {
    pub fn new(strategies: Vec<Arc<dyn PngStrategy>>) -> Self {
        Self { strategies }
    }

    pub fn for_choice(choice: PngStrategyChoice) -> Self {
        let heuristic: Arc<dyn PngStrategy> = Arc::new(HeuristicStrategy);
        let zopfli: Arc<dyn PngStrategy> = Arc::new(ZopfliStrategy);
        let quantize: Arc<dyn PngStrategy> = Arc::new(QuantizeStrategy);
        let strategies = match choice {
            PngStrategyChoice::Auto => vec![heuristic, zopfli, quantize],
            PngStrategyChoice::Heuristic => vec![heuristic],
            PngStrategyChoice::Zopfli => vec![zopfli],
            PngStrategyChoice::Quantize => vec![quantize],
        };
        Self::new(strategies)
    }

    /// Smallest successful candidate, or a degraded passthrough when every strategy failed.
    ///
    /// The winner's report records whether it beats the source asset.
    pub async fn select(
        &self,
        source: Arc<PngSource>,
        options: &PngOptions,
        original: &SourceAsset,
        original_format: MediaFormat,
        progress: StageReporter,
    ) -> EncodedCandidate {
        let total = self.strategies.len();
        let mut best: Option<(Vec<u8>, PngReport, BackendId)> = None;
        let mut attempts = Vec::new();

        for (index, strategy) in self.strategies.iter().enumerate() {
            let task_strategy = Arc::clone(strategy);
            let task_source = Arc::clone(&source);
            let task_options = options.clone();
            let result = tokio::task::spawn_blocking(move || task_strategy.compress(&task_source, &task_options))
                .await
                .unwrap_or_else(|e| Err(EncodeError::Join(e.to_string())));
            progress.report_fraction(index + 1, total);

            match result {
                Ok((bytes, report)) => {
                    debug!("PNG {} produced {} bytes", strategy.kind(), bytes.len());
                    let smaller = best.as_ref().map_or(true, |(b, _, _)| bytes.len() < b.len());
                    if smaller {
                        best = Some((bytes, report, strategy.backend()));
                    }
                }
                Err(e) => {
                    warn!("⚠️  PNG {} strategy failed: {}", strategy.kind(), e);
                    attempts.push(format!("{}: {}", strategy.kind(), e));
                }
            }
        }

        let Some((bytes, mut png_report, backend)) = best else {
            let mut report = EncodeReport::new("passthrough");
            report.notes = attempts;
            return EncodedCandidate::passthrough(original, MediaFormat::Png).with_report(report);
        };

        png_report.decision = Some(decide(bytes.len(), original.size(), original_format));
        info!(
            "🖼️  PNG {}: {} ({})",
            png_report.strategy,
            FileManager::format_size(bytes.len() as u64),
            png_report.decision.as_deref().unwrap_or_default()
        );

        let mut report = EncodeReport::new(png_report.strategy.to_string());
        report.notes = attempts;
        report.png = Some(png_report);
        EncodedCandidate::new(bytes, MediaFormat::Png, backend).with_report(report)
    }
}

/// Decision text for the winning candidate against the source asset.
///
/// Only a PNG source can be kept; a converted source just records the growth.
pub fn decide(candidate_size: usize, source_size: usize, source_format: MediaFormat) -> String {
    if candidate_size < source_size {
        format!("saved {} bytes", source_size - candidate_size)
    } else if source_format == MediaFormat::Png {
        "kept original PNG (smaller than candidate)".to_string()
    } else {
        format!("{} bytes larger than the {} source", candidate_size - source_size, source_format)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ProgressReporter;
    use image::{Rgba, RgbaImage};

    struct FixedSize(PngStrategyKind, usize);

    impl PngStrategy for FixedSize {
        fn kind(&self) -> PngStrategyKind {
            self.0
        }

        fn backend(&self) -> BackendId {
            BackendId::Custom("sized")
        }

        fn compress(&self, _source: &PngSource, _options: &PngOptions) -> Result<(Vec<u8>, PngReport), EncodeError> {
            Ok((vec![0; self.1], PngReport::new(self.0)))
        }
    }

    struct Broken;

    impl PngStrategy for Broken {
        fn kind(&self) -> PngStrategyKind {
            PngStrategyKind::Zopfli
        }

        fn backend(&self) -> BackendId {
            BackendId::Zopflipng
        }

        fn compress(&self, _source: &PngSource, _options: &PngOptions) -> Result<(Vec<u8>, PngReport), EncodeError> {
            Err(EncodeError::ToolUnavailable("zopflipng".to_string()))
        }
    }

    fn source() -> Arc<PngSource> {
        let image = DynamicImage::ImageRgba8(RgbaImage::from_pixel(4, 4, Rgba([1, 2, 3, 255])));
        Arc::new(PngSource::from_image(image).unwrap())
    }

    #[tokio::test]
    async fn test_smallest_candidate_wins_and_decision_is_recorded() {
        let selector = StrategySelector::new(vec![
            Arc::new(FixedSize(PngStrategyKind::Heuristic, 60)),
            Arc::new(Broken),
            Arc::new(FixedSize(PngStrategyKind::Quantize, 40)),
        ]);
        let original = SourceAsset::new(vec![0u8; 100]);
        let candidate = selector
            .select(source(), &PngOptions::default(), &original, MediaFormat::Png, ProgressReporter::silent().stage(0.3, 0.6))
            .await;

        assert_eq!(candidate.size(), 40);
        let report = candidate.report.unwrap();
        let png = report.png.unwrap();
        assert_eq!(png.strategy, PngStrategyKind::Quantize);
        assert_eq!(png.decision.as_deref(), Some("saved 60 bytes"));
        assert_eq!(report.notes.len(), 1);
    }

    #[tokio::test]
    async fn test_larger_winner_records_kept_original() {
        let selector = StrategySelector::new(vec![Arc::new(FixedSize(PngStrategyKind::Heuristic, 500))]);
        let original = SourceAsset::new(vec![0u8; 100]);
        let candidate = selector
            .select(source(), &PngOptions::default(), &original, MediaFormat::Png, ProgressReporter::silent().stage(0.3, 0.6))
            .await;
        let png = candidate.report.unwrap().png.unwrap();
        assert_eq!(png.decision.as_deref(), Some("kept original PNG (smaller than candidate)"));
    }

    #[tokio::test]
    async fn test_converted_source_decision_names_its_format() {
        let selector = StrategySelector::new(vec![Arc::new(FixedSize(PngStrategyKind::Heuristic, 500))]);
        let original = SourceAsset::new(vec![0u8; 100]);
        let candidate = selector
            .select(source(), &PngOptions::default(), &original, MediaFormat::Jpeg, ProgressReporter::silent().stage(0.3, 0.6))
            .await;
        let png = candidate.report.unwrap().png.unwrap();
        assert_eq!(png.decision.as_deref(), Some("400 bytes larger than the JPEG source"));
        assert_eq!(decide(40, 100, MediaFormat::Jpeg), "saved 60 bytes");
    }

    #[tokio::test]
    async fn test_all_strategies_failing_degrades() {
        let selector = StrategySelector::new(vec![Arc::new(Broken)]);
        let original = SourceAsset::new(vec![9u8; 10]);
        let candidate = selector
            .select(source(), &PngOptions::default(), &original, MediaFormat::Png, ProgressReporter::silent().stage(0.3, 0.6))
            .await;
        assert!(candidate.degraded);
        assert_eq!(candidate.bytes, original.bytes());
    }

    #[test]
    fn test_source_header_facts() {
        let rgb = PngSource::from_image(DynamicImage::new_rgb8(3, 3)).unwrap();
        let parsed = PngSource::from_bytes(rgb.bytes.clone()).unwrap();
        assert_eq!(parsed.bits_per_channel, 8);
        assert!(!parsed.has_alpha);

        let rgba16 = PngSource::from_image(DynamicImage::new_rgba16(3, 3)).unwrap();
        let parsed = PngSource::from_bytes(rgba16.bytes.clone()).unwrap();
        assert_eq!(parsed.bits_per_channel, 16);
        assert!(parsed.has_alpha);
    }

    #[test]
    fn test_choice_parses_tool_aliases() {
        assert_eq!("pngquant".parse::<PngStrategyChoice>(), Ok(PngStrategyChoice::Quantize));
        assert_eq!("Auto".parse::<PngStrategyChoice>(), Ok(PngStrategyChoice::Auto));
        assert!("oxipng".parse::<PngStrategyChoice>().is_err());
    }
}
