//! # Quality Mapper
//!
//! Funzioni pure che convertono la qualità normalizzata dell'utente in parametri
//! numerici specifici per ogni encoder. Tutte le funzioni sono totali e idempotenti.
//!
//! ## Schemi:
//! - **Quantizer / CRF** (AVIF): mappa lineare invertita su `[10, 55]`, 1.0 → 10, 0.1 → 55.
//!   La distanza `1 - q` è normalizzata sull'intervallo utile `[0.1, 1.0]` così che
//!   entrambi gli estremi vengano raggiunti
//! - **Lossy scalar** (JPEG, WebP, HEIC): `q` clampato in `[0.01, 1.0]`
//! - **Percent**: scalar * 100 per i tool a riga di comando
//! - **GIF palette**: `clamp(q * 256, 16, 256)` colori

use serde::{Deserialize, Serialize};

pub const MIN_QUALITY: f32 = 0.1;
pub const MAX_QUALITY: f32 = 1.0;

const QUANTIZER_BEST: f32 = 10.0;
const QUANTIZER_SPAN: f32 = 45.0;
const AV1_QUANTIZER_MAX: f32 = 63.0;

/// User-facing quality dial, always inside `[0.1, 1.0]`.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(from = "f32", into = "f32")]
pub struct QualitySetting(f32);

impl QualitySetting {
    pub fn new(value: f32) -> Self {
        if value.is_nan() {
            return Self(MAX_QUALITY);
        }
        Self(value.clamp(MIN_QUALITY, MAX_QUALITY))
    }

    pub fn value(self) -> f32 {
        self.0
    }
}

impl From<f32> for QualitySetting {
    fn from(value: f32) -> Self {
        Self::new(value)
    }
}

impl From<QualitySetting> for f32 {
    fn from(quality: QualitySetting) -> Self {
        quality.0
    }
}

/// Numeric parameter families understood by `to_encoder_parameter`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterScheme {
    /// AV1 quantizer, lower is better.
    Quantizer,
    /// Same map as `Quantizer`, documented as CRF for video-style encoders.
    Crf,
    /// Lossy quality as a 1..=100 percentage.
    LossyPercent,
    /// Maximum palette entries for GIF palette generation.
    GifPaletteSize,
}

pub fn to_encoder_parameter(quality: QualitySetting, scheme: ParameterScheme) -> i32 {
    match scheme {
        ParameterScheme::Quantizer | ParameterScheme::Crf => quantizer(quality) as i32,
        ParameterScheme::LossyPercent => lossy_percent(quality.value()) as i32,
        ParameterScheme::GifPaletteSize => gif_palette_size(quality) as i32,
    }
}

/// Inverted linear map onto `[10, 55]`.
///
/// The distance from full quality is normalised by 0.9 so that 0.1 lands exactly on 55.
/// Mid-range values therefore sit slightly above a plain `10 + (1 - q) * 45`
/// (0.7 gives 25 rather than 23.5).
pub fn quantizer(quality: QualitySetting) -> u8 {
    let distance = (MAX_QUALITY - quality.value()) / (MAX_QUALITY - MIN_QUALITY);
    (QUANTIZER_BEST + distance * QUANTIZER_SPAN).round() as u8
}

/// Quality scalar handed to JPEG, WebP and HEIC encoders.
pub fn lossy_scalar(quality: f32) -> f32 {
    if quality.is_nan() {
        return 1.0;
    }
    quality.clamp(0.01, 1.0)
}

pub fn lossy_percent(quality: f32) -> u8 {
    ((lossy_scalar(quality) * 100.0).round() as u8).clamp(1, 100)
}

/// Converts an AV1 quantizer (0..=63, lower is better) to a 1..=100 quality for
/// encoders that take a percentage.
pub fn av1_quality_percent(quantizer: u8) -> u8 {
    let q = (quantizer as f32).min(AV1_QUANTIZER_MAX);
    (((AV1_QUANTIZER_MAX - q) / AV1_QUANTIZER_MAX) * 100.0).round().clamp(1.0, 100.0) as u8
}

pub fn gif_palette_size(quality: QualitySetting) -> u16 {
    ((quality.value() * 256.0) as u16).clamp(16, 256)
}

/// AV1 encoder speed presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AvifSpeed {
    Fast,
    #[default]
    Balanced,
    Best,
}

impl AvifSpeed {
    /// `--speed` / cpu-used value, 0 (slowest) to 10.
    pub fn cpu_used(self) -> u8 {
        match self {
            Self::Fast => 8,
            Self::Balanced => 4,
            Self::Best => 0,
        }
    }
}

/// Perceptual quality band for palette quantization, in percent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuantizationBand {
    pub min: u8,
    pub max: u8,
}

impl QuantizationBand {
    /// Builds a band from `[0, 1]` fractions. `max` never drops below `min`.
    pub fn from_fractions(min: f32, max: f32) -> Self {
        let to_percent = |v: f32| {
            if v.is_nan() {
                0
            } else {
                (v * 100.0).round().clamp(0.0, 100.0) as u8
            }
        };
        let min = to_percent(min);
        let max = to_percent(max).max(min);
        Self { min, max }
    }
}

pub fn quantization_speed(speed: u8) -> u8 {
    speed.clamp(1, 10)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quantizer_endpoints() {
        assert_eq!(quantizer(QualitySetting::new(1.0)), 10);
        assert_eq!(quantizer(QualitySetting::new(0.1)), 55);
        assert_eq!(
            to_encoder_parameter(QualitySetting::new(1.0), ParameterScheme::Crf),
            10
        );
        assert_eq!(
            to_encoder_parameter(QualitySetting::new(0.1), ParameterScheme::Quantizer),
            55
        );
    }

    #[test]
    fn test_quantizer_mid_range_uses_normalised_distance() {
        assert_eq!(quantizer(QualitySetting::new(0.7)), 25);
    }

    #[test]
    fn test_quantizer_is_monotonic() {
        let mut previous = i32::MAX;
        for step in 0..=90 {
            let q = QualitySetting::new(0.1 + step as f32 * 0.01);
            let param = to_encoder_parameter(q, ParameterScheme::Quantizer);
            assert!(param <= previous, "quantizer rose at q={}", q.value());
            previous = param;
        }
    }

    #[test]
    fn test_quality_setting_clamps() {
        assert_eq!(QualitySetting::new(0.0).value(), MIN_QUALITY);
        assert_eq!(QualitySetting::new(3.0).value(), MAX_QUALITY);
        assert_eq!(QualitySetting::new(f32::NAN).value(), MAX_QUALITY);
        assert_eq!(quantizer(QualitySetting::new(-5.0)), 55);
    }

    #[test]
    fn test_lossy_scalar_clamps() {
        assert_eq!(lossy_scalar(0.0), 0.01);
        assert_eq!(lossy_scalar(0.75), 0.75);
        assert_eq!(lossy_scalar(7.0), 1.0);
        assert_eq!(lossy_percent(0.0), 1);
        assert_eq!(lossy_percent(0.85), 85);
        assert_eq!(lossy_scalar(lossy_scalar(0.004)), lossy_scalar(0.004));
    }

    #[test]
    fn test_gif_palette_size_bounds() {
        assert_eq!(gif_palette_size(QualitySetting::new(0.1)), 25);
        assert_eq!(gif_palette_size(QualitySetting::new(0.05)), 25);
        assert_eq!(gif_palette_size(QualitySetting::new(1.0)), 256);
    }

    #[test]
    fn test_quantization_band_keeps_max_above_min() {
        let band = QuantizationBand::from_fractions(0.9, 0.5);
        assert_eq!(band, QuantizationBand { min: 90, max: 90 });

        let band = QuantizationBand::from_fractions(0.6, 0.95);
        assert_eq!(band, QuantizationBand { min: 60, max: 95 });

        let band = QuantizationBand::from_fractions(-1.0, 2.0);
        assert_eq!(band, QuantizationBand { min: 0, max: 100 });
    }

    #[test]
    fn test_av1_quality_percent() {
        assert_eq!(av1_quality_percent(0), 100);
        assert_eq!(av1_quality_percent(63), 1);
        assert!(av1_quality_percent(10) > av1_quality_percent(55));
    }

    #[test]
    fn test_avif_speed_presets() {
        assert_eq!(AvifSpeed::Fast.cpu_used(), 8);
        assert_eq!(AvifSpeed::Balanced.cpu_used(), 4);
        assert_eq!(AvifSpeed::Best.cpu_used(), 0);
    }
}
