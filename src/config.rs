//! # Configuration Management Module
//!
//! Questo modulo gestisce la configurazione della pipeline di ricompressione.
//!
//! ## Responsabilità:
//! - Definisce `CompressionSettings` con tutti i parametri per formato
//! - Fornisce validazione dei parametri
//! - Supporta caricamento/salvataggio da/verso file JSON
//! - Fornisce valori di default sensati per tutti i parametri
//!
//! ## Parametri principali:
//! - `quality`: qualità normalizzata per formato (JPEG 0.75, HEIC 0.85, WebP 0.80,
//!   AVIF 0.85, GIF 0.80)
//! - `avif_speed`: preset di velocità AV1 (default: balanced)
//! - `backend_preference`: famiglia di backend da provare per prima (default: system)
//! - `png`: strategia PNG, iterazioni zopflipng, banda pngquant
//! - `gif`: scala, dithering, frame rate della pipeline a filtri
//! - `animation`: policy per formato (WebP preserve, AVIF flatten, GIF preserve)
//! - `verify_animation`: ridecodifica l'output animato per contare i frame
//! - `max_dimensions`: box massimo per le immagini statiche (default: nessuno)
//! - `av`: codec, CRF, preset e parametri audio
//!
//! Il file di default si trova in `<config_dir>/media-recompress/settings.json`;
//! se manca si usano i default.

use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::animation::AnimationPolicy;
use crate::av_processor::AvSettings;
use crate::codec::{BackendPreference, EncodeParams, GifOptions};
use crate::format::MediaFormat;
use crate::png::PngOptions;
use crate::quality::{AvifSpeed, QualitySetting, MAX_QUALITY};
use crate::resize::MaxDimensions;

/// Default quality per image format.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FormatQualities {
    pub jpeg: QualitySetting,
    pub heic: QualitySetting,
    pub webp: QualitySetting,
    pub avif: QualitySetting,
    pub gif: QualitySetting,
}

impl Default for FormatQualities {
    fn default() -> Self {
        Self {
            jpeg: QualitySetting::new(0.75),
            heic: QualitySetting::new(0.85),
            webp: QualitySetting::new(0.80),
            avif: QualitySetting::new(0.85),
            gif: QualitySetting::new(0.80),
        }
    }
}

impl FormatQualities {
    /// PNG and audio/video formats have no quality dial and report the maximum.
    pub fn for_format(&self, format: MediaFormat) -> QualitySetting {
        match format {
            MediaFormat::Jpeg => self.jpeg,
            MediaFormat::Heic => self.heic,
            MediaFormat::WebP => self.webp,
            MediaFormat::Avif => self.avif,
            MediaFormat::Gif => self.gif,
            _ => QualitySetting::new(MAX_QUALITY),
        }
    }
}

/// Animation policy per animated container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnimationPolicies {
    pub webp: AnimationPolicy,
    pub avif: AnimationPolicy,
    pub gif: AnimationPolicy,
}

impl Default for AnimationPolicies {
    fn default() -> Self {
        Self {
            webp: AnimationPolicy::Preserve,
            avif: AnimationPolicy::Flatten,
            gif: AnimationPolicy::Preserve,
        }
    }
}

impl AnimationPolicies {
    pub fn for_format(&self, format: MediaFormat) -> AnimationPolicy {
        match format {
            MediaFormat::WebP => self.webp,
            MediaFormat::Avif => self.avif,
            MediaFormat::Gif => self.gif,
            _ => AnimationPolicy::Flatten,
        }
    }
}

/// Settings for every compression request of a `Compressor`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionSettings {
    pub quality: FormatQualities,
    pub avif_speed: AvifSpeed,
    pub backend_preference: BackendPreference,
    pub png: PngOptions,
    pub gif: GifOptions,
    pub animation: AnimationPolicies,
    /// Re-decode animated output and compare frame counts
    pub verify_animation: bool,
    /// Bounding box for still images (width, height)
    pub max_dimensions: Option<(u32, u32)>,
    pub av: AvSettings,
}

impl Default for CompressionSettings {
    fn default() -> Self {
        Self {
            quality: FormatQualities::default(),
            avif_speed: AvifSpeed::Balanced,
            backend_preference: BackendPreference::System,
            png: PngOptions::default(),
            gif: GifOptions::default(),
            animation: AnimationPolicies::default(),
            verify_animation: true,
            max_dimensions: None,
            av: AvSettings::default(),
        }
    }
}

impl CompressionSettings {
    /// Validate configuration parameters
    pub fn validate(&self) -> Result<()> {
        let png = &self.png;
        for (name, value) in [
            ("PNG quantize minimum quality", png.quantize_min_quality),
            ("PNG quantize maximum quality", png.quantize_max_quality),
            ("PNG quantize dithering", png.quantize_dithering),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(anyhow::anyhow!("{} must be between 0.0 and 1.0", name));
            }
        }

        if !(1..=10).contains(&png.quantize_speed) {
            return Err(anyhow::anyhow!("PNG quantize speed must be between 1 and 10"));
        }

        if png.iterations == 0 || png.iterations_large == 0 {
            return Err(anyhow::anyhow!("zopflipng iterations must be greater than 0"));
        }

        if !(self.gif.scale > 0.0 && self.gif.scale <= 1.0) {
            return Err(anyhow::anyhow!("GIF scale must be in (0.0, 1.0]"));
        }

        if let Some(fps) = self.gif.frame_rate {
            if !(fps > 0.0 && fps.is_finite()) {
                return Err(anyhow::anyhow!("GIF frame rate must be positive"));
            }
        }

        if let Some((width, height)) = self.max_dimensions {
            if width == 0 || height == 0 {
                return Err(anyhow::anyhow!("Maximum dimensions must be greater than 0"));
            }
        }

        self.av.validate()
    }

    /// `<config_dir>/media-recompress/settings.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("media-recompress").join("settings.json"))
    }

    /// Load configuration from file. A missing file yields the defaults.
    pub async fn from_file(path: &Path) -> Result<Self> {
        if !tokio::fs::try_exists(path).await? {
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path).await?;
        let settings: CompressionSettings = serde_json::from_str(&content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Save configuration to file
    pub async fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    pub fn max_dimensions(&self) -> Option<MaxDimensions> {
        self.max_dimensions.map(MaxDimensions::from)
    }

    /// Encoder parameters for `format`, with an optional per-request quality.
    pub fn encode_params(&self, format: MediaFormat, quality: Option<QualitySetting>) -> EncodeParams {
        let mut params = EncodeParams::new(quality.unwrap_or_else(|| self.quality.for_format(format)));
        params.speed = self.avif_speed;
        params.gif = self.gif;
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_settings_validation() {
        let mut settings = CompressionSettings::default();
        assert_ok!(settings.validate());

        settings.png.quantize_max_quality = 1.5;
        assert_err!(settings.validate());

        settings.png.quantize_max_quality = 0.95;
        settings.png.quantize_speed = 0;
        assert_err!(settings.validate());

        settings.png.quantize_speed = 3;
        settings.gif.scale = 0.0;
        assert_err!(settings.validate());

        settings.gif.scale = 0.5;
        settings.max_dimensions = Some((0, 100));
        assert_err!(settings.validate());

        settings.max_dimensions = Some((1920, 1080));
        settings.av.video_crf = 60;
        assert_err!(settings.validate());

        settings.av.video_crf = 28;
        assert_ok!(settings.validate());
    }

    #[test]
    fn test_settings_default() {
        let settings = CompressionSettings::default();
        assert_eq!(settings.quality.jpeg.value(), 0.75);
        assert_eq!(settings.quality.for_format(MediaFormat::Heic).value(), 0.85);
        assert_eq!(settings.quality.for_format(MediaFormat::WebP).value(), 0.80);
        assert_eq!(settings.animation.for_format(MediaFormat::WebP), AnimationPolicy::Preserve);
        assert_eq!(settings.animation.for_format(MediaFormat::Avif), AnimationPolicy::Flatten);
        assert_eq!(settings.animation.for_format(MediaFormat::Gif), AnimationPolicy::Preserve);
        assert!(settings.verify_animation);
        assert_eq!(settings.max_dimensions, None);
    }

    #[test]
    fn test_encode_params_prefers_request_quality() {
        let settings = CompressionSettings::default();
        let params = settings.encode_params(MediaFormat::Avif, None);
        assert_eq!(params.quality.value(), 0.85);
        let params = settings.encode_params(MediaFormat::Avif, Some(QualitySetting::new(0.3)));
        assert_eq!(params.quality.value(), 0.3);
    }

    #[tokio::test]
    async fn test_settings_save_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("settings.json");

        let mut original = CompressionSettings::default();
        original.quality.webp = QualitySetting::new(0.6);
        original.avif_speed = AvifSpeed::Fast;
        original.backend_preference = BackendPreference::Native;
        original.png.iterations = 15;
        original.max_dimensions = Some((2048, 2048));
        original.av.audio_bitrate = "192k".to_string();

        original.save_to_file(&path).await.unwrap();
        let loaded = CompressionSettings::from_file(&path).await.unwrap();
        assert_eq!(loaded, original);
    }

    #[tokio::test]
    async fn test_missing_file_yields_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let loaded = CompressionSettings::from_file(&temp_dir.path().join("absent.json"))
            .await
            .unwrap();
        assert_eq!(loaded, CompressionSettings::default());
    }

    #[tokio::test]
    async fn test_partial_file_fills_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("settings.json");
        tokio::fs::write(&path, r#"{"quality": {"jpeg": 0.5}, "png": {"strategy": "zopfli"}}"#)
            .await
            .unwrap();

        let loaded = CompressionSettings::from_file(&path).await.unwrap();
        assert_eq!(loaded.quality.jpeg.value(), 0.5);
        assert_eq!(loaded.quality.avif.value(), 0.85);
        assert_eq!(loaded.png.strategy, crate::png::PngStrategyChoice::Zopfli);
        assert_eq!(loaded.png.iterations, 3);
    }
}
