//! # Compressor
//!
//! Punto di ingresso unico: `Compressor::compress(request, on_progress)`.
//!
//! ## Flusso per item:
//! 1. **Sniff**: `detect()` sui primi byte; l'hint del chiamante sostituisce solo il fallback
//! 2. **Routing**: immagini → pipeline immagini, audio/video → `AvProcessor`
//! 3. **Decode**: catena di decoder del formato sorgente
//! 4. **Animazione**: `Preserve` → `AnimationPipeline`, `Flatten` → primo frame
//! 5. **Encode**: PNG → `StrategySelector`, altri → `FallbackChain` con heartbeat
//! 6. **SizeGuard**: "mai peggiorare", salvo conversione richiesta
//!
//! La cancellazione viene controllata tra uno stadio e l'altro. Il valore 1.0 di
//! progresso è sempre l'ultimo emesso, dopo l'arresto del heartbeat.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use image::DynamicImage;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::animation::{flatten, AnimationPipeline, AnimationPolicy};
use crate::av_processor::{self, AvProcessor};
use crate::codec::{BackendPreference, BackendRegistry, EncodeParams, FrameSequence};
use crate::config::CompressionSettings;
use crate::error::CompressError;
use crate::fallback::FallbackChain;
use crate::format::{detect, FormatTag, MediaCategory, MediaFormat};
use crate::outcome::{CompressionOutcome, EncodeReport, EncodedCandidate, OutcomeWarning, SourceAsset};
use crate::png::{PngSource, StrategySelector};
use crate::progress::{Heartbeat, HeartbeatConfig, ProgressReporter};
use crate::quality::QualitySetting;
use crate::resize::cap_dimensions;
use crate::size_guard;

/// One compression request. Unset fields fall back to the compressor's settings.
#[derive(Debug, Clone)]
pub struct CompressRequest {
    pub bytes: Arc<[u8]>,
    pub source_format_hint: Option<MediaFormat>,
    pub target_format: Option<MediaFormat>,
    pub quality: Option<QualitySetting>,
    pub animation_policy: Option<AnimationPolicy>,
    pub backend_preference: Option<BackendPreference>,
}

impl CompressRequest {
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            bytes: bytes.into(),
            source_format_hint: None,
            target_format: None,
            quality: None,
            animation_policy: None,
            backend_preference: None,
        }
    }

    pub fn source_format_hint(mut self, format: MediaFormat) -> Self {
        self.source_format_hint = Some(format);
        self
    }

    pub fn target_format(mut self, format: MediaFormat) -> Self {
        self.target_format = Some(format);
        self
    }

    pub fn quality(mut self, quality: impl Into<QualitySetting>) -> Self {
        self.quality = Some(quality.into());
        self
    }

    pub fn animation_policy(mut self, policy: AnimationPolicy) -> Self {
        self.animation_policy = Some(policy);
        self
    }

    pub fn backend_preference(mut self, preference: BackendPreference) -> Self {
        self.backend_preference = Some(preference);
        self
    }
}

/// Sniff result with the caller's hint applied to the fallback case only.
pub fn resolve_format(bytes: &[u8], hint: Option<MediaFormat>) -> FormatTag {
    let tag = detect(bytes);
    match hint {
        Some(format) if !tag.recognized => FormatTag {
            format,
            is_animated: false,
            recognized: false,
        },
        _ => tag,
    }
}

pub struct Compressor {
    settings: CompressionSettings,
    registry: BackendRegistry,
    png_selector: Option<StrategySelector>,
    stop_receiver: Option<Mutex<broadcast::Receiver<()>>>,
    cancelled: AtomicBool,
}

impl Compressor {
    pub fn new(settings: CompressionSettings) -> Self {
        Self {
            settings,
            registry: BackendRegistry::with_defaults(),
            png_selector: None,
            stop_receiver: None,
            cancelled: AtomicBool::new(false),
        }
    }

    /// Replaces the default backends.
    pub fn with_registry(mut self, registry: BackendRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Replaces the PNG strategies chosen by `settings.png.strategy`.
    pub fn with_png_selector(mut self, selector: StrategySelector) -> Self {
        self.png_selector = Some(selector);
        self
    }

    /// A message on `stop_receiver` fails the current and every later item with `Cancelled`.
    pub fn with_cancellation(mut self, stop_receiver: broadcast::Receiver<()>) -> Self {
        self.stop_receiver = Some(Mutex::new(stop_receiver));
        self
    }

    pub fn settings(&self) -> &CompressionSettings {
        &self.settings
    }

    /// Polls the stop signal. Once true it stays true.
    pub fn is_cancelled(&self) -> bool {
        self.should_stop()
    }

    fn should_stop(&self) -> bool {
        if self.cancelled.load(Ordering::SeqCst) {
            return true;
        }
        let Some(receiver) = &self.stop_receiver else {
            return false;
        };
        let mut receiver = receiver.lock().unwrap_or_else(|e| e.into_inner());
        let stop = match receiver.try_recv() {
            Ok(()) | Err(broadcast::error::TryRecvError::Lagged(_)) => true,
            // a dropped sender means nobody can cancel any more
            Err(broadcast::error::TryRecvError::Empty) | Err(broadcast::error::TryRecvError::Closed) => false,
        };
        if stop {
            self.cancelled.store(true, Ordering::SeqCst);
        }
        stop
    }

    fn checkpoint(&self, stage: &str) -> Result<(), CompressError> {
        if self.should_stop() {
            debug!("Stop signal received before {}", stage);
            return Err(CompressError::Cancelled);
        }
        Ok(())
    }

    /// Compresses one media item. Never panics and always ends with a 1.0 progress value.
    pub async fn compress(
        &self,
        request: CompressRequest,
        on_progress: impl Fn(f32) + Send + Sync + 'static,
    ) -> CompressionOutcome {
        let reporter = ProgressReporter::new(on_progress);
        let outcome = match self.run(request, &reporter).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("❌ Compression failed: {}", e);
                CompressionOutcome::failed(e.kind(), e.to_string())
            }
        };
        reporter.finish();
        debug!("Outcome: {}", outcome.reason());
        outcome
    }

    async fn run(&self, request: CompressRequest, reporter: &ProgressReporter) -> Result<CompressionOutcome, CompressError> {
        self.checkpoint("sniffing")?;
        let source = SourceAsset::new(request.bytes.clone());
        let tag = resolve_format(source.bytes(), request.source_format_hint);
        let conversion_requested = request.target_format.is_some_and(|target| target != tag.format);
        debug!(
            "Detected {} (animated flag: {}, recognized: {})",
            tag.format, tag.is_animated, tag.recognized
        );
        reporter.report(0.01);

        if tag.format.category() != MediaCategory::Image {
            let target = av_processor::resolve_target(tag.format, request.target_format)?;
            self.checkpoint("transcoding")?;
            let candidate = AvProcessor::new(self.settings.av.clone())
                .transcode(&source, tag.format, target, reporter.stage(0.05, 0.9))
                .await;
            self.checkpoint("size check")?;
            return Ok(size_guard::accept(candidate, &source, tag.format, conversion_requested));
        }

        let target = request.target_format.unwrap_or(tag.format);
        if target.category() != MediaCategory::Image {
            return Err(CompressError::UnsupportedContainer(format!(
                "cannot convert {} to {}",
                tag.format, target
            )));
        }

        let preference = request.backend_preference.unwrap_or(self.settings.backend_preference);
        let policy = request
            .animation_policy
            .unwrap_or_else(|| self.settings.animation.for_format(tag.format));
        let params = self.settings.encode_params(target, request.quality);

        let mut pipeline = AnimationPipeline::new(&self.registry, preference, self.settings.verify_animation);
        let sequence = pipeline.decode(&source, tag.format).await?;
        reporter.report(0.05);
        self.checkpoint("encoding")?;

        let mut warnings = Vec::new();
        if tag.is_animated && sequence.len() == 1 {
            warn!("⚠️  {} is flagged animated but decoded to a single frame", tag.format);
            warnings.push(OutcomeWarning::AnimationFlagMismatch {
                flagged: true,
                decoded_frames: 1,
            });
        }
        let animated = tag.is_animated || sequence.len() > 1;

        let candidate = if animated && policy == AnimationPolicy::Preserve && target.supports_animation() {
            let run = pipeline
                .reencode(sequence, target, &params, &source, reporter.stage(0.05, 0.8))
                .await;
            debug!("Animation pipeline ended in state {}", run.state);
            warnings.extend(run.warnings);
            run.candidate
        } else {
            if animated && policy == AnimationPolicy::Preserve {
                debug!("{} cannot carry animation, keeping the first frame", target);
            }
            let (image, flattened) = flatten(sequence).ok_or(crate::error::DecodeError::Empty)?;
            warnings.extend(flattened);
            self.encode_still(image, &source, tag.format, target, &params, preference, reporter)
                .await
        };

        self.checkpoint("size check")?;
        Ok(size_guard::accept(candidate, &source, tag.format, conversion_requested).with_warnings(warnings))
    }

    #[allow(clippy::too_many_arguments)]
    async fn encode_still(
        &self,
        image: DynamicImage,
        source: &SourceAsset,
        source_format: MediaFormat,
        target: MediaFormat,
        params: &EncodeParams,
        preference: BackendPreference,
        reporter: &ProgressReporter,
    ) -> EncodedCandidate {
        let dimensions = (image.width(), image.height());
        let image = cap_dimensions(image, self.settings.max_dimensions());
        let resized = dimensions != (image.width(), image.height());

        if target == MediaFormat::Png {
            let png_source = match self.png_source(image, source, source_format, resized) {
                Ok(png_source) => png_source,
                Err(e) => {
                    let mut report = EncodeReport::new("passthrough");
                    report.note(format!("png: {e}"));
                    return EncodedCandidate::passthrough(source, target).with_report(report);
                }
            };
            let default_selector;
            let selector = match &self.png_selector {
                Some(selector) => selector,
                None => {
                    default_selector = StrategySelector::for_choice(self.settings.png.strategy);
                    &default_selector
                }
            };
            return selector
                .select(
                    Arc::new(png_source),
                    &self.settings.png,
                    source,
                    source_format,
                    reporter.stage(0.3, 0.7),
                )
                .await;
        }

        let chain = FallbackChain::for_format(&self.registry, target, preference);
        debug!("{} still chain: {:?}", target, chain.backend_names());
        let heartbeat = Heartbeat::start(reporter.stage(0.0, 1.0), HeartbeatConfig::still());
        let candidate = chain.encode_still(Arc::new(image), params, source).await;
        heartbeat.stop().await;
        candidate
    }

    /// Original PNG bytes keep their header facts unless the pixels changed.
    fn png_source(
        &self,
        image: DynamicImage,
        source: &SourceAsset,
        source_format: MediaFormat,
        resized: bool,
    ) -> Result<PngSource, crate::error::EncodeError> {
        if source_format == MediaFormat::Png && !resized {
            match PngSource::from_bytes(source.shared()) {
                Ok(png_source) => return Ok(png_source),
                Err(e) => debug!("Re-encoding PNG source for strategies: {}", e),
            }
        }
        PngSource::from_image(image)
    }

    /// Decoded frames of `bytes`, for callers that only need pixels.
    pub async fn decode(&self, bytes: impl Into<Arc<[u8]>>, format: MediaFormat) -> Result<FrameSequence, CompressError> {
        let source = SourceAsset::new(bytes);
        let mut pipeline = AnimationPipeline::new(&self.registry, self.settings.backend_preference, false);
        Ok(pipeline.decode(&source, format).await?)
    }
}
