//! # Batch Runner
//!
//! Applica `Compressor::compress` a un file o a una directory, un file alla volta.
//!
//! ## Flusso:
//! 1. Discovery con walkdir; i file vengono riconosciuti dai magic number
//! 2. Per ogni file: lettura, compressione, scrittura dell'esito
//! 3. Statistiche finali (log o evento JSON `complete`)
//!
//! ## Scrittura:
//! - **Output directory**: albero replicato, anche gli originali mantenuti vengono copiati
//! - **In place**: swap tramite `.bak`; un originale mantenuto non viene toccato
//! - **Dry run**: nessuna scrittura

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Result;
use tracing::{debug, error, info, warn};

use crate::animation::AnimationPolicy;
use crate::codec::BackendPreference;
use crate::file_manager::FileManager;
use crate::format::{FormatTag, MediaFormat};
use crate::json_output::{FileCompletion, JsonConfig, JsonMessage};
use crate::orchestrator::compressor::{CompressRequest, Compressor};
use crate::orchestrator::path_resolver::PathResolver;
use crate::outcome::CompressionOutcome;
use crate::progress::{BatchProgress, BatchStats};
use crate::quality::QualitySetting;

/// Per-run overrides applied to every request of the batch.
#[derive(Debug, Clone, Default)]
pub struct BatchOptions {
    pub output_dir: Option<PathBuf>,
    pub target_format: Option<MediaFormat>,
    pub quality: Option<QualitySetting>,
    pub animation_policy: Option<AnimationPolicy>,
    pub backend_preference: Option<BackendPreference>,
    pub dry_run: bool,
    pub json_output: bool,
}

pub struct BatchRunner {
    compressor: Compressor,
    options: BatchOptions,
}

impl BatchRunner {
    pub fn new(compressor: Compressor, options: BatchOptions) -> Self {
        Self { compressor, options }
    }

    /// Processes `input` (file or directory) and returns the run's statistics.
    pub async fn run(&self, input: &Path) -> Result<BatchStats> {
        let start_time = Instant::now();
        let resolver = PathResolver::new(input, self.options.output_dir.as_deref()).await?;
        let scan_root = tokio::fs::canonicalize(input).await?;

        let files: Vec<(PathBuf, FormatTag)> = FileManager::find_media_files(&scan_root)
            .await?
            .into_iter()
            .filter(|(path, _)| !resolver.is_inside_output(path))
            .collect();

        self.emit_start(&scan_root, &resolver, files.len());
        let mut stats = BatchStats::new();

        if files.is_empty() {
            if self.options.json_output {
                JsonMessage::complete(&stats, start_time.elapsed().as_secs_f64()).emit();
            } else {
                info!("No supported media files found in {}", scan_root.display());
            }
            return Ok(stats);
        }

        let progress = if self.options.json_output {
            BatchProgress::hidden()
        } else {
            BatchProgress::new(files.len() as u64)
        };

        let total = files.len();
        for (index, (path, tag)) in files.into_iter().enumerate() {
            if self.compressor.is_cancelled() {
                warn!("⚠️  Stop requested, skipping the remaining {} files", total - index);
                break;
            }
            self.process_file(&resolver, &path, tag, index, total, &progress, &mut stats)
                .await;
        }

        progress.finish(&stats.format_summary());
        self.emit_summary(&stats, start_time.elapsed().as_secs_f64());
        Ok(stats)
    }

    fn emit_start(&self, input: &Path, resolver: &PathResolver, total_files: usize) {
        let settings = self.compressor.settings();
        if self.options.json_output {
            JsonMessage::Start {
                input: input.to_path_buf(),
                output_dir: resolver.output_dir().map(Path::to_path_buf),
                total_files,
                config: JsonConfig {
                    target_format: self.options.target_format.map(|f| f.to_string()),
                    quality: self.options.quality.map(|q| q.value()),
                    backend_preference: format!(
                        "{:?}",
                        self.options.backend_preference.unwrap_or(settings.backend_preference)
                    )
                    .to_lowercase(),
                    png_strategy: format!("{:?}", settings.png.strategy).to_lowercase(),
                    flatten_animation: self.options.animation_policy == Some(AnimationPolicy::Flatten),
                    dry_run: self.options.dry_run,
                },
            }
            .emit();
            return;
        }

        info!("Starting media recompression in: {}", input.display());
        match self.options.target_format {
            Some(format) => info!("Mode: convert everything to {}", format),
            None => info!("Mode: recompress in the original formats"),
        }
        match resolver.output_dir() {
            Some(dir) => info!("Output directory: {}", dir.display()),
            None => info!("Mode: replace files in place"),
        }
        if self.options.dry_run {
            info!("Dry run mode: no files will be modified");
        }
        info!("Found {} media files to process", total_files);
    }

    #[allow(clippy::too_many_arguments)]
    async fn process_file(
        &self,
        resolver: &PathResolver,
        path: &Path,
        tag: FormatTag,
        index: usize,
        total: usize,
        progress: &BatchProgress,
        stats: &mut BatchStats,
    ) {
        let name = path
            .file_name()
            .unwrap_or_default()
            .to_string_lossy()
            .into_owned();

        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                let e = anyhow::Error::from(e);
                error!("❌ Cannot read {}: {}", path.display(), e);
                stats.add_failed();
                if self.options.json_output {
                    JsonMessage::FileComplete(FileCompletion::unreadable(path.to_path_buf(), &e)).emit();
                }
                progress.item_done(&format!("[ERROR] {}", name));
                return;
            }
        };
        let original_size = bytes.len() as u64;

        if self.options.json_output {
            JsonMessage::FileStart {
                path: path.to_path_buf(),
                format: tag.format.to_string(),
                size: original_size,
                index,
                total,
            }
            .emit();
        }
        debug!("Processing {} ({}, {})", path.display(), tag.format, FileManager::format_size(original_size));

        let bar = progress.clone();
        let bar_name = name.clone();
        let outcome = self
            .compressor
            .compress(self.request(bytes), move |fraction| bar.item_progress(&bar_name, fraction))
            .await;

        let output = match self.write_outcome(resolver, path, tag.format, &outcome).await {
            Ok(output) => output,
            Err(e) => {
                error!("❌ Cannot write result for {}: {}", path.display(), e);
                stats.add_failed();
                if self.options.json_output {
                    JsonMessage::FileComplete(FileCompletion::unreadable(path.to_path_buf(), &e)).emit();
                }
                progress.item_done(&format!("[ERROR] {}", name));
                return;
            }
        };

        let message = match &outcome {
            CompressionOutcome::Accepted(accepted) => {
                let new_size = accepted.candidate.size() as u64;
                stats.add_accepted(original_size, new_size);
                format!(
                    "[OK] {}: {:.1}% saved",
                    name,
                    FileManager::calculate_reduction(original_size, new_size)
                )
            }
            CompressionOutcome::KeptOriginal(_) => {
                stats.add_kept_original(original_size);
                format!("[KEEP] {}", name)
            }
            CompressionOutcome::Failed(_) => {
                stats.add_failed();
                format!("[ERROR] {}", name)
            }
        };
        info!("{}: {}", name, outcome.reason());

        if self.options.json_output {
            JsonMessage::FileComplete(FileCompletion::from_outcome(
                path.to_path_buf(),
                output,
                original_size,
                &outcome,
            ))
            .emit();
        }
        progress.item_done(&message);
    }

    fn request(&self, bytes: Vec<u8>) -> CompressRequest {
        let mut request = CompressRequest::new(bytes);
        request.target_format = self.options.target_format;
        request.quality = self.options.quality;
        request.animation_policy = self.options.animation_policy;
        request.backend_preference = self.options.backend_preference;
        request
    }

    /// Writes the outcome's bytes. Returns where they went (or would go, on a dry run).
    async fn write_outcome(
        &self,
        resolver: &PathResolver,
        path: &Path,
        source_format: MediaFormat,
        outcome: &CompressionOutcome,
    ) -> Result<Option<PathBuf>> {
        let (Some(bytes), Some(format)) = (outcome.bytes(), outcome.format()) else {
            return Ok(None);
        };
        let in_place = resolver.output_dir().is_none();
        if in_place && outcome.is_kept_original() {
            return Ok(None);
        }

        let destination = resolver.output_path(path, source_format, format)?;
        if self.options.dry_run {
            info!("[DRY RUN] Would write {}", destination.display());
            return Ok(Some(destination));
        }

        if in_place {
            if destination != path && tokio::fs::try_exists(&destination).await? {
                return Err(anyhow::anyhow!(
                    "refusing to overwrite existing {}",
                    destination.display()
                ));
            }
            FileManager::replace_file(path, &destination, bytes).await?;
        } else {
            FileManager::write_output(&destination, bytes).await?;
        }
        Ok(Some(destination))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::image_codec::ImageDecoder;
    use crate::codec::{BackendId, BackendKind, BackendRegistry, CodecBackend, EncodeParams};
    use crate::config::CompressionSettings;
    use crate::error::EncodeError;
    use image::codecs::jpeg::JpegEncoder;
    use image::{DynamicImage, Rgb, RgbImage};
    use std::io::Cursor;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::sync::broadcast;

    struct FixedOutput(usize);

    impl CodecBackend for FixedOutput {
        fn id(&self) -> BackendId {
            BackendId::Custom("fixed-output")
        }

        fn kind(&self) -> BackendKind {
            BackendKind::Native
        }

        fn encode_still(&self, _image: &DynamicImage, _params: &EncodeParams) -> Result<Vec<u8>, EncodeError> {
            Ok(vec![9u8; self.0])
        }
    }

    fn jpeg_bytes() -> Vec<u8> {
        let image = RgbImage::from_fn(48, 32, |x, y| Rgb([(x * 5) as u8, (y * 7) as u8, 40]));
        let mut bytes = Vec::new();
        JpegEncoder::new_with_quality(&mut Cursor::new(&mut bytes), 95)
            .encode_image(&image)
            .unwrap();
        bytes
    }

    fn compressor(output_size: usize) -> Compressor {
        let registry = BackendRegistry::empty()
            .with_decoder(MediaFormat::Jpeg, Arc::new(ImageDecoder))
            .with_encoder(MediaFormat::Jpeg, Arc::new(FixedOutput(output_size)))
            .with_encoder(MediaFormat::WebP, Arc::new(FixedOutput(output_size)));
        Compressor::new(CompressionSettings::default()).with_registry(registry)
    }

    fn options(output_dir: Option<PathBuf>) -> BatchOptions {
        BatchOptions {
            output_dir,
            ..BatchOptions::default()
        }
    }

    #[tokio::test]
    async fn test_output_directory_mirrors_accepted_files() {
        let input = TempDir::new().unwrap();
        let output = TempDir::new().unwrap();
        std::fs::create_dir(input.path().join("album")).unwrap();
        std::fs::write(input.path().join("album").join("one.jpg"), jpeg_bytes()).unwrap();
        std::fs::write(input.path().join("two.jpeg"), jpeg_bytes()).unwrap();
        std::fs::write(input.path().join("readme.txt"), b"not media").unwrap();

        let runner = BatchRunner::new(compressor(16), options(Some(output.path().to_path_buf())));
        let stats = runner.run(input.path()).await.unwrap();

        assert_eq!(stats.items_processed, 2);
        assert_eq!(stats.items_accepted, 2);
        assert_eq!(std::fs::read(output.path().join("album").join("one.jpg")).unwrap(), vec![9u8; 16]);
        assert_eq!(std::fs::read(output.path().join("two.jpeg")).unwrap().len(), 16);
        assert_eq!(std::fs::read(input.path().join("two.jpeg")).unwrap(), jpeg_bytes());
    }

    #[tokio::test]
    async fn test_in_place_keeps_original_when_not_smaller() {
        let input = TempDir::new().unwrap();
        let photo = input.path().join("photo.jpg");
        let source = jpeg_bytes();
        std::fs::write(&photo, &source).unwrap();

        let runner = BatchRunner::new(compressor(source.len() + 1), options(None));
        let stats = runner.run(input.path()).await.unwrap();

        assert_eq!(stats.items_kept_original, 1);
        assert_eq!(std::fs::read(&photo).unwrap(), source);
        assert!(!FileManager::backup_path(&photo).exists());
    }

    #[tokio::test]
    async fn test_in_place_conversion_changes_extension() {
        let input = TempDir::new().unwrap();
        let photo = input.path().join("photo.jpg");
        std::fs::write(&photo, jpeg_bytes()).unwrap();

        let batch_options = BatchOptions {
            target_format: Some(MediaFormat::WebP),
            ..BatchOptions::default()
        };
        let stats = BatchRunner::new(compressor(8), batch_options)
            .run(&photo)
            .await
            .unwrap();

        assert_eq!(stats.items_accepted, 1);
        assert!(!photo.exists());
        assert_eq!(std::fs::read(input.path().join("photo.webp")).unwrap().len(), 8);
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let input = TempDir::new().unwrap();
        let output = input.path().join("out");
        std::fs::write(input.path().join("photo.jpg"), jpeg_bytes()).unwrap();

        let batch_options = BatchOptions {
            output_dir: Some(output.clone()),
            dry_run: true,
            ..BatchOptions::default()
        };
        let stats = BatchRunner::new(compressor(8), batch_options)
            .run(input.path())
            .await
            .unwrap();

        assert_eq!(stats.items_accepted, 1);
        assert!(!output.join("photo.jpg").exists());
        assert_eq!(std::fs::read(input.path().join("photo.jpg")).unwrap(), jpeg_bytes());
    }

    #[tokio::test]
    async fn test_stop_signal_skips_remaining_files() {
        let input = TempDir::new().unwrap();
        std::fs::write(input.path().join("a.jpg"), jpeg_bytes()).unwrap();
        std::fs::write(input.path().join("b.jpg"), jpeg_bytes()).unwrap();
        let (stop, receiver) = broadcast::channel(1);
        stop.send(()).unwrap();

        let runner = BatchRunner::new(compressor(8).with_cancellation(receiver), options(None));
        let stats = runner.run(input.path()).await.unwrap();

        assert_eq!(stats.items_processed, 0);
        assert_eq!(std::fs::read(input.path().join("a.jpg")).unwrap(), jpeg_bytes());
    }
}
