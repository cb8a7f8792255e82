//! # Media Recompress - Main Entry Point
//!
//! ## Responsabilità:
//! - Parsing degli argomenti della command line con `clap`
//! - Inizializzazione del logging con `tracing` (INFO o DEBUG, `RUST_LOG` ha la precedenza)
//! - Caricamento di `CompressionSettings` (file `--config` o percorso di default)
//! - Ctrl-C inoltrato al compressor come segnale di stop
//! - Avvio del batch runner
//!
//! ## Esempio di utilizzo:
//! ```bash
//! media-recompress ~/Pictures --output ~/Pictures-small --format webp --quality 0.7
//! ```

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use media_recompress::json_output::JsonMessage;
use media_recompress::png::PngStrategyChoice;
use media_recompress::tools::{ToolLocator, KNOWN_TOOLS};
use media_recompress::{
    AnimationPolicy, BackendPreference, BatchOptions, BatchRunner, CompressionSettings, Compressor, MediaFormat,
    QualitySetting,
};

#[derive(Parser)]
#[command(name = "media-recompress")]
#[command(about = "Re-encode images, audio and video without ever making them bigger")]
struct Args {
    /// File or directory to process
    input: Option<PathBuf>,

    /// Output directory (if not specified, files are replaced in place)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Target format: jpeg, png, heic, webp, avif, gif, mp4, mov, m4v, mp3, aac, m4a, opus, flac, wav
    #[arg(short, long)]
    format: Option<MediaFormat>,

    /// Normalized quality (0.1-1.0); per-format defaults when omitted
    #[arg(short, long)]
    quality: Option<f32>,

    /// Keep only the first frame of animated sources
    #[arg(long)]
    flatten_animation: bool,

    /// Backend family tried first: system or native
    #[arg(long)]
    backend: Option<BackendPreference>,

    /// PNG strategy: auto, heuristic, zopfli or quantize
    #[arg(long)]
    png_strategy: Option<PngStrategyChoice>,

    /// Settings file (JSON); defaults to the user config directory
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Dry run - don't write any file
    #[arg(long)]
    dry_run: bool,

    /// Emit JSON line events on stdout
    #[arg(long)]
    json: bool,

    /// List the external tools found and exit
    #[arg(long)]
    check_tools: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    // JSON events own stdout
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if args.check_tools {
        println!("{}", ToolLocator::instance().report(KNOWN_TOOLS));
        return Ok(());
    }

    let json_output = args.json;
    let result = run(args).await;
    if let (true, Err(e)) = (json_output, &result) {
        JsonMessage::error(e.to_string(), e.chain().nth(1).map(|cause| cause.to_string())).emit();
    }
    result
}

async fn run(args: Args) -> Result<()> {
    let Some(input) = args.input else {
        return Err(anyhow::anyhow!("An input file or directory is required"));
    };
    if !input.exists() {
        return Err(anyhow::anyhow!("Input does not exist: {}", input.display()));
    }

    let mut settings = load_settings(args.config.as_deref()).await?;
    if let Some(strategy) = args.png_strategy {
        settings.png.strategy = strategy;
    }
    settings.validate()?;

    if let Some(quality) = args.quality {
        if !(0.0..=1.0).contains(&quality) {
            return Err(anyhow::anyhow!("Quality must be between 0.0 and 1.0"));
        }
    }

    let (stop_sender, stop_receiver) = broadcast::channel(1);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("⚠️  Ctrl-C received, finishing the current file");
            let _ = stop_sender.send(());
        }
    });

    let compressor = Compressor::new(settings).with_cancellation(stop_receiver);
    let options = BatchOptions {
        output_dir: args.output,
        target_format: args.format,
        quality: args.quality.map(QualitySetting::new),
        animation_policy: args.flatten_animation.then_some(AnimationPolicy::Flatten),
        backend_preference: args.backend,
        dry_run: args.dry_run,
        json_output: args.json,
    };

    let stats = BatchRunner::new(compressor, options).run(&input).await?;
    if stats.items_failed > 0 {
        warn!("{} files failed", stats.items_failed);
    }
    Ok(())
}

async fn load_settings(path: Option<&std::path::Path>) -> Result<CompressionSettings> {
    let path = match path {
        Some(path) => {
            if !path.exists() {
                return Err(anyhow::anyhow!("Settings file does not exist: {}", path.display()));
            }
            path.to_path_buf()
        }
        None => match CompressionSettings::default_path() {
            Some(path) => path,
            None => return Ok(CompressionSettings::default()),
        },
    };
    info!("Loading settings from {}", path.display());
    CompressionSettings::from_file(&path).await
}
