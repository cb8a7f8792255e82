//! # Media Recompress Library
//!
//! Ricompressione adattiva di immagini, audio e video con la garanzia di non
//! restituire mai un file più grande dell'originale (salvo conversione richiesta).
//!
//! ## Architettura dei moduli:
//! - `format`: riconoscimento del formato dai magic number
//! - `quality`: mappatura della qualità normalizzata sui parametri dei codec
//! - `codec`: backend di encode/decode (in-process e tool esterni) e registry
//! - `fallback`: catena di backend provati in ordine di priorità
//! - `size_guard`: regola "mai peggiorare"
//! - `animation`: decode, re-encode e verifica delle sequenze animate
//! - `png`: strategie PNG (euristica, zopflipng, pngquant) e selettore
//! - `av_processor`: transcodifica audio/video con ffmpeg
//! - `progress`: progress monotono, heartbeat e barra del batch
//! - `orchestrator`: `Compressor::compress` e batch runner
//! - `config`: `CompressionSettings` con validazione e persistenza JSON
//!
//! ## Utilizzo:
//! ```no_run
//! use media_recompress::{CompressRequest, CompressionSettings, Compressor, MediaFormat};
//!
//! # async fn run(bytes: Vec<u8>) {
//! let compressor = Compressor::new(CompressionSettings::default());
//! let request = CompressRequest::new(bytes).target_format(MediaFormat::WebP);
//! let outcome = compressor.compress(request, |p| println!("{:.0}%", p * 100.0)).await;
//! println!("{}", outcome.reason());
//! # }
//! ```

pub mod animation;
pub mod av_processor;
pub mod codec;
pub mod config;
pub mod error;
pub mod fallback;
pub mod file_manager;
pub mod format;
pub mod json_output;
pub mod orchestrator;
pub mod outcome;
pub mod png;
pub mod progress;
pub mod quality;
pub mod resize;
pub mod size_guard;
pub mod tools;
pub mod utils;

pub use animation::AnimationPolicy;
pub use codec::BackendPreference;
pub use config::CompressionSettings;
pub use error::{CompressError, ErrorKind};
pub use format::{detect, MediaFormat};
pub use orchestrator::{BatchOptions, BatchRunner, CompressRequest, Compressor};
pub use outcome::CompressionOutcome;
pub use quality::QualitySetting;
