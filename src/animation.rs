//! # Animation Pipeline
//!
//! Ricodifica di sequenze animate (GIF, WebP, AVIF) mantenendo ordine e durata dei frame.
//!
//! ## Stati:
//! ```text
//! Detected → Decoding → (Extract → Convert → Append)* → Finalizing → Done | Failed
//! ```
//!
//! ## Regole:
//! - Il timescale della sorgente viene ereditato e le durate copiate tali e quali;
//!   una durata nulla diventa 1 tick
//! - I frame sono appesi in ordine stretto; un frame fallito annulla l'intera
//!   sequenza per quel backend (mai output parziale)
//! - Verifica opzionale: l'output viene ridecodificato e il numero di frame confrontato
//!   con la sorgente. Un mismatch produce `AnimationNotPreserved`, non un errore
//! - Policy `Flatten`: solo il primo frame prosegue sul percorso still

use std::fmt;
use std::sync::Arc;

use image::DynamicImage;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::codec::{BackendPreference, BackendRegistry, EncodeParams, FrameRecord, FrameSequence};
use crate::fallback::{self, FallbackChain};
use crate::format::MediaFormat;
use crate::outcome::{EncodedCandidate, OutcomeWarning, SourceAsset};
use crate::progress::StageReporter;

/// Timescale of synthesized sequences, in ticks per second.
pub const SYNTH_TIMESCALE: u32 = 600;

/// What to do with a multi-frame source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnimationPolicy {
    Preserve,
    Flatten,
}

impl std::str::FromStr for AnimationPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "preserve" => Ok(Self::Preserve),
            "flatten" => Ok(Self::Flatten),
            other => Err(format!("unknown animation policy: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnimationState {
    Detected,
    Decoding,
    PerFrame,
    Finalizing,
    Done,
    Failed,
}

impl fmt::Display for AnimationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Detected => f.write_str("detected"),
            Self::Decoding => f.write_str("decoding"),
            Self::PerFrame => f.write_str("per-frame"),
            Self::Finalizing => f.write_str("finalizing"),
            Self::Done => f.write_str("done"),
            Self::Failed => f.write_str("failed"),
        }
    }
}

/// Result of one re-encode run.
#[derive(Debug)]
pub struct AnimationRun {
    pub candidate: EncodedCandidate,
    pub warnings: Vec<OutcomeWarning>,
    pub state: AnimationState,
}

pub struct AnimationPipeline<'a> {
    registry: &'a BackendRegistry,
    preference: BackendPreference,
    verify: bool,
    state: AnimationState,
}

impl<'a> AnimationPipeline<'a> {
    pub fn new(registry: &'a BackendRegistry, preference: BackendPreference, verify: bool) -> Self {
        Self {
            registry,
            preference,
            verify,
            state: AnimationState::Detected,
        }
    }

    pub fn state(&self) -> AnimationState {
        self.state
    }

    fn transition(&mut self, next: AnimationState) {
        debug!("Animation {} -> {}", self.state, next);
        self.state = next;
    }

    /// Decodes every frame of `source` with its duration in source ticks.
    pub async fn decode(
        &mut self,
        source: &SourceAsset,
        format: MediaFormat,
    ) -> Result<FrameSequence, crate::error::DecodeError> {
        self.transition(AnimationState::Decoding);
        let result = fallback::decode(self.registry, format, source.shared()).await;
        if result.is_err() {
            self.transition(AnimationState::Failed);
        }
        result
    }

    /// Re-encodes `sequence` as `target` at the sequence's own timescale.
    ///
    /// `progress` is the per-frame stage; verification happens after the last frame.
    pub async fn reencode(
        &mut self,
        sequence: FrameSequence,
        target: MediaFormat,
        params: &EncodeParams,
        source: &SourceAsset,
        progress: StageReporter,
    ) -> AnimationRun {
        let expected = sequence.len();
        let timescale = sequence.timescale.max(1);
        let frames = Arc::new(normalize_durations(sequence.frames));

        debug!("Appending {} frames at timescale {}", expected, timescale);
        self.transition(AnimationState::PerFrame);
        let chain = FallbackChain::for_format(self.registry, target, self.preference);
        let candidate = chain
            .encode_sequence(Arc::clone(&frames), timescale, params, source, progress)
            .await;

        if candidate.degraded {
            warn!("❌ No backend could encode {} frames as {}", expected, target);
            self.transition(AnimationState::Failed);
            return AnimationRun {
                candidate,
                warnings: Vec::new(),
                state: self.state,
            };
        }

        self.transition(AnimationState::Finalizing);
        let mut warnings = Vec::new();
        if self.verify {
            if let Some(actual) = self.verify_frame_count(&candidate, target).await {
                if actual != expected {
                    warn!("⚠️  Animation not preserved: {} of {} frames", actual, expected);
                    warnings.push(OutcomeWarning::AnimationNotPreserved { expected, actual });
                }
            }
        }

        self.transition(AnimationState::Done);
        info!("🎞️  Re-encoded {} frames as {} with {}", expected, target, candidate.backend);
        AnimationRun {
            candidate,
            warnings,
            state: self.state,
        }
    }

    /// Frame count of the encoded output, `None` when no decoder can read it back.
    async fn verify_frame_count(&self, candidate: &EncodedCandidate, target: MediaFormat) -> Option<usize> {
        let bytes: Arc<[u8]> = Arc::from(candidate.bytes.as_slice());
        match fallback::decode(self.registry, target, bytes).await {
            Ok(decoded) => Some(decoded.len()),
            Err(e) => {
                debug!("Skipping animation verification for {}: {}", target, e);
                None
            }
        }
    }
}

/// Zero or missing durations become one tick. Order is untouched.
pub fn normalize_durations(frames: Vec<FrameRecord>) -> Vec<FrameRecord> {
    frames
        .into_iter()
        .map(|mut frame| {
            frame.duration_ticks = frame.duration_ticks.max(1);
            frame
        })
        .collect()
}

/// First frame of `sequence`, plus the informational warning when frames were dropped.
pub fn flatten(sequence: FrameSequence) -> Option<(DynamicImage, Option<OutcomeWarning>)> {
    let frames = sequence.len();
    let first = sequence.frames.into_iter().next()?;
    let warning = (frames > 1).then_some(OutcomeWarning::AnimationFlattened { frames });
    Some((first.image, warning))
}

/// Builds a constant-rate sequence at `SYNTH_TIMESCALE`.
pub fn synthesize(images: Vec<DynamicImage>, fps: f32) -> FrameSequence {
    let fps = if fps.is_finite() && fps > 0.0 { fps } else { 1.0 };
    let ticks = ((SYNTH_TIMESCALE as f32 / fps).round() as u64).max(1);
    FrameSequence {
        frames: images
            .into_iter()
            .map(|image| FrameRecord {
                image,
                duration_ticks: ticks,
            })
            .collect(),
        timescale: SYNTH_TIMESCALE,
    }
}
