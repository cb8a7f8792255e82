//! # Outcome Types
//!
//! Tipi che attraversano la pipeline: l'input immutabile (`SourceAsset`), i candidati
//! prodotti dai backend (`EncodedCandidate`) e il risultato terminale
//! (`CompressionOutcome`). Ogni stato terminale porta una `reason` leggibile.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::codec::BackendId;
use crate::error::ErrorKind;
use crate::file_manager::FileManager;
use crate::format::MediaFormat;
use crate::png::PngReport;

/// Immutable input buffer of one request. Cloning shares the bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceAsset {
    bytes: Arc<[u8]>,
}

impl SourceAsset {
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn shared(&self) -> Arc<[u8]> {
        Arc::clone(&self.bytes)
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

/// Applied parameters of the encoder that produced a candidate.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EncodeReport {
    pub strategy: String,
    pub parameters: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub png: Option<PngReport>,
    pub notes: Vec<String>,
}

impl EncodeReport {
    pub fn new(strategy: impl Into<String>) -> Self {
        Self {
            strategy: strategy.into(),
            ..Default::default()
        }
    }

    pub fn with_parameter(mut self, key: &str, value: impl ToString) -> Self {
        self.parameters.insert(key.to_string(), value.to_string());
        self
    }

    pub fn note(&mut self, note: impl Into<String>) {
        self.notes.push(note.into());
    }
}

/// Bytes produced by one backend, waiting for the size guard.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedCandidate {
    pub bytes: Vec<u8>,
    pub format: MediaFormat,
    pub backend: BackendId,
    pub report: Option<EncodeReport>,
    /// Set when every backend failed and the source bytes stand in for a candidate.
    pub degraded: bool,
}

impl EncodedCandidate {
    pub fn new(bytes: Vec<u8>, format: MediaFormat, backend: BackendId) -> Self {
        Self {
            bytes,
            format,
            backend,
            report: None,
            degraded: false,
        }
    }

    pub fn with_report(mut self, report: EncodeReport) -> Self {
        self.report = Some(report);
        self
    }

    /// Stand-in candidate equal in size to the source.
    pub fn passthrough(source: &SourceAsset, format: MediaFormat) -> Self {
        Self {
            bytes: source.bytes().to_vec(),
            format,
            backend: BackendId::Passthrough,
            report: None,
            degraded: true,
        }
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

/// Non-fatal conditions attached to a finished request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "warning", rename_all = "snake_case")]
pub enum OutcomeWarning {
    /// The re-encoded sequence does not hold the source's frame count.
    AnimationNotPreserved { expected: usize, actual: usize },
    /// The container's animation flag and the decoded frame count disagree.
    AnimationFlagMismatch { flagged: bool, decoded_frames: usize },
    /// Only the first frame was kept, as requested by the policy.
    AnimationFlattened { frames: usize },
}

impl fmt::Display for OutcomeWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AnimationNotPreserved { expected, actual } => write!(
                f,
                "animation not preserved: expected {expected} frames, output has {actual}"
            ),
            Self::AnimationFlagMismatch {
                flagged,
                decoded_frames,
            } => write!(
                f,
                "animation flag is {} but the decoder reported {decoded_frames} frame(s)",
                if *flagged { "set" } else { "clear" }
            ),
            Self::AnimationFlattened { frames } => {
                write!(f, "animation flattened to the first of {frames} frames")
            }
        }
    }
}

/// Why the source bytes were returned unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeepReason {
    SizeRegression {
        backend: BackendId,
        candidate_size: usize,
        source_size: usize,
    },
    NoBackendSucceeded { attempts: Vec<String> },
}

impl fmt::Display for KeepReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SizeRegression {
                backend,
                candidate_size,
                source_size,
            } => write!(
                f,
                "kept original: {backend} produced {} which is not smaller than {}",
                FileManager::format_size(*candidate_size as u64),
                FileManager::format_size(*source_size as u64)
            ),
            Self::NoBackendSucceeded { attempts } if attempts.is_empty() => {
                write!(f, "kept original: no backend available")
            }
            Self::NoBackendSucceeded { attempts } => {
                write!(f, "kept original: every backend failed ({})", attempts.join("; "))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AcceptedOutcome {
    pub candidate: EncodedCandidate,
    pub source_size: usize,
    pub format_conversion: bool,
    pub warnings: Vec<OutcomeWarning>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KeptOriginal {
    pub source: SourceAsset,
    pub format: MediaFormat,
    pub reason: KeepReason,
    /// Report of the discarded candidate, when one was produced.
    pub report: Option<EncodeReport>,
    pub warnings: Vec<OutcomeWarning>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FailedOutcome {
    pub kind: ErrorKind,
    pub message: String,
}

/// Terminal result of one `compress` call.
#[derive(Debug, Clone, PartialEq)]
pub enum CompressionOutcome {
    Accepted(AcceptedOutcome),
    KeptOriginal(KeptOriginal),
    Failed(FailedOutcome),
}

impl CompressionOutcome {
    pub fn failed(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Failed(FailedOutcome {
            kind,
            message: message.into(),
        })
    }

    /// Attaches warnings gathered before the size decision. Failures carry none.
    pub fn with_warnings(mut self, extra: Vec<OutcomeWarning>) -> Self {
        match &mut self {
            Self::Accepted(accepted) => accepted.warnings.extend(extra),
            Self::KeptOriginal(kept) => kept.warnings.extend(extra),
            Self::Failed(_) => {}
        }
        self
    }

    /// Candidate bytes, the untouched source, or `None` on failure.
    pub fn bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Accepted(accepted) => Some(&accepted.candidate.bytes),
            Self::KeptOriginal(kept) => Some(kept.source.bytes()),
            Self::Failed(_) => None,
        }
    }

    pub fn format(&self) -> Option<MediaFormat> {
        match self {
            Self::Accepted(accepted) => Some(accepted.candidate.format),
            Self::KeptOriginal(kept) => Some(kept.format),
            Self::Failed(_) => None,
        }
    }

    pub fn warnings(&self) -> &[OutcomeWarning] {
        match self {
            Self::Accepted(accepted) => &accepted.warnings,
            Self::KeptOriginal(kept) => &kept.warnings,
            Self::Failed(_) => &[],
        }
    }

    /// Applied parameters of the accepted or discarded candidate.
    pub fn report(&self) -> Option<&EncodeReport> {
        match self {
            Self::Accepted(accepted) => accepted.candidate.report.as_ref(),
            Self::KeptOriginal(kept) => kept.report.as_ref(),
            Self::Failed(_) => None,
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted(_))
    }

    pub fn is_kept_original(&self) -> bool {
        matches!(self, Self::KeptOriginal(_))
    }

    /// Human-readable explanation of the terminal state.
    pub fn reason(&self) -> String {
        let mut reason = match self {
            Self::Accepted(accepted) => {
                let candidate = &accepted.candidate;
                let strategy = candidate
                    .report
                    .as_ref()
                    .map(|r| format!(" ({})", r.strategy))
                    .unwrap_or_default();
                if accepted.format_conversion {
                    format!(
                        "converted to {} with {}{}: {} -> {}",
                        candidate.format,
                        candidate.backend,
                        strategy,
                        FileManager::format_size(accepted.source_size as u64),
                        FileManager::format_size(candidate.size() as u64)
                    )
                } else {
                    format!(
                        "compressed with {}{}: {} -> {} ({:.1}% smaller)",
                        candidate.backend,
                        strategy,
                        FileManager::format_size(accepted.source_size as u64),
                        FileManager::format_size(candidate.size() as u64),
                        FileManager::calculate_reduction(
                            accepted.source_size as u64,
                            candidate.size() as u64
                        )
                    )
                }
            }
            Self::KeptOriginal(kept) => kept.reason.to_string(),
            Self::Failed(failed) => format!("failed ({}): {}", failed.kind, failed.message),
        };
        for warning in self.warnings() {
            reason.push_str("; ");
            reason.push_str(&warning.to_string());
        }
        reason
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passthrough_candidate_matches_source() {
        let source = SourceAsset::new(vec![1u8, 2, 3, 4]);
        let candidate = EncodedCandidate::passthrough(&source, MediaFormat::Jpeg);
        assert_eq!(candidate.bytes, source.bytes());
        assert_eq!(candidate.size(), source.size());
        assert!(candidate.degraded);
        assert_eq!(candidate.backend, BackendId::Passthrough);
    }

    #[test]
    fn test_reason_mentions_backend_and_warnings() {
        let outcome = CompressionOutcome::Accepted(AcceptedOutcome {
            candidate: EncodedCandidate::new(vec![0; 10], MediaFormat::WebP, BackendId::Img2Webp),
            source_size: 40,
            format_conversion: false,
            warnings: vec![OutcomeWarning::AnimationNotPreserved {
                expected: 4,
                actual: 1,
            }],
        });
        let reason = outcome.reason();
        assert!(reason.contains("img2webp"));
        assert!(reason.contains("75.0% smaller"));
        assert!(reason.contains("expected 4 frames"));
    }

    #[test]
    fn test_kept_original_returns_source_bytes() {
        let source = SourceAsset::new(vec![9u8; 16]);
        let outcome = CompressionOutcome::KeptOriginal(KeptOriginal {
            source: source.clone(),
            format: MediaFormat::Png,
            reason: KeepReason::NoBackendSucceeded { attempts: vec![] },
            report: None,
            warnings: vec![],
        });
        assert_eq!(outcome.bytes(), Some(source.bytes()));
        assert_eq!(outcome.reason(), "kept original: no backend available");
    }
}
