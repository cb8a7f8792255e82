//! # Size Guard
//!
//! Politica di accettazione post-encode: "mai peggiorare".
//!
//! ## Regole:
//! 1. Candidato degradato (tutti i backend falliti) → `KeptOriginal(NoBackendSucceeded)`
//! 2. Nessuna conversione richiesta e `|candidato| >= |sorgente|` → `KeptOriginal(SizeRegression)`
//! 3. Conversione di formato richiesta → accettato anche se più grande
//! 4. Altrimenti → `Accepted`
//!
//! La conversione è decisa dall'intento del chiamante (formato target esplicito e
//! diverso da quello rilevato), non dal formato del candidato.

use tracing::info;

use crate::file_manager::FileManager;
use crate::format::MediaFormat;
use crate::outcome::{
    AcceptedOutcome, CompressionOutcome, EncodeReport, EncodedCandidate, KeepReason, KeptOriginal, SourceAsset,
};

pub fn accept(
    candidate: EncodedCandidate,
    source: &SourceAsset,
    source_format: MediaFormat,
    conversion_requested: bool,
) -> CompressionOutcome {
    if candidate.degraded {
        let attempts = candidate
            .report
            .as_ref()
            .map(|report| report.notes.clone())
            .unwrap_or_default();
        return keep(source, source_format, KeepReason::NoBackendSucceeded { attempts }, candidate.report);
    }

    if !conversion_requested && candidate.size() >= source.size() {
        info!(
            "📏 {} candidate is {} vs source {}, keeping original",
            candidate.backend,
            FileManager::format_size(candidate.size() as u64),
            FileManager::format_size(source.size() as u64)
        );
        let reason = KeepReason::SizeRegression {
            backend: candidate.backend,
            candidate_size: candidate.size(),
            source_size: source.size(),
        };
        return keep(source, source_format, reason, candidate.report);
    }

    CompressionOutcome::Accepted(AcceptedOutcome {
        candidate,
        source_size: source.size(),
        format_conversion: conversion_requested,
        warnings: Vec::new(),
    })
}

fn keep(
    source: &SourceAsset,
    format: MediaFormat,
    reason: KeepReason,
    report: Option<EncodeReport>,
) -> CompressionOutcome {
    CompressionOutcome::KeptOriginal(KeptOriginal {
        source: source.clone(),
        format,
        reason,
        report,
        warnings: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::BackendId;

    fn candidate(size: usize) -> EncodedCandidate {
        EncodedCandidate::new(vec![1u8; size], MediaFormat::WebP, BackendId::Cwebp)
    }

    #[test]
    fn test_smaller_candidate_is_accepted() {
        let source = SourceAsset::new(vec![0u8; 100]);
        let outcome = accept(candidate(99), &source, MediaFormat::WebP, false);
        assert!(outcome.is_accepted());
        assert_eq!(outcome.bytes().map(<[u8]>::len), Some(99));
    }

    #[test]
    fn test_equal_or_larger_candidate_keeps_source() {
        let source = SourceAsset::new(vec![0u8; 100]);
        for size in [100, 101, 500] {
            let outcome = accept(candidate(size), &source, MediaFormat::WebP, false);
            assert!(outcome.is_kept_original());
            assert_eq!(outcome.bytes(), Some(source.bytes()));
            assert_eq!(outcome.format(), Some(MediaFormat::WebP));
        }
    }

    #[test]
    fn test_requested_conversion_bypasses_size_check() {
        let source = SourceAsset::new(vec![0u8; 100]);
        let outcome = accept(candidate(400), &source, MediaFormat::Png, true);
        match outcome {
            CompressionOutcome::Accepted(accepted) => {
                assert!(accepted.format_conversion);
                assert_eq!(accepted.candidate.format, MediaFormat::WebP);
            }
            other => panic!("expected accepted, got {other:?}"),
        }
    }

    #[test]
    fn test_degraded_candidate_is_never_accepted() {
        let source = SourceAsset::new(vec![5u8; 20]);
        let degraded = EncodedCandidate::passthrough(&source, MediaFormat::Avif);
        let outcome = accept(degraded, &source, MediaFormat::Png, true);
        match outcome {
            CompressionOutcome::KeptOriginal(kept) => {
                assert_eq!(kept.format, MediaFormat::Png);
                assert!(matches!(kept.reason, KeepReason::NoBackendSucceeded { .. }));
            }
            other => panic!("expected kept original, got {other:?}"),
        }
    }
}
