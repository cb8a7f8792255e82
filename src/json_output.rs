//! # JSON Output Module
//!
//! Output strutturato, un oggetto JSON per riga su stdout, per chi pilota il batch
//! runner da un altro processo.
//!
//! ## Tipi di messaggi:
//! - `start`: inizio del batch con la configurazione effettiva
//! - `file_start`: inizio elaborazione di un file
//! - `file_complete`: esito del file con reason, warning e report dei parametri
//! - `complete`: statistiche finali
//! - `error`: errore che interrompe il batch

use std::path::PathBuf;

use serde::Serialize;

use crate::error::ErrorKind;
use crate::outcome::{CompressionOutcome, EncodeReport, OutcomeWarning};
use crate::progress::BatchStats;

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JsonMessage {
    Start {
        input: PathBuf,
        output_dir: Option<PathBuf>,
        total_files: usize,
        config: JsonConfig,
    },

    FileStart {
        path: PathBuf,
        format: String,
        size: u64,
        index: usize,
        total: usize,
    },

    FileComplete(FileCompletion),

    Complete {
        files_processed: usize,
        files_accepted: usize,
        files_kept_original: usize,
        errors: usize,
        total_bytes_saved: u64,
        average_reduction: f64,
        duration_seconds: f64,
    },

    Error {
        message: String,
        details: Option<String>,
    },
}

/// Effective batch options echoed in the `start` event.
#[derive(Debug, Clone, Serialize)]
pub struct JsonConfig {
    pub target_format: Option<String>,
    pub quality: Option<f32>,
    pub backend_preference: String,
    pub png_strategy: String,
    pub flatten_animation: bool,
    pub dry_run: bool,
}

/// Terminal state of one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Accepted,
    KeptOriginal,
    Failed,
}

#[derive(Debug, Serialize)]
pub struct FileCompletion {
    pub path: PathBuf,
    pub output: Option<PathBuf>,
    pub status: FileStatus,
    pub format: Option<String>,
    pub original_size: u64,
    pub output_size: Option<u64>,
    pub reduction_percent: f64,
    pub reason: String,
    pub warnings: Vec<OutcomeWarning>,
    pub report: Option<EncodeReport>,
    pub error_kind: Option<ErrorKind>,
}

impl FileCompletion {
    pub fn from_outcome(path: PathBuf, output: Option<PathBuf>, original_size: u64, outcome: &CompressionOutcome) -> Self {
        let status = match outcome {
            CompressionOutcome::Accepted(_) => FileStatus::Accepted,
            CompressionOutcome::KeptOriginal(_) => FileStatus::KeptOriginal,
            CompressionOutcome::Failed(_) => FileStatus::Failed,
        };
        let output_size = outcome.bytes().map(|bytes| bytes.len() as u64);
        let reduction_percent = match (status, output_size) {
            (FileStatus::Accepted, Some(size)) if original_size > 0 => {
                (original_size as f64 - size as f64) / original_size as f64 * 100.0
            }
            _ => 0.0,
        };
        let error_kind = match outcome {
            CompressionOutcome::Failed(failed) => Some(failed.kind),
            _ => None,
        };

        Self {
            path,
            output,
            status,
            format: outcome.format().map(|format| format.to_string()),
            original_size,
            output_size,
            reduction_percent,
            reason: outcome.reason(),
            warnings: outcome.warnings().to_vec(),
            report: outcome.report().cloned(),
            error_kind,
        }
    }

    /// A file that could not even be read.
    pub fn unreadable(path: PathBuf, error: &anyhow::Error) -> Self {
        Self {
            path,
            output: None,
            status: FileStatus::Failed,
            format: None,
            original_size: 0,
            output_size: None,
            reduction_percent: 0.0,
            reason: error.to_string(),
            warnings: Vec::new(),
            report: None,
            error_kind: Some(ErrorKind::Io),
        }
    }
}

impl JsonMessage {
    /// Writes the message as one line on stdout.
    pub fn emit(&self) {
        if let Ok(json) = serde_json::to_string(self) {
            println!("{}", json);
        }
    }

    pub fn complete(stats: &BatchStats, duration_seconds: f64) -> Self {
        Self::Complete {
            files_processed: stats.items_processed,
            files_accepted: stats.items_accepted,
            files_kept_original: stats.items_kept_original,
            errors: stats.items_failed,
            total_bytes_saved: stats.total_bytes_saved,
            average_reduction: stats.overall_reduction_percent(),
            duration_seconds,
        }
    }

    pub fn error(message: impl Into<String>, details: Option<String>) -> Self {
        Self::Error {
            message: message.into(),
            details,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::BackendId;
    use crate::format::MediaFormat;
    use crate::outcome::{EncodedCandidate, KeepReason, KeptOriginal, SourceAsset};
    use crate::size_guard;

    #[test]
    fn test_file_complete_for_accepted_outcome() {
        let source = SourceAsset::new(vec![0u8; 200]);
        let candidate = EncodedCandidate::new(vec![1u8; 50], MediaFormat::WebP, BackendId::Cwebp)
            .with_report(EncodeReport::new("cwebp").with_parameter("quality", 80));
        let outcome = size_guard::accept(candidate, &source, MediaFormat::Jpeg, true);

        let completion = FileCompletion::from_outcome(PathBuf::from("a.jpg"), Some(PathBuf::from("a.webp")), 200, &outcome);
        let value = serde_json::to_value(JsonMessage::FileComplete(completion)).unwrap();

        assert_eq!(value["type"], "file_complete");
        assert_eq!(value["status"], "accepted");
        assert_eq!(value["format"], "WebP");
        assert_eq!(value["output_size"], 50);
        assert_eq!(value["reduction_percent"], 75.0);
        assert_eq!(value["report"]["parameters"]["quality"], "80");
        assert!(value["error_kind"].is_null());
    }

    #[test]
    fn test_file_complete_for_kept_original_carries_warnings() {
        let outcome = CompressionOutcome::KeptOriginal(KeptOriginal {
            source: SourceAsset::new(vec![0u8; 10]),
            format: MediaFormat::Gif,
            reason: KeepReason::NoBackendSucceeded { attempts: Vec::new() },
            report: None,
            warnings: vec![OutcomeWarning::AnimationFlattened { frames: 4 }],
        });

        let completion = FileCompletion::from_outcome(PathBuf::from("a.gif"), None, 10, &outcome);
        let value = serde_json::to_value(JsonMessage::FileComplete(completion)).unwrap();

        assert_eq!(value["status"], "kept_original");
        assert_eq!(value["reduction_percent"], 0.0);
        assert_eq!(value["warnings"][0]["warning"], "animation_flattened");
        assert_eq!(value["warnings"][0]["frames"], 4);
    }

    #[test]
    fn test_failed_outcome_reports_error_kind() {
        let outcome = CompressionOutcome::failed(ErrorKind::Cancelled, "Compression cancelled");
        let completion = FileCompletion::from_outcome(PathBuf::from("a.png"), None, 10, &outcome);
        let value = serde_json::to_value(JsonMessage::FileComplete(completion)).unwrap();

        assert_eq!(value["status"], "failed");
        assert_eq!(value["error_kind"], "cancelled");
        assert!(value["output_size"].is_null());
    }

    #[test]
    fn test_complete_message_uses_batch_stats() {
        let mut stats = BatchStats::new();
        stats.add_accepted(100, 40);
        stats.add_failed();
        let value = serde_json::to_value(JsonMessage::complete(&stats, 1.5)).unwrap();

        assert_eq!(value["type"], "complete");
        assert_eq!(value["files_accepted"], 1);
        assert_eq!(value["errors"], 1);
        assert_eq!(value["total_bytes_saved"], 60);
    }
}
