//! # Fallback Chain
//!
//! Prova i backend di un formato in ordine di priorità stretto. Ogni `EncodeError` è
//! assorbito e registrato, poi si passa al backend successivo. Se tutti falliscono
//! la catena non va in errore: restituisce un candidato "passthrough" identico alla
//! sorgente (`degraded = true`), che il `SizeGuard` trasforma in `KeptOriginal`.
//!
//! Le chiamate ai backend sono bloccanti e girano in `spawn_blocking`.

use std::sync::Arc;

use image::DynamicImage;
use tracing::{debug, info, warn};

use crate::codec::{
    append_frames, BackendPreference, BackendRegistry, CodecBackend, EncodeParams, FrameRecord, FrameSequence,
};
use crate::error::{DecodeError, EncodeError};
use crate::format::MediaFormat;
use crate::outcome::{EncodeReport, EncodedCandidate, SourceAsset};
use crate::progress::{Heartbeat, HeartbeatConfig, StageReporter};
use crate::quality::{lossy_percent, quantizer};

/// Share of a sequence stage given to frame appends; the rest covers `finish`.
const APPEND_SHARE: f32 = 0.5;

/// Ordered backends for one target format.
pub struct FallbackChain {
    format: MediaFormat,
    backends: Vec<Arc<dyn CodecBackend>>,
}

impl FallbackChain {
    pub fn new(format: MediaFormat, backends: Vec<Arc<dyn CodecBackend>>) -> Self {
        Self { format, backends }
    }

    pub fn for_format(registry: &BackendRegistry, format: MediaFormat, preference: BackendPreference) -> Self {
        Self::new(format, registry.encoders(format, preference))
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn backend_names(&self) -> Vec<&'static str> {
        self.backends.iter().map(|b| b.id().name()).collect()
    }

    /// Encodes one still frame with the first backend that succeeds.
    pub async fn encode_still(
        &self,
        image: Arc<DynamicImage>,
        params: &EncodeParams,
        source: &SourceAsset,
    ) -> EncodedCandidate {
        let mut attempts = Vec::new();

        for backend in &self.backends {
            debug!("Trying {} for {} still", backend.id(), self.format);
            let task_backend = Arc::clone(backend);
            let task_image = Arc::clone(&image);
            let task_params = params.clone();
            let result = tokio::task::spawn_blocking(move || task_backend.encode_still(&task_image, &task_params))
                .await
                .unwrap_or_else(|e| Err(EncodeError::Join(e.to_string())));

            match result {
                Ok(bytes) => return self.candidate(backend.as_ref(), bytes, params, None),
                Err(e) => {
                    warn!("⚠️  {} failed: {}", backend.id(), e);
                    attempts.push(format!("{}: {}", backend.id(), e));
                }
            }
        }

        self.exhausted(source, attempts)
    }

    /// Encodes a frame sequence with the first sequence-capable backend that succeeds.
    ///
    /// The first half of `progress` receives `frames_done / total` as frames are appended.
    /// The second half is driven by a sequence heartbeat while the writer finishes, since
    /// external encoders do their work there. A backend that fails on any frame produces
    /// no bytes and the next backend starts from frame 0.
    pub async fn encode_sequence(
        &self,
        frames: Arc<Vec<FrameRecord>>,
        timescale: u32,
        params: &EncodeParams,
        source: &SourceAsset,
        progress: StageReporter,
    ) -> EncodedCandidate {
        let mut attempts = Vec::new();

        for backend in self.backends.iter().filter(|b| b.supports_sequences()) {
            debug!("Trying {} for {} frames of {}", backend.id(), frames.len(), self.format);
            let task_backend = Arc::clone(backend);
            let task_frames = Arc::clone(&frames);
            let task_params = params.clone();
            let append_progress = progress.sub_stage(0.0, APPEND_SHARE);
            let total = frames.len();
            let appended = tokio::task::spawn_blocking(move || {
                append_frames(
                    task_backend.as_ref(),
                    &task_frames,
                    timescale,
                    &task_params,
                    |done| append_progress.report_fraction(done, total),
                )
            })
            .await
            .unwrap_or_else(|e| Err(EncodeError::Join(e.to_string())));

            let result = match appended {
                Ok(writer) => {
                    let heartbeat = Heartbeat::start(
                        progress.sub_stage(APPEND_SHARE, 1.0 - APPEND_SHARE),
                        HeartbeatConfig::sequence(),
                    );
                    let finished = tokio::task::spawn_blocking(move || writer.finish())
                        .await
                        .unwrap_or_else(|e| Err(EncodeError::Join(e.to_string())));
                    heartbeat.stop().await;
                    finished
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(bytes) => {
                    return self.candidate(backend.as_ref(), bytes, params, Some((frames.len(), timescale)))
                }
                Err(e) => {
                    warn!("⚠️  {} failed: {}", backend.id(), e);
                    attempts.push(format!("{}: {}", backend.id(), e));
                }
            }
        }

        self.exhausted(source, attempts)
    }

    fn candidate(
        &self,
        backend: &dyn CodecBackend,
        bytes: Vec<u8>,
        params: &EncodeParams,
        sequence: Option<(usize, u32)>,
    ) -> EncodedCandidate {
        info!("✅ {} encoded {} ({} bytes)", backend.id(), self.format, bytes.len());
        let mut report = applied_parameters(self.format, params, backend);
        if let Some((frames, timescale)) = sequence {
            report = report
                .with_parameter("frames", frames)
                .with_parameter("timescale", timescale);
        }
        EncodedCandidate::new(bytes, self.format, backend.id()).with_report(report)
    }

    fn exhausted(&self, source: &SourceAsset, attempts: Vec<String>) -> EncodedCandidate {
        if attempts.is_empty() {
            warn!("No backend available for {}", self.format);
        } else {
            warn!("All {} backends failed for {}", attempts.len(), self.format);
        }
        let mut report = EncodeReport::new("passthrough");
        report.notes = attempts;
        EncodedCandidate::passthrough(source, self.format).with_report(report)
    }
}

/// Decodes `bytes` with the first decoder registered for `format` that succeeds.
///
/// Decoders are not a fallback in the encode sense: when every decoder fails the
/// last error is returned and the item fails.
pub async fn decode(
    registry: &BackendRegistry,
    format: MediaFormat,
    bytes: Arc<[u8]>,
) -> Result<FrameSequence, DecodeError> {
    let mut last_error = DecodeError::NoDecoder(format);

    for backend in registry.decoders(format) {
        let id = backend.id();
        let task_bytes = Arc::clone(&bytes);
        let result = tokio::task::spawn_blocking(move || backend.decode_sequence(&task_bytes))
            .await
            .unwrap_or_else(|e| {
                Err(DecodeError::Backend {
                    backend: id,
                    message: e.to_string(),
                })
            });

        match result {
            Ok(sequence) if !sequence.is_empty() => {
                debug!("{} decoded {} frame(s) of {}", id, sequence.len(), format);
                return Ok(sequence);
            }
            Ok(_) => last_error = DecodeError::Empty,
            Err(e) => {
                debug!("{} could not decode {}: {}", id, format, e);
                last_error = e;
            }
        }
    }

    Err(last_error)
}

/// Report of the numeric parameters the backend actually received.
fn applied_parameters(format: MediaFormat, params: &EncodeParams, backend: &dyn CodecBackend) -> EncodeReport {
    let report = EncodeReport::new(backend.id().name()).with_parameter("quality", params.quality.value());
    match format {
        MediaFormat::Avif => report
            .with_parameter("quantizer", quantizer(params.quality))
            .with_parameter("speed", params.speed.cpu_used()),
        MediaFormat::Gif => report
            .with_parameter("palette_size", crate::quality::gif_palette_size(params.quality))
            .with_parameter("dithering", params.gif.dithering),
        _ => report.with_parameter("lossy_percent", lossy_percent(params.quality.value())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{BackendId, BackendKind, SequenceWriter};
    use crate::progress::ProgressReporter;
    use crate::quality::QualitySetting;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct Failing {
        calls: AtomicUsize,
    }

    impl CodecBackend for Failing {
        fn id(&self) -> BackendId {
            BackendId::Custom("failing")
        }

        fn kind(&self) -> BackendKind {
            BackendKind::System
        }

        fn encode_still(&self, _image: &DynamicImage, _params: &EncodeParams) -> Result<Vec<u8>, EncodeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(EncodeError::ToolUnavailable("nothing".to_string()))
        }
    }

    struct Fixed(&'static str, Vec<u8>);

    impl CodecBackend for Fixed {
        fn id(&self) -> BackendId {
            BackendId::Custom(self.0)
        }

        fn kind(&self) -> BackendKind {
            BackendKind::Native
        }

        fn encode_still(&self, _image: &DynamicImage, _params: &EncodeParams) -> Result<Vec<u8>, EncodeError> {
            Ok(self.1.clone())
        }
    }

    /// Fails when asked to append the frame at `fail_at`.
    struct BrokenSequence {
        fail_at: usize,
    }

    struct BrokenWriter {
        fail_at: usize,
        appended: usize,
    }

    impl SequenceWriter for BrokenWriter {
        fn append(&mut self, _frame: &FrameRecord) -> Result<(), EncodeError> {
            if self.appended == self.fail_at {
                return Err(EncodeError::backend(BackendId::Custom("broken"), "frame rejected"));
            }
            self.appended += 1;
            Ok(())
        }

        fn finish(self: Box<Self>) -> Result<Vec<u8>, EncodeError> {
            Ok(vec![0; self.appended])
        }
    }

    impl CodecBackend for BrokenSequence {
        fn id(&self) -> BackendId {
            BackendId::Custom("broken")
        }

        fn kind(&self) -> BackendKind {
            BackendKind::System
        }

        fn supports_sequences(&self) -> bool {
            true
        }

        fn sequence_writer(&self, _timescale: u32, _params: &EncodeParams) -> Result<Box<dyn SequenceWriter>, EncodeError> {
            Ok(Box::new(BrokenWriter {
                fail_at: self.fail_at,
                appended: 0,
            }))
        }
    }

    fn params() -> EncodeParams {
        EncodeParams::new(QualitySetting::new(0.8))
    }

    fn frames(count: usize) -> Arc<Vec<FrameRecord>> {
        Arc::new(
            (0..count)
                .map(|_| FrameRecord {
                    image: DynamicImage::new_rgba8(2, 2),
                    duration_ticks: 10,
                })
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_first_success_wins_after_failure() {
        let failing = Arc::new(Failing {
            calls: AtomicUsize::new(0),
        });
        let chain = FallbackChain::new(
            MediaFormat::Jpeg,
            vec![
                failing.clone(),
                Arc::new(Fixed("second", vec![1, 2])),
                Arc::new(Fixed("third", vec![3])),
            ],
        );
        let source = SourceAsset::new(vec![0u8; 10]);
        let candidate = chain
            .encode_still(Arc::new(DynamicImage::new_rgb8(2, 2)), &params(), &source)
            .await;

        assert_eq!(failing.calls.load(Ordering::SeqCst), 1);
        assert_eq!(candidate.backend, BackendId::Custom("second"));
        assert_eq!(candidate.bytes, vec![1, 2]);
        assert!(!candidate.degraded);
        let report = candidate.report.unwrap();
        assert_eq!(report.parameters.get("lossy_percent").map(String::as_str), Some("80"));
    }

    #[tokio::test]
    async fn test_exhausted_chain_degrades_to_source_bytes() {
        let chain = FallbackChain::new(
            MediaFormat::Avif,
            vec![
                Arc::new(Failing {
                    calls: AtomicUsize::new(0),
                }),
                Arc::new(Failing {
                    calls: AtomicUsize::new(0),
                }),
            ],
        );
        let source = SourceAsset::new(vec![7u8; 32]);
        let candidate = chain
            .encode_still(Arc::new(DynamicImage::new_rgb8(2, 2)), &params(), &source)
            .await;

        assert!(candidate.degraded);
        assert_eq!(candidate.bytes, source.bytes());
        assert_eq!(candidate.report.unwrap().notes.len(), 2);
    }

    #[tokio::test]
    async fn test_sequence_frame_failure_moves_to_next_backend() {
        let recorded = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&recorded);
        let reporter = ProgressReporter::new(move |v| sink.lock().unwrap().push(v));

        let chain = FallbackChain::new(
            MediaFormat::Gif,
            vec![
                Arc::new(Fixed("still-only", vec![1])),
                Arc::new(BrokenSequence { fail_at: 2 }),
                Arc::new(BrokenSequence { fail_at: usize::MAX }),
            ],
        );
        let source = SourceAsset::new(vec![0u8; 64]);
        let candidate = chain
            .encode_sequence(frames(4), 1000, &params(), &source, reporter.stage(0.05, 0.8))
            .await;

        // the partial writer never hands out bytes, the complete one does
        assert_eq!(candidate.bytes.len(), 4);
        assert!(!candidate.degraded);

        // appends fill 0.05..0.45, the finish heartbeat starts at 0.47
        let values = recorded.lock().unwrap().clone();
        assert!(values.windows(2).all(|w| w[0] < w[1]));
        assert!(values.iter().any(|v| (v - 0.45).abs() < 1e-6));
        assert!(values.iter().all(|v| *v <= 0.85 + 1e-6));
        assert!(values.last().copied().unwrap() > 0.45);
    }

    /// Appends instantly, then blocks in `finish` like an external encoder does.
    struct SlowFinish;

    struct SlowFinishWriter(usize);

    impl SequenceWriter for SlowFinishWriter {
        fn append(&mut self, _frame: &FrameRecord) -> Result<(), EncodeError> {
            self.0 += 1;
            Ok(())
        }

        fn finish(self: Box<Self>) -> Result<Vec<u8>, EncodeError> {
            std::thread::sleep(std::time::Duration::from_millis(1300));
            Ok(vec![1; self.0])
        }
    }

    impl CodecBackend for SlowFinish {
        fn id(&self) -> BackendId {
            BackendId::Custom("slow-finish")
        }

        fn kind(&self) -> BackendKind {
            BackendKind::System
        }

        fn supports_sequences(&self) -> bool {
            true
        }

        fn sequence_writer(&self, _timescale: u32, _params: &EncodeParams) -> Result<Box<dyn SequenceWriter>, EncodeError> {
            Ok(Box::new(SlowFinishWriter(0)))
        }
    }

    #[tokio::test]
    async fn test_finish_runs_under_sequence_heartbeat() {
        let recorded = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&recorded);
        let reporter = ProgressReporter::new(move |v| sink.lock().unwrap().push(v));

        let chain = FallbackChain::new(MediaFormat::WebP, vec![Arc::new(SlowFinish)]);
        let source = SourceAsset::new(vec![0u8; 64]);
        let candidate = chain
            .encode_sequence(frames(2), 600, &params(), &source, reporter.stage(0.05, 0.8))
            .await;
        reporter.finish();
        tokio::time::sleep(std::time::Duration::from_millis(600)).await;

        assert_eq!(candidate.bytes.len(), 2);
        let values = recorded.lock().unwrap().clone();
        let (last, before) = values.split_last().unwrap();
        assert_eq!(*last, 1.0);
        // 0.47 on start, then at least one 500 ms tick while finish blocks
        let heartbeat: Vec<f32> = before.iter().copied().filter(|v| *v > 0.45 + 1e-6).collect();
        assert!(heartbeat.len() >= 2, "heartbeat never advanced: {values:?}");
        assert!(before.iter().all(|v| *v <= 0.45 + 0.95 * 0.4 + 1e-6));
        assert!(values.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_empty_chain_reports_no_attempts() {
        let chain = FallbackChain::new(MediaFormat::Heic, vec![]);
        assert!(chain.is_empty());
        let source = SourceAsset::new(vec![1u8; 4]);
        let candidate = chain
            .encode_still(Arc::new(DynamicImage::new_rgb8(1, 1)), &params(), &source)
            .await;
        assert!(candidate.degraded);
        assert!(candidate.report.unwrap().notes.is_empty());
    }
}
