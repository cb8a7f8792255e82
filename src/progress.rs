//! # Progress Tracking Module
//!
//! Questo modulo gestisce due livelli di progresso.
//!
//! ## Per singolo item (`ProgressReporter`):
//! - Segnale monotono in `[0, 1]` inoltrato al callback del chiamante
//! - `stage(start, span)` mappa un progresso locale `[0, 1]` su una fetta globale
//! - `Heartbeat`: task tokio che avanza un valore sintetico durante le chiamate native
//!   opache (300 ms / +0.05 per immagini, 500 ms / +0.02 per sequenze, tetto 0.95)
//! - `finish()` emette sempre 1.0 ed è l'ultimo valore: il heartbeat va fermato
//!   (`Heartbeat::stop().await`) prima di chiamarlo
//!
//! ## Per batch (`BatchProgress` + `BatchStats`):
//! - Barra `indicatif` con messaggio di stato per file
//! - Statistiche cumulative: accettati, originali mantenuti, falliti, byte risparmiati
//!
//! ```text
//! ⠋ [00:00:12] [=========>------------------------------] 3/12 (25%) photo.png 62%
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::file_manager::FileManager;

type ProgressSink = dyn Fn(f32) + Send + Sync;

struct ReporterState {
    last: f32,
    finished: bool,
}

/// Monotonic progress signal shared by every stage of one request.
#[derive(Clone)]
pub struct ProgressReporter {
    sink: Arc<ProgressSink>,
    state: Arc<Mutex<ReporterState>>,
}

impl ProgressReporter {
    pub fn new(sink: impl Fn(f32) + Send + Sync + 'static) -> Self {
        Self {
            sink: Arc::new(sink),
            state: Arc::new(Mutex::new(ReporterState {
                last: 0.0,
                finished: false,
            })),
        }
    }

    pub fn silent() -> Self {
        Self::new(|_| {})
    }

    /// Emits `value` if it moves the signal forward. Values after `finish` are dropped.
    pub fn report(&self, value: f32) {
        if value.is_nan() {
            return;
        }
        let value = value.clamp(0.0, 1.0);
        // the sink runs under the lock so concurrent reporters cannot reorder emissions
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.finished || value <= state.last {
            return;
        }
        state.last = value;
        (self.sink)(value);
    }

    /// Emits the final 1.0 and closes the signal.
    pub fn finish(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.finished {
            return;
        }
        state.finished = true;
        state.last = 1.0;
        (self.sink)(1.0);
    }

    pub fn stage(&self, start: f32, span: f32) -> StageReporter {
        StageReporter {
            reporter: self.clone(),
            start,
            span,
        }
    }
}

/// Maps local `[0, 1]` progress into `start + local * span` on the parent reporter.
#[derive(Clone)]
pub struct StageReporter {
    reporter: ProgressReporter,
    start: f32,
    span: f32,
}

impl StageReporter {
    pub fn report(&self, local: f32) {
        if local.is_nan() {
            return;
        }
        self.reporter
            .report(self.start + local.clamp(0.0, 1.0) * self.span);
    }

    /// `done / total` of a known-length loop.
    pub fn report_fraction(&self, done: usize, total: usize) {
        if total == 0 {
            return;
        }
        self.report(done as f32 / total as f32);
    }

    /// Nested slice of this stage, `start` and `span` in local units.
    pub fn sub_stage(&self, start: f32, span: f32) -> StageReporter {
        StageReporter {
            reporter: self.reporter.clone(),
            start: self.start + start * self.span,
            span: span * self.span,
        }
    }
}

/// Tick parameters of a heartbeat.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    pub start: f32,
    pub increment: f32,
    pub cap: f32,
}

impl HeartbeatConfig {
    /// Single opaque still-image encode.
    pub fn still() -> Self {
        Self {
            interval: Duration::from_millis(300),
            start: 0.05,
            increment: 0.05,
            cap: 0.95,
        }
    }

    /// Whole-sequence synthesis without per-frame callbacks.
    pub fn sequence() -> Self {
        Self {
            interval: Duration::from_millis(500),
            start: 0.05,
            increment: 0.02,
            cap: 0.95,
        }
    }
}

/// Synthetic ticker running next to a single blocking call.
pub struct Heartbeat {
    stop: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl Heartbeat {
    pub fn start(stage: StageReporter, config: HeartbeatConfig) -> Self {
        let (stop, mut stopped) = oneshot::channel::<()>();
        stage.report(config.start);

        let handle = tokio::spawn(async move {
            let mut value = config.start;
            let mut ticker = tokio::time::interval_at(
                tokio::time::Instant::now() + config.interval,
                config.interval,
            );
            loop {
                tokio::select! {
                    biased;
                    _ = &mut stopped => break,
                    _ = ticker.tick() => {
                        value = (value + config.increment).min(config.cap);
                        stage.report(value);
                    }
                }
            }
        });

        Self {
            stop: Some(stop),
            handle,
        }
    }

    /// Signals the ticker and waits until it can no longer emit.
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Err(e) = (&mut self.handle).await {
            if !e.is_cancelled() {
                debug!("Heartbeat task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Batch-level bar for the command line.
#[derive(Clone)]
pub struct BatchProgress {
    bar: ProgressBar,
}

impl BatchProgress {
    pub fn new(total_items: u64) -> Self {
        let bar = ProgressBar::new(total_items);
        if let Ok(style) = ProgressStyle::default_bar().template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({percent}%) {msg}",
        ) {
            bar.set_style(style.progress_chars("=>-"));
        }
        bar.enable_steady_tick(Duration::from_millis(100));
        Self { bar }
    }

    pub fn hidden() -> Self {
        Self {
            bar: ProgressBar::hidden(),
        }
    }

    /// Per-item fraction forwarded from a `ProgressReporter` sink.
    pub fn item_progress(&self, name: &str, fraction: f32) {
        self.bar
            .set_message(format!("{} {:.0}%", name, fraction * 100.0));
    }

    pub fn item_done(&self, message: &str) {
        self.bar.inc(1);
        self.bar.set_message(message.to_string());
    }

    pub fn finish(&self, message: &str) {
        self.bar.finish_with_message(message.to_string());
    }
}

/// Cumulative outcome counters for a batch.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct BatchStats {
    pub items_processed: usize,
    pub items_accepted: usize,
    pub items_kept_original: usize,
    pub items_failed: usize,
    pub total_bytes_saved: u64,
    pub total_original_size: u64,
}

impl BatchStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_accepted(&mut self, original_size: u64, new_size: u64) {
        self.items_processed += 1;
        self.items_accepted += 1;
        self.total_original_size += original_size;
        self.total_bytes_saved += original_size.saturating_sub(new_size);
    }

    pub fn add_kept_original(&mut self, original_size: u64) {
        self.items_processed += 1;
        self.items_kept_original += 1;
        self.total_original_size += original_size;
    }

    pub fn add_failed(&mut self) {
        self.items_processed += 1;
        self.items_failed += 1;
    }

    pub fn overall_reduction_percent(&self) -> f64 {
        FileManager::calculate_reduction(
            self.total_original_size,
            self.total_original_size - self.total_bytes_saved,
        )
    }

    pub fn format_summary(&self) -> String {
        format!(
            "Processed: {} | Compressed: {} | Kept original: {} | Failed: {} | Saved: {} ({:.2}%)",
            self.items_processed,
            self.items_accepted,
            self.items_kept_original,
            self.items_failed,
            FileManager::format_size(self.total_bytes_saved),
            self.overall_reduction_percent()
        )
    }
}
