//! # Zopfli Strategy
//!
//! Ricompressione lossless tramite `zopflipng` (filtri 0, MinSum, Entropy).
//! I toggle lossy vengono applicati solo quando hanno effetto sull'immagine:
//! `lossy_transparent` richiede un canale alpha, `lossy_8bit` una sorgente > 8 bit.

use tracing::debug;

use super::{PngOptions, PngReport, PngSource, PngStrategy, PngStrategyKind};
use crate::args;
use crate::codec::external::task_dir;
use crate::codec::BackendId;
use crate::error::EncodeError;
use crate::tools::{read_tool_output, ToolCommand};
use crate::utils::path_arg;

/// Sources at or above this size use `iterations_large`.
pub const LARGE_SOURCE_BYTES: usize = 200_000;

const FILTER_STRATEGIES: &str = "0me";

pub struct ZopfliStrategy;

/// Options actually handed to zopflipng for one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectiveOptions {
    pub iterations: u32,
    pub lossy_transparent: bool,
    pub lossy_8bit: bool,
}

impl EffectiveOptions {
    pub fn resolve(source: &PngSource, options: &PngOptions) -> Self {
        let iterations = if source.bytes.len() >= LARGE_SOURCE_BYTES {
            options.iterations_large
        } else {
            options.iterations
        };
        let lossy_transparent = options.lossy_transparent && source.has_alpha;
        if options.lossy_transparent && !lossy_transparent {
            debug!("lossy_transparent disabled: image has no alpha channel");
        }
        let lossy_8bit = options.lossy_8bit && source.bits_per_channel > 8;
        if options.lossy_8bit && !lossy_8bit {
            debug!("lossy_8bit disabled: image is already {}-bit", source.bits_per_channel);
        }
        Self {
            iterations: iterations.max(1),
            lossy_transparent,
            lossy_8bit,
        }
    }

    fn report(&self) -> PngReport {
        let mut report = PngReport::new(PngStrategyKind::Zopfli);
        report.iterations = Some(self.iterations);
        report.lossy_transparent = Some(self.lossy_transparent);
        report.lossy_8bit = Some(self.lossy_8bit);
        report
    }

    fn arguments(&self) -> Vec<String> {
        let mut arguments = args![format!("--iterations={}", self.iterations), format!("--filters={FILTER_STRATEGIES}")];
        if self.lossy_transparent {
            arguments.push("--lossy_transparent".to_string());
        }
        if self.lossy_8bit {
            arguments.push("--lossy_8bit".to_string());
        }
        arguments.push("-y".to_string());
        arguments
    }
}

impl PngStrategy for ZopfliStrategy {
    fn kind(&self) -> PngStrategyKind {
        PngStrategyKind::Zopfli
    }

    fn backend(&self) -> BackendId {
        BackendId::Zopflipng
    }

    fn compress(&self, source: &PngSource, options: &PngOptions) -> Result<(Vec<u8>, PngReport), EncodeError> {
        let effective = EffectiveOptions::resolve(source, options);
        let dir = task_dir()?;
        let input = dir.path().join("input.png");
        let output = dir.path().join("output.png");
        std::fs::write(&input, &source.bytes)?;

        let mut arguments = effective.arguments();
        arguments.push(path_arg(&input));
        arguments.push(path_arg(&output));
        ToolCommand::new("zopflipng", arguments).run()?;
        let bytes = read_tool_output("zopflipng", &output)?;

        Ok((bytes, effective.report()))
    }
}
