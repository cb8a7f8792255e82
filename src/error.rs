//! # Error Types Module
//!
//! Questo modulo definisce la tassonomia degli errori della pipeline di ricompressione.
//!
//! ## Categorie di errori:
//! - `DecodeError`: sorgente illeggibile o corrotta. Fatale per l'item, nessun retry
//! - `EncodeError`: un backend specifico ha fallito. Assorbito dalla `FallbackChain`
//! - `CompressError`: errori che terminano l'item (`Decode`, `UnsupportedContainer`,
//!   `Cancelled`, `Io`)
//! - `ErrorKind`: la forma serializzabile riportata in `CompressionOutcome::Failed`
//!
//! La regressione di dimensione e l'animazione non preservata NON sono errori:
//! vedi `outcome::KeepReason` e `outcome::OutcomeWarning`.

use serde::Serialize;

use crate::codec::BackendId;
use crate::format::MediaFormat;

/// Failure to turn source bytes into pixels.
#[derive(thiserror::Error, Debug)]
pub enum DecodeError {
    #[error("Image decode error: {0}")]
    Image(#[from] image::ImageError),

    #[error("PNG decode error: {0}")]
    Png(#[from] png::DecodingError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{backend} failed to decode: {message}")]
    Backend { backend: BackendId, message: String },

    #[error("No decoder available for {0}")]
    NoDecoder(MediaFormat),

    #[error("Source contains no frames")]
    Empty,
}

/// Failure of a single backend. Recovered locally by trying the next backend.
#[derive(thiserror::Error, Debug)]
pub enum EncodeError {
    #[error("Image encode error: {0}")]
    Image(#[from] image::ImageError),

    #[error("PNG encode error: {0}")]
    Png(#[from] png::EncodingError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Tool not available: {0}")]
    ToolUnavailable(String),

    #[error("{tool} exited with {code:?}: {log}")]
    ToolFailed {
        tool: String,
        code: Option<i32>,
        log: String,
    },

    #[error("{backend} does not support {operation}")]
    Unsupported {
        backend: BackendId,
        operation: &'static str,
    },

    #[error("Appending frame {index} failed: {message}")]
    FrameAppend { index: usize, message: String },

    #[error("{backend}: {message}")]
    Backend { backend: BackendId, message: String },

    #[error("Blocking encode task failed: {0}")]
    Join(String),
}

impl EncodeError {
    pub fn unsupported(backend: BackendId, operation: &'static str) -> Self {
        Self::Unsupported { backend, operation }
    }

    pub fn backend(backend: BackendId, message: impl Into<String>) -> Self {
        Self::Backend {
            backend,
            message: message.into(),
        }
    }
}

/// Errors that end a compression request with `CompressionOutcome::Failed`.
#[derive(thiserror::Error, Debug)]
pub enum CompressError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("Unsupported container: {0}")]
    UnsupportedContainer(String),

    #[error("Compression cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CompressError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Decode(_) => ErrorKind::Decode,
            Self::UnsupportedContainer(_) => ErrorKind::UnsupportedContainer,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Io(_) => ErrorKind::Io,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Decode,
    UnsupportedContainer,
    Cancelled,
    Io,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Decode => "decode error",
            Self::UnsupportedContainer => "unsupported container",
            Self::Cancelled => "cancelled",
            Self::Io => "io error",
        };
        f.write_str(label)
    }
}
