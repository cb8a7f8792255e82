//! # Orchestrator Module
//!
//! - `compressor`: pipeline di un singolo item (`compress`)
//! - `batch`: runner sequenziale su file e directory
//! - `path_resolver`: calcolo dei path di output

pub mod batch;
pub mod compressor;
pub mod path_resolver;

pub use batch::{BatchOptions, BatchRunner};
pub use compressor::{resolve_format, CompressRequest, Compressor};
pub use path_resolver::PathResolver;
