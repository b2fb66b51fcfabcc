//! Crate-wide error type.
//!
//! Structural failures (bad flags, unusable directories, a corrupt bundled
//! index) propagate to process exit; per-file failures during a scan are
//! reported and skipped at the call site and never reach this far.

use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid flags, unknown method, missing required paths.
    #[error("{0}")]
    Usage(String),

    /// Read/write failures outside the per-file scan path.
    #[error("{0}")]
    Io(String),

    /// Malformed binary index artefact.
    #[error("corrupted index file {path}: {detail}")]
    CorruptedIndex { path: PathBuf, detail: String },

    /// Audio could not be decoded to PCM.
    #[error("failed to decode {path}: {detail}")]
    Decode { path: PathBuf, detail: String },

    /// Decoded PCM is shorter than one spectrogram slice.
    #[error("{path} is shorter than one spectrogram slice")]
    TooShort { path: PathBuf },

    /// The embedding model could not be loaded.
    #[error("embedding model error: {0}")]
    Model(String),

    /// Model inference failed or produced an unusable output.
    #[error("embedding failed: {0}")]
    Embedding(String),

    /// A slice row with zero norm cannot be L2-normalised.
    #[error("zero-norm embedding slice in {key}")]
    DegenerateEmbedding { key: String },

    /// Batch or bundle persistence failed mid-scan.
    #[error("scan failed: {0}")]
    ScanFailed(String),

    /// The bundled vector map has no entries.
    #[error("bundled index {path} is empty; run a scan first")]
    EmptyIndex { path: PathBuf },
}
