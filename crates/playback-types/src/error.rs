// crates/playback-types/src/error.rs
//
// Public error kinds. Internal FFmpeg/IO calls inside playback-engine are
// wrapped with anyhow::Context for a rich chain; at the component boundary
// that chain collapses into one of these kinds so an embedder gets a stable,
// matchable surface instead of an opaque anyhow::Error.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to open source '{path}': {message}")]
    IoOpenFailed { path: String, message: String },

    #[error("transient read error on '{path}': {message}")]
    IoReadTransient { path: String, message: String },

    #[error("fatal read error on '{path}' after {consecutive_errors} consecutive failures: {message}")]
    IoReadFatal {
        path: String,
        consecutive_errors: u32,
        message: String,
    },

    #[error("transient decode error ({kind:?}): {message}")]
    DecodeTransient { kind: crate::MediaKind, message: String },

    #[error("decode error ({kind:?}): {message}")]
    DecodeError { kind: crate::MediaKind, message: String },

    #[error("seek is unsupported on a real-time source")]
    SeekUnsupported,

    #[error("seek to {target_seconds}s failed: {message}")]
    SeekFailed { target_seconds: f64, message: String },

    #[error("failed to open recording output '{path}': {message}")]
    RecordOpenFailed { path: String, message: String },

    #[error("failed to write recording output '{path}': {message}")]
    RecordWriteFailed { path: String, message: String },

    #[error("invalid configuration: {reason}")]
    ConfigInvalid { reason: String },

    #[error("operation cancelled")]
    Cancelled,
}
