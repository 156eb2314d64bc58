use crate::progress::ExportPhase;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Closed error taxonomy. Everything that can go wrong inside a run maps to
/// one of these codes; stray failures are wrapped at the pipeline boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    EncoderInitFailed,
    FrameEncodeFailed,
    AudioEncodeFailed,
    MuxerError,
    DiskFull,
    Cancelled,
    Timeout,
    MemoryExceeded,
    UnsupportedCodec,
    InvalidSettings,
}

#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{code:?} during {phase:?}: {message}")]
pub struct ExportError {
    pub code: ErrorCode,
    pub message: String,
    pub phase: ExportPhase,
    pub recoverable: bool,
}

impl ExportError {
    pub fn new(code: ErrorCode, phase: ExportPhase, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            phase,
            // Cancellation is the only state the caller can recover from by
            // simply re-running.
            recoverable: code == ErrorCode::Cancelled,
        }
    }

    pub fn cancelled(phase: ExportPhase) -> Self {
        Self::new(ErrorCode::Cancelled, phase, "export cancelled")
    }

    pub fn invalid_settings(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidSettings, ExportPhase::Preparing, message)
    }

    /// Wrap an arbitrary failure message, preserving it verbatim. Used at
    /// the outermost catch so nothing escapes the taxonomy.
    pub fn wrap(code: ErrorCode, phase: ExportPhase, source: impl std::fmt::Display) -> Self {
        Self::new(code, phase, source.to_string())
    }
}

impl From<media_io::ProbeError> for ExportError {
    fn from(e: media_io::ProbeError) -> Self {
        ExportError::wrap(ErrorCode::EncoderInitFailed, ExportPhase::Preparing, e)
    }
}

/// Classify an I/O error from a sink or scratch write; a full disk gets its
/// own code so the UI can suggest freeing space.
pub fn io_error_code(e: &std::io::Error) -> ErrorCode {
    if e.raw_os_error() == Some(28) {
        // ENOSPC
        ErrorCode::DiskFull
    } else {
        ErrorCode::MuxerError
    }
}
