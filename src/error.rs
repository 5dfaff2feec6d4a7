//! Error handling types for swankbridge
//!
//! `ErrorReport` is what evaluator-facing operations fail with; `BridgeError`
//! is the wider error type seen at the editor-facing dispatch boundary.

use thiserror::Error;

use crate::evaluator::StackFrame;
use crate::frame::FrameError;
use crate::sexp::SexpError;

/// Failure of an evaluator operation.
///
/// `fatal == true` means the link is unusable (process death, socket EOF,
/// protocol desynchronization) and only a RESTART can recover.
/// `fatal == false` is an evaluator-level error that opens a debugger session.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct ErrorReport {
    pub message: String,
    pub frames: Vec<StackFrame>,
    pub fatal: bool,
}

impl ErrorReport {
    /// Create a fatal report (process or transport failure)
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            frames: Vec::new(),
            fatal: true,
        }
    }

    /// Create a recoverable report raised by the evaluator itself
    pub fn evaluator(message: impl Into<String>, frames: Vec<StackFrame>) -> Self {
        Self {
            message: message.into(),
            frames,
            fatal: false,
        }
    }

    /// Create a fatal report for an unrecognized message on the evaluator socket
    pub fn desync(message: impl Into<String>) -> Self {
        Self::fatal(format!("Protocol desynchronization: {}", message.into()))
    }
}

impl From<FrameError> for ErrorReport {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::ConnectionClosed => ErrorReport::fatal("Socket connection closed"),
            FrameError::Io(e) => ErrorReport::fatal(format!("Socket error: {}", e)),
            other => ErrorReport::desync(other.to_string()),
        }
    }
}

/// Errors surfaced at the editor-facing boundary
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Evaluator operation failed
    #[error(transparent)]
    Report(#[from] ErrorReport),

    /// No handler registered for the operation
    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    /// Handler received arguments it cannot use
    #[error("Invalid arguments for {operation}: {message}")]
    InvalidArguments { operation: String, message: String },

    /// Inbound message does not have the `:emacs-rex` shape
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    /// Framing failure on the editor socket
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    /// S-expression could not be decoded
    #[error("S-expression error: {0}")]
    Sexp(#[from] SexpError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for dispatch-level operations
pub type BridgeResult<T> = Result<T, BridgeError>;

impl BridgeError {
    /// Create an invalid arguments error
    pub fn invalid_arguments(operation: impl Into<String>, message: impl Into<String>) -> Self {
        BridgeError::InvalidArguments {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a malformed request error
    pub fn malformed(message: impl Into<String>) -> Self {
        BridgeError::MalformedRequest(message.into())
    }
}
