//! Error types for stagewire.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;

/// Boxed error used as the cause of protocol and evaluation failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Main error type for all stagewire operations.
#[derive(Debug, Error)]
pub enum StagewireError {
    /// I/O error on the underlying connection.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A stage rejected malformed input.
    #[error("Protocol error: {message}")]
    Protocol {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Any other failure raised while evaluating a stage or an encoder.
    #[error("Evaluation error: {0}")]
    Evaluation(#[source] BoxError),

    /// An encoder asked for a second streaming session while one is open.
    #[error("Streaming session already active")]
    StreamingAlreadyActive,

    /// An ordinary write was attempted while a streaming session is open.
    #[error("Ordinary write attempted while streaming is active")]
    WriteWhileStreaming,

    /// Too many consecutive stage steps (transitions, or produced values on
    /// drain calls) without consuming input.
    #[error("Stage transition limit exceeded ({limit} steps without progress)")]
    TransitionLimit { limit: usize },

    /// Connection closed unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Backpressure timeout - write queue full.
    #[error("Backpressure timeout")]
    BackpressureTimeout,
}

impl StagewireError {
    /// Protocol error with a message only.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
            source: None,
        }
    }

    /// Protocol error carrying the underlying cause.
    pub fn protocol_with(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Protocol {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Wrap an arbitrary error raised during evaluation.
    pub fn evaluation(source: impl Into<BoxError>) -> Self {
        Self::Evaluation(source.into())
    }

    /// Streaming contract violations indicate a programming error in the
    /// encoder or application and must never be absorbed.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::StreamingAlreadyActive | Self::WriteWhileStreaming
        )
    }

    /// A second instance of a fatal error, so it can be reported to both
    /// the stream producer and the connection owner.
    pub(crate) fn fatal_copy(&self) -> Option<Self> {
        match self {
            Self::StreamingAlreadyActive => Some(Self::StreamingAlreadyActive),
            Self::WriteWhileStreaming => Some(Self::WriteWhileStreaming),
            _ => None,
        }
    }
}

/// Shared slot holding the first error raised by a background task.
#[derive(Debug, Clone, Default)]
pub(crate) struct ErrorSlot(Arc<Mutex<Option<StagewireError>>>);

impl ErrorSlot {
    /// Store `err` unless an earlier error is already held.
    pub(crate) fn record(&self, err: StagewireError) {
        let mut slot = self.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    pub(crate) fn take(&self) -> Option<StagewireError> {
        self.lock().take()
    }

    fn lock(&self) -> MutexGuard<'_, Option<StagewireError>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Result type alias using StagewireError.
pub type Result<T> = std::result::Result<T, StagewireError>;
