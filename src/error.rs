//! Error types for the voicebridge controller.

/// Top-level error type for the session controller and its collaborators.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Serial desynchronization or a malformed frame header.
    #[error("framing error: {0}")]
    Framing(String),

    /// Serial link open/read/write failure.
    #[error("link error: {0}")]
    Link(String),

    /// The rolling buffer could not evict old samples.
    #[error("buffer pressure: {0}")]
    BufferPressure(String),

    /// Speech recognition collaborator failure.
    #[error("recognizer error: {0}")]
    Recognizer(String),

    /// Rewrite collaborator failure.
    #[error("rewriter error: {0}")]
    Rewriter(String),

    /// Speech synthesis collaborator failure.
    #[error("synthesis error: {0}")]
    Synthesis(String),

    /// Playback job failure.
    #[error("playback error: {0}")]
    Playback(String),

    /// A pipeline stage exceeded its watchdog deadline.
    #[error("{stage} timed out after {waited_ms}ms")]
    StageTimeout {
        /// Stage label for diagnostics.
        stage: &'static str,
        /// How long the controller waited.
        waited_ms: u64,
    },

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Resource ownership invariant violated. This is a programming error;
    /// the session aborts after flushing the transition log.
    #[error("resource invariant violated: {0}")]
    ResourceInvariant(String),

    /// Controller event channel closed unexpectedly.
    #[error("channel error: {0}")]
    Channel(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, BridgeError>;
