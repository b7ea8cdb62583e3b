//! Error types for the update agent.

/// Top-level error type for the auto-update core.
#[derive(Debug, thiserror::Error)]
pub enum LauncherError {
    /// Mirror request failed, timed out, or returned a non-success status.
    #[error("mirror error: {0}")]
    Network(String),

    /// Downloaded artifact length differed from the release metadata.
    #[error("length mismatch for {target} (expected {expected} bytes, got {actual})")]
    LengthMismatch {
        /// Target filename being verified.
        target: String,
        /// Length declared by the release metadata.
        expected: u64,
        /// Length actually read from the mirror.
        actual: u64,
    },

    /// Downloaded artifact digest differed from the release metadata.
    #[error("{algorithm} digest mismatch for {target} (expected {expected}, got {actual})")]
    DigestMismatch {
        /// Target filename being verified.
        target: String,
        /// Hash algorithm that produced the mismatch.
        algorithm: String,
        /// Digest declared by the release metadata (hex).
        expected: String,
        /// Digest computed over the downloaded bytes (hex).
        actual: String,
    },

    /// Downloaded archive could not be extracted.
    #[error("untar error: {0}")]
    Untar(String),

    /// A staged or installed executable failed the liveness probe.
    #[error("executable invalid: {0}")]
    ExecutableInvalid(String),

    /// Filesystem operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Release metadata was missing, malformed, or not yet published.
    #[error("metadata error: {0}")]
    Metadata(String),

    /// Failed to parse or compare semantic versions.
    #[error("version error: {0}")]
    Version(#[from] semver::Error),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Finalization failed (exec-replace or newest-version resolution).
    #[error("finalize error: {0}")]
    Finalize(String),

    /// Generic error.
    #[error("{0}")]
    Other(String),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, LauncherError>;
