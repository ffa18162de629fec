use thiserror::Error;

/// Crate-wide error type.
///
/// Parser anomalies are absorbed with fallbacks and never surface here; the
/// variants below are the failures a caller can actually observe.
#[derive(Error, Debug)]
pub enum Error {
    #[error("script parse error: {0}")]
    Parse(String),

    #[error("audio playback used before initialize()")]
    NotInitialized,

    #[error("failed to open audio output: {0}")]
    Initialization(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("authentication rejected: {0}")]
    Authentication(String),

    #[error("synthesis failed: {0}")]
    Synthesis(String),

    #[error("interrupted")]
    Interrupted,

    #[error("story backend error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// True for failures worth retrying as-is (connect again, re-drive the
    /// same event). Authentication and programming errors are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Connection(_) | Error::Synthesis(_) | Error::Interrupted | Error::Backend(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
