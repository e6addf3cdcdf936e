use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AnalyzeError {
    /// No credential available. Not retryable.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("transient failure: {0}")]
    Transient(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("camera access was denied, check the device permissions")]
    PermissionDenied,

    #[error("no capture device was found")]
    NotFound,

    #[error("the capture device is in use by another application")]
    Busy,

    #[error("the stream format is unsupported or the server refused cross-origin access: {0}")]
    Unsupported(String),

    #[error("failed to start the video source: {0}")]
    Other(String),

    #[error("failed to launch the capture process: {0}")]
    Spawn(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    /// The source is cross-origin and its pixels cannot be read.
    #[error("the video source does not allow its frames to be read (cross-origin restriction)")]
    SecurityRestriction,

    #[error("frame encoding failed: {0}")]
    Encode(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    QuotaExceeded,
    Transient,
}

/// Classifies an upstream failure by its text.
///
/// The service does not return a reliable structured error, so this matches on
/// substrings of the stringified error. Anything unrecognized is transient.
pub fn classify_failure(message: &str) -> FailureKind {
    let lower = message.to_ascii_lowercase();
    if message.contains("429")
        || message.contains("RESOURCE_EXHAUSTED")
        || lower.contains("quota")
        || lower.contains("exceeded")
    {
        FailureKind::QuotaExceeded
    } else {
        FailureKind::Transient
    }
}

impl AnalyzeError {
    pub fn from_failure(message: impl Into<String>) -> Self {
        let message = message.into();
        match classify_failure(&message) {
            FailureKind::QuotaExceeded => AnalyzeError::QuotaExceeded(message),
            FailureKind::Transient => AnalyzeError::Transient(message),
        }
    }
}
