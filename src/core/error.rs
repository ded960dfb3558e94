//! Error kinds surfaced by the generation pipeline.
//!
//! Composition and sequence errors are caller mistakes and are never retried.
//! Generation errors come from the completion service; only `Network` and
//! `RateLimited` are worth retrying.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompositionError {
    #[error("source text is missing or empty")]
    EmptySource,

    #[error("batch index {0} is outside 1..={max}", max = u32::MAX / 3)]
    InvalidBatchIndex(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GenerationErrorKind {
    Network,
    RateLimited,
    InvalidResponse,
    Unauthorized,
}

impl GenerationErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, GenerationErrorKind::Network | GenerationErrorKind::RateLimited)
    }

    /// Classifies a non-success HTTP status returned by a provider.
    pub fn from_status(status: u16) -> Self {
        match status {
            401 | 403 => GenerationErrorKind::Unauthorized,
            429 => GenerationErrorKind::RateLimited,
            408 | 500..=599 => GenerationErrorKind::Network,
            _ => GenerationErrorKind::InvalidResponse,
        }
    }
}

impl fmt::Display for GenerationErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GenerationErrorKind::Network => "network",
            GenerationErrorKind::RateLimited => "rate limited",
            GenerationErrorKind::InvalidResponse => "invalid response",
            GenerationErrorKind::Unauthorized => "unauthorized",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("generation failed ({kind}): {message}")]
pub struct GenerationError {
    pub kind: GenerationErrorKind,
    pub message: String,
}

impl GenerationError {
    pub fn new(kind: GenerationErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(GenerationErrorKind::Network, message)
    }

    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::new(GenerationErrorKind::InvalidResponse, message)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// The request URL is dropped from the message; it may carry credentials.
impl From<reqwest::Error> for GenerationError {
    fn from(err: reqwest::Error) -> Self {
        let err = err.without_url();
        if let Some(status) = err.status() {
            return Self::new(GenerationErrorKind::from_status(status.as_u16()), err.to_string());
        }
        if err.is_decode() {
            return Self::invalid_response(err.to_string());
        }
        Self::network(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SequenceError {
    #[error("no outline has been generated for this run")]
    OutlineMissing,

    #[error("outline already generated; invalidate it explicitly before regenerating")]
    OutlineAlreadyGenerated,

    #[error("batch {requested} requested out of order, expected batch {expected}")]
    OutOfOrder { requested: u32, expected: u32 },

    #[error("no batch has been generated yet")]
    NoBatches,

    #[error("run is {state} and accepts no further stages")]
    RunClosed { state: String },

    #[error("stored history is corrupt: entry {position} is batch {found}")]
    CorruptHistory { position: usize, found: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Composition(#[from] CompositionError),

    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error(transparent)]
    Sequence(#[from] SequenceError),
}

impl PipelineError {
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::Generation(err) => err.is_retryable(),
            _ => false,
        }
    }
}
