use noticewatch_store::StoreError;
use thiserror::Error;

/// Validation errors for domain values and configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("ticker cannot be empty")]
    EmptyTicker,
    #[error("ticker length {len} outside {min}..={max}")]
    TickerLength { len: usize, min: usize, max: usize },
    #[error("ticker contains invalid character '{ch}' at index {index}")]
    TickerInvalidChar { ch: char, index: usize },
    #[error("ticker must contain at least one letter: '{value}'")]
    TickerWithoutLetter { value: String },
    #[error("ticker '{value}' is a settlement or quote currency")]
    DeniedTicker { value: String },

    #[error("unrecognized timestamp: '{value}'")]
    InvalidTimestamp { value: String },
    #[error("invalid url '{value}': {reason}")]
    InvalidUrl { value: String, reason: String },

    #[error("invalid configuration for {field}: {reason}")]
    InvalidConfig { field: &'static str, reason: String },
}

/// Failures surfaced by the pipeline.
///
/// Duplicates, timing classes and watermark skips are outcomes, not errors,
/// and are reported through [`crate::NoticeOutcome`].
#[derive(Debug, Error)]
pub enum NoticeError {
    #[error("network failure calling {destination}: {message}")]
    Network {
        destination: String,
        message: String,
    },

    #[error("call to {destination} timed out after {timeout_ms}ms")]
    Timeout { destination: String, timeout_ms: u64 },

    #[error("{destination} is rate limited, retry in {retry_after_ms}ms")]
    RateLimited {
        destination: String,
        retry_after_ms: u64,
    },

    #[error("circuit open for {destination}")]
    CircuitOpen { destination: String },

    #[error("{destination} answered with status {status}")]
    Http { destination: String, status: u16 },

    #[error("could not decode {source_name}: {message}")]
    Decode {
        source_name: String,
        message: String,
    },

    #[error(transparent)]
    Persistence(#[from] StoreError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("downstream sink is closed")]
    SinkClosed,

    #[error("operation cancelled")]
    Cancelled,
}

impl NoticeError {
    pub fn network(destination: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Network {
            destination: destination.into(),
            message: message.into(),
        }
    }

    pub fn decode(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Decode {
            source_name: source_name.into(),
            message: message.into(),
        }
    }

    /// Whether the retry loop may try again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. } | Self::Timeout { .. } => true,
            Self::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Whether the failure counts against a circuit breaker. A cancelled call
    /// counts like a network failure.
    pub fn counts_as_failure(&self) -> bool {
        !matches!(
            self,
            Self::CircuitOpen { .. } | Self::RateLimited { .. } | Self::Validation(_)
        )
    }
}
