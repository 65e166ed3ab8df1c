use thiserror::Error;

use crate::models::ModelAttempt;

/// A single failed call to the model provider, already classified.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("Provider credentials missing or rejected: {0}")]
    MissingCredentials(String),

    #[error("Rate limited by provider: {0}")]
    RateLimited(String),

    #[error("Provider resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    #[error("Upstream fault (HTTP {status}): {message}")]
    ServerFault { status: u16, message: String },

    #[error("Model returned an empty response")]
    EmptyResponse,

    #[error("Malformed request: {0}")]
    BadRequest(String),

    #[error("Blocked by content safety filter: {0}")]
    SafetyBlocked(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Failed to decode provider response: {0}")]
    Decode(String),

    #[error("Unexpected provider response (HTTP {status}): {message}")]
    Http { status: u16, message: String },
}

impl ProviderError {
    /// Whether the next model identifier should be tried after this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited(_)
                | Self::ResourceExhausted(_)
                | Self::Unavailable(_)
                | Self::ServerFault { .. }
                | Self::EmptyResponse
                | Self::Network(_)
        )
    }

    /// Throttling signals that qualify for one extra attempt on the same model.
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Self::RateLimited(_) | Self::ResourceExhausted(_))
    }

    /// Map an HTTP status outside the success range to an error.
    pub fn from_status(status: u16, message: String) -> Self {
        match status {
            429 => Self::RateLimited(message),
            500 | 502 | 503 | 504 => Self::ServerFault { status, message },
            401 | 403 => Self::MissingCredentials(message),
            400 if message.to_lowercase().contains("safety") => Self::SafetyBlocked(message),
            400 => Self::BadRequest(message),
            _ => Self::Http { status, message },
        }
    }
}

/// Coarse category of a dispatch failure, used to pick the user-facing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Exhausted,
    Fatal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::Exhausted => "exhausted",
            Self::Fatal => "fatal",
        }
    }
}

#[derive(Error, Debug)]
pub enum TriageError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("All {} model attempts failed", .attempts.len())]
    Exhausted { attempts: Vec<ModelAttempt> },

    #[error("Model {model} failed: {source}")]
    Fatal {
        model: String,
        #[source]
        source: ProviderError,
    },

    #[error("Audit delivery failed: {0}")]
    Audit(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

impl TriageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Configuration,
            Self::Exhausted { .. } => ErrorKind::Exhausted,
            _ => ErrorKind::Fatal,
        }
    }
}

pub type Result<T> = std::result::Result<T, TriageError>;
