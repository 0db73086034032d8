use std::fmt;

use thiserror::Error;

/// Application-wide error types for Scout.
#[derive(Error, Debug)]
pub enum AppError {
    /// A catalog entry, header entry or runtime setting is invalid.
    #[error("Config error: {0}")]
    ConfigError(String),

    /// The username could not be turned into a valid URL for a site.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Network/connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Request timed out.
    #[error("Request timed out after {0} ms")]
    Timeout(u64),

    /// The site answered with a status worth retrying (429 or 5xx).
    #[error("HTTP {status} from {url}")]
    HttpStatus { status: u16, url: String },

    /// Evidence regex evaluation exceeded its time bound.
    #[error("Evidence match timed out after {0} ms")]
    MatcherTimeout(u64),

    /// Result persistence failed.
    #[error("Sink error: {0}")]
    SinkError(String),

    /// A probe ran out of attempts.
    #[error("Gave up after {attempts} attempts: {last}")]
    ExhaustedRetries { attempts: u32, last: ErrorKind },

    /// I/O failure (reading catalog files, writing sinks).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// A background task died (panic or runtime shutdown).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::NetworkError(_) | AppError::Timeout(_) => true,
            AppError::HttpStatus { status, .. } => is_retryable_status(*status),
            _ => false,
        }
    }

    /// Coarse class of this error, as recorded on a probe outcome.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Timeout(_) => ErrorKind::Timeout,
            AppError::NetworkError(_) => ErrorKind::Network,
            AppError::HttpStatus { status, .. } => ErrorKind::Status(*status),
            AppError::InvalidUrl(_) | AppError::ConfigError(_) => ErrorKind::InvalidUrl,
            AppError::ExhaustedRetries { last, .. } => *last,
            _ => ErrorKind::Other,
        }
    }
}

/// 429 and every 5xx are transient; everything else is final for the attempt.
pub fn is_retryable_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

/// Error class carried by [`ProbeOutcome`](crate::models::ProbeOutcome) and the retry state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    Timeout,
    Status(u16),
    InvalidUrl,
    Cancelled,
    Other,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Network => write!(f, "network"),
            ErrorKind::Timeout => write!(f, "timeout"),
            ErrorKind::Status(code) => write!(f, "http {code}"),
            ErrorKind::InvalidUrl => write!(f, "invalid url"),
            ErrorKind::Cancelled => write!(f, "cancelled"),
            ErrorKind::Other => write!(f, "other"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(AppError::NetworkError("reset".into()).is_retryable());
        assert!(AppError::Timeout(30).is_retryable());
        assert!(
            AppError::HttpStatus {
                status: 429,
                url: "http://a.test".into()
            }
            .is_retryable()
        );
        assert!(
            AppError::HttpStatus {
                status: 503,
                url: "http://a.test".into()
            }
            .is_retryable()
        );
        assert!(
            !AppError::HttpStatus {
                status: 404,
                url: "http://a.test".into()
            }
            .is_retryable()
        );
        assert!(!AppError::SinkError("disk full".into()).is_retryable());
        assert!(!AppError::ConfigError("bad".into()).is_retryable());
    }

    #[test]
    fn test_retryable_status_boundaries() {
        assert!(!is_retryable_status(200));
        assert!(!is_retryable_status(302));
        assert!(!is_retryable_status(404));
        assert!(!is_retryable_status(428));
        assert!(is_retryable_status(429));
        assert!(is_retryable_status(500));
        assert!(is_retryable_status(599));
        assert!(!is_retryable_status(600));
    }

    #[test]
    fn test_error_kind_mapping() {
        assert_eq!(AppError::Timeout(10).kind(), ErrorKind::Timeout);
        assert_eq!(
            AppError::NetworkError("refused".into()).kind(),
            ErrorKind::Network
        );
        assert_eq!(
            AppError::HttpStatus {
                status: 502,
                url: String::new()
            }
            .kind(),
            ErrorKind::Status(502)
        );
        assert_eq!(
            AppError::ExhaustedRetries {
                attempts: 3,
                last: ErrorKind::Timeout
            }
            .kind(),
            ErrorKind::Timeout
        );
    }
}
