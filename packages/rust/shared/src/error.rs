//! Error types for darkscout.
//!
//! Library crates use [`DarkscoutError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all darkscout operations.
#[derive(Debug, thiserror::Error)]
pub enum DarkscoutError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Timeout, connection, DNS or proxy failure.
    #[error("network error: {0}")]
    Network(String),

    /// The server answered with a non-2xx status.
    #[error("HTTP {status} from {url}")]
    HttpStatus { url: String, status: u16 },

    /// Malformed content or an extraction failure.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Knowledge store or run history error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Language model request, quota, or response error.
    #[error("language model error: {message}")]
    Llm { message: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error.
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, DarkscoutError>;

impl DarkscoutError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a language model error from any displayable message.
    pub fn llm(msg: impl Into<String>) -> Self {
        Self::Llm {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = DarkscoutError::config("missing API key");
        assert_eq!(err.to_string(), "config error: missing API key");

        let err = DarkscoutError::HttpStatus {
            url: "http://example.onion/".into(),
            status: 503,
        };
        assert_eq!(err.to_string(), "HTTP 503 from http://example.onion/");

        let err = DarkscoutError::llm("quota exceeded");
        assert!(err.to_string().contains("quota exceeded"));
    }
}
