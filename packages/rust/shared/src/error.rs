//! Error types for the annotation build engine.
//!
//! Library crates use [`AnnotateError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all engine operations.
#[derive(Debug, thiserror::Error)]
pub enum AnnotateError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Submitted text or files were rejected before a build was created.
    #[error("input error: {message}")]
    Input { message: String },

    /// Build settings failed validation.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The external pipeline could not be driven to completion.
    #[error("pipeline error: {0}")]
    Pipeline(String),

    /// A privileged operation was attempted without the shared secret.
    #[error("secret key could not be confirmed")]
    Unauthorized,

    /// No build (or build directory) is known for the fingerprint.
    #[error("no such build: {fingerprint}")]
    NotFound { fingerprint: String },

    /// A result was requested before the build reached a finished state.
    #[error("build {fingerprint} has not finished")]
    NotFinished { fingerprint: String },

    /// JSON or TOML (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, AnnotateError>;

impl AnnotateError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create an input error from any displayable message.
    pub fn input(msg: impl Into<String>) -> Self {
        Self::Input {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a pipeline error from any displayable message.
    pub fn pipeline(msg: impl Into<String>) -> Self {
        Self::Pipeline(msg.into())
    }

    /// Create a not-found error for a fingerprint.
    pub fn not_found(fingerprint: impl Into<String>) -> Self {
        Self::NotFound {
            fingerprint: fingerprint.into(),
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
        let err = AnnotateError::input("empty input");
        assert_eq!(err.to_string(), "input error: empty input");

        let err = AnnotateError::not_found("abc-f");
        assert_eq!(err.to_string(), "no such build: abc-f");

        let err = AnnotateError::Unauthorized;
        assert!(err.to_string().contains("secret key"));
    }

    #[test]
    fn io_error_keeps_path() {
        let err = AnnotateError::io(
            "/tmp/builds/x",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        let shown = err.to_string();
        assert!(shown.contains("/tmp/builds/x"));
        assert!(shown.contains("gone"));
    }
}
