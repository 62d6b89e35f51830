//! Error types for the asset cache

// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

use miette::Diagnostic;
use std::path::Path;
use thiserror::Error;

/// Error type for cache operations
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// I/O error during cache operations
    #[error(
        "I/O {operation} failed{}",
        path.as_ref().map_or(String::new(), |p| format!(": {}", p.display()))
    )]
    #[diagnostic(
        code(assetcache::io),
        help("Check file permissions and ensure the cache root is writable")
    )]
    Io {
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
        /// Path that caused the error, if available
        path: Option<Box<Path>>,
        /// Operation that failed (e.g., "read", "write", "persist")
        operation: String,
    },

    /// Configuration or validation error
    #[error("Cache configuration error: {message}")]
    #[diagnostic(code(assetcache::config))]
    Configuration {
        /// Error message describing the configuration issue
        message: String,
    },

    /// The cache root is not configured, missing, or not writable
    #[error("Cache is unavailable")]
    #[diagnostic(
        code(assetcache::unavailable),
        help("Set a cache root and make sure it and its js/ and css/ zones are writable")
    )]
    Unavailable,

    /// Serialization error
    #[error("Serialization error: {message}")]
    #[diagnostic(code(assetcache::serialization))]
    Serialization {
        /// Error message describing the serialization issue
        message: String,
    },

    /// A third-party page-cache purge failed
    #[error("Page cache purge failed: {message}")]
    #[diagnostic(code(assetcache::purge))]
    Purge {
        /// Error message describing the purge failure
        message: String,
    },
}

impl Error {
    /// Create a configuration error
    #[must_use]
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
        }
    }

    /// Create an I/O error with path context
    #[must_use]
    pub fn io(
        source: std::io::Error,
        path: impl AsRef<Path>,
        operation: impl Into<String>,
    ) -> Self {
        Self::Io {
            source,
            path: Some(path.as_ref().into()),
            operation: operation.into(),
        }
    }

    /// Create an I/O error without path context
    #[must_use]
    pub fn io_no_path(source: std::io::Error, operation: impl Into<String>) -> Self {
        Self::Io {
            source,
            path: None,
            operation: operation.into(),
        }
    }

    /// Create a serialization error
    #[must_use]
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create a purge error
    #[must_use]
    pub fn purge(msg: impl Into<String>) -> Self {
        Self::Purge {
            message: msg.into(),
        }
    }
}

/// Result type for cache operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_display_includes_path() {
        let err = Error::io(
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
            "/cache/css/ao_x.css",
            "write",
        );
        assert_eq!(err.to_string(), "I/O write failed: /cache/css/ao_x.css");
    }

    #[test]
    fn test_io_error_without_path() {
        let err = Error::io_no_path(
            std::io::Error::new(std::io::ErrorKind::Other, "boom"),
            "read_dir",
        );
        assert_eq!(err.to_string(), "I/O read_dir failed");
    }

    #[test]
    fn test_constructors() {
        assert!(matches!(
            Error::configuration("bad"),
            Error::Configuration { message } if message == "bad"
        ));
        assert!(matches!(
            Error::purge("varnish down"),
            Error::Purge { message } if message == "varnish down"
        ));
        assert_eq!(Error::Unavailable.to_string(), "Cache is unavailable");
    }
}
