use baily_proto::{codes, ErrorPayload};
use std::path::PathBuf;
use thiserror::Error;

/// Core error type for baily dev-server operations.
///
/// The taxonomy determines both the HTTP status of a failed request and
/// whether the error is recoverable without user action: optimize and I/O
/// failures keep the server running, resolve and transform failures are
/// reported to the user, and only startup configuration failures are fatal.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to resolve \"{specifier}\"{}", .importer.as_deref().map(|i| format!(" from {i}")).unwrap_or_default())]
    Resolve {
        specifier: String,
        importer: Option<String>,
    },

    #[error("File is outside the allowed workspace roots: {path}")]
    FsDenied { path: PathBuf },

    #[error("[{plugin}] {hook} failed for {id}: {message}")]
    Plugin {
        plugin: String,
        hook: &'static str,
        id: String,
        message: String,
    },

    #[error("Transform of {id} failed: {message}")]
    Transform { id: String, message: String },

    #[error("Dependency optimization failed{}: {message}", .specifier.as_deref().map(|s| format!(" for \"{s}\"")).unwrap_or_default())]
    Optimize {
        specifier: Option<String>,
        message: String,
    },

    #[error("Failed to read config at {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config at {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{0}")]
    Other(String),
}

impl Error {
    #[must_use]
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Stable error code for the wire protocol.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Resolve { .. } | Self::FsDenied { .. } => codes::RESOLVE_FAILED,
            Self::Plugin { .. } | Self::Transform { .. } => codes::TRANSFORM_FAILED,
            Self::Optimize { .. } => codes::OPTIMIZE_FAILED,
            _ => codes::INTERNAL_ERROR,
        }
    }

    /// HTTP status for a request that failed with this error.
    #[must_use]
    pub fn status(&self) -> u16 {
        match self {
            Self::Resolve { .. } => 502,
            Self::FsDenied { .. } => 403,
            Self::Plugin { .. } | Self::Transform { .. } | Self::Optimize { .. } => 500,
            _ => 500,
        }
    }

    /// Structured body for the HMR `error` payload and HTTP responses.
    #[must_use]
    pub fn to_payload(&self) -> ErrorPayload {
        let file = match self {
            Self::Plugin { id, .. } | Self::Transform { id, .. } => Some(id.clone()),
            Self::FsDenied { path } => Some(path.display().to_string()),
            _ => None,
        };
        ErrorPayload {
            code: self.code().to_string(),
            message: self.to_string(),
            stack: None,
            file,
            frame: None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_error_display_with_importer() {
        let err = Error::Resolve {
            specifier: "./missing".to_string(),
            importer: Some("/src/main.js".to_string()),
        };
        let msg = err.to_string();
        assert!(msg.contains("./missing"));
        assert!(msg.contains("/src/main.js"));
        assert_eq!(err.status(), 502);
        assert_eq!(err.code(), codes::RESOLVE_FAILED);
    }

    #[test]
    fn test_transform_error_payload_carries_file() {
        let err = Error::Transform {
            id: "/src/app.js".to_string(),
            message: "unexpected token".to_string(),
        };
        let payload = err.to_payload();
        assert_eq!(payload.code, codes::TRANSFORM_FAILED);
        assert_eq!(payload.file.as_deref(), Some("/src/app.js"));
    }

    #[test]
    fn test_fs_denied_is_403() {
        let err = Error::FsDenied {
            path: PathBuf::from("/etc/passwd"),
        };
        assert_eq!(err.status(), 403);
    }
}
