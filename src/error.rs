//! Public error taxonomy for a download run.

use std::path::PathBuf;

/// Error returned by [`crate::driver::download`] and the components it composes.
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    /// The HEAD probe failed, or succeeded without a usable `Content-Length`.
    #[error("failed to fetch metadata for {url}: {reason}")]
    Metadata { url: String, reason: String },

    /// A GET response did not satisfy a range request that was required.
    #[error("origin at {url} does not honour range requests")]
    RangeUnsupported { url: String },

    /// A request exhausted its retry budget.
    #[error("transport error: {0}")]
    Transport(#[from] curl::Error),

    /// A request exhausted its retry budget with a non-2xx HTTP status (not a
    /// curl-level transport failure).
    #[error("HTTP {status} from {url}")]
    Http { url: String, status: u32 },

    /// A chunk file was shorter than its declared segment during merge.
    #[error("chunk file {path} is shorter than expected: got {actual}, want {expected}")]
    Integrity {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    /// The caller requested cancellation.
    #[error("download cancelled")]
    Cancelled,

    /// A filesystem operation failed.
    #[error("filesystem error at {path}: {source}")]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl DownloadError {
    pub(crate) fn fs(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DownloadError::Filesystem {
            path: path.into(),
            source,
        }
    }
}
