//! Upstream Client (C2): metadata calls and artifact streaming against a
//! PyPI-shaped index. Unlike storage, the backend here is not pluggable —
//! the wire contracts are fixed to one upstream shape, so
//! `PypiClient` is used directly rather than behind a trait object.

mod backoff_policy;
pub mod pypi;

pub use pypi::PypiClient;

use crate::error::ErrorKind;
use crate::model::Serial;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("project {0} not found upstream")]
    NotFound(String),
    #[error("stale metadata for {project}: expected serial >= {expected}, got {got}")]
    StaleMetadata {
        project: String,
        expected: Serial,
        got: Serial,
    },
    #[error("simple index for {0} did not return JSON")]
    NonJsonSimpleIndex(String),
    #[error("failed to parse upstream response for {context}: {source}")]
    Parse {
        context: String,
        source: serde_json::Error,
    },
    #[error("checksum mismatch for {url}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        url: String,
        expected: String,
        actual: String,
    },
    #[error("artifact size mismatch for {url}: expected {expected}, got {actual}")]
    SizeMismatch {
        url: String,
        expected: u64,
        actual: u64,
    },
    #[error("exhausted retries fetching {0}")]
    MaxRetriesExceeded(String),
    #[error("invalid proxy configuration: {0}")]
    InvalidProxy(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::Network(_) | ClientError::Timeout(_) | ClientError::MaxRetriesExceeded(_) => {
                ErrorKind::Transient
            }
            ClientError::NotFound(_) | ClientError::NonJsonSimpleIndex(_) => {
                ErrorKind::UpstreamNotFound
            }
            ClientError::StaleMetadata { .. } => ErrorKind::StaleMetadata,
            ClientError::ChecksumMismatch { .. } | ClientError::SizeMismatch { .. } => {
                ErrorKind::Integrity
            }
            ClientError::Parse { .. } | ClientError::InvalidProxy(_) => ErrorKind::Configuration,
            ClientError::Io(_) => ErrorKind::LocalIo,
        }
    }

    /// 404/410 and the no-JSON-fallback case are not worth retrying.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ClientError::NotFound(_) | ClientError::NonJsonSimpleIndex(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// Result of a changelog poll: the serial upstream is currently at, and the
/// `(project, serial)` pairs that changed since the cursor we asked from.
#[derive(Debug, Clone)]
pub struct ChangelogDelta {
    pub current_serial: Serial,
    pub changed: Vec<(String, Serial)>,
}

/// A fetched project's metadata plus the caching token to send back on the
/// next poll. `raw` is the untouched Warehouse JSON body so project-metadata
/// regex filters can select arbitrary JSON paths (e.g. classifiers)
/// that the strongly-typed `Project` model doesn't carry.
#[derive(Debug, Clone)]
pub struct ProjectMetadata {
    pub project: crate::model::Project,
    pub etag: Option<String>,
    pub raw: serde_json::Value,
}

pub use backoff_policy::retry_with_backoff;
