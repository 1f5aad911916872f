//! Storage Abstraction (C1): uniform read/write/delete/move/list/lock/hash
//! over a pluggable backend. Only the abstraction is specified here — the
//! byte-level implementation of non-filesystem backends (S3-compatible,
//! Swift) is out of scope for now; the filesystem backend is
//! implemented in full since it is the backend every other component is
//! exercised against.

mod filesystem;

pub use filesystem::{FilesystemStorage, MirrorLockGuard};

use crate::config::{CompareMethod, StorageBackendKind};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("not found: {0}")]
    NotFound(PathBuf),
    #[error("already exists: {0}")]
    AlreadyExists(PathBuf),
    #[error("permission denied: {0}")]
    PermissionDenied(PathBuf),
    #[error("disk full while writing {0}")]
    IoFull(PathBuf),
    #[error("checksum mismatch reading back {0}")]
    Corrupt(PathBuf),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{backend} backend is not implemented in this build (byte-level drivers are out of scope; only the storage abstraction is specified)")]
    BackendNotImplemented { backend: &'static str },
}

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatInfo {
    pub size: u64,
    /// Backend-defined comparable timestamp (mtime for filesystem). Object
    /// stores may not preserve client-set timestamps — see the open
    /// question on `compare-method=stat` semantics; we treat
    /// a missing/unreliable timestamp as always-stale so `hash` remains the
    /// authoritative default.
    pub mtime_unix: Option<i64>,
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Object-safe storage abstraction so the mirror can be built against
/// whichever backend `storage-backend` selects without threading a
/// generic parameter through every component.
pub trait Storage: Send + Sync {
    fn read(&self, path: &str) -> BoxFuture<'_, Result<String>>;
    fn read_binary(&self, path: &str) -> BoxFuture<'_, Result<Vec<u8>>>;
    /// Atomic with respect to readers: writes to a sibling `.`-prefixed
    /// temp name and renames into place.
    fn write(&self, path: &str, contents: String) -> BoxFuture<'_, Result<()>>;
    fn write_binary(&self, path: &str, contents: Vec<u8>) -> BoxFuture<'_, Result<()>>;
    fn exists(&self, path: &str) -> BoxFuture<'_, Result<bool>>;
    fn is_dir(&self, path: &str) -> BoxFuture<'_, Result<bool>>;
    fn is_file(&self, path: &str) -> BoxFuture<'_, Result<bool>>;
    fn delete(&self, path: &str) -> BoxFuture<'_, Result<()>>;
    fn rmdir(&self, path: &str, recursive: bool) -> BoxFuture<'_, Result<()>>;
    /// Atomic rename within this backend instance.
    fn mv(&self, from: &str, to: &str) -> BoxFuture<'_, Result<()>>;
    fn copy(&self, from: &str, to: &str) -> BoxFuture<'_, Result<()>>;
    fn walk(&self, path: &str) -> BoxFuture<'_, Result<Vec<String>>>;
    fn mkdir(&self, path: &str) -> BoxFuture<'_, Result<()>>;
    /// May be emulated as a pointer file on backends without native
    /// symlinks; readers must not depend on kernel-visible symlinks.
    fn symlink(&self, target: &str, link: &str) -> BoxFuture<'_, Result<()>>;
    fn scandir(&self, path: &str) -> BoxFuture<'_, Result<Vec<String>>>;
    fn hash_file(&self, path: &str, digest_name: &str) -> BoxFuture<'_, Result<String>>;
    fn stat(&self, path: &str) -> BoxFuture<'_, Result<StatInfo>>;
    fn compare_files(
        &self,
        a: &str,
        b: &str,
        method: CompareMethod,
    ) -> BoxFuture<'_, Result<bool>>;
    /// Scoped exclusive lock released on all exit paths (including panics,
    /// via `Drop`).
    fn acquire_mirror_lock(&self, path: &str) -> BoxFuture<'_, Result<MirrorLockGuard>>;
    /// Local filesystem root, when this backend has one. Used by the
    /// downloader to stream bytes directly to a temp path before the
    /// atomic rename into the canonical content-addressed path.
    fn local_root(&self) -> Option<&Path>;
}

pub fn open(kind: StorageBackendKind, root: PathBuf) -> Result<Box<dyn Storage>> {
    match kind {
        StorageBackendKind::Filesystem => Ok(Box::new(FilesystemStorage::new(root))),
        StorageBackendKind::S3 => Err(StorageError::BackendNotImplemented { backend: "s3" }),
        StorageBackendKind::Swift => Err(StorageError::BackendNotImplemented { backend: "swift" }),
    }
}
