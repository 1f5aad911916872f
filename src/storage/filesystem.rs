use super::{CompareMethod, Result, StatInfo, Storage, StorageError};
use fs2::FileExt;
use md5::Md5;
use sha2::{Digest, Sha256};
use std::fs::File as StdFile;
use std::io::Read;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Local filesystem storage backend. All writes go through
/// write-temp-then-rename so concurrent readers never observe a partial
/// file.
#[derive(Debug, Clone)]
pub struct FilesystemStorage {
    root: PathBuf,
}

impl FilesystemStorage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    fn temp_sibling(path: &Path) -> PathBuf {
        let file_name = path
            .file_name()
            .map(|n| format!(".{}.tmp-{}", n.to_string_lossy(), uuid::Uuid::new_v4()))
            .unwrap_or_else(|| format!(".tmp-{}", uuid::Uuid::new_v4()));
        path.with_file_name(file_name)
    }

    fn map_io_err(path: &Path, source: std::io::Error) -> StorageError {
        match source.kind() {
            std::io::ErrorKind::NotFound => StorageError::NotFound(path.to_path_buf()),
            std::io::ErrorKind::AlreadyExists => StorageError::AlreadyExists(path.to_path_buf()),
            std::io::ErrorKind::PermissionDenied => {
                StorageError::PermissionDenied(path.to_path_buf())
            }
            _ if source.raw_os_error() == Some(28) => StorageError::IoFull(path.to_path_buf()),
            _ => StorageError::Io {
                path: path.to_path_buf(),
                source,
            },
        }
    }
}

fn walk_dir_blocking(root: &Path) -> std::io::Result<Vec<String>> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                if let Ok(rel) = path.strip_prefix(root) {
                    out.push(rel.to_string_lossy().replace('\\', "/"));
                }
            }
        }
    }
    out.sort();
    Ok(out)
}

fn hash_file_blocking(path: &Path, digest_name: &str) -> std::io::Result<String> {
    let mut file = StdFile::open(path)?;
    let mut buffer = [0u8; 65536];
    match digest_name {
        "md5" => {
            // md5 kept for config-surface parity (`digest_name = md5`); the
            // default and only digest used for content-addressing is sha256.
            let mut hasher = Md5::new();
            loop {
                let n = file.read(&mut buffer)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buffer[..n]);
            }
            Ok(hex::encode(hasher.finalize()))
        }
        _ => {
            let mut hasher = Sha256::new();
            loop {
                let n = file.read(&mut buffer)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buffer[..n]);
            }
            Ok(hex::encode(hasher.finalize()))
        }
    }
}

/// Released on drop (all exit paths, including unwind).
pub struct MirrorLockGuard {
    file: Option<StdFile>,
}

impl Drop for MirrorLockGuard {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = fs2::FileExt::unlock(&file);
        }
    }
}

impl Storage for FilesystemStorage {
    fn read(&self, path: &str) -> super::BoxFuture<'_, Result<String>> {
        let target = self.resolve(path);
        Box::pin(async move {
            fs::read_to_string(&target)
                .await
                .map_err(|e| Self::map_io_err(&target, e))
        })
    }

    fn read_binary(&self, path: &str) -> super::BoxFuture<'_, Result<Vec<u8>>> {
        let target = self.resolve(path);
        Box::pin(async move {
            fs::read(&target)
                .await
                .map_err(|e| Self::map_io_err(&target, e))
        })
    }

    fn write(&self, path: &str, contents: String) -> super::BoxFuture<'_, Result<()>> {
        self.write_binary(path, contents.into_bytes())
    }

    fn write_binary(&self, path: &str, contents: Vec<u8>) -> super::BoxFuture<'_, Result<()>> {
        let target = self.resolve(path);
        Box::pin(async move {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|e| Self::map_io_err(parent, e))?;
            }
            let temp = Self::temp_sibling(&target);
            let mut file = fs::File::create(&temp)
                .await
                .map_err(|e| Self::map_io_err(&temp, e))?;
            file.write_all(&contents)
                .await
                .map_err(|e| Self::map_io_err(&temp, e))?;
            file.flush().await.map_err(|e| Self::map_io_err(&temp, e))?;
            drop(file);
            fs::rename(&temp, &target).await.map_err(|e| {
                let _ = std::fs::remove_file(&temp);
                Self::map_io_err(&target, e)
            })
        })
    }

    fn exists(&self, path: &str) -> super::BoxFuture<'_, Result<bool>> {
        let target = self.resolve(path);
        Box::pin(async move { Ok(fs::try_exists(&target).await.unwrap_or(false)) })
    }

    fn is_dir(&self, path: &str) -> super::BoxFuture<'_, Result<bool>> {
        let target = self.resolve(path);
        Box::pin(async move {
            Ok(fs::metadata(&target)
                .await
                .map(|m| m.is_dir())
                .unwrap_or(false))
        })
    }

    fn is_file(&self, path: &str) -> super::BoxFuture<'_, Result<bool>> {
        let target = self.resolve(path);
        Box::pin(async move {
            Ok(fs::metadata(&target)
                .await
                .map(|m| m.is_file())
                .unwrap_or(false))
        })
    }

    fn delete(&self, path: &str) -> super::BoxFuture<'_, Result<()>> {
        let target = self.resolve(path);
        Box::pin(async move {
            match fs::remove_file(&target).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(Self::map_io_err(&target, e)),
            }
        })
    }

    fn rmdir(&self, path: &str, recursive: bool) -> super::BoxFuture<'_, Result<()>> {
        let target = self.resolve(path);
        Box::pin(async move {
            let result = if recursive {
                fs::remove_dir_all(&target).await
            } else {
                fs::remove_dir(&target).await
            };
            match result {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(Self::map_io_err(&target, e)),
            }
        })
    }

    fn mv(&self, from: &str, to: &str) -> super::BoxFuture<'_, Result<()>> {
        let from = self.resolve(from);
        let to = self.resolve(to);
        Box::pin(async move {
            if let Some(parent) = to.parent() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|e| Self::map_io_err(parent, e))?;
            }
            fs::rename(&from, &to)
                .await
                .map_err(|e| Self::map_io_err(&from, e))
        })
    }

    fn copy(&self, from: &str, to: &str) -> super::BoxFuture<'_, Result<()>> {
        let from = self.resolve(from);
        let to = self.resolve(to);
        Box::pin(async move {
            if let Some(parent) = to.parent() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|e| Self::map_io_err(parent, e))?;
            }
            fs::copy(&from, &to)
                .await
                .map(|_| ())
                .map_err(|e| Self::map_io_err(&from, e))
        })
    }

    fn walk(&self, path: &str) -> super::BoxFuture<'_, Result<Vec<String>>> {
        let target = self.resolve(path);
        Box::pin(async move {
            tokio::task::spawn_blocking(move || walk_dir_blocking(&target))
                .await
                .map_err(|e| StorageError::Io {
                    path: PathBuf::new(),
                    source: std::io::Error::other(e),
                })?
                .map_err(|e| StorageError::Io {
                    path: PathBuf::new(),
                    source: e,
                })
        })
    }

    fn mkdir(&self, path: &str) -> super::BoxFuture<'_, Result<()>> {
        let target = self.resolve(path);
        Box::pin(async move {
            fs::create_dir_all(&target)
                .await
                .map_err(|e| Self::map_io_err(&target, e))
        })
    }

    fn symlink(&self, target_path: &str, link: &str) -> super::BoxFuture<'_, Result<()>> {
        let target_path = target_path.to_string();
        let link = self.resolve(link);
        Box::pin(async move {
            if let Some(parent) = link.parent() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|e| Self::map_io_err(parent, e))?;
            }
            let _ = fs::remove_file(&link).await;
            #[cfg(unix)]
            {
                tokio::fs::symlink(&target_path, &link)
                    .await
                    .map_err(|e| Self::map_io_err(&link, e))
            }
            #[cfg(not(unix))]
            {
                // Emulated as a pointer file; readers must resolve it explicitly.
                fs::write(&link, target_path.as_bytes())
                    .await
                    .map_err(|e| Self::map_io_err(&link, e))
            }
        })
    }

    fn scandir(&self, path: &str) -> super::BoxFuture<'_, Result<Vec<String>>> {
        let target = self.resolve(path);
        Box::pin(async move {
            let mut entries = match fs::read_dir(&target).await {
                Ok(e) => e,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => return Err(Self::map_io_err(&target, e)),
            };
            let mut names = Vec::new();
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| Self::map_io_err(&target, e))?
            {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
            names.sort();
            Ok(names)
        })
    }

    fn hash_file(&self, path: &str, digest_name: &str) -> super::BoxFuture<'_, Result<String>> {
        let target = self.resolve(path);
        let digest_name = digest_name.to_string();
        Box::pin(async move {
            let target_for_blocking = target.clone();
            tokio::task::spawn_blocking(move || {
                hash_file_blocking(&target_for_blocking, &digest_name)
            })
            .await
            .map_err(|e| StorageError::Io {
                path: target.clone(),
                source: std::io::Error::other(e),
            })?
            .map_err(|e| Self::map_io_err(&target, e))
        })
    }

    fn stat(&self, path: &str) -> super::BoxFuture<'_, Result<StatInfo>> {
        let target = self.resolve(path);
        Box::pin(async move {
            let meta = fs::metadata(&target)
                .await
                .map_err(|e| Self::map_io_err(&target, e))?;
            let mtime_unix = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64);
            Ok(StatInfo {
                size: meta.len(),
                mtime_unix,
            })
        })
    }

    fn compare_files(
        &self,
        a: &str,
        b: &str,
        method: CompareMethod,
    ) -> super::BoxFuture<'_, Result<bool>> {
        let a = a.to_string();
        let b = b.to_string();
        Box::pin(async move {
            match method {
                CompareMethod::Hash => {
                    let ha = self.hash_file(&a, "sha256").await?;
                    let hb = self.hash_file(&b, "sha256").await?;
                    Ok(ha == hb)
                }
                CompareMethod::Stat => {
                    let sa = self.stat(&a).await?;
                    let sb = self.stat(&b).await?;
                    Ok(sa.size == sb.size && sa.mtime_unix == sb.mtime_unix)
                }
            }
        })
    }

    fn acquire_mirror_lock(&self, path: &str) -> super::BoxFuture<'_, Result<MirrorLockGuard>> {
        let target = self.resolve(path);
        Box::pin(async move {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|e| Self::map_io_err(parent, e))?;
            }
            let target_for_blocking = target.clone();
            tokio::task::spawn_blocking(move || -> Result<MirrorLockGuard> {
                let file = std::fs::OpenOptions::new()
                    .create(true)
                    .write(true)
                    .open(&target_for_blocking)
                    .map_err(|e| FilesystemStorage::map_io_err(&target_for_blocking, e))?;
                file.try_lock_exclusive().map_err(|_| {
                    StorageError::PermissionDenied(target_for_blocking.clone())
                })?;
                Ok(MirrorLockGuard { file: Some(file) })
            })
            .await
            .map_err(|e| StorageError::Io {
                path: target,
                source: std::io::Error::other(e),
            })?
        })
    }

    fn local_root(&self) -> Option<&Path> {
        Some(&self.root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fs_storage() -> (tempfile::TempDir, FilesystemStorage) {
        let dir = tempdir().unwrap();
        let storage = FilesystemStorage::new(dir.path().to_path_buf());
        (dir, storage)
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let (_dir, storage) = fs_storage();
        storage
            .write("simple/foo/index.html", "<html></html>".to_string())
            .await
            .unwrap();
        let read = storage.read("simple/foo/index.html").await.unwrap();
        assert_eq!(read, "<html></html>");
    }

    #[tokio::test]
    async fn write_binary_leaves_no_temp_file_on_success() {
        let (dir, storage) = fs_storage();
        storage
            .write_binary("packages/ab/cd/rest/file.whl", vec![1, 2, 3])
            .await
            .unwrap();
        let mut saw_temp = false;
        for entry in walk_dir_blocking(dir.path()).unwrap() {
            if entry.contains(".tmp-") {
                saw_temp = true;
            }
        }
        assert!(!saw_temp);
    }

    #[tokio::test]
    async fn hash_file_matches_known_sha256() {
        let (_dir, storage) = fs_storage();
        storage
            .write_binary("f.bin", b"hello world".to_vec())
            .await
            .unwrap();
        let digest = storage.hash_file("f.bin", "sha256").await.unwrap();
        assert_eq!(
            digest,
            "b94d27b9934d3e08a52e52d7da7dacefe8efb6da7cdd7e3e0d7c3e9b0d90fc8b"
        );
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let (_dir, storage) = fs_storage();
        let err = storage.read("does/not/exist").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn mirror_lock_is_exclusive() {
        let (_dir, storage) = fs_storage();
        let guard = storage.acquire_mirror_lock(".lock").await.unwrap();
        let err = storage.acquire_mirror_lock(".lock").await;
        assert!(err.is_err());
        drop(guard);
        assert!(storage.acquire_mirror_lock(".lock").await.is_ok());
    }

    #[tokio::test]
    async fn compare_files_stat_mode_catches_same_size_different_mtime() {
        let (dir, storage) = fs_storage();
        storage.write_binary("a.whl", vec![1, 2, 3]).await.unwrap();
        storage.write_binary("b.whl", vec![4, 5, 6]).await.unwrap();

        let earlier = std::time::UNIX_EPOCH + std::time::Duration::from_secs(1_000);
        std::fs::OpenOptions::new()
            .write(true)
            .open(dir.path().join("b.whl"))
            .unwrap()
            .set_modified(earlier)
            .unwrap();

        let same = storage.compare_files("a.whl", "a.whl", CompareMethod::Stat).await.unwrap();
        assert!(same);

        let equal_despite_same_size = storage.compare_files("a.whl", "b.whl", CompareMethod::Stat).await.unwrap();
        assert!(!equal_despite_same_size);
    }
}
