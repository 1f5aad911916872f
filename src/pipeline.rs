//! Package Pipeline (C4): fetch metadata → filter → download missing
//! artifacts → publish index files → publish JSON. One call to
//! `process_project` is the unit of work the Worker Pool (C5) fans out.

use crate::client::{ClientError, PypiClient};
use crate::config::{CompareMethod, MirrorConfig};
use crate::error::ErrorKind;
use crate::events::{emit, EventSink};
use crate::events::SyncEvent;
use crate::filters::release::parse_iso8601_to_unix;
use crate::filters::FilterChain;
use crate::index;
use crate::model::{Release, ReleaseFile, Serial};
use crate::storage::{Storage, StorageError};
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;

const MAX_STALE_RETRIES: u32 = 3;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Index(#[from] crate::index::IndexError),
    #[error("metadata for {project} stayed stale after {attempts} attempts")]
    StaleMetadataExhausted { project: String, attempts: u32 },
    #[error("this build's storage backend has no local filesystem root, so artifacts can't be streamed to a temp path before the atomic rename")]
    NoLocalRoot,
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Client(e) => e.kind(),
            PipelineError::Storage(_) | PipelineError::Index(_) => ErrorKind::LocalIo,
            PipelineError::StaleMetadataExhausted { .. } => ErrorKind::StaleMetadata,
            PipelineError::NoLocalRoot => ErrorKind::LocalIo,
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Clone)]
pub enum PipelineOutcome {
    /// Project was fetched, filtered, diffed, and published.
    Synced {
        files_downloaded: u64,
        bytes: u64,
        releases_kept: usize,
        /// On-mirror paths created or updated this run,
        /// flushed to the configured diff file by the Controller at
        /// FINALIZE.
        paths: Vec<String>,
    },
    /// Project is gone upstream, or every release was filtered out; any
    /// local state for it was removed.
    Removed,
}

/// Borrowed collaborators shared across every pipeline invocation in a run.
/// Cheaply `Copy`-able by re-borrowing, so the worker pool can hand one to
/// each concurrent task without cloning the underlying client/storage.
#[derive(Clone, Copy)]
pub struct PipelineContext<'a> {
    pub storage: &'a dyn Storage,
    pub client: &'a PypiClient,
    pub filters: &'a FilterChain,
    pub cfg: &'a MirrorConfig,
}

/// `web/` is the on-disk root for everything servable;
/// `status`/`generation`/`todo` live one level up, outside this prefix.
pub(crate) fn web_path(relative: &str) -> String {
    format!("web/{relative}")
}

pub async fn process_project(
    ctx: PipelineContext<'_>,
    project: &str,
    expected_serial: Serial,
    events: &EventSink,
) -> Result<PipelineOutcome> {
    emit(events, SyncEvent::ProjectStarted { project: project.to_string() });

    let metadata = match fetch_with_stale_retry(&ctx, project, expected_serial).await {
        Ok(m) => m,
        Err(PipelineError::Client(ClientError::NotFound(_))) => {
            delete_local_project(ctx, project).await?;
            emit(
                events,
                SyncEvent::ProjectSkipped {
                    project: project.to_string(),
                    reason: "not found upstream".into(),
                },
            );
            return Ok(PipelineOutcome::Removed);
        }
        Err(e) => {
            emit(
                events,
                SyncEvent::ProjectFailed { project: project.to_string(), reason: e.to_string() },
            );
            return Err(e);
        }
    };

    // The simple index must also resolve to JSON for this project: a project
    // whose `/simple/<project>/` still serves legacy HTML is fatal, per the
    // Upstream Client's no-HTML-fallback contract, even though its Warehouse
    // JSON fetch above already succeeded.
    match ctx.client.fetch_simple_json(project).await {
        Ok(_) => {}
        Err(ClientError::NotFound(_)) => {
            delete_local_project(ctx, project).await?;
            emit(
                events,
                SyncEvent::ProjectSkipped { project: project.to_string(), reason: "not found upstream".into() },
            );
            return Ok(PipelineOutcome::Removed);
        }
        Err(e) => {
            emit(events, SyncEvent::ProjectFailed { project: project.to_string(), reason: e.to_string() });
            return Err(e.into());
        }
    }

    let previously_mirrored = previously_mirrored_versions(ctx, project).await?;
    let filtered = ctx
        .filters
        .apply(&metadata.project, &metadata.raw, &previously_mirrored);

    let Some(releases) = filtered else {
        delete_local_project(ctx, project).await?;
        emit(
            events,
            SyncEvent::ProjectSkipped {
                project: project.to_string(),
                reason: "dropped by filter chain".into(),
            },
        );
        return Ok(PipelineOutcome::Removed);
    };

    let planned: Vec<&ReleaseFile> = releases.values().flat_map(|r| r.files.iter()).collect();

    let mut files_downloaded = 0u64;
    let mut bytes = 0u64;
    let mut paths = Vec::new();
    for file in &planned {
        if needs_download(ctx, file).await? {
            emit(
                events,
                SyncEvent::DownloadStarted { project: project.to_string(), filename: file.filename.clone() },
            );
            let size = download_one(ctx, file).await?;
            files_downloaded += 1;
            bytes += size;
            paths.push(web_path(&file.canonical_path()));
            emit(
                events,
                SyncEvent::DownloadFinished {
                    project: project.to_string(),
                    filename: file.filename.clone(),
                    bytes: size,
                },
            );
        }
    }

    publish(ctx, &metadata.project.name, &releases, &metadata.raw, metadata.project.last_serial).await?;
    paths.push(index::project_dir(ctx.cfg, &metadata.project.name));

    emit(
        events,
        SyncEvent::ProjectSucceeded {
            project: project.to_string(),
            files_downloaded,
            bytes,
            releases_kept: releases.len(),
        },
    );

    Ok(PipelineOutcome::Synced {
        files_downloaded,
        bytes,
        releases_kept: releases.len(),
        paths,
    })
}

async fn fetch_with_stale_retry(
    ctx: &PipelineContext<'_>,
    project: &str,
    expected_serial: Serial,
) -> Result<crate::client::ProjectMetadata> {
    let expected = if expected_serial == 0 { None } else { Some(expected_serial) };
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match ctx.client.fetch_project_metadata(project, expected).await {
            Ok(m) => return Ok(m),
            Err(ClientError::StaleMetadata { project, expected, got }) => {
                if attempts >= MAX_STALE_RETRIES {
                    return Err(PipelineError::StaleMetadataExhausted { project, attempts });
                }
                let _ = got;
                let _ = expected;
                continue;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Release versions already mirrored locally, read from the project's prior
/// JSON snapshot (if any) so release filters like latest-N can keep whatever
/// is currently installed rather than churning it on every run.
async fn previously_mirrored_versions(
    ctx: PipelineContext<'_>,
    project: &str,
) -> Result<HashSet<String>> {
    match ctx.storage.read(&web_path(&format!("json/{project}"))).await {
        Ok(text) => {
            let parsed: serde_json::Value = match serde_json::from_str(&text) {
                Ok(v) => v,
                Err(_) => return Ok(HashSet::new()),
            };
            let versions = parsed
                .get("releases")
                .and_then(|v| v.as_object())
                .map(|map| map.keys().cloned().collect())
                .unwrap_or_default();
            Ok(versions)
        }
        Err(StorageError::NotFound(_)) => Ok(HashSet::new()),
        Err(e) => Err(e.into()),
    }
}

pub(crate) async fn needs_download(ctx: PipelineContext<'_>, file: &ReleaseFile) -> Result<bool> {
    let path = web_path(&file.canonical_path());
    if !ctx.storage.exists(&path).await? {
        return Ok(true);
    }
    match ctx.cfg.compare_method {
        CompareMethod::Hash => {
            let digest = ctx.storage.hash_file(&path, "sha256").await?;
            Ok(!digest.eq_ignore_ascii_case(&file.digests.sha256))
        }
        CompareMethod::Stat => {
            let stat = ctx.storage.stat(&path).await?;
            if stat.size != file.size {
                return Ok(true);
            }
            match (stat.mtime_unix, file.upload_time.as_deref().and_then(parse_iso8601_to_unix)) {
                (Some(local), Some(expected)) => Ok(local != expected),
                // No recorded upload time to compare against, or the
                // backend doesn't report mtime: size match is all we have.
                _ => Ok(false),
            }
        }
    }
}

/// Streams bytes to a sibling temp path via the Upstream Client (hashing as
/// they arrive), then hands off to the storage abstraction's atomic `mv` so
/// the canonical content-addressed path never observes a partial file.
pub(crate) async fn download_one(ctx: PipelineContext<'_>, file: &ReleaseFile) -> Result<u64> {
    let root = ctx.storage.local_root().ok_or(PipelineError::NoLocalRoot)?;
    let canonical = web_path(&file.canonical_path());
    let temp_rel = format!("{canonical}.part-{}", uuid::Uuid::new_v4());
    let temp_path = root.join(&temp_rel);

    ctx.client
        .stream_artifact(&file.url, &temp_path, &file.digests.sha256, file.size)
        .await?;
    ctx.storage.mv(&temp_rel, &canonical).await?;

    // Stamp the file's mtime with the upstream upload time so a later
    // `compare-method = stat` run can tell a re-upload (same size, new
    // upload time) from an untouched file without re-hashing.
    if let Some(unix) = file.upload_time.as_deref().and_then(parse_iso8601_to_unix) {
        let final_path = root.join(&canonical);
        let _ = set_mtime(final_path, unix).await;
    }

    Ok(file.size)
}

async fn set_mtime(path: std::path::PathBuf, unix_secs: i64) -> std::io::Result<()> {
    tokio::task::spawn_blocking(move || {
        let time = std::time::UNIX_EPOCH + std::time::Duration::from_secs(unix_secs.max(0) as u64);
        std::fs::OpenOptions::new().write(true).open(&path)?.set_modified(time)
    })
    .await
    .map_err(std::io::Error::other)?
}

async fn publish(
    ctx: PipelineContext<'_>,
    project: &str,
    releases: &BTreeMap<String, Release>,
    raw: &serde_json::Value,
    serial: Serial,
) -> Result<()> {
    index::write_project_index(ctx.storage, ctx.cfg, project, releases, serial).await?;
    if ctx.cfg.json {
        index::write_project_json(ctx.storage, project, raw).await?;
    }
    Ok(())
}

/// Removes every on-disk trace of a project: its release files (enumerated
/// from the prior JSON snapshot, since content-addressed files carry no
/// back-reference to their owning project), its index directory, and its
/// JSON metadata.
pub async fn delete_local_project(ctx: PipelineContext<'_>, project: &str) -> Result<()> {
    let json_path = web_path(&format!("json/{project}"));
    if let Ok(text) = ctx.storage.read(&json_path).await
        && let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&text)
        && let Some(releases) = parsed.get("releases").and_then(|v| v.as_object())
    {
        for files in releases.values().filter_map(|v| v.as_array()) {
            for file in files {
                if let Some(sha256) = file.get("digests").and_then(|d| d.get("sha256")).and_then(|v| v.as_str())
                    && let Some(filename) = file.get("filename").and_then(|v| v.as_str())
                {
                    let path = web_path(&crate::model::content_addressed_path(sha256, filename));
                    let _ = ctx.storage.delete(&path).await;
                }
            }
        }
    }

    let dir = index::project_dir(ctx.cfg, project);
    ctx.storage.rmdir(&dir, true).await?;
    let _ = ctx.storage.delete(&json_path).await;
    let _ = ctx.storage.delete(&web_path(&format!("pypi/{project}/json"))).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::PypiClient;
    use crate::filters::FilterChain;
    use crate::model::Digests;
    use crate::storage::FilesystemStorage;

    #[test]
    fn web_path_prefixes_with_web_segment() {
        assert_eq!(web_path("simple/peerme/index.html"), "web/simple/peerme/index.html");
    }

    fn test_file(upload_time: Option<&str>) -> ReleaseFile {
        ReleaseFile {
            url: "https://example.test/x.whl".into(),
            filename: "x.whl".into(),
            packagetype: "bdist_wheel".into(),
            requires_python: None,
            size: 3,
            digests: Digests { sha256: "abc123def456".repeat(6), md5: None },
            yanked: false,
            upload_time: upload_time.map(|s| s.to_string()),
        }
    }

    #[tokio::test]
    async fn stat_mode_redownloads_when_upload_time_moved_despite_matching_size() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = MirrorConfig::from_str(&format!(
            "[mirror]\ndirectory={}\nmaster=https://pypi.org\ncompare-method=stat\n",
            dir.path().display()
        ))
        .unwrap();
        let storage = FilesystemStorage::new(dir.path().to_path_buf());
        let client = PypiClient::from_config(&cfg).unwrap();
        let filters = FilterChain::build(&cfg).unwrap();
        let ctx = PipelineContext { storage: &storage, client: &client, filters: &filters, cfg: &cfg };

        let file = test_file(Some("2023-01-01T00:00:00Z"));
        let path = web_path(&file.canonical_path());
        storage.write_binary(&path, vec![1, 2, 3]).await.unwrap();
        let stamped = parse_iso8601_to_unix("2023-01-01T00:00:00Z").unwrap();
        set_mtime(dir.path().join(&path), stamped).await.unwrap();

        assert!(!needs_download(ctx, &file).await.unwrap());

        let reuploaded = test_file(Some("2024-06-01T00:00:00Z"));
        assert!(needs_download(ctx, &reuploaded).await.unwrap());
    }
}
