//! Mirror Controller (C6): the per-run state machine that ties the other
//! components together.
//!
//! ```text
//! IDLE → ACQUIRE_LOCK → LOAD_CURSOR → DISCOVER → (CLEANUP) → DRAIN → FINALIZE → IDLE
//!                               └──────────── FAILED ────────────────┘
//! ```
//!
//! Every state past ACQUIRE_LOCK runs under the mirror-wide exclusive lock
//! (`MirrorLockGuard`), released by `Drop` on every exit path including the
//! error ones.

use crate::client::{ClientError, PypiClient};
use crate::config::MirrorConfig;
use crate::error::ErrorKind;
use crate::events::{emit, EventSink, SyncEvent};
use crate::filters::{FilterChain, FilterError};
use crate::index;
use crate::model::Serial;
use crate::normalize::normalize;
use crate::pipeline::{self, PipelineContext, PipelineError, PipelineOutcome};
use crate::storage::{self, Storage, StorageError};
use crate::workers::{self, TodoItem, WorkerOutcome};
use std::collections::HashSet;
use thiserror::Error;

/// Bump to invalidate every prior mirror's on-disk state (forces a full
/// resync on the next run against an older `generation` file).
const CURRENT_GENERATION: u64 = 1;

/// Rewrite `todo` to disk after this many completions during DRAIN, so a
/// crash loses at most this many already-finished projects' progress.
const TODO_CHECKPOINT_INTERVAL: usize = 10;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Filter(#[from] FilterError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Index(#[from] crate::index::IndexError),
    #[error("mirror directory is locked by another run")]
    LockContention,
    #[error("{failed} of {attempted} projects failed this run; status was not advanced")]
    RunIncomplete { attempted: usize, failed: usize },
    #[error("io error writing {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
}

impl ControllerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ControllerError::Storage(_) | ControllerError::Index(_) | ControllerError::Io { .. } => {
                ErrorKind::LocalIo
            }
            ControllerError::Client(e) => e.kind(),
            ControllerError::Filter(_) => ErrorKind::Filter,
            ControllerError::Pipeline(e) => e.kind(),
            ControllerError::LockContention => ErrorKind::LocalIo,
            ControllerError::RunIncomplete { .. } => ErrorKind::Cancellation,
        }
    }
}

pub type Result<T> = std::result::Result<T, ControllerError>;

#[derive(Debug, Clone, Copy, Default)]
pub struct MirrorOptions {
    /// `mirror --force-check`: re-diffs every planned file against disk
    /// even though no serial advanced.
    pub force_check: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub target_serial: Serial,
    pub succeeded: usize,
    pub failed: usize,
    pub files_downloaded: u64,
    pub bytes: u64,
}

/// Runs one full `mirror` cycle: discover the changelog delta since the
/// last successful run, drain it through the worker pool, and finalize.
pub async fn run(cfg: &MirrorConfig, options: MirrorOptions, events: &EventSink) -> Result<RunSummary> {
    emit(events, SyncEvent::RunStarted { command: "mirror".into() });

    let storage = storage::open(cfg.storage_backend, cfg.directory.clone())?;
    let client = PypiClient::from_config(cfg)?;
    let filters = FilterChain::build(cfg)?;

    let _lock = acquire_lock(storage.as_ref()).await?;

    let status = load_cursor(storage.as_ref(), options.force_check).await?;
    let (target_serial, mut todo) = discover(storage.as_ref(), &client, status).await?;

    emit(events, SyncEvent::DiscoverComplete { target_serial, todo: todo.len() });

    if cfg.cleanup {
        cleanup_legacy_directories(storage.as_ref(), cfg).await?;
    }

    let ctx = PipelineContext { storage: storage.as_ref(), client: &client, filters: &filters, cfg };
    let summary = drain_and_finalize(ctx, cfg, target_serial, &mut todo, events).await?;

    emit(events, SyncEvent::RunFinished { succeeded: summary.succeeded, failed: summary.failed });
    Ok(summary)
}

/// Processes one named project outside the changelog delta cycle. Still
/// runs under the mirror lock since it writes into the same on-disk tree
/// as a full `mirror` run.
pub async fn sync_one(cfg: &MirrorConfig, project: &str, events: &EventSink) -> Result<PipelineOutcome> {
    emit(events, SyncEvent::RunStarted { command: "sync".into() });

    let storage = storage::open(cfg.storage_backend, cfg.directory.clone())?;
    let client = PypiClient::from_config(cfg)?;
    let filters = FilterChain::build(cfg)?;
    let _lock = acquire_lock(storage.as_ref()).await?;

    let ctx = PipelineContext { storage: storage.as_ref(), client: &client, filters: &filters, cfg };
    let outcome = pipeline::process_project(ctx, project, 0, events).await?;
    index::regenerate_root_index(storage.as_ref(), cfg).await?;
    Ok(outcome)
}

/// Removes named projects and their files,
/// then regenerates the root index once for the whole batch.
pub async fn delete(cfg: &MirrorConfig, projects: &[String], events: &EventSink) -> Result<()> {
    emit(events, SyncEvent::RunStarted { command: "delete".into() });

    let storage = storage::open(cfg.storage_backend, cfg.directory.clone())?;
    let client = PypiClient::from_config(cfg)?;
    let filters = FilterChain::build(cfg)?;
    let _lock = acquire_lock(storage.as_ref()).await?;

    let ctx = PipelineContext { storage: storage.as_ref(), client: &client, filters: &filters, cfg };
    for project in projects {
        pipeline::delete_local_project(ctx, project).await?;
        emit(events, SyncEvent::ProjectSkipped { project: project.clone(), reason: "deleted by operator".into() });
    }
    index::regenerate_root_index(storage.as_ref(), cfg).await?;
    Ok(())
}

async fn acquire_lock(storage: &dyn Storage) -> Result<storage::MirrorLockGuard> {
    storage.acquire_mirror_lock(".lock").await.map_err(|e| match e {
        StorageError::PermissionDenied(_) => ControllerError::LockContention,
        other => other.into(),
    })
}

/// LOAD_CURSOR: reads `generation` and `status`. A `generation` mismatch
/// (or `--force-check`) clears the effective status so DISCOVER performs a
/// full changelog replay instead of a delta since the last cursor.
async fn load_cursor(storage: &dyn Storage, force_check: bool) -> Result<Serial> {
    let on_disk_generation = read_u64(storage, "generation").await?.unwrap_or(CURRENT_GENERATION);
    let status = read_u64(storage, "status").await?.unwrap_or(0);

    let generation_changed = on_disk_generation != CURRENT_GENERATION;
    if generation_changed {
        storage.write("generation", CURRENT_GENERATION.to_string()).await?;
    }

    if force_check || generation_changed {
        Ok(0)
    } else {
        Ok(status)
    }
}

async fn read_u64(storage: &dyn Storage, path: &str) -> Result<Option<u64>> {
    match storage.read(path).await {
        Ok(text) => Ok(text.trim().parse::<u64>().ok()),
        Err(StorageError::NotFound(_)) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// DISCOVER: resumes from a well-formed `todo` file if one exists,
/// otherwise asks the Upstream Client for the changelog delta since
/// `status` and writes a fresh `todo` atomically. A malformed `todo` is
/// treated as absent.
async fn discover(storage: &dyn Storage, client: &PypiClient, status: Serial) -> Result<(Serial, Vec<TodoItem>)> {
    if let Ok(text) = storage.read("todo").await
        && let Some(parsed) = parse_todo(&text)
    {
        return Ok(parsed);
    }

    let delta = client.changelog_since(status).await?;
    let todo: Vec<TodoItem> = delta
        .changed
        .into_iter()
        .map(|(project, serial)| TodoItem { project, serial })
        .collect();
    write_todo(storage, delta.current_serial, &todo).await?;
    Ok((delta.current_serial, todo))
}

fn parse_todo(text: &str) -> Option<(Serial, Vec<TodoItem>)> {
    let mut lines = text.lines();
    let target_serial: Serial = lines.next()?.trim().parse().ok()?;
    let mut items = Vec::new();
    for line in lines {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (project, serial) = line.split_once('\t')?;
        items.push(TodoItem { project: project.to_string(), serial: serial.trim().parse().ok()? });
    }
    Some((target_serial, items))
}

async fn write_todo(storage: &dyn Storage, target_serial: Serial, items: &[TodoItem]) -> Result<()> {
    let mut text = format!("{target_serial}\n");
    for item in items {
        text.push_str(&item.project);
        text.push('\t');
        text.push_str(&item.serial.to_string());
        text.push('\n');
    }
    storage.write("todo", text).await?;
    Ok(())
}

/// Removes project directories under `web/simple/` whose name is not
/// already PEP 503-normalized — left behind by a mirror predating
/// normalization, or by a config change (Design Notes: made a distinct
/// phase between DISCOVER and DRAIN to avoid racing concurrent
/// publication).
async fn cleanup_legacy_directories(storage: &dyn Storage, cfg: &MirrorConfig) -> Result<()> {
    let roots: Vec<String> = if cfg.hash_index {
        let mut out = Vec::new();
        for letter in storage.scandir("web/simple/").await.unwrap_or_default() {
            out.push(format!("web/simple/{letter}/"));
        }
        out
    } else {
        vec!["web/simple/".to_string()]
    };

    for root in roots {
        for entry in storage.scandir(&root).await.unwrap_or_default() {
            if entry.contains('.') {
                continue;
            }
            if entry != normalize(&entry) {
                storage.rmdir(&format!("{root}{entry}/"), true).await?;
            }
        }
    }
    Ok(())
}

/// DRAIN + FINALIZE. Returns `RunIncomplete` (keeping `todo` intact for the
/// remaining/failed projects) when anything failed; otherwise advances
/// `status`, deletes `todo`, regenerates the root index, and flushes the
/// diff file.
async fn drain_and_finalize(
    ctx: PipelineContext<'_>,
    cfg: &MirrorConfig,
    target_serial: Serial,
    todo: &mut Vec<TodoItem>,
    events: &EventSink,
) -> Result<RunSummary> {
    if todo.is_empty() {
        let previous_status = read_u64(ctx.storage, "status").await?.unwrap_or(0);
        if previous_status == target_serial {
            // Empty changelog, serial unchanged: nothing to do, so leave
            // status/todo/indexes untouched rather than rewrite them.
            return Ok(RunSummary { target_serial, succeeded: 0, failed: 0, files_downloaded: 0, bytes: 0 });
        }
    }

    let attempted = todo.len();
    let mut succeeded = 0usize;
    let mut failed = 0usize;
    let mut files_downloaded = 0u64;
    let mut bytes = 0u64;
    let mut diff_paths: Vec<String> = Vec::new();
    let mut remaining: HashSet<String> = todo.iter().map(|t| t.project.clone()).collect();
    let mut since_checkpoint = 0usize;

    let work = |item: TodoItem| async move {
        pipeline::process_project(ctx, &item.project, item.serial, events)
            .await
            .map_err(|e| e.to_string())
    };

    let results = workers::drain(std::mem::take(todo), cfg.workers, cfg.stop_on_error, work, |_| {}).await;

    for outcome in results {
        match outcome {
            WorkerOutcome::Succeeded { project, outcome } => {
                succeeded += 1;
                remaining.remove(&project);
                if let PipelineOutcome::Synced { files_downloaded: f, bytes: b, paths, .. } = outcome {
                    files_downloaded += f;
                    bytes += b;
                    diff_paths.extend(paths);
                }
            }
            WorkerOutcome::Failed { project, .. } => {
                failed += 1;
                let _ = project;
            }
            WorkerOutcome::Cancelled { project } => {
                failed += 1;
                let _ = project;
            }
        }
        since_checkpoint += 1;
        if since_checkpoint >= TODO_CHECKPOINT_INTERVAL {
            let rest: Vec<TodoItem> = remaining.iter().map(|p| TodoItem { project: p.clone(), serial: 0 }).collect();
            write_todo(ctx.storage, target_serial, &rest).await?;
            since_checkpoint = 0;
        }
    }

    if failed > 0 {
        let rest: Vec<TodoItem> = remaining.into_iter().map(|p| TodoItem { project: p, serial: 0 }).collect();
        write_todo(ctx.storage, target_serial, &rest).await?;
        return Err(ControllerError::RunIncomplete { attempted, failed });
    }

    let previous_status = read_u64(ctx.storage, "status").await?.unwrap_or(0);
    ctx.storage.write("status", target_serial.to_string()).await?;
    emit(events, SyncEvent::SerialAdvanced { from: previous_status, to: target_serial });
    let _ = ctx.storage.delete("todo").await;
    index::regenerate_root_index(ctx.storage, cfg).await?;
    flush_diff_file(cfg, &diff_paths).await?;

    Ok(RunSummary { target_serial, succeeded, failed, files_downloaded, bytes })
}

/// The diff file is a plain host-filesystem artifact for external tooling
/// to tail, independent of the mirror's storage backend (it may point
/// outside the mirror directory entirely), so it's written directly rather
/// than through the `Storage` abstraction.
async fn flush_diff_file(cfg: &MirrorConfig, paths: &[String]) -> Result<()> {
    let Some(base) = &cfg.diff_file else {
        return Ok(());
    };
    let path = if cfg.diff_append_epoch {
        let epoch = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let mut p = base.clone();
        let suffix = format!(".{epoch}");
        p.as_mut_os_string().push(suffix);
        p
    } else {
        base.clone()
    };
    let contents = paths.join("\n");
    tokio::fs::write(&path, contents)
        .await
        .map_err(|source| ControllerError::Io { path, source })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_todo_reads_target_serial_and_items() {
        let text = "42\npeerme\t40\nnumpy\t41\n";
        let (target, items) = parse_todo(text).unwrap();
        assert_eq!(target, 42);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].project, "peerme");
        assert_eq!(items[0].serial, 40);
    }

    #[test]
    fn parse_todo_rejects_non_numeric_first_line() {
        assert!(parse_todo("not-a-number\npeerme\t1\n").is_none());
    }

    #[test]
    fn parse_todo_rejects_malformed_item_line() {
        assert!(parse_todo("1\npeerme-missing-tab\n").is_none());
    }

    #[test]
    fn parse_todo_accepts_target_serial_with_no_items() {
        let (target, items) = parse_todo("7\n").unwrap();
        assert_eq!(target, 7);
        assert!(items.is_empty());
    }
}
