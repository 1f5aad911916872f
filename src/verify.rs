//! Verify/Repair (C7): walks every mirrored project, reconciles it against
//! authoritative upstream metadata, and repairs what it finds wrong.
//!
//! Unlike the Package Pipeline, verify never consults the Filter Chain —
//! it reconciles whatever is already on disk against upstream truth rather
//! than deciding what should be mirrored in the first place.

use crate::client::{ClientError, PypiClient};
use crate::config::MirrorConfig;
use crate::error::ErrorKind;
use crate::events::{emit, EventSink, SyncEvent};
use crate::filters::{FilterChain, FilterError};
use crate::index;
use crate::pipeline::{self, PipelineContext, PipelineError};
use crate::storage::{self, StorageError};
use crate::workers::{self, TodoItem, WorkerOutcome};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Index(#[from] crate::index::IndexError),
    #[error(transparent)]
    Filter(#[from] FilterError),
    #[error("mirror directory is locked by another run")]
    LockContention,
}

impl VerifyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            VerifyError::Storage(_) | VerifyError::Index(_) => ErrorKind::LocalIo,
            VerifyError::Client(e) => e.kind(),
            VerifyError::Pipeline(e) => e.kind(),
            VerifyError::Filter(_) => ErrorKind::Filter,
            VerifyError::LockContention => ErrorKind::LocalIo,
        }
    }
}

pub type Result<T> = std::result::Result<T, VerifyError>;

#[derive(Debug, Clone, Copy, Default)]
pub struct VerifyOptions {
    /// Remove a project's tree when it's no longer known upstream.
    pub delete: bool,
    /// Regenerate a project's JSON metadata mirror after reconciling it.
    pub json_update: bool,
    /// Report what would change without writing or deleting anything.
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default)]
pub struct VerifySummary {
    pub checked: usize,
    pub removed: usize,
    pub repaired_files: usize,
    pub failed: usize,
}

enum ProjectVerifyOutcome {
    Removed,
    Checked { repaired_files: usize },
}

pub async fn run(cfg: &MirrorConfig, options: VerifyOptions, events: &EventSink) -> Result<VerifySummary> {
    emit(events, SyncEvent::RunStarted { command: "verify".into() });

    let storage = storage::open(cfg.storage_backend, cfg.directory.clone())?;
    let client = PypiClient::from_config(cfg)?;
    let filters = FilterChain::build(cfg)?;

    let _lock = storage.acquire_mirror_lock(".lock").await.map_err(|e| match e {
        StorageError::PermissionDenied(_) => VerifyError::LockContention,
        other => other.into(),
    })?;

    let projects = index::discover_mirrored_projects(storage.as_ref(), cfg).await?;
    let ctx = PipelineContext { storage: storage.as_ref(), client: &client, filters: &filters, cfg };

    let todo: Vec<TodoItem> = projects.into_iter().map(|project| TodoItem { project, serial: 0 }).collect();
    let work = |item: TodoItem| async move {
        verify_project(ctx, &item.project, options, events)
            .await
            .map_err(|e| e.to_string())
    };
    let results = workers::drain(todo, cfg.verifiers, false, work, |_| {}).await;

    let mut summary = VerifySummary::default();
    for outcome in results {
        match outcome {
            WorkerOutcome::Succeeded { outcome: ProjectVerifyOutcome::Removed, .. } => summary.removed += 1,
            WorkerOutcome::Succeeded {
                outcome: ProjectVerifyOutcome::Checked { repaired_files },
                ..
            } => {
                summary.checked += 1;
                summary.repaired_files += repaired_files;
            }
            WorkerOutcome::Failed { project, error } => {
                summary.failed += 1;
                emit(events, SyncEvent::ProjectFailed { project, reason: error });
            }
            WorkerOutcome::Cancelled { .. } => {}
        }
    }

    if !options.dry_run {
        index::regenerate_root_index(storage.as_ref(), cfg).await?;
    }
    emit(
        events,
        SyncEvent::RunFinished { succeeded: summary.checked + summary.removed, failed: summary.failed },
    );
    Ok(summary)
}

async fn verify_project(
    ctx: PipelineContext<'_>,
    project: &str,
    options: VerifyOptions,
    events: &EventSink,
) -> Result<ProjectVerifyOutcome> {
    let metadata = match ctx.client.fetch_project_metadata(project, None).await {
        Ok(m) => m,
        Err(ClientError::NotFound(_)) => {
            if options.delete && !options.dry_run {
                pipeline::delete_local_project(ctx, project).await?;
            }
            emit(
                events,
                SyncEvent::ProjectSkipped { project: project.to_string(), reason: "not found upstream".into() },
            );
            return Ok(ProjectVerifyOutcome::Removed);
        }
        Err(e) => return Err(e.into()),
    };

    let mut repaired_files = 0usize;
    for file in metadata.project.all_files() {
        let path = pipeline::web_path(&file.canonical_path());
        let matches = match ctx.storage.exists(&path).await? {
            false => false,
            true => ctx
                .storage
                .hash_file(&path, "sha256")
                .await?
                .eq_ignore_ascii_case(&file.digests.sha256),
        };
        if matches {
            continue;
        }

        repaired_files += 1;
        emit(
            events,
            SyncEvent::VerifyRepaired { project: project.to_string(), filename: file.filename.clone() },
        );
        if !options.dry_run {
            let _ = ctx.storage.delete(&path).await;
            pipeline::download_one(ctx, file).await?;
        }
    }

    if options.json_update && !options.dry_run {
        index::write_project_index(
            ctx.storage,
            ctx.cfg,
            project,
            &metadata.project.releases,
            metadata.project.last_serial,
        )
        .await?;
        if ctx.cfg.json {
            index::write_project_json(ctx.storage, project, &metadata.raw).await?;
        }
    }

    Ok(ProjectVerifyOutcome::Checked { repaired_files })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_defaults_to_all_zero() {
        let summary = VerifySummary::default();
        assert_eq!(summary.checked, 0);
        assert_eq!(summary.removed, 0);
        assert_eq!(summary.repaired_files, 0);
        assert_eq!(summary.failed, 0);
    }
}
