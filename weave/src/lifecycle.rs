//! Workspace lifecycle: spawn, list, status, complete, reconcile.
//!
//! Every mutating operation on a task runs under that task's lock. Multi-step
//! sequences touch git first and the state cache last, so a failure part-way
//! leaves nothing registered.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::core::checklist::{Checkpoint, ValidationResult};
use crate::core::metadata::MetadataRecord;
use crate::core::reconcile::{CachedFact, WorkspaceView, reconcile_views};
use crate::core::types::{Health, Role, Task, WorkspaceState, status};
use crate::error::WeaveError;
use crate::io::completion_log::{CompletionEntry, CompletionRecorder};
use crate::io::config::{Mode, WeaveConfig};
use crate::io::init::{WeavePaths, ensure_layout};
use crate::io::lock::{FileLock, lock_task};
use crate::io::notes::Metadata;
use crate::io::state_cache::{CacheEntry, StateCache, StateRecord};
use crate::io::stores::{Backend, scan_worktree_base};
use crate::validation::{
    inspection_failure, run_message_check, run_post_completion, run_pre_change, run_pre_completion,
};

/// Inputs for `spawn`.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub task: u64,
    pub role: Role,
    /// Descriptive slug; defaults to the role name.
    pub slug: Option<String>,
    pub labels: Vec<String>,
}

/// Options for `complete`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompleteOptions {
    /// Tear down even when the gate fails or the workspace cannot be probed.
    pub force: bool,
    /// Keep the task branch even when HEAD already contains it.
    pub keep_branch: bool,
}

impl CompleteOptions {
    pub fn forced() -> Self {
        Self {
            force: true,
            ..Self::default()
        }
    }
}

/// Outcome of `complete`.
#[derive(Debug, Clone)]
pub enum CompletionOutcome {
    /// Workspace removed; `validation` is the pre-completion result.
    Removed {
        entry: CacheEntry,
        validation: ValidationResult,
        recorded: ValidationResult,
        forced: bool,
        /// The merged task branch was deleted.
        branch_deleted: bool,
    },
    /// Gate failed; nothing changed.
    Rejected(ValidationResult),
}

/// One workspace with everything `status` reports.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceStatus {
    #[serde(flatten)]
    pub view: WorkspaceView,
    pub state: WorkspaceState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MetadataRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_commit: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uncommitted: Option<usize>,
}

/// What `reconcile` saw and changed.
#[derive(Debug, Clone, Serialize)]
pub struct ReconcileReport {
    pub views: Vec<WorkspaceView>,
    /// Tasks whose cached health changed.
    pub updated: Vec<u64>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.views.iter().all(|view| view.health.is_healthy())
    }
}

/// Lifecycle operations over a backend.
pub struct Lifecycle<'a, B: Backend + ?Sized> {
    pub(crate) paths: &'a WeavePaths,
    pub(crate) cfg: &'a WeaveConfig,
    pub(crate) backend: &'a B,
    recorder: &'a dyn CompletionRecorder,
}

impl<'a, B: Backend + ?Sized> Lifecycle<'a, B> {
    pub fn new(
        paths: &'a WeavePaths,
        cfg: &'a WeaveConfig,
        backend: &'a B,
        recorder: &'a dyn CompletionRecorder,
    ) -> Self {
        Self {
            paths,
            cfg,
            backend,
            recorder,
        }
    }

    pub fn cache(&self) -> StateCache {
        StateCache::new(
            &self.paths.state_path,
            &self.paths.locks_dir,
            self.cfg.lock_backoff(),
        )
    }

    pub fn metadata(&self) -> Metadata<'a, B> {
        Metadata::new(
            self.backend,
            &self.paths.locks_dir,
            self.cfg.lock_backoff(),
            self.cfg.sync_backoff(),
        )
    }

    pub(crate) fn lock(&self, task: u64) -> Result<FileLock> {
        lock_task(&self.paths.locks_dir, task, &self.cfg.lock_backoff())
    }

    /// Reconciled views for the given cache contents. Read-only.
    pub(crate) fn views(&self, state: &StateRecord) -> Result<Vec<WorkspaceView>> {
        let cached: Vec<CachedFact> = state
            .workspaces
            .iter()
            .map(|entry| CachedFact {
                task: entry.task,
                reference: entry.reference.clone(),
                path: entry.path.clone(),
                exists: entry.path.is_dir(),
            })
            .collect();
        let registry = self.backend.registered_workspaces()?;
        let disk = scan_worktree_base(&self.paths.worktree_base(self.cfg))?;
        Ok(reconcile_views(&cached, &registry, &disk))
    }

    /// Create the task's branch (if needed), worktree, and metadata, then
    /// register it.
    #[instrument(skip_all, fields(task = request.task, role = %request.role))]
    pub fn spawn(&self, request: &SpawnRequest) -> Result<CacheEntry> {
        let task = Task::new(request.task, request.role, request.slug.as_deref())?;
        let _lock = self.lock(task.id)?;
        ensure_layout(self.paths)?;

        let cache = self.cache();
        let state = cache.load()?;
        if let Some(existing) = state.get(task.id) {
            return Err(WeaveError::AlreadyActive {
                task: task.id,
                path: existing.path.display().to_string(),
            }
            .into());
        }
        if let Some(view) = self.views(&state)?.into_iter().find(|v| v.task == task.id) {
            return Err(WeaveError::CorruptedState {
                task: task.id,
                detail: format!("untracked workspace {} at {}", view.reference, view.path.display()),
            }
            .into());
        }

        let name = task.canonical_name.as_str();
        let path = self.paths.workspace_path(self.cfg, name);
        let base = if self.backend.reference_exists(name)? {
            debug!(reference = name, "reusing existing reference");
            self.backend.fork_point(name)?
        } else {
            Some(self.backend.create_reference(name)?)
        };

        self.backend
            .add_workspace(&path, name)
            .with_context(|| format!("create workspace for task {}", task.id))?;
        advance(task.id, WorkspaceState::Requested, WorkspaceState::Created);

        let mut record = MetadataRecord::new(task.role, status::ACTIVE);
        record.labels = request.labels.iter().cloned().collect();
        record.skills = self
            .cfg
            .route_skills(request.labels.iter().map(String::as_str));
        if let Err(err) = self.metadata().set(name, &record, None) {
            self.discard_workspace(&path);
            return Err(err.context(format!("write metadata for task {}", task.id)));
        }

        let entry = CacheEntry {
            task: task.id,
            reference: task.canonical_name.clone(),
            path: path.clone(),
            role: task.role,
            created_at: task.created_at,
            base,
            health: Health::Healthy,
        };
        if let Err(err) = cache.register(entry.clone(), self.cfg.mode) {
            self.discard_workspace(&path);
            return Err(err.context(format!("register task {}", task.id)));
        }
        advance(task.id, WorkspaceState::Created, WorkspaceState::Active);
        info!(task = task.id, path = %path.display(), "workspace spawned");
        Ok(entry)
    }

    fn discard_workspace(&self, path: &Path) {
        if let Err(err) = self.backend.remove_workspace(path, true) {
            warn!(path = %path.display(), err = %err, "failed to roll back workspace");
        }
    }

    /// Union of cache, registry and disk with health flags. Never mutates.
    pub fn list(&self) -> Result<Vec<WorkspaceView>> {
        let state = self.cache().load()?;
        self.views(&state)
    }

    pub fn status(&self, task: u64) -> Result<WorkspaceStatus> {
        let state = self.cache().load()?;
        let view = self
            .views(&state)?
            .into_iter()
            .find(|view| view.task == task)
            .ok_or(WeaveError::UnknownTask { task })?;
        let entry = state.get(task);

        let metadata = match self.metadata().get(&view.reference) {
            Ok(observed) => observed.map(|observed| observed.record),
            Err(err) => {
                warn!(task, err = %err, "metadata unreadable");
                None
            }
        };
        let last_commit = if self.backend.reference_exists(&view.reference)? {
            self.backend.last_commit_time(&view.reference)?
        } else {
            None
        };
        let uncommitted = if view.on_disk && view.path.is_dir() {
            Some(self.backend.uncommitted_count(&view.path)?)
        } else {
            None
        };
        let state = derive_state(
            view.health,
            view.in_cache,
            metadata.as_ref().map(|record| record.status.as_str()),
        );
        Ok(WorkspaceStatus {
            role: entry
                .map(|entry| entry.role)
                .or_else(|| metadata.as_ref().and_then(MetadataRecord::role)),
            created_at: entry.map(|entry| entry.created_at),
            view,
            state,
            metadata,
            last_commit,
            uncommitted,
        })
    }

    /// Run the completion gate and, on pass or `force`, tear the workspace down.
    #[instrument(skip_all, fields(task = task, force = options.force))]
    pub fn complete(&self, task: u64, options: CompleteOptions) -> Result<CompletionOutcome> {
        let force = options.force;
        let _lock = self.lock(task)?;
        let cache = self.cache();
        let state = cache.load()?;
        let entry = state
            .get(task)
            .cloned()
            .ok_or(WeaveError::UnknownTask { task })?;
        let view = self
            .views(&state)?
            .into_iter()
            .find(|view| view.task == task);
        if let Some(view) = view.filter(|view| !view.health.is_healthy()) {
            return Err(WeaveError::CorruptedState {
                task,
                detail: format!("workspace is {}", view.health),
            }
            .into());
        }

        let validation = match run_pre_completion(self.backend, self.cfg, &entry) {
            Ok(validation) => validation,
            Err(err) if force => {
                warn!(task, err = %format!("{err:#}"), "workspace not inspectable, forcing completion");
                inspection_failure(&err)
            }
            Err(err) => return Err(err),
        };
        if !validation.passed && !force {
            info!(task, failed = ?validation.failed(), "completion rejected");
            return Ok(CompletionOutcome::Rejected(validation));
        }
        if !validation.passed {
            warn!(task, failed = ?validation.failed(), "completing despite failed checks");
        }

        let metadata = self.metadata();
        let seed = || MetadataRecord::new(entry.role, status::ACTIVE);
        advance(task, WorkspaceState::Active, WorkspaceState::Completing);
        metadata.update(&entry.reference, seed, |record| {
            record.status = status::COMPLETING.to_string();
        })?;

        if let Some(remote) = self.cfg.remote()
            && let Err(err) = self.publish(remote, &entry.reference)
        {
            advance(task, WorkspaceState::Completing, WorkspaceState::Active);
            metadata.update(&entry.reference, seed, |record| {
                record.status = status::ACTIVE.to_string();
            })?;
            return Err(err);
        }

        self.backend
            .remove_workspace(&entry.path, force)
            .with_context(|| format!("remove workspace for task {task}"))?;
        advance(task, WorkspaceState::Completing, WorkspaceState::Removed);

        // The worktree is gone; the cache must forget it whatever else fails.
        let finalized = metadata
            .update(&entry.reference, seed, |record| {
                record.status = status::COMPLETED.to_string();
                record.last_activity = Some(Utc::now());
            })
            .map(drop);
        cache.deregister(task)?;
        let branch_deleted = !options.keep_branch && self.prune_reference(task, &entry.reference);

        let completed_at = Utc::now();
        let completion = CompletionEntry {
            task,
            reference: entry.reference.clone(),
            role: entry.role,
            completed_at,
            duration_secs: (completed_at - entry.created_at).num_seconds(),
            forced: force && !validation.passed,
            validation: validation.clone(),
        };
        let recorded = run_post_completion(self.recorder, &completion, finalized);
        info!(task, forced = completion.forced, branch_deleted, "workspace removed");
        Ok(CompletionOutcome::Removed {
            entry,
            validation,
            recorded,
            forced: completion.forced,
            branch_deleted,
        })
    }

    /// Delete the task branch once HEAD contains it; unmerged work stays.
    fn prune_reference(&self, task: u64, reference: &str) -> bool {
        match self.backend.delete_reference_if_merged(reference) {
            Ok(true) => {
                info!(task, reference, "merged branch deleted");
                true
            }
            Ok(false) => {
                debug!(task, reference, "branch kept, not merged");
                false
            }
            Err(err) => {
                warn!(task, reference, err = %format!("{err:#}"), "could not delete branch");
                false
            }
        }
    }

    /// Push the branch and notes; in hybrid mode failures only warn.
    fn publish(&self, remote: &str, reference: &str) -> Result<()> {
        let pushed = self
            .cfg
            .sync_backoff()
            .run(
                |attempt| {
                    debug!(remote, reference, attempt, "pushing reference");
                    self.backend.push_reference(remote, reference)
                },
                |_| true,
            )
            .with_context(|| format!("push {reference} to {remote}"))
            .and_then(|()| self.metadata().push(remote));
        match (pushed, self.cfg.mode) {
            (Ok(()), _) => Ok(()),
            (Err(err), Mode::Hybrid) => {
                warn!(remote, reference, err = %format!("{err:#}"), "remote sync failed, continuing");
                Ok(())
            }
            (Err(err), _) => Err(err),
        }
    }

    /// Refresh every cache entry's health from ground truth.
    pub fn reconcile(&self) -> Result<ReconcileReport> {
        let cache = self.cache();
        let views = self.views(&cache.load()?)?;
        let updated = cache.update(|state| {
            let mut updated = Vec::new();
            for entry in &mut state.workspaces {
                let Some(view) = views.iter().find(|view| view.task == entry.task) else {
                    continue;
                };
                if entry.health != view.health {
                    entry.health = view.health;
                    updated.push(entry.task);
                }
            }
            updated
        })?;
        if !updated.is_empty() {
            info!(?updated, "cache health updated");
        }
        Ok(ReconcileReport { views, updated })
    }

    /// Run one checkpoint for a tracked task.
    pub fn run_checkpoint(
        &self,
        checkpoint: Checkpoint,
        task: u64,
        message: Option<&str>,
    ) -> Result<ValidationResult> {
        let entry = self
            .cache()
            .entry(task)?
            .ok_or(WeaveError::UnknownTask { task })?;
        match checkpoint {
            Checkpoint::PreChange => match message {
                Some(message) if !entry.path.is_dir() => Ok(run_message_check(self.cfg, message)),
                _ => run_pre_change(self.backend, self.cfg, &entry.path, message),
            },
            Checkpoint::PreCompletion => run_pre_completion(self.backend, self.cfg, &entry),
            Checkpoint::PostCompletion => Err(WeaveError::identifier(
                checkpoint.as_str(),
                "runs only as part of `weave complete`",
            )
            .into()),
        }
    }

    pub fn workspace_path(&self, canonical_name: &str) -> PathBuf {
        self.paths.workspace_path(self.cfg, canonical_name)
    }
}

/// Record a lifecycle step. Every call site names a legal edge of the
/// transition table.
pub(crate) fn advance(task: u64, from: WorkspaceState, to: WorkspaceState) {
    debug_assert!(
        from.can_transition_to(to),
        "illegal workspace transition {from} -> {to}"
    );
    debug!(task, %from, %to, "workspace transition");
}

/// Lifecycle state implied by health, tracking and the metadata status.
pub fn derive_state(health: Health, in_cache: bool, metadata_status: Option<&str>) -> WorkspaceState {
    if !health.is_healthy() {
        return WorkspaceState::Corrupted;
    }
    if !in_cache {
        return WorkspaceState::Created;
    }
    match metadata_status {
        Some(status::COMPLETING) => WorkspaceState::Completing,
        _ => WorkspaceState::Active,
    }
}
