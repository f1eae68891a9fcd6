//! Operator-invoked repair of cache/registry/filesystem divergence.
//!
//! Never runs automatically: `reconcile` only flags problems, `recover`
//! fixes one task at a time under that task's lock.

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::core::metadata::MetadataRecord;
use crate::core::reconcile::WorkspaceView;
use crate::core::types::{Health, Role, WorkspaceState, status};
use crate::error::WeaveError;
use crate::io::state_cache::CacheEntry;
use crate::io::stores::Backend;
use crate::lifecycle::{Lifecycle, advance};

/// A single repair step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecoveryAction {
    /// Stale registry entries pruned.
    PrunedRegistry,
    /// Cache entry for a vanished workspace dropped.
    DroppedEntry,
    /// Worktree re-linked with `git worktree repair`.
    RepairedWorkspace,
    /// Cache entry rebuilt for a workspace found on disk or in the registry.
    RestoredEntry,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecoveryReport {
    pub task: u64,
    pub actions: Vec<RecoveryAction>,
    /// Health after the repair; `None` when nothing anywhere knows the task.
    pub health: Option<Health>,
}

impl RecoveryReport {
    pub fn is_noop(&self) -> bool {
        self.actions.is_empty()
    }
}

impl<B: Backend + ?Sized> Lifecycle<'_, B> {
    /// Repair one task. Idempotent: a healthy or unknown task is left alone.
    #[instrument(skip_all, fields(task = task))]
    pub fn recover(&self, task: u64) -> Result<RecoveryReport> {
        let _lock = self.lock(task)?;
        let cache = self.cache();
        let state = cache.load()?;
        let view = self
            .views(&state)?
            .into_iter()
            .find(|view| view.task == task);
        let Some(view) = view else {
            info!(task, "nothing to recover");
            return Ok(report(task, Vec::new(), None));
        };

        match (view.in_cache, view.on_disk, view.registered) {
            (true, false, _) => self.drop_stale(task, &view),
            (false, _, _) => self.restore_entry(task, &view),
            (true, true, false) => {
                self.repair(task, &view)?;
                advance(task, WorkspaceState::Corrupted, WorkspaceState::Active);
                Ok(report(
                    task,
                    vec![RecoveryAction::RepairedWorkspace],
                    Some(Health::Healthy),
                ))
            }
            (true, true, true) => Ok(report(task, Vec::new(), Some(view.health))),
        }
    }

    /// Workspace gone: forget it everywhere but keep the branch.
    fn drop_stale(&self, task: u64, view: &WorkspaceView) -> Result<RecoveryReport> {
        self.backend.prune_workspaces()?;
        let mut actions = vec![RecoveryAction::PrunedRegistry];
        let entry = self.cache().entry(task)?;
        self.cache().deregister(task)?;
        actions.push(RecoveryAction::DroppedEntry);
        advance(task, WorkspaceState::Corrupted, WorkspaceState::Removed);

        let role = entry.map_or(Role::Implementer, |entry| entry.role);
        if let Err(err) = self.metadata().update(
            &view.reference,
            || MetadataRecord::new(role, status::ORPHANED),
            |record| {
                record.status = status::ORPHANED.to_string();
                record.last_activity = Some(Utc::now());
            },
        ) {
            warn!(task, err = %format!("{err:#}"), "could not mark metadata orphaned");
        }
        info!(task, reference = %view.reference, "stale workspace dropped");
        Ok(report(task, actions, Some(Health::Orphaned)))
    }

    /// Workspace present but untracked: rebuild the cache entry.
    fn restore_entry(&self, task: u64, view: &WorkspaceView) -> Result<RecoveryReport> {
        let mut actions = Vec::new();
        if !view.registered {
            self.repair(task, view)?;
            actions.push(RecoveryAction::RepairedWorkspace);
        }
        let metadata = match self.metadata().get(&view.reference) {
            Ok(observed) => observed.map(|observed| observed.record),
            Err(err) => {
                warn!(task, err = %format!("{err:#}"), "metadata unreadable, assuming defaults");
                None
            }
        };
        let role = metadata
            .as_ref()
            .and_then(MetadataRecord::role)
            .unwrap_or(Role::Implementer);
        let base = if self.backend.reference_exists(&view.reference)? {
            self.backend.fork_point(&view.reference)?
        } else {
            None
        };
        let entry = CacheEntry {
            task,
            reference: view.reference.clone(),
            path: view.path.clone(),
            role,
            created_at: Utc::now(),
            base,
            health: Health::Healthy,
        };
        self.cache().register(entry, self.cfg.mode)?;
        actions.push(RecoveryAction::RestoredEntry);
        advance(task, WorkspaceState::Corrupted, WorkspaceState::Active);

        let seed = || MetadataRecord::new(role, status::RECOVERED);
        self.metadata().update(&view.reference, seed, |record| {
            record.status = status::RECOVERED.to_string();
            record.last_activity = Some(Utc::now());
        })?;
        info!(task, path = %view.path.display(), "cache entry restored");
        Ok(report(task, actions, Some(Health::Healthy)))
    }

    fn repair(&self, task: u64, view: &WorkspaceView) -> Result<()> {
        self.backend.repair_workspace(&view.path).map_err(|err| {
            WeaveError::CorruptedState {
                task,
                detail: format!("worktree repair failed for {}: {err:#}", view.path.display()),
            }
            .into()
        })
    }
}

fn report(task: u64, actions: Vec<RecoveryAction>, health: Option<Health>) -> RecoveryReport {
    RecoveryReport {
        task,
        actions,
        health,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::WorkspaceState;
    use crate::io::config::WeaveConfig;
    use crate::io::init::WeavePaths;
    use crate::lifecycle::SpawnRequest;
    use crate::test_support::{FakeBackend, FakeRecorder};

    fn spawn(lifecycle: &Lifecycle<'_, FakeBackend>, task: u64, role: Role) -> CacheEntry {
        lifecycle
            .spawn(&SpawnRequest {
                task,
                role,
                slug: None,
                labels: Vec::new(),
            })
            .expect("spawn")
    }

    #[test]
    fn deleted_directory_is_dropped_and_reported_orphaned() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = WeavePaths::new(temp.path());
        let cfg = WeaveConfig::default();
        let backend = FakeBackend::new(temp.path());
        let recorder = FakeRecorder::default();
        let lifecycle = Lifecycle::new(&paths, &cfg, &backend, &recorder);
        let entry = spawn(&lifecycle, 21, Role::Reviewer);
        std::fs::remove_dir_all(&entry.path).expect("delete");

        let report = lifecycle.recover(21).expect("recover");
        assert_eq!(report.health, Some(Health::Orphaned));
        assert_eq!(
            report.actions,
            vec![RecoveryAction::PrunedRegistry, RecoveryAction::DroppedEntry]
        );
        assert!(lifecycle.cache().entry(21).expect("entry").is_none());
        assert_eq!(backend.calls("prune_workspaces"), 1);
        let meta = lifecycle
            .metadata()
            .get("task-21-reviewer")
            .expect("get")
            .expect("present");
        assert_eq!(meta.record.status, status::ORPHANED);

        let again = lifecycle.recover(21).expect("recover again");
        assert!(again.is_noop());
        assert_eq!(again.health, None);
    }

    #[test]
    fn lost_cache_entry_is_rebuilt_from_metadata() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = WeavePaths::new(temp.path());
        let cfg = WeaveConfig::default();
        let backend = FakeBackend::new(temp.path());
        let recorder = FakeRecorder::default();
        let lifecycle = Lifecycle::new(&paths, &cfg, &backend, &recorder);
        spawn(&lifecycle, 22, Role::Architect);
        std::fs::remove_file(&paths.state_path).expect("lose cache");

        let report = lifecycle.recover(22).expect("recover");
        assert_eq!(report.actions, vec![RecoveryAction::RestoredEntry]);
        assert_eq!(report.health, Some(Health::Healthy));
        let entry = lifecycle.cache().entry(22).expect("entry").expect("restored");
        assert_eq!(entry.role, Role::Architect);
        assert_eq!(
            lifecycle.status(22).expect("status").state,
            WorkspaceState::Active
        );
        assert!(lifecycle.recover(22).expect("again").is_noop());
    }

    #[test]
    fn unregistered_workspace_is_repaired() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = WeavePaths::new(temp.path());
        let cfg = WeaveConfig::default();
        let backend = FakeBackend::new(temp.path());
        let recorder = FakeRecorder::default();
        let lifecycle = Lifecycle::new(&paths, &cfg, &backend, &recorder);
        let entry = spawn(&lifecycle, 23, Role::Implementer);
        backend.forget_workspace(&entry.path);
        assert_eq!(lifecycle.list().expect("list")[0].health, Health::Orphaned);

        let report = lifecycle.recover(23).expect("recover");
        assert_eq!(report.actions, vec![RecoveryAction::RepairedWorkspace]);
        assert_eq!(lifecycle.list().expect("list")[0].health, Health::Healthy);
    }

    #[test]
    fn failed_repair_is_corrupted_state() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = WeavePaths::new(temp.path());
        let cfg = WeaveConfig::default();
        let backend = FakeBackend::new(temp.path());
        let recorder = FakeRecorder::default();
        let lifecycle = Lifecycle::new(&paths, &cfg, &backend, &recorder);
        let entry = spawn(&lifecycle, 24, Role::Ux);
        backend.forget_workspace(&entry.path);
        backend.fail_times("repair_workspace", 1);

        let err = lifecycle.recover(24).expect_err("repair fails");
        assert!(matches!(
            crate::error::classify(&err),
            Some(WeaveError::CorruptedState { task: 24, .. })
        ));
    }

    #[test]
    fn healthy_task_is_a_noop() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = WeavePaths::new(temp.path());
        let cfg = WeaveConfig::default();
        let backend = FakeBackend::new(temp.path());
        let recorder = FakeRecorder::default();
        let lifecycle = Lifecycle::new(&paths, &cfg, &backend, &recorder);
        spawn(&lifecycle, 25, Role::Pm);
        let report = lifecycle.recover(25).expect("recover");
        assert!(report.is_noop());
        assert_eq!(report.health, Some(Health::Healthy));
    }
}
