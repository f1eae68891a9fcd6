//! Pure reconciliation of the state cache against ground truth.
//!
//! Inputs are already-collected facts: cache entries, the worktree registry,
//! and which task directories exist under the worktree base. The output is a
//! view per task plus the health each cache entry should carry.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use serde::Serialize;

use crate::core::identity::from_canonical_name;
use crate::core::types::Health;

/// One registered worktree as reported by the VCS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEntry {
    pub path: PathBuf,
    /// Short branch name, if the worktree is on a branch.
    pub branch: Option<String>,
    /// Registry says the directory is gone.
    pub prunable: bool,
}

impl RegistryEntry {
    /// Task id when the worktree is on a canonical task branch.
    pub fn task_id(&self) -> Option<u64> {
        self.branch
            .as_deref()
            .and_then(|branch| from_canonical_name(branch).ok())
    }
}

/// Cache-side facts about one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedFact {
    pub task: u64,
    pub reference: String,
    pub path: PathBuf,
    /// Directory exists on disk.
    pub exists: bool,
}

/// Disk-side fact: a canonical-named directory under the worktree base.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskFact {
    pub task: u64,
    pub name: String,
    pub path: PathBuf,
}

/// Reconciled view of one task's workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkspaceView {
    pub task: u64,
    pub reference: String,
    pub path: PathBuf,
    pub health: Health,
    pub in_cache: bool,
    pub registered: bool,
    pub on_disk: bool,
}

/// Reconcile facts into per-task views, ordered by task id.
pub fn reconcile_views(
    cached: &[CachedFact],
    registry: &[RegistryEntry],
    disk: &[DiskFact],
) -> Vec<WorkspaceView> {
    let live_registry: BTreeMap<u64, &RegistryEntry> = registry
        .iter()
        .filter(|entry| !entry.prunable)
        .filter_map(|entry| entry.task_id().map(|task| (task, entry)))
        .collect();
    let disk_by_task: BTreeMap<u64, &DiskFact> =
        disk.iter().map(|fact| (fact.task, fact)).collect();

    let mut views = BTreeMap::new();
    for fact in cached {
        let registered = live_registry.contains_key(&fact.task);
        let health = if !fact.exists {
            Health::Missing
        } else if !registered {
            Health::Orphaned
        } else {
            Health::Healthy
        };
        views.insert(
            fact.task,
            WorkspaceView {
                task: fact.task,
                reference: fact.reference.clone(),
                path: fact.path.clone(),
                health,
                in_cache: true,
                registered,
                on_disk: fact.exists,
            },
        );
    }

    let uncached: BTreeSet<u64> = live_registry
        .keys()
        .chain(disk_by_task.keys())
        .copied()
        .filter(|task| !views.contains_key(task))
        .collect();
    for task in uncached {
        let registered = live_registry.get(&task);
        let on_disk = disk_by_task.get(&task);
        let (reference, path) = match (registered, on_disk) {
            (Some(entry), _) => (
                entry.branch.clone().unwrap_or_default(),
                entry.path.clone(),
            ),
            (None, Some(fact)) => (fact.name.clone(), fact.path.clone()),
            (None, None) => continue,
        };
        views.insert(
            task,
            WorkspaceView {
                task,
                reference,
                path,
                health: Health::Orphaned,
                in_cache: false,
                registered: registered.is_some(),
                on_disk: on_disk.is_some() || registered.is_some(),
            },
        );
    }

    views.into_values().collect()
}
