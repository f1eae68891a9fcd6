//! Local state cache (`.weave/state.json`).
//!
//! The cache is an index, not the source of truth: the worktree registry and
//! the filesystem win on disagreement (see `reconcile`). A missing or
//! unreadable file therefore degrades to an empty record instead of failing.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::backoff::Backoff;
use crate::core::types::{Health, Role};
use crate::io::atomic::write_json_atomic;
use crate::io::config::Mode;
use crate::io::lock::lock_named;

pub const STATE_VERSION: u32 = 1;

/// One tracked workspace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub task: u64,
    pub reference: String,
    pub path: PathBuf,
    pub role: Role,
    pub created_at: DateTime<Utc>,
    /// Commit the task branch was created from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<String>,
    #[serde(default, skip_serializing_if = "Health::is_healthy")]
    pub health: Health,
}

/// Persisted cache document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateRecord {
    pub version: u32,
    #[serde(default)]
    pub mode: Mode,
    /// Sorted by task id, at most one entry per task.
    #[serde(default)]
    pub workspaces: Vec<CacheEntry>,
}

impl Default for StateRecord {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            mode: Mode::default(),
            workspaces: Vec::new(),
        }
    }
}

impl StateRecord {
    pub fn get(&self, task: u64) -> Option<&CacheEntry> {
        self.workspaces.iter().find(|entry| entry.task == task)
    }

    pub fn get_mut(&mut self, task: u64) -> Option<&mut CacheEntry> {
        self.workspaces.iter_mut().find(|entry| entry.task == task)
    }

    /// Insert or replace the entry for `entry.task`.
    pub fn insert(&mut self, entry: CacheEntry) {
        match self
            .workspaces
            .binary_search_by_key(&entry.task, |existing| existing.task)
        {
            Ok(index) => self.workspaces[index] = entry,
            Err(index) => self.workspaces.insert(index, entry),
        }
    }

    pub fn remove(&mut self, task: u64) -> Option<CacheEntry> {
        let index = self.workspaces.iter().position(|entry| entry.task == task)?;
        Some(self.workspaces.remove(index))
    }
}

/// Load the cache. Missing → empty. Unparseable → logged, preserved as
/// `state.json.corrupt`, and treated as empty.
pub fn load_state(path: &Path) -> Result<StateRecord> {
    if !path.exists() {
        debug!(path = %path.display(), "no state cache, starting empty");
        return Ok(StateRecord::default());
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read state cache {}", path.display()))?;
    match serde_json::from_str::<StateRecord>(&contents) {
        Ok(mut state) => {
            state.workspaces.sort_by_key(|entry| entry.task);
            state.workspaces.dedup_by_key(|entry| entry.task);
            debug!(entries = state.workspaces.len(), "state cache loaded");
            Ok(state)
        }
        Err(err) => {
            let corrupt = path.with_extension("json.corrupt");
            warn!(
                path = %path.display(),
                err = %err,
                preserved = %corrupt.display(),
                "state cache unreadable, treating as empty"
            );
            if let Err(copy_err) = fs::copy(path, &corrupt) {
                warn!(err = %copy_err, "failed to preserve corrupt state cache");
            }
            Ok(StateRecord::default())
        }
    }
}

/// Atomically write the cache.
pub fn save_state(path: &Path, state: &StateRecord) -> Result<()> {
    debug!(path = %path.display(), entries = state.workspaces.len(), "writing state cache");
    write_json_atomic(path, state)
}

/// Cache handle that serializes read-modify-write across processes.
#[derive(Debug, Clone)]
pub struct StateCache {
    path: PathBuf,
    locks_dir: PathBuf,
    backoff: Backoff,
}

impl StateCache {
    pub fn new(path: impl Into<PathBuf>, locks_dir: impl Into<PathBuf>, backoff: Backoff) -> Self {
        Self {
            path: path.into(),
            locks_dir: locks_dir.into(),
            backoff,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<StateRecord> {
        load_state(&self.path)
    }

    pub fn entry(&self, task: u64) -> Result<Option<CacheEntry>> {
        Ok(self.load()?.remove(task))
    }

    /// Apply `f` under the state lock and persist the result.
    pub fn update<T>(&self, f: impl FnOnce(&mut StateRecord) -> T) -> Result<T> {
        let _guard = lock_named(&self.locks_dir, "state", &self.backoff)?;
        let mut state = self.load()?;
        let out = f(&mut state);
        save_state(&self.path, &state)?;
        Ok(out)
    }

    pub fn register(&self, entry: CacheEntry, mode: Mode) -> Result<()> {
        self.update(|state| {
            state.mode = mode;
            state.insert(entry);
        })
    }

    /// Drop an entry; returns whether one existed.
    pub fn deregister(&self, task: u64) -> Result<bool> {
        self.update(|state| state.remove(task).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(task: u64) -> CacheEntry {
        CacheEntry {
            task,
            reference: format!("task-{task}-implementer"),
            path: PathBuf::from(format!("/repo/.weave/worktrees/task-{task}-implementer")),
            role: Role::Implementer,
            created_at: DateTime::parse_from_rfc3339("2026-01-02T03:04:05Z")
                .expect("time")
                .with_timezone(&Utc),
            base: None,
            health: Health::Healthy,
        }
    }

    fn cache(dir: &Path) -> StateCache {
        StateCache::new(dir.join("state.json"), dir.join("locks"), Backoff::new(3, 1))
    }

    /// Healthy entries omit the health field.
    #[test]
    fn serialized_layout_is_stable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state.json");
        let mut state = StateRecord::default();
        state.insert(entry(42));
        save_state(&path, &state).expect("save");
        let raw = fs::read_to_string(&path).expect("read");
        assert!(raw.contains("\"mode\": \"local\""));
        assert!(raw.contains("\"task\": 42"));
        assert!(raw.contains("\"createdAt\": \"2026-01-02T03:04:05Z\""));
        assert!(!raw.contains("health"));
        assert_eq!(load_state(&path).expect("load"), state);
    }

    #[test]
    fn missing_file_loads_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        let state = load_state(&temp.path().join("state.json")).expect("load");
        assert!(state.workspaces.is_empty());
    }

    #[test]
    fn truncated_file_loads_empty_and_is_preserved() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state.json");
        fs::write(&path, "{\"version\": 1, \"workspaces\": {\"4").expect("write");
        let state = load_state(&path).expect("load");
        assert!(state.workspaces.is_empty());
        assert!(temp.path().join("state.json.corrupt").exists());
    }

    #[test]
    fn register_and_deregister_round_trip() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cache = cache(temp.path());
        cache.register(entry(8), Mode::Local).expect("register 8");
        cache.register(entry(7), Mode::Local).expect("register 7");
        assert_eq!(cache.entry(7).expect("entry").map(|e| e.task), Some(7));
        assert!(cache.deregister(7).expect("deregister"));
        assert!(!cache.deregister(7).expect("deregister again"));
        let tasks: Vec<u64> = cache
            .load()
            .expect("load")
            .workspaces
            .iter()
            .map(|entry| entry.task)
            .collect();
        assert_eq!(tasks, vec![8]);
    }

    #[test]
    fn concurrent_updates_keep_every_entry() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cache = StateCache::new(
            temp.path().join("state.json"),
            temp.path().join("locks"),
            Backoff::new(50, 2),
        );
        std::thread::scope(|scope| {
            for task in 1..=6 {
                let cache = cache.clone();
                scope.spawn(move || cache.register(entry(task), Mode::Local).expect("register"));
            }
        });
        assert_eq!(cache.load().expect("load").workspaces.len(), 6);
    }
}
