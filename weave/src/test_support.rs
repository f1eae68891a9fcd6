//! Test-only helpers: an in-memory backend, a capturing recorder, and a
//! scratch git repository.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};

use crate::core::checklist::WorkspaceSnapshot;
use crate::core::reconcile::RegistryEntry;
use crate::error::WeaveError;
use crate::io::completion_log::{CompletionEntry, CompletionRecorder};
use crate::io::stores::{
    MetadataStore, ProbeRequest, ReferenceStore, WorkspaceProbe, WorkspaceStore,
};

/// Injected failure schedule for one operation.
#[derive(Debug, Default, Clone, Copy)]
struct Fault {
    /// Calls that still succeed before failures start.
    skip: u32,
    /// Failing calls left after `skip` runs out.
    times: u32,
}

#[derive(Debug, Default)]
struct FakeState {
    /// Branch name -> spawn-point commit.
    refs: BTreeMap<String, String>,
    /// Worktree path -> checked-out branch.
    registry: BTreeMap<PathBuf, String>,
    notes: BTreeMap<String, String>,
    /// Branches HEAD does not contain yet.
    unmerged: BTreeSet<String>,
    failures: BTreeMap<String, Fault>,
    calls: BTreeMap<String, u32>,
    snapshots: BTreeMap<u64, WorkspaceSnapshot>,
    staged_diff: String,
}

/// In-memory stand-in for git. Worktree directories are created on disk so
/// filesystem checks behave as they would against a real repository.
#[derive(Debug)]
pub struct FakeBackend {
    root: PathBuf,
    state: Mutex<FakeState>,
}

impl FakeBackend {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            state: Mutex::new(FakeState::default()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Make the next `times` calls of `op` fail with an external-tool error.
    pub fn fail_times(&self, op: &str, times: u32) {
        self.with(|state| {
            state.failures.insert(op.to_string(), Fault { skip: 0, times });
        });
    }

    /// Let the next `calls` calls of `op` succeed, then fail the one after.
    pub fn fail_after(&self, op: &str, calls: u32) {
        self.with(|state| {
            state
                .failures
                .insert(op.to_string(), Fault { skip: calls, times: 1 });
        });
    }

    /// Treat `name` as carrying commits HEAD does not have.
    pub fn mark_unmerged(&self, name: &str) {
        self.with(|state| {
            state.unmerged.insert(name.to_string());
        });
    }

    pub fn has_reference(&self, name: &str) -> bool {
        self.with(|state| state.refs.contains_key(name))
    }

    /// How many times `op` has been invoked.
    pub fn calls(&self, op: &str) -> u32 {
        self.with(|state| state.calls.get(op).copied().unwrap_or(0))
    }

    pub fn set_snapshot(&self, task: u64, snapshot: WorkspaceSnapshot) {
        self.with(|state| {
            state.snapshots.insert(task, snapshot);
        });
    }

    pub fn set_staged_diff(&self, diff: &str) {
        self.with(|state| state.staged_diff = diff.to_string());
    }

    /// Drop a worktree from the registry without touching the directory.
    pub fn forget_workspace(&self, path: &Path) {
        self.with(|state| {
            state.registry.remove(path);
        });
    }

    fn with<T>(&self, f: impl FnOnce(&mut FakeState) -> T) -> T {
        let mut state = self.state.lock().expect("fake backend state");
        f(&mut state)
    }

    fn hit(&self, op: &str) -> Result<()> {
        self.with(|state| {
            *state.calls.entry(op.to_string()).or_default() += 1;
            match state.failures.get_mut(op) {
                Some(fault) if fault.skip > 0 => {
                    fault.skip -= 1;
                    Ok(())
                }
                Some(fault) if fault.times > 0 => {
                    fault.times -= 1;
                    Err(WeaveError::ExternalTool {
                        command: op.to_string(),
                        detail: "injected failure".to_string(),
                    }
                    .into())
                }
                _ => Ok(()),
            }
        })
    }
}

impl ReferenceStore for FakeBackend {
    fn reference_exists(&self, name: &str) -> Result<bool> {
        self.hit("reference_exists")?;
        Ok(self.with(|state| state.refs.contains_key(name)))
    }

    fn create_reference(&self, name: &str) -> Result<String> {
        self.hit("create_reference")?;
        self.with(|state| {
            let base = format!("{:040x}", state.refs.len() + 1);
            state.refs.insert(name.to_string(), base.clone());
            Ok(base)
        })
    }

    fn fork_point(&self, name: &str) -> Result<Option<String>> {
        self.hit("fork_point")?;
        Ok(self.with(|state| state.refs.get(name).cloned()))
    }

    fn push_reference(&self, _remote: &str, _name: &str) -> Result<()> {
        self.hit("push_reference")
    }

    fn delete_reference_if_merged(&self, name: &str) -> Result<bool> {
        self.hit("delete_reference_if_merged")?;
        Ok(self.with(|state| {
            if state.unmerged.contains(name) {
                return false;
            }
            state.refs.remove(name).is_some()
        }))
    }
}

impl WorkspaceStore for FakeBackend {
    fn add_workspace(&self, path: &Path, reference: &str) -> Result<()> {
        self.hit("add_workspace")?;
        if self.with(|state| state.registry.contains_key(path)) {
            bail!("'{}' already exists", path.display());
        }
        fs::create_dir_all(path).with_context(|| format!("create {}", path.display()))?;
        self.with(|state| {
            state.registry.insert(path.to_path_buf(), reference.to_string());
        });
        Ok(())
    }

    fn remove_workspace(&self, path: &Path, _force: bool) -> Result<()> {
        self.hit("remove_workspace")?;
        if path.exists() {
            fs::remove_dir_all(path).with_context(|| format!("remove {}", path.display()))?;
        }
        self.forget_workspace(path);
        Ok(())
    }

    fn registered_workspaces(&self) -> Result<Vec<RegistryEntry>> {
        self.hit("registered_workspaces")?;
        Ok(self.with(|state| {
            state
                .registry
                .iter()
                .map(|(path, branch)| RegistryEntry {
                    path: path.clone(),
                    branch: Some(branch.clone()),
                    prunable: !path.is_dir(),
                })
                .collect()
        }))
    }

    fn prune_workspaces(&self) -> Result<()> {
        self.hit("prune_workspaces")?;
        self.with(|state| state.registry.retain(|path, _| path.is_dir()));
        Ok(())
    }

    fn repair_workspace(&self, path: &Path) -> Result<()> {
        self.hit("repair_workspace")?;
        let Some(name) = path.file_name() else {
            bail!("cannot repair {}", path.display());
        };
        if !path.is_dir() {
            bail!("not a worktree: {}", path.display());
        }
        let branch = name.to_string_lossy().into_owned();
        self.with(|state| {
            state.registry.insert(path.to_path_buf(), branch);
        });
        Ok(())
    }
}

impl MetadataStore for FakeBackend {
    fn read_metadata(&self, reference: &str) -> Result<Option<String>> {
        self.hit("read_metadata")?;
        Ok(self.with(|state| state.notes.get(reference).cloned()))
    }

    fn write_metadata(&self, reference: &str, raw: &str) -> Result<()> {
        self.hit("write_metadata")?;
        self.with(|state| {
            state.notes.insert(reference.to_string(), raw.to_string());
        });
        Ok(())
    }

    fn push_metadata(&self, _remote: &str) -> Result<()> {
        self.hit("push_metadata")
    }

    fn fetch_metadata(&self, _remote: &str) -> Result<()> {
        self.hit("fetch_metadata")
    }
}

impl WorkspaceProbe for FakeBackend {
    fn snapshot(&self, request: &ProbeRequest<'_>) -> Result<WorkspaceSnapshot> {
        self.hit("snapshot")?;
        let mut snapshot = self.with(|state| {
            state
                .snapshots
                .get(&request.task)
                .cloned()
                .unwrap_or_default()
        });
        snapshot.task_id = request.task;
        snapshot.reference = request.reference.to_string();
        Ok(snapshot)
    }

    fn uncommitted_count(&self, _path: &Path) -> Result<usize> {
        Ok(0)
    }

    fn last_commit_time(&self, _reference: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(None)
    }

    fn staged_diff(&self, _path: &Path) -> Result<String> {
        self.hit("staged_diff")?;
        Ok(self.with(|state| state.staged_diff.clone()))
    }
}

/// Recorder that keeps completions in memory.
#[derive(Debug, Default)]
pub struct FakeRecorder {
    entries: Mutex<Vec<CompletionEntry>>,
    fail: bool,
}

impl FakeRecorder {
    /// A recorder whose every write fails.
    pub fn failing() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn entries(&self) -> Vec<CompletionEntry> {
        self.entries.lock().expect("recorder entries").clone()
    }
}

impl CompletionRecorder for FakeRecorder {
    fn record(&self, entry: &CompletionEntry) -> Result<()> {
        if self.fail {
            bail!("recorder unavailable");
        }
        self.entries
            .lock()
            .expect("recorder entries")
            .push(entry.clone());
        Ok(())
    }
}

/// Throwaway git repository with one commit on `main`.
pub struct TestRepo {
    dir: tempfile::TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create temp repo")?;
        let repo = Self { dir };
        let root = repo.path().to_path_buf();
        run_git(&root, &["init", "--quiet", "--initial-branch=main"])?;
        run_git(&root, &["config", "user.email", "dev@example.com"])?;
        run_git(&root, &["config", "user.name", "Weave Test"])?;
        run_git(&root, &["config", "commit.gpgsign", "false"])?;
        repo.commit_file(&root, "README.md", "# scratch\n", "initial commit")?;
        Ok(repo)
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Canonicalized so paths compare equal to what git reports.
    pub fn root(&self) -> PathBuf {
        self.dir
            .path()
            .canonicalize()
            .unwrap_or_else(|_| self.dir.path().to_path_buf())
    }

    /// Write `rel` under `workdir` and commit it there.
    pub fn commit_file(&self, workdir: &Path, rel: &str, contents: &str, message: &str) -> Result<()> {
        let path = workdir.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
        run_git(workdir, &["add", "--", rel])?;
        run_git(workdir, &["commit", "--quiet", "--no-verify", "-m", message])?;
        Ok(())
    }

    pub fn git(&self, workdir: &Path, args: &[&str]) -> Result<String> {
        run_git(workdir, args)
    }
}

fn run_git(dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .with_context(|| format!("spawn git {}", args.join(" ")))?;
    if !output.status.success() {
        bail!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
