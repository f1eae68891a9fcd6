//! Store seams between the lifecycle logic and git.
//!
//! Lifecycle code only talks to these traits. [`GitBackend`] implements them
//! with git subprocesses; tests substitute an in-memory fake.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::core::checklist::{LintStatus, WorkspaceSnapshot};
use crate::core::identity::from_canonical_name;
use crate::core::reconcile::{DiskFact, RegistryEntry};
use crate::io::config::WeaveConfig;
use crate::io::git::Git;
use crate::io::process::{DEFAULT_OUTPUT_LIMIT, run_command_with_timeout};

/// Branch-level operations.
pub trait ReferenceStore {
    fn reference_exists(&self, name: &str) -> Result<bool>;
    /// Create `name` at the current HEAD and return the commit it points to.
    fn create_reference(&self, name: &str) -> Result<String>;
    /// Where an existing reference forked from the current HEAD.
    fn fork_point(&self, name: &str) -> Result<Option<String>>;
    fn push_reference(&self, remote: &str, name: &str) -> Result<()>;
    /// Delete `name` if the current HEAD already contains all of it.
    /// Returns whether the reference was deleted.
    fn delete_reference_if_merged(&self, name: &str) -> Result<bool>;
}

/// Worktree registry operations.
pub trait WorkspaceStore {
    fn add_workspace(&self, path: &Path, reference: &str) -> Result<()>;
    fn remove_workspace(&self, path: &Path, force: bool) -> Result<()>;
    fn registered_workspaces(&self) -> Result<Vec<RegistryEntry>>;
    /// Drop registry entries whose directories are gone.
    fn prune_workspaces(&self) -> Result<()>;
    /// Re-link a moved or half-registered worktree.
    fn repair_workspace(&self, path: &Path) -> Result<()>;
}

/// Raw metadata blobs keyed by reference name.
pub trait MetadataStore {
    fn read_metadata(&self, reference: &str) -> Result<Option<String>>;
    fn write_metadata(&self, reference: &str, raw: &str) -> Result<()>;
    fn push_metadata(&self, remote: &str) -> Result<()>;
    fn fetch_metadata(&self, remote: &str) -> Result<()>;
}

/// Inputs for one workspace probe.
#[derive(Debug, Clone)]
pub struct ProbeRequest<'a> {
    pub task: u64,
    pub reference: &'a str,
    pub path: &'a Path,
    /// Spawn point; `None` when unknown (commits are then not counted).
    pub base: Option<&'a str>,
    pub documents: &'a [String],
    pub coverage_report: &'a str,
}

/// Facts about a workspace's contents.
pub trait WorkspaceProbe {
    fn snapshot(&self, request: &ProbeRequest<'_>) -> Result<WorkspaceSnapshot>;
    /// Number of uncommitted paths in the workspace.
    fn uncommitted_count(&self, path: &Path) -> Result<usize>;
    fn last_commit_time(&self, reference: &str) -> Result<Option<chrono::DateTime<chrono::Utc>>>;
    /// Staged diff (no context lines) inside a workspace.
    fn staged_diff(&self, path: &Path) -> Result<String>;
}

/// Everything the lifecycle needs.
pub trait Backend: ReferenceStore + WorkspaceStore + MetadataStore + WorkspaceProbe {}

impl<T> Backend for T where T: ReferenceStore + WorkspaceStore + MetadataStore + WorkspaceProbe {}

/// Canonical-named directories directly under the worktree base.
pub fn scan_worktree_base(base: &Path) -> Result<Vec<DiskFact>> {
    if !base.exists() {
        return Ok(Vec::new());
    }
    let mut facts = Vec::new();
    let entries =
        fs::read_dir(base).with_context(|| format!("read worktree base {}", base.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("read entry in {}", base.display()))?;
        if !entry.path().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Ok(task) = from_canonical_name(&name) {
            facts.push(DiskFact {
                task,
                name,
                path: entry.path(),
            });
        }
    }
    facts.sort_by_key(|fact| fact.task);
    Ok(facts)
}

/// git-backed implementation of every store.
#[derive(Debug, Clone)]
pub struct GitBackend {
    git: Git,
    notes_ref: String,
    lint_command: Vec<String>,
    lint_timeout: Duration,
}

impl GitBackend {
    pub fn new(root: &Path, cfg: &WeaveConfig) -> Self {
        Self {
            git: Git::new(root).with_timeout(cfg.git_timeout()),
            notes_ref: cfg.git.notes_ref.clone(),
            lint_command: cfg.validation.lint_command.clone(),
            lint_timeout: Duration::from_secs(cfg.validation.lint_timeout_secs),
        }
    }

    pub fn git(&self) -> &Git {
        &self.git
    }

    fn notes_refname(&self) -> String {
        format!("refs/notes/{}", self.notes_ref)
    }

    /// Stable object the note for `reference` hangs off. Branch tips move;
    /// this blob never does.
    fn anchor(&self, reference: &str) -> Result<String> {
        self.git
            .hash_object(&format!("weave-reference refs/heads/{reference}\n"))
    }

    fn run_lint(&self, workdir: &Path) -> Result<LintStatus> {
        let Some((program, args)) = self.lint_command.split_first() else {
            return Ok(LintStatus::NotConfigured);
        };
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(workdir);
        let out = run_command_with_timeout(cmd, None, self.lint_timeout, DEFAULT_OUTPUT_LIMIT)
            .with_context(|| format!("run lint command {}", self.lint_command.join(" ")))?;
        if out.success() {
            return Ok(LintStatus::Clean);
        }
        let detail = out.failure_detail();
        let summary: Vec<&str> = detail.lines().take(5).collect();
        debug!(timed_out = out.timed_out, "lint reported errors");
        Ok(LintStatus::Errors(summary.join(" | ")))
    }
}

#[derive(Debug, Deserialize)]
struct CoverageReport {
    percent: f64,
}

fn read_coverage(path: &Path) -> Option<f64> {
    let raw = fs::read_to_string(path).ok()?;
    match serde_json::from_str::<CoverageReport>(&raw) {
        Ok(report) => Some(report.percent),
        Err(err) => {
            warn!(path = %path.display(), err = %err, "unreadable coverage report, treating as 0%");
            None
        }
    }
}

impl ReferenceStore for GitBackend {
    fn reference_exists(&self, name: &str) -> Result<bool> {
        self.git.branch_exists(name)
    }

    fn create_reference(&self, name: &str) -> Result<String> {
        let base = self.git.rev_parse("HEAD")?;
        self.git.create_branch(name, &base)?;
        Ok(base)
    }

    fn fork_point(&self, name: &str) -> Result<Option<String>> {
        self.git.merge_base("HEAD", name)
    }

    fn push_reference(&self, remote: &str, name: &str) -> Result<()> {
        self.git
            .push(remote, &format!("refs/heads/{name}:refs/heads/{name}"))
    }

    fn delete_reference_if_merged(&self, name: &str) -> Result<bool> {
        if !self.git.branch_exists(name)? || !self.git.is_ancestor(name, "HEAD")? {
            return Ok(false);
        }
        self.git.delete_branch(name)?;
        Ok(true)
    }
}

impl WorkspaceStore for GitBackend {
    fn add_workspace(&self, path: &Path, reference: &str) -> Result<()> {
        self.git.worktree_add(path, reference)
    }

    fn remove_workspace(&self, path: &Path, force: bool) -> Result<()> {
        self.git.worktree_remove(path, force)
    }

    fn registered_workspaces(&self) -> Result<Vec<RegistryEntry>> {
        self.git.worktree_list()
    }

    fn prune_workspaces(&self) -> Result<()> {
        self.git.worktree_prune()
    }

    fn repair_workspace(&self, path: &Path) -> Result<()> {
        self.git.worktree_repair(path)
    }
}

impl MetadataStore for GitBackend {
    fn read_metadata(&self, reference: &str) -> Result<Option<String>> {
        let anchor = self.anchor(reference)?;
        let raw = self.git.notes_show(&self.notes_ref, &anchor)?;
        Ok(raw.map(|raw| raw.trim_end().to_string()))
    }

    fn write_metadata(&self, reference: &str, raw: &str) -> Result<()> {
        let anchor = self.anchor(reference)?;
        self.git.notes_write(&self.notes_ref, &anchor, raw)
    }

    fn push_metadata(&self, remote: &str) -> Result<()> {
        let refname = self.notes_refname();
        self.git.push(remote, &format!("{refname}:{refname}"))
    }

    fn fetch_metadata(&self, remote: &str) -> Result<()> {
        let refname = self.notes_refname();
        self.git.fetch(remote, &format!("{refname}:{refname}"))
    }
}

impl WorkspaceProbe for GitBackend {
    fn snapshot(&self, request: &ProbeRequest<'_>) -> Result<WorkspaceSnapshot> {
        let inside = self.git.at(request.path);
        let uncommitted = inside
            .status_porcelain()?
            .into_iter()
            .map(|entry| entry.path)
            .collect();
        let (commits_ahead, changed_files) = match request.base {
            Some(base) => (
                self.git.count_commits(base, request.reference)?,
                self.git.changed_files(base, request.reference)?,
            ),
            None => (0, Vec::new()),
        };
        let present_documents: BTreeSet<String> = request
            .documents
            .iter()
            .filter(|doc| request.path.join(doc.as_str()).is_file())
            .cloned()
            .collect();
        let coverage_percent = read_coverage(&request.path.join(request.coverage_report));
        let lint = self.run_lint(request.path)?;
        Ok(WorkspaceSnapshot {
            task_id: request.task,
            reference: request.reference.to_string(),
            commits_ahead,
            uncommitted,
            changed_files,
            present_documents,
            coverage_percent,
            lint,
        })
    }

    fn uncommitted_count(&self, path: &Path) -> Result<usize> {
        Ok(self.git.at(path).status_porcelain()?.len())
    }

    fn last_commit_time(&self, reference: &str) -> Result<Option<chrono::DateTime<chrono::Utc>>> {
        self.git.last_commit_time(reference)
    }

    fn staged_diff(&self, path: &Path) -> Result<String> {
        self.git.at(path).staged_diff()
    }
}
