//! Git adapter.
//!
//! weave keeps all ground truth in git (branches, the worktree registry and
//! notes), so this is a small, explicit wrapper around `git` subprocess
//! calls. Every call runs under a timeout; spawn failures, timeouts and
//! non-zero exits surface as [`WeaveError::ExternalTool`].

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use tracing::{debug, instrument, warn};

use crate::core::reconcile::RegistryEntry;
use crate::error::WeaveError;
use crate::io::process::{CommandOutput, DEFAULT_OUTPUT_LIMIT, run_command_with_timeout};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
    timeout: Duration,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Same settings, different working directory.
    pub fn at(&self, workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            timeout: self.timeout,
        }
    }

    /// Absolute path of the main working tree.
    pub fn toplevel(&self) -> Result<PathBuf> {
        let out = self.run_capture(&["rev-parse", "--show-toplevel"])?;
        Ok(PathBuf::from(out.trim()))
    }

    /// Directory shared by all worktrees (hooks live here).
    pub fn common_dir(&self) -> Result<PathBuf> {
        let out = self.run_capture(&["rev-parse", "--git-common-dir"])?;
        let dir = PathBuf::from(out.trim());
        Ok(if dir.is_absolute() {
            dir
        } else {
            self.workdir.join(dir)
        })
    }

    /// Short branch name, or `None` on detached HEAD.
    pub fn current_branch(&self) -> Result<Option<String>> {
        let out = self.run(&["symbolic-ref", "--quiet", "--short", "HEAD"])?;
        if !out.success() {
            debug!("detached HEAD");
            return Ok(None);
        }
        Ok(Some(out.stdout_text().trim().to_string()))
    }

    /// Check whether a local branch exists.
    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let out = self.run(&[
            "show-ref",
            "--verify",
            "--quiet",
            &format!("refs/heads/{branch}"),
        ])?;
        Ok(out.success())
    }

    /// Create a branch at `start` without checking it out.
    #[instrument(skip_all, fields(branch, start))]
    pub fn create_branch(&self, branch: &str, start: &str) -> Result<()> {
        debug!(branch, start, "creating branch");
        self.run_checked(&["branch", branch, start])?;
        Ok(())
    }

    pub fn rev_parse(&self, rev: &str) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--verify", &format!("{rev}^{{commit}}")])?;
        Ok(out.trim().to_string())
    }

    /// Best common ancestor of two revisions, if they share history.
    pub fn merge_base(&self, a: &str, b: &str) -> Result<Option<String>> {
        let out = self.run(&["merge-base", a, b])?;
        if !out.success() {
            return Ok(None);
        }
        Ok(Some(out.stdout_text().trim().to_string()))
    }

    /// Whether every commit on `branch` is reachable from `into`.
    pub fn is_ancestor(&self, branch: &str, into: &str) -> Result<bool> {
        let args = ["merge-base", "--is-ancestor", branch, into];
        let out = self.run(&args)?;
        match out.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(tool_error(&args, out.failure_detail())),
        }
    }

    /// Delete a merged local branch. git refuses unmerged ones.
    #[instrument(skip_all, fields(branch))]
    pub fn delete_branch(&self, branch: &str) -> Result<()> {
        self.run_checked(&["branch", "--delete", branch])?;
        debug!(branch, "branch deleted");
        Ok(())
    }

    /// Commits reachable from `head` but not from `base`.
    pub fn count_commits(&self, base: &str, head: &str) -> Result<u64> {
        let out = self.run_capture(&["rev-list", "--count", &format!("{base}..{head}")])?;
        out.trim()
            .parse()
            .map_err(|err| anyhow!("unexpected rev-list output '{}': {err}", out.trim()))
    }

    /// Paths changed between `base` and `head`.
    pub fn changed_files(&self, base: &str, head: &str) -> Result<Vec<String>> {
        let out = self.run_capture(&["diff", "--name-only", &format!("{base}..{head}")])?;
        Ok(out
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Committer time of the tip of `reference`.
    pub fn last_commit_time(&self, reference: &str) -> Result<Option<DateTime<Utc>>> {
        let out = self.run_capture(&["log", "-1", "--format=%cI", reference])?;
        let raw = out.trim();
        if raw.is_empty() {
            return Ok(None);
        }
        let parsed = DateTime::parse_from_rfc3339(raw)
            .map_err(|err| anyhow!("unexpected commit time '{raw}': {err}"))?;
        Ok(Some(parsed.with_timezone(&Utc)))
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// Staged changes with no context lines.
    pub fn staged_diff(&self) -> Result<String> {
        self.run_capture(&["diff", "--cached", "--unified=0", "--no-color", "--no-ext-diff"])
    }

    #[instrument(skip_all, fields(path = %path.display(), branch))]
    pub fn worktree_add(&self, path: &Path, branch: &str) -> Result<()> {
        let path_arg = path.to_string_lossy();
        self.run_checked(&["worktree", "add", &path_arg, branch])?;
        debug!("worktree added");
        Ok(())
    }

    #[instrument(skip_all, fields(path = %path.display(), force))]
    pub fn worktree_remove(&self, path: &Path, force: bool) -> Result<()> {
        let path_arg = path.to_string_lossy();
        let mut args = vec!["worktree", "remove"];
        if force {
            args.push("--force");
        }
        args.push(path_arg.as_ref());
        self.run_checked(&args)?;
        debug!("worktree removed");
        Ok(())
    }

    /// The worktree registry, main worktree included.
    pub fn worktree_list(&self) -> Result<Vec<RegistryEntry>> {
        let out = self.run_capture(&["worktree", "list", "--porcelain"])?;
        Ok(parse_worktree_list(&out))
    }

    pub fn worktree_prune(&self) -> Result<()> {
        self.run_checked(&["worktree", "prune"])?;
        Ok(())
    }

    pub fn worktree_repair(&self, path: &Path) -> Result<()> {
        let path_arg = path.to_string_lossy();
        self.run_checked(&["worktree", "repair", &path_arg])?;
        Ok(())
    }

    /// Write `content` as a blob and return its id.
    pub fn hash_object(&self, content: &str) -> Result<String> {
        let out =
            self.run_checked_with_stdin(&["hash-object", "-w", "--stdin"], content.as_bytes())?;
        Ok(out.stdout_text().trim().to_string())
    }

    /// Note attached to `object` under `refs/notes/<notes_ref>`, if any.
    pub fn notes_show(&self, notes_ref: &str, object: &str) -> Result<Option<String>> {
        let ref_arg = format!("--ref={notes_ref}");
        let args = ["notes", ref_arg.as_str(), "show", object];
        let out = self.run(&args)?;
        if out.success() {
            return Ok(Some(out.stdout_text()));
        }
        let detail = out.failure_detail();
        if detail.contains("no note found") {
            return Ok(None);
        }
        Err(tool_error(&args, detail))
    }

    /// Replace the note on `object`.
    pub fn notes_write(&self, notes_ref: &str, object: &str, content: &str) -> Result<()> {
        let ref_arg = format!("--ref={notes_ref}");
        self.run_checked_with_stdin(
            &["notes", &ref_arg, "add", "--force", "--file=-", object],
            content.as_bytes(),
        )?;
        Ok(())
    }

    #[instrument(skip_all, fields(remote, refspec))]
    pub fn push(&self, remote: &str, refspec: &str) -> Result<()> {
        self.run_checked(&["push", remote, refspec])?;
        Ok(())
    }

    #[instrument(skip_all, fields(remote, refspec))]
    pub fn fetch(&self, remote: &str, refspec: &str) -> Result<()> {
        self.run_checked(&["fetch", remote, refspec])?;
        Ok(())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        Ok(self.run_checked(args)?.stdout_text())
    }

    fn run_checked(&self, args: &[&str]) -> Result<CommandOutput> {
        let output = self.run(args)?;
        if !output.success() {
            return Err(tool_error(args, output.failure_detail()));
        }
        Ok(output)
    }

    fn run_checked_with_stdin(&self, args: &[&str], stdin: &[u8]) -> Result<CommandOutput> {
        let output = self.execute(args, Some(stdin))?;
        if !output.success() {
            return Err(tool_error(args, output.failure_detail()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<CommandOutput> {
        self.execute(args, None)
    }

    fn execute(&self, args: &[&str], stdin: Option<&[u8]>) -> Result<CommandOutput> {
        let mut cmd = Command::new("git");
        // Hooks may export these; every call here names its own directory.
        cmd.args(args)
            .current_dir(&self.workdir)
            .env_remove("GIT_DIR")
            .env_remove("GIT_WORK_TREE");
        let output = run_command_with_timeout(cmd, stdin, self.timeout, DEFAULT_OUTPUT_LIMIT)
            .map_err(|err| tool_error(args, format!("{err:#}")))?;
        if output.timed_out {
            warn!(args = %args.join(" "), timeout = ?self.timeout, "git timed out");
            return Err(tool_error(args, format!("timed out after {:?}", self.timeout)));
        }
        Ok(output)
    }
}

fn tool_error(args: &[&str], detail: String) -> anyhow::Error {
    WeaveError::ExternalTool {
        command: format!("git {}", args.join(" ")),
        detail,
    }
    .into()
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}

/// Parse `git worktree list --porcelain` blocks.
fn parse_worktree_list(raw: &str) -> Vec<RegistryEntry> {
    let mut entries = Vec::new();
    let mut current: Option<RegistryEntry> = None;
    for line in raw.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            entries.extend(current.take());
            current = Some(RegistryEntry {
                path: PathBuf::from(path),
                branch: None,
                prunable: false,
            });
            continue;
        }
        let Some(entry) = current.as_mut() else {
            continue;
        };
        if let Some(branch) = line.strip_prefix("branch ") {
            let short = branch.strip_prefix("refs/heads/").unwrap_or(branch);
            entry.branch = Some(short.to_string());
        } else if line == "prunable" || line.starts_with("prunable ") {
            entry.prunable = true;
        }
    }
    entries.extend(current);
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_untracked_line() {
        let e = parse_status_line("?? notes/draft.md").expect("parse");
        assert_eq!(
            e,
            StatusEntry {
                code: "??".to_string(),
                path: "notes/draft.md".to_string()
            }
        );
    }

    #[test]
    fn parses_rename_line_uses_new_path() {
        let e = parse_status_line("R  docs/old.md -> docs/new.md").expect("parse");
        assert_eq!(e.code, "R ");
        assert_eq!(e.path, "docs/new.md");
    }

    #[test]
    fn parses_worktree_registry() {
        let raw = "\
worktree /repo
HEAD 1111111111111111111111111111111111111111
branch refs/heads/main

worktree /repo/.weave/worktrees/task-42-implementer
HEAD 2222222222222222222222222222222222222222
branch refs/heads/task-42-implementer

worktree /repo/.weave/worktrees/task-7-ux
HEAD 3333333333333333333333333333333333333333
branch refs/heads/task-7-ux
prunable gitdir file points to non-existent location

worktree /tmp/detached
HEAD 4444444444444444444444444444444444444444
detached
";
        let entries = parse_worktree_list(raw);
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[1].branch.as_deref(), Some("task-42-implementer"));
        assert_eq!(entries[1].task_id(), Some(42));
        assert!(entries[2].prunable);
        assert_eq!(entries[3].branch, None);
        assert_eq!(entries[0].task_id(), None);
    }

    #[test]
    fn missing_git_dir_is_an_external_tool_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let git = Git::new(temp.path().join("does-not-exist"));
        let err = git.toplevel().expect_err("no workdir");
        assert!(matches!(
            crate::error::classify(&err),
            Some(WeaveError::ExternalTool { .. })
        ));
    }
}
