//! Entry points for the installed git hook adapters.
//!
//! Adapters `exec weave hook <name> [args]` from inside the worktree git is
//! operating on. Anything not on a task branch passes through untouched.

use std::fs;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use tracing::{debug, warn};

use crate::core::checklist::{Checkpoint, ValidationResult};
use crate::core::identity::from_canonical_name;
use crate::core::metadata::MetadataRecord;
use crate::core::types::{Role, status};
use crate::io::git::Git;
use crate::io::stores::Backend;
use crate::lifecycle::Lifecycle;
use crate::validation::{run_message_check, run_pre_change};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    PreCommit,
    CommitMsg,
    PostCommit,
    PrePush,
}

impl FromStr for HookKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pre-commit" => Ok(Self::PreCommit),
            "commit-msg" => Ok(Self::CommitMsg),
            "post-commit" => Ok(Self::PostCommit),
            "pre-push" => Ok(Self::PrePush),
            other => bail!("unsupported hook: {other}"),
        }
    }
}

/// Run one hook from `cwd`. `None` means the hook had nothing to check.
pub fn run_hook<B: Backend + ?Sized>(
    lifecycle: &Lifecycle<'_, B>,
    kind: HookKind,
    cwd: &Path,
    args: &[String],
) -> Result<Option<ValidationResult>> {
    let git = Git::new(cwd).with_timeout(lifecycle.cfg.git_timeout());
    let Some(branch) = git.current_branch()? else {
        debug!(?kind, "detached HEAD, hook skipped");
        return Ok(None);
    };
    let Ok(task) = from_canonical_name(&branch) else {
        debug!(?kind, branch = %branch, "not a task branch, hook skipped");
        return Ok(None);
    };

    match kind {
        HookKind::PreCommit => {
            run_pre_change(lifecycle.backend, lifecycle.cfg, cwd, None).map(Some)
        }
        HookKind::CommitMsg => {
            let file = args
                .first()
                .context("commit-msg hook needs the message file path")?;
            let message = fs::read_to_string(cwd.join(file))
                .with_context(|| format!("read commit message {file}"))?;
            Ok(Some(run_message_check(lifecycle.cfg, &message)))
        }
        HookKind::PostCommit => {
            record_activity(lifecycle, task, &branch);
            Ok(None)
        }
        HookKind::PrePush => {
            if lifecycle.cache().entry(task)?.is_none() {
                debug!(task, "untracked task branch, pre-push skipped");
                return Ok(None);
            }
            lifecycle
                .run_checkpoint(Checkpoint::PreCompletion, task, None)
                .map(Some)
        }
    }
}

/// Bump the commit counter. Never fails the commit that already happened.
fn record_activity<B: Backend + ?Sized>(lifecycle: &Lifecycle<'_, B>, task: u64, branch: &str) {
    let role = match lifecycle.cache().entry(task) {
        Ok(entry) => entry.map_or(Role::Implementer, |entry| entry.role),
        Err(_) => Role::Implementer,
    };
    let updated = lifecycle.metadata().update(
        branch,
        || MetadataRecord::new(role, status::ACTIVE),
        |record| {
            record.commits += 1;
            record.last_activity = Some(Utc::now());
        },
    );
    match updated {
        Ok(record) => debug!(task, commits = record.commits, "activity recorded"),
        Err(err) => warn!(task, err = %format!("{err:#}"), "could not record commit activity"),
    }
}
