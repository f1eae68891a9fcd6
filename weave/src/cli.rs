//! CLI command implementations.
//!
//! Each command returns the process exit code. Errors bubble up to `main`,
//! which prints them and maps them through [`exit_codes::for_error`].

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::debug;

use crate::core::checklist::{Checkpoint, ValidationResult};
use crate::core::identity::{from_canonical_name, parse_task_arg};
use crate::core::metadata::MetadataRecord;
use crate::core::reconcile::WorkspaceView;
use crate::core::types::{Role, status};
use crate::error::WeaveError;
use crate::exit_codes;
use crate::hook::{HookKind, run_hook};
use crate::io::completion_log::FileRecorder;
use crate::io::config::{Mode, WeaveConfig, load_config};
use crate::io::git::{DEFAULT_TIMEOUT, Git};
use crate::io::init::{InitOptions, WeavePaths, init_weave};
use crate::io::stores::GitBackend;
use crate::lifecycle::{CompleteOptions, CompletionOutcome, Lifecycle, SpawnRequest};

/// Everything a command needs, resolved from the working directory.
pub struct Session {
    pub paths: WeavePaths,
    pub cfg: WeaveConfig,
    backend: GitBackend,
    recorder: FileRecorder,
}

impl Session {
    pub fn open(cwd: &Path) -> Result<Self> {
        let paths = WeavePaths::discover(cwd, DEFAULT_TIMEOUT)?;
        let cfg = load_config(&paths.config_path)?;
        let backend = GitBackend::new(&paths.root, &cfg);
        let recorder = FileRecorder::new(
            &paths.completions_path,
            &paths.metrics_path,
            &paths.locks_dir,
            cfg.lock_backoff(),
        );
        debug!(root = %paths.root.display(), mode = ?cfg.mode, "session opened");
        Ok(Self {
            paths,
            cfg,
            backend,
            recorder,
        })
    }

    pub fn lifecycle(&self) -> Lifecycle<'_, GitBackend> {
        Lifecycle::new(&self.paths, &self.cfg, &self.backend, &self.recorder)
    }

    /// Reference for a task: the tracked one, or the argument itself when it
    /// is already a canonical name.
    fn reference_for(&self, raw: &str, task: u64) -> Result<String> {
        if let Some(entry) = self.lifecycle().cache().entry(task)? {
            return Ok(entry.reference);
        }
        let bare = raw.trim();
        if from_canonical_name(bare).is_ok() {
            return Ok(bare.to_string());
        }
        Err(WeaveError::UnknownTask { task }.into())
    }
}

pub fn cmd_init(cwd: &Path, force: bool, mode: Option<Mode>) -> Result<i32> {
    let paths = WeavePaths::discover(cwd, DEFAULT_TIMEOUT)?;
    let git = Git::new(&paths.root);
    let hook_binary = std::env::current_exe().context("locate weave binary")?;
    let report = init_weave(
        &paths,
        &git,
        &InitOptions {
            force,
            mode,
            hook_binary,
        },
    )?;
    println!(
        "init: root={} hooks={}",
        paths.root.display(),
        report.hooks_installed.join(",")
    );
    for hook in &report.hooks_backed_up {
        println!("init: backed up existing {hook} hook to {hook}.backup");
    }
    Ok(exit_codes::OK)
}

pub fn cmd_spawn(
    cwd: &Path,
    task: &str,
    role: Role,
    title: Option<&str>,
    labels: Vec<String>,
) -> Result<i32> {
    let session = Session::open(cwd)?;
    let task = parse_task_arg(task)?;
    let entry = session.lifecycle().spawn(&SpawnRequest {
        task,
        role,
        slug: title.map(str::to_string),
        labels,
    })?;
    println!(
        "spawn: task={} reference={} path={}",
        entry.task,
        entry.reference,
        entry.path.display()
    );
    Ok(exit_codes::OK)
}

pub fn cmd_list(cwd: &Path, json: bool) -> Result<i32> {
    let session = Session::open(cwd)?;
    let views = session.lifecycle().list()?;
    if json {
        print_json(&views)?;
        return Ok(exit_codes::OK);
    }
    if views.is_empty() {
        println!("list: no workspaces");
    }
    for view in &views {
        print_view("list", view);
    }
    Ok(exit_codes::OK)
}

pub fn cmd_status(cwd: &Path, task: &str, json: bool) -> Result<i32> {
    let session = Session::open(cwd)?;
    let task = parse_task_arg(task)?;
    let status = session.lifecycle().status(task)?;
    if json {
        print_json(&status)?;
        return Ok(exit_codes::OK);
    }
    println!(
        "status: task={} reference={} state={} health={}",
        status.view.task, status.view.reference, status.state, status.view.health
    );
    println!("status: path={}", status.view.path.display());
    if let Some(role) = status.role {
        println!("status: role={role}");
    }
    if let Some(created_at) = status.created_at {
        println!("status: created_at={}", created_at.to_rfc3339());
    }
    if let Some(meta) = &status.metadata {
        print_metadata("status", meta);
    }
    if let Some(last_commit) = status.last_commit {
        println!("status: last_commit={}", last_commit.to_rfc3339());
    }
    if let Some(uncommitted) = status.uncommitted {
        println!("status: uncommitted={uncommitted}");
    }
    Ok(exit_codes::OK)
}

pub fn cmd_complete(cwd: &Path, task: &str, options: CompleteOptions) -> Result<i32> {
    let session = Session::open(cwd)?;
    let task = parse_task_arg(task)?;
    match session.lifecycle().complete(task, options)? {
        CompletionOutcome::Rejected(result) => Ok(report_failure(result)),
        CompletionOutcome::Removed {
            entry,
            validation,
            recorded,
            forced,
            branch_deleted,
        } => {
            if forced {
                eprintln!(
                    "warning: completed with failed checks: {}",
                    validation.failed().join(", ")
                );
            }
            if !recorded.passed {
                for check in recorded.checks.iter().filter(|check| !check.passed) {
                    eprintln!(
                        "warning: {}",
                        check.remediation.as_deref().unwrap_or(&check.name)
                    );
                }
            }
            println!(
                "complete: task={} reference={} forced={} removed={} branch_deleted={}",
                entry.task,
                entry.reference,
                forced,
                entry.path.display(),
                branch_deleted
            );
            Ok(exit_codes::OK)
        }
    }
}

pub fn cmd_recover(cwd: &Path, task: &str) -> Result<i32> {
    let session = Session::open(cwd)?;
    let task = parse_task_arg(task)?;
    let report = session.lifecycle().recover(task)?;
    let health = report
        .health
        .map_or_else(|| "unknown".to_string(), |health| health.to_string());
    if report.is_noop() {
        println!("recover: task={task} health={health} nothing to do");
        return Ok(exit_codes::OK);
    }
    let actions: Vec<String> = report
        .actions
        .iter()
        .map(|action| format!("{action:?}"))
        .collect();
    println!(
        "recover: task={task} health={health} actions={}",
        actions.join(",")
    );
    Ok(exit_codes::OK)
}

pub fn cmd_reconcile(cwd: &Path, json: bool) -> Result<i32> {
    let session = Session::open(cwd)?;
    let report = session.lifecycle().reconcile()?;
    if json {
        print_json(&report)?;
        return Ok(exit_codes::OK);
    }
    for view in &report.views {
        print_view("reconcile", view);
    }
    println!(
        "reconcile: workspaces={} updated={} clean={}",
        report.views.len(),
        report.updated.len(),
        report.is_clean()
    );
    Ok(exit_codes::OK)
}

pub fn cmd_checkpoint(
    cwd: &Path,
    checkpoint: Checkpoint,
    task: &str,
    message_file: Option<&Path>,
) -> Result<i32> {
    let session = Session::open(cwd)?;
    let task = parse_task_arg(task)?;
    let message = message_file
        .map(|path| {
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))
        })
        .transpose()?;
    let result = session
        .lifecycle()
        .run_checkpoint(checkpoint, task, message.as_deref())?;
    if !result.passed {
        return Ok(report_failure(result));
    }
    println!(
        "checkpoint: {} passed ({} checks)",
        result.checkpoint,
        result.checks.len()
    );
    Ok(exit_codes::OK)
}

pub fn cmd_meta_show(cwd: &Path, task: &str) -> Result<i32> {
    let session = Session::open(cwd)?;
    let id = parse_task_arg(task)?;
    let reference = session.reference_for(task, id)?;
    match session.lifecycle().metadata().get(&reference)? {
        Some(observed) => {
            println!("meta: reference={reference} hash={}", observed.hash);
            print_json(&observed.record)?;
        }
        None => println!("meta: reference={reference} no metadata"),
    }
    Ok(exit_codes::OK)
}

/// Changes requested by `weave meta set`.
#[derive(Debug, Default)]
pub struct MetaChanges {
    pub status: Option<String>,
    pub labels: Vec<String>,
    pub skills: Vec<String>,
    /// Hash the caller last saw; defaults to the hash read just before writing.
    pub expect: Option<String>,
}

pub fn cmd_meta_set(cwd: &Path, task: &str, changes: MetaChanges) -> Result<i32> {
    let session = Session::open(cwd)?;
    let id = parse_task_arg(task)?;
    let reference = session.reference_for(task, id)?;
    let lifecycle = session.lifecycle();
    let metadata = lifecycle.metadata();
    let observed = metadata.get(&reference)?;
    let expected = match (&changes.expect, &observed) {
        (Some(hash), _) => hash.clone(),
        (None, Some(observed)) => observed.hash.clone(),
        (None, None) => "none".to_string(),
    };
    let mut record = match observed {
        Some(observed) => observed.record,
        None => {
            let role = lifecycle
                .cache()
                .entry(id)?
                .map_or(Role::Implementer, |entry| entry.role);
            MetadataRecord::new(role, status::ACTIVE)
        }
    };
    if let Some(status) = changes.status {
        record.status = status;
    }
    record.labels.extend(changes.labels);
    record.skills.extend(changes.skills);
    let hash = metadata.set(&reference, &record, Some(&expected))?;
    println!("meta: reference={reference} hash={hash}");
    Ok(exit_codes::OK)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotesDirection {
    Push,
    Fetch,
}

pub fn cmd_notes(cwd: &Path, direction: NotesDirection, remote: Option<&str>) -> Result<i32> {
    let session = Session::open(cwd)?;
    let remote = remote
        .or_else(|| session.cfg.remote())
        .unwrap_or("origin")
        .to_string();
    let lifecycle = session.lifecycle();
    let metadata = lifecycle.metadata();
    match direction {
        NotesDirection::Push => metadata.push(&remote)?,
        NotesDirection::Fetch => metadata.fetch(&remote)?,
    }
    println!("notes: {direction:?} remote={remote}");
    Ok(exit_codes::OK)
}

pub fn cmd_hook(cwd: &Path, name: &str, args: &[String]) -> Result<i32> {
    let kind: HookKind = name.parse()?;
    let session = Session::open(cwd)?;
    match run_hook(&session.lifecycle(), kind, cwd, args)? {
        Some(result) if !result.passed => Ok(report_failure(result)),
        _ => Ok(exit_codes::OK),
    }
}

/// Print a failed checkpoint with its remediation list.
fn report_failure(result: ValidationResult) -> i32 {
    let err = WeaveError::Validation(result);
    eprintln!("error: {err}");
    for line in err.remediation() {
        eprintln!("  - {line}");
    }
    exit_codes::VALIDATION
}

fn print_view(prefix: &str, view: &WorkspaceView) {
    println!(
        "{prefix}: task={} reference={} health={} cached={} registered={} path={}",
        view.task,
        view.reference,
        view.health,
        view.in_cache,
        view.registered,
        view.path.display()
    );
}

fn print_metadata(prefix: &str, meta: &MetadataRecord) {
    let labels: Vec<&str> = meta.labels.iter().map(String::as_str).collect();
    let skills: Vec<&str> = meta.skills.iter().map(String::as_str).collect();
    println!(
        "{prefix}: meta status={} commits={} labels={} skills={}",
        meta.status,
        meta.commits,
        labels.join(","),
        skills.join(",")
    );
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize output")?;
    println!("{payload}");
    Ok(())
}

