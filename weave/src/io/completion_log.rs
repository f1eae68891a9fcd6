//! Post-completion bookkeeping under `.weave/`.
//!
//! - `completions.jsonl`: one line per completed task (append-only).
//! - `metrics.json`: aggregate counters, rewritten atomically.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::backoff::Backoff;
use crate::core::checklist::ValidationResult;
use crate::core::types::Role;
use crate::io::atomic::write_json_atomic;
use crate::io::lock::lock_named;

/// One completed task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CompletionEntry {
    pub task: u64,
    pub reference: String,
    pub role: Role,
    pub completed_at: DateTime<Utc>,
    /// Seconds between spawn and completion.
    pub duration_secs: i64,
    /// Completed despite a failed pre-completion checkpoint.
    pub forced: bool,
    pub validation: ValidationResult,
}

/// Aggregate counters across completions.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Metrics {
    pub completed: u64,
    pub forced: u64,
    #[serde(default)]
    pub by_role: BTreeMap<String, u64>,
    /// Failed check name -> times it was overridden with `--force`.
    #[serde(default)]
    pub overridden_checks: BTreeMap<String, u64>,
    #[serde(default)]
    pub total_duration_secs: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_completed_at: Option<DateTime<Utc>>,
}

impl Metrics {
    fn apply(&mut self, entry: &CompletionEntry) {
        self.completed += 1;
        *self
            .by_role
            .entry(entry.role.as_str().to_string())
            .or_default() += 1;
        if entry.forced {
            self.forced += 1;
            for name in entry.validation.failed() {
                *self.overridden_checks.entry(name).or_default() += 1;
            }
        }
        self.total_duration_secs += entry.duration_secs.max(0);
        self.last_completed_at = Some(entry.completed_at);
    }
}

/// Sink for completion records.
pub trait CompletionRecorder {
    fn record(&self, entry: &CompletionEntry) -> Result<()>;
}

/// File-backed recorder.
#[derive(Debug, Clone)]
pub struct FileRecorder {
    completions_path: PathBuf,
    metrics_path: PathBuf,
    locks_dir: PathBuf,
    backoff: Backoff,
}

impl FileRecorder {
    pub fn new(
        completions_path: impl Into<PathBuf>,
        metrics_path: impl Into<PathBuf>,
        locks_dir: impl Into<PathBuf>,
        backoff: Backoff,
    ) -> Self {
        Self {
            completions_path: completions_path.into(),
            metrics_path: metrics_path.into(),
            locks_dir: locks_dir.into(),
            backoff,
        }
    }
}

impl CompletionRecorder for FileRecorder {
    fn record(&self, entry: &CompletionEntry) -> Result<()> {
        let _guard = lock_named(&self.locks_dir, "metrics", &self.backoff)?;
        append_line(&self.completions_path, entry)?;
        let mut metrics = load_metrics(&self.metrics_path)?;
        metrics.apply(entry);
        write_json_atomic(&self.metrics_path, &metrics)?;
        debug!(task = entry.task, completed = metrics.completed, "completion recorded");
        Ok(())
    }
}

fn append_line<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let mut line = serde_json::to_string(value).context("serialize completion")?;
    line.push('\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("append {}", path.display()))
}

/// Load metrics; missing or unreadable files start from zero.
pub fn load_metrics(path: &Path) -> Result<Metrics> {
    if !path.exists() {
        return Ok(Metrics::default());
    }
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    match serde_json::from_str(&raw) {
        Ok(metrics) => Ok(metrics),
        Err(err) => {
            warn!(path = %path.display(), err = %err, "unreadable metrics, starting from zero");
            Ok(Metrics::default())
        }
    }
}

/// Read every completion line, skipping malformed ones.
pub fn read_completions(path: &Path) -> Result<Vec<CompletionEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    Ok(raw
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str(line) {
            Ok(entry) => Some(entry),
            Err(err) => {
                warn!(err = %err, "skipping malformed completion line");
                None
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::checklist::{CheckResult, Checkpoint};

    fn entry(task: u64, forced: bool) -> CompletionEntry {
        let checks = if forced {
            vec![CheckResult::fail("coverage_threshold", "raise coverage")]
        } else {
            vec![CheckResult::pass("coverage_threshold")]
        };
        CompletionEntry {
            task,
            reference: format!("task-{task}-implementer"),
            role: Role::Implementer,
            completed_at: Utc::now(),
            duration_secs: 90,
            forced,
            validation: ValidationResult::from_checks(Checkpoint::PreCompletion, checks),
        }
    }

    #[test]
    fn records_lines_and_counters() {
        let temp = tempfile::tempdir().expect("tempdir");
        let recorder = FileRecorder::new(
            temp.path().join("completions.jsonl"),
            temp.path().join("metrics.json"),
            temp.path().join("locks"),
            Backoff::new(3, 1),
        );
        recorder.record(&entry(1, false)).expect("first");
        recorder.record(&entry(2, true)).expect("second");

        let lines = read_completions(&temp.path().join("completions.jsonl")).expect("read");
        assert_eq!(lines.iter().map(|e| e.task).collect::<Vec<_>>(), vec![1, 2]);

        let metrics = load_metrics(&temp.path().join("metrics.json")).expect("metrics");
        assert_eq!(metrics.completed, 2);
        assert_eq!(metrics.forced, 1);
        assert_eq!(metrics.by_role.get("implementer"), Some(&2));
        assert_eq!(metrics.overridden_checks.get("coverage_threshold"), Some(&1));
        assert_eq!(metrics.total_duration_secs, 180);
    }

    #[test]
    fn malformed_metrics_restart_from_zero() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("metrics.json");
        fs::write(&path, "{oops").expect("write");
        assert_eq!(load_metrics(&path).expect("load"), Metrics::default());
    }
}
