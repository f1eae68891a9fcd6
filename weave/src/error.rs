//! Typed failure taxonomy for weave operations.
//!
//! Operations return `anyhow::Result`; the variants below are attached as the
//! root error so the CLI can `downcast_ref::<WeaveError>()` and pick an exit
//! code. Everything else (I/O, parse errors) is treated as operational.

use thiserror::Error;

use crate::core::checklist::ValidationResult;

#[derive(Debug, Error)]
pub enum WeaveError {
    /// Malformed task id or reference name.
    #[error("invalid identifier '{name}': {reason}")]
    Identifier { name: String, reason: String },

    /// The task already has an active workspace.
    #[error("task {task} already has an active workspace at {path}")]
    AlreadyActive { task: u64, path: String },

    /// Lock contention exhausted the retry budget.
    #[error("task {task} is busy (lock held by another process after {attempts} attempts)")]
    Busy { task: u64, attempts: u32 },

    /// Metadata changed between read and write.
    #[error("metadata for {reference} changed since it was read (expected {expected}, found {found})")]
    Conflict {
        reference: String,
        expected: String,
        found: String,
    },

    /// A quality gate failed.
    #[error("{} checkpoint failed: {}", .0.checkpoint, .0.failed().join(", "))]
    Validation(ValidationResult),

    /// Cache, registry and filesystem disagree about the task.
    #[error("task {task} is in a corrupted state: {detail} (run `weave recover {task}`)")]
    CorruptedState { task: u64, detail: String },

    /// Nothing tracks the task.
    #[error("no workspace tracked for task {task}")]
    UnknownTask { task: u64 },

    /// git failed, could not be spawned, or timed out.
    #[error("{command} failed: {detail}")]
    ExternalTool { command: String, detail: String },
}

impl WeaveError {
    pub fn identifier(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Identifier {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Itemized remediation lines for user-facing output.
    pub fn remediation(&self) -> Vec<String> {
        match self {
            Self::Validation(result) => result
                .checks
                .iter()
                .filter(|check| !check.passed)
                .map(|check| match &check.remediation {
                    Some(hint) => format!("{}: {}", check.name, hint),
                    None => check.name.clone(),
                })
                .collect(),
            Self::AlreadyActive { task, .. } => {
                vec![format!("finish it first with `weave complete {task}`")]
            }
            Self::Busy { .. } => vec!["retry once the other operation finishes".to_string()],
            Self::Conflict { .. } => {
                vec!["re-read the metadata and apply the change again".to_string()]
            }
            _ => Vec::new(),
        }
    }

    /// True for failures that are expected outcomes rather than environment breakage.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

/// Find the typed error at the root of an `anyhow` chain, if any.
pub fn classify(err: &anyhow::Error) -> Option<&WeaveError> {
    err.chain().find_map(|cause| cause.downcast_ref::<WeaveError>())
}
