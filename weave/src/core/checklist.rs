//! Definition-of-Done checklists and the pure checks behind them.
//!
//! Checklists are a data table `role -> [CheckSpec]`. Every check is a plain
//! function over a [`WorkspaceSnapshot`]; the I/O needed to fill the snapshot
//! lives in `io::stores`.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::types::Role;
use crate::error::WeaveError;

/// Lifecycle points at which the pipeline runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Checkpoint {
    PreChange,
    PreCompletion,
    PostCompletion,
}

impl Checkpoint {
    pub fn as_str(self) -> &'static str {
        match self {
            Checkpoint::PreChange => "pre-change",
            Checkpoint::PreCompletion => "pre-completion",
            Checkpoint::PostCompletion => "post-completion",
        }
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Checkpoint {
    type Err = WeaveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pre-change" => Ok(Checkpoint::PreChange),
            "pre-completion" => Ok(Checkpoint::PreCompletion),
            "post-completion" => Ok(Checkpoint::PostCompletion),
            other => Err(WeaveError::identifier(other, "unknown checkpoint")),
        }
    }
}

/// Outcome of one check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
}

impl CheckResult {
    pub fn pass(name: &str) -> Self {
        Self {
            name: name.to_string(),
            passed: true,
            remediation: None,
        }
    }

    pub fn fail(name: &str, remediation: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            passed: false,
            remediation: Some(remediation.into()),
        }
    }
}

/// Result of one checkpoint invocation. Emitted and logged, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub checkpoint: Checkpoint,
    pub checks: Vec<CheckResult>,
    pub passed: bool,
}

impl ValidationResult {
    /// AND of all checks; an empty list passes.
    pub fn from_checks(checkpoint: Checkpoint, checks: Vec<CheckResult>) -> Self {
        let passed = checks.iter().all(|check| check.passed);
        Self {
            checkpoint,
            checks,
            passed,
        }
    }

    /// Names of failed checks, in checklist order.
    pub fn failed(&self) -> Vec<String> {
        self.checks
            .iter()
            .filter(|check| !check.passed)
            .map(|check| check.name.clone())
            .collect()
    }
}

/// Lint outcome as seen by the probe.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LintStatus {
    /// No lint command configured.
    #[default]
    NotConfigured,
    Clean,
    Errors(String),
}

/// Everything the completion checks need to know about a workspace.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WorkspaceSnapshot {
    pub task_id: u64,
    pub reference: String,
    /// Commits on the task branch past its spawn point.
    pub commits_ahead: u64,
    /// Uncommitted or untracked paths in the workspace.
    pub uncommitted: Vec<String>,
    /// Paths changed on the branch since its spawn point.
    pub changed_files: Vec<String>,
    /// Which of the checklist's required documents exist in the workspace.
    pub present_documents: BTreeSet<String>,
    /// Line coverage in percent; `None` when no report was found.
    pub coverage_percent: Option<f64>,
    pub lint: LintStatus,
}

/// Thresholds that parameterize the checks.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckSettings {
    pub coverage_threshold: f64,
    pub coverage_report: String,
}

/// Identifier + implementation of one checklist entry.
#[derive(Clone, Copy)]
pub struct CheckSpec {
    pub name: &'static str,
    pub description: &'static str,
    /// Document that must exist, relative to the workspace (`{id}` is substituted).
    pub document: Option<&'static str>,
    pub run: fn(&CheckSpec, &WorkspaceSnapshot, &CheckSettings) -> CheckResult,
}

impl fmt::Debug for CheckSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckSpec").field("name", &self.name).finish()
    }
}

impl CheckSpec {
    pub fn document_path(&self, task_id: u64) -> Option<String> {
        self.document
            .map(|template| template.replace("{id}", &task_id.to_string()))
    }

    pub fn evaluate(&self, snapshot: &WorkspaceSnapshot, settings: &CheckSettings) -> CheckResult {
        (self.run)(self, snapshot, settings)
    }
}

const CHANGES_COMMITTED: CheckSpec = CheckSpec {
    name: "changes_committed",
    description: "Work committed on the task branch",
    document: None,
    run: check_changes_committed,
};

const COVERAGE_THRESHOLD: CheckSpec = CheckSpec {
    name: "coverage_threshold",
    description: "Automated test coverage at or above threshold",
    document: None,
    run: check_coverage,
};

const NO_LINT_ERRORS: CheckSpec = CheckSpec {
    name: "no_lint_errors",
    description: "No outstanding lint errors",
    document: None,
    run: check_lint,
};

const DOCS_TOUCHED: CheckSpec = CheckSpec {
    name: "docs_touched",
    description: "Documentation updated",
    document: None,
    run: check_docs_touched,
};

const fn document_check(
    name: &'static str,
    description: &'static str,
    path: &'static str,
) -> CheckSpec {
    CheckSpec {
        name,
        description,
        document: Some(path),
        run: check_document_exists,
    }
}

const PM_CHECKS: &[CheckSpec] = &[
    document_check("prd_exists", "PRD written", "docs/prd/PRD-{id}.md"),
    CHANGES_COMMITTED,
];

const ARCHITECT_CHECKS: &[CheckSpec] = &[
    document_check("adr_exists", "ADR written", "docs/adr/ADR-{id}.md"),
    document_check("spec_exists", "Tech spec written", "docs/specs/SPEC-{id}.md"),
    CHANGES_COMMITTED,
];

const IMPLEMENTER_CHECKS: &[CheckSpec] = &[
    CHANGES_COMMITTED,
    COVERAGE_THRESHOLD,
    NO_LINT_ERRORS,
    DOCS_TOUCHED,
];

const REVIEWER_CHECKS: &[CheckSpec] = &[
    document_check("review_doc", "Review written", "docs/reviews/REVIEW-{id}.md"),
    CHANGES_COMMITTED,
];

const UX_CHECKS: &[CheckSpec] = &[
    document_check("ux_doc", "UX design written", "docs/ux/UX-{id}.md"),
    CHANGES_COMMITTED,
];

/// The Definition-of-Done table.
pub fn checklist_for(role: Role) -> &'static [CheckSpec] {
    match role {
        Role::Pm => PM_CHECKS,
        Role::Architect => ARCHITECT_CHECKS,
        Role::Implementer => IMPLEMENTER_CHECKS,
        Role::Reviewer => REVIEWER_CHECKS,
        Role::Ux => UX_CHECKS,
    }
}

/// Documents the probe must look for before the checklist can run.
pub fn required_documents(role: Role, task_id: u64) -> Vec<String> {
    checklist_for(role)
        .iter()
        .filter_map(|spec| spec.document_path(task_id))
        .collect()
}

/// Run the role's checklist against a snapshot.
pub fn evaluate_checklist(
    role: Role,
    snapshot: &WorkspaceSnapshot,
    settings: &CheckSettings,
) -> ValidationResult {
    let checks = checklist_for(role)
        .iter()
        .map(|spec| spec.evaluate(snapshot, settings))
        .collect();
    ValidationResult::from_checks(Checkpoint::PreCompletion, checks)
}

fn check_changes_committed(
    spec: &CheckSpec,
    snapshot: &WorkspaceSnapshot,
    _settings: &CheckSettings,
) -> CheckResult {
    if !snapshot.uncommitted.is_empty() {
        let preview: Vec<&str> = snapshot
            .uncommitted
            .iter()
            .take(5)
            .map(String::as_str)
            .collect();
        return CheckResult::fail(
            spec.name,
            format!(
                "commit or stash {} uncommitted file(s): {}",
                snapshot.uncommitted.len(),
                preview.join(", ")
            ),
        );
    }
    if snapshot.commits_ahead == 0 {
        return CheckResult::fail(
            spec.name,
            format!("no changes committed on {}", snapshot.reference),
        );
    }
    CheckResult::pass(spec.name)
}

fn check_coverage(
    spec: &CheckSpec,
    snapshot: &WorkspaceSnapshot,
    settings: &CheckSettings,
) -> CheckResult {
    match snapshot.coverage_percent {
        Some(percent) if percent >= settings.coverage_threshold => CheckResult::pass(spec.name),
        Some(percent) => CheckResult::fail(
            spec.name,
            format!(
                "coverage {percent:.1}% is below {:.1}%; add tests and refresh {}",
                settings.coverage_threshold, settings.coverage_report
            ),
        ),
        None => CheckResult::fail(
            spec.name,
            format!(
                "no coverage recorded (0%); write {} with the measured percent",
                settings.coverage_report
            ),
        ),
    }
}

fn check_lint(
    spec: &CheckSpec,
    snapshot: &WorkspaceSnapshot,
    _settings: &CheckSettings,
) -> CheckResult {
    match &snapshot.lint {
        LintStatus::NotConfigured | LintStatus::Clean => CheckResult::pass(spec.name),
        LintStatus::Errors(summary) => {
            CheckResult::fail(spec.name, format!("fix lint errors: {summary}"))
        }
    }
}

fn check_docs_touched(
    spec: &CheckSpec,
    snapshot: &WorkspaceSnapshot,
    _settings: &CheckSettings,
) -> CheckResult {
    let touched = snapshot
        .changed_files
        .iter()
        .any(|path| path.starts_with("docs/") || path.ends_with(".md"));
    if touched {
        CheckResult::pass(spec.name)
    } else {
        CheckResult::fail(spec.name, "update documentation (docs/ or a .md file)")
    }
}

fn check_document_exists(
    spec: &CheckSpec,
    snapshot: &WorkspaceSnapshot,
    _settings: &CheckSettings,
) -> CheckResult {
    let Some(path) = spec.document_path(snapshot.task_id) else {
        return CheckResult::pass(spec.name);
    };
    if snapshot.present_documents.contains(&path) {
        CheckResult::pass(spec.name)
    } else {
        CheckResult::fail(spec.name, format!("create {path}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> CheckSettings {
        CheckSettings {
            coverage_threshold: 80.0,
            coverage_report: "coverage.json".to_string(),
        }
    }

    fn committed_snapshot() -> WorkspaceSnapshot {
        WorkspaceSnapshot {
            task_id: 42,
            reference: "task-42-implementer".to_string(),
            commits_ahead: 2,
            changed_files: vec!["src/lib.rs".to_string(), "docs/usage.md".to_string()],
            coverage_percent: Some(91.5),
            ..WorkspaceSnapshot::default()
        }
    }

    #[test]
    fn implementer_passes_with_committed_covered_documented_work() {
        let result = evaluate_checklist(Role::Implementer, &committed_snapshot(), &settings());
        assert!(result.passed, "{:?}", result.failed());
        assert_eq!(result.checks.len(), 4);
    }

    #[test]
    fn zero_commits_reports_no_changes() {
        let snapshot = WorkspaceSnapshot {
            commits_ahead: 0,
            ..committed_snapshot()
        };
        let result = evaluate_checklist(Role::Implementer, &snapshot, &settings());
        assert!(!result.passed);
        let check = &result.checks[0];
        assert_eq!(check.name, "changes_committed");
        assert!(
            check
                .remediation
                .as_deref()
                .is_some_and(|text| text.contains("no changes"))
        );
    }

    #[test]
    fn missing_coverage_counts_as_zero() {
        let snapshot = WorkspaceSnapshot {
            coverage_percent: None,
            ..committed_snapshot()
        };
        let result = evaluate_checklist(Role::Implementer, &snapshot, &settings());
        assert_eq!(result.failed(), vec!["coverage_threshold".to_string()]);
    }

    #[test]
    fn uncommitted_files_fail_before_commit_count() {
        let snapshot = WorkspaceSnapshot {
            uncommitted: vec!["wip.rs".to_string()],
            ..committed_snapshot()
        };
        let result = evaluate_checklist(Role::Implementer, &snapshot, &settings());
        let remediation = result.checks[0].remediation.clone().expect("remediation");
        assert!(remediation.contains("wip.rs"));
    }

    #[test]
    fn lint_errors_and_missing_docs_fail() {
        let snapshot = WorkspaceSnapshot {
            changed_files: vec!["src/lib.rs".to_string()],
            lint: LintStatus::Errors("2 warnings".to_string()),
            ..committed_snapshot()
        };
        let result = evaluate_checklist(Role::Implementer, &snapshot, &settings());
        assert_eq!(
            result.failed(),
            vec!["no_lint_errors".to_string(), "docs_touched".to_string()]
        );
    }

    #[test]
    fn architect_needs_both_documents() {
        let mut snapshot = committed_snapshot();
        snapshot
            .present_documents
            .insert("docs/adr/ADR-42.md".to_string());
        let result = evaluate_checklist(Role::Architect, &snapshot, &settings());
        assert_eq!(result.failed(), vec!["spec_exists".to_string()]);
        assert_eq!(
            required_documents(Role::Architect, 42),
            vec![
                "docs/adr/ADR-42.md".to_string(),
                "docs/specs/SPEC-42.md".to_string()
            ]
        );
    }

    #[test]
    fn every_role_gates_on_committed_work() {
        for role in Role::ALL {
            assert!(
                checklist_for(role)
                    .iter()
                    .any(|spec| spec.name == "changes_committed"),
                "{role}"
            );
        }
    }

    #[test]
    fn empty_result_passes_and_any_failure_fails() {
        assert!(ValidationResult::from_checks(Checkpoint::PreChange, Vec::new()).passed);
        let failed = ValidationResult::from_checks(
            Checkpoint::PreChange,
            vec![CheckResult::pass("y"), CheckResult::fail("x", "fix x")],
        );
        assert!(!failed.passed);
        assert_eq!(failed.failed(), vec!["x".to_string()]);
    }
}
