//! Lightweight pre-change checks: forbidden patterns in staged additions and
//! the change-description format.

use anyhow::{Context, Result};
use regex::Regex;

use crate::core::checklist::{CheckResult, Checkpoint, ValidationResult};

/// One added line from the staged diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddedLine {
    pub path: String,
    pub line: String,
}

/// Compiled forbidden patterns.
#[derive(Debug, Clone)]
pub struct ForbiddenPatterns {
    patterns: Vec<Regex>,
}

impl ForbiddenPatterns {
    pub fn compile(sources: &[String]) -> Result<Self> {
        let patterns = sources
            .iter()
            .map(|src| Regex::new(src).with_context(|| format!("compile forbidden pattern '{src}'")))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    /// Every `(path, pattern)` hit, in diff order.
    pub fn find(&self, added: &[AddedLine]) -> Vec<(String, String)> {
        let mut hits = Vec::new();
        for entry in added {
            for pattern in &self.patterns {
                if pattern.is_match(&entry.line) {
                    hits.push((entry.path.clone(), pattern.as_str().to_string()));
                }
            }
        }
        hits
    }
}

/// Parse `git diff --cached --unified=0` output into added lines.
///
/// `+++` is a file header only between `diff --git` and the first `@@` of a
/// file block. Inside a hunk every line starting with `+` is content, even
/// when the content itself starts with `+`.
pub fn parse_added_lines(diff: &str) -> Vec<AddedLine> {
    let mut added = Vec::new();
    let mut current: Option<String> = None;
    let mut in_hunk = false;
    for line in diff.lines() {
        if line.starts_with("diff --git ") {
            current = None;
            in_hunk = false;
            continue;
        }
        if line.starts_with("@@") {
            in_hunk = true;
            continue;
        }
        if !in_hunk {
            if let Some(path) = line.strip_prefix("+++ ") {
                current = match path {
                    "/dev/null" => None,
                    other => Some(other.strip_prefix("b/").unwrap_or(other).to_string()),
                };
            }
            continue;
        }
        if let (Some(path), Some(content)) = (&current, line.strip_prefix('+')) {
            added.push(AddedLine {
                path: path.clone(),
                line: content.to_string(),
            });
        }
    }
    added
}

/// Check the first non-comment line of a change description.
pub fn check_message(message: &str, max_subject_len: usize) -> CheckResult {
    const NAME: &str = "change_description";
    let subject = message
        .lines()
        .map(str::trim_end)
        .find(|line| !line.starts_with('#') && !line.trim().is_empty());
    match subject {
        None => CheckResult::fail(NAME, "write a change description with a subject line"),
        Some(line) if line.chars().count() > max_subject_len => CheckResult::fail(
            NAME,
            format!(
                "shorten the subject line to {max_subject_len} characters (currently {})",
                line.chars().count()
            ),
        ),
        Some(_) => CheckResult::pass(NAME),
    }
}

/// Build the pre-change result from staged additions and an optional message.
pub fn pre_change(
    patterns: &ForbiddenPatterns,
    added: &[AddedLine],
    message: Option<&str>,
    max_subject_len: usize,
) -> ValidationResult {
    let mut checks = Vec::new();
    let hits = patterns.find(added);
    if hits.is_empty() {
        checks.push(CheckResult::pass("forbidden_patterns"));
    } else {
        let listed: Vec<String> = hits
            .iter()
            .map(|(path, pattern)| format!("{path} matches /{pattern}/"))
            .collect();
        checks.push(CheckResult::fail(
            "forbidden_patterns",
            format!("remove forbidden content: {}", listed.join("; ")),
        ));
    }
    if let Some(message) = message {
        checks.push(check_message(message, max_subject_len));
    }
    ValidationResult::from_checks(Checkpoint::PreChange, checks)
}
