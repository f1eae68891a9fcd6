//! Task id <-> canonical branch/workspace name.
//!
//! Canonical names look like `task-42-jwt-auth`. The same string is used as
//! the branch name and as the worktree directory name, so a task's
//! workspace path is a pure function of its id and slug.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::WeaveError;

/// Longest slug kept after sanitizing.
pub const MAX_SLUG_LEN: usize = 40;

const PREFIX: &str = "task-";
const HEADS: &str = "refs/heads/";

static CANONICAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^task-([1-9][0-9]*)-[a-z0-9]+(?:-[a-z0-9]+)*$").expect("canonical name regex")
});

/// Lowercase, restrict to `[a-z0-9-]`, collapse dashes, truncate.
///
/// An input with no usable characters becomes `task`.
pub fn sanitize_slug(raw: &str) -> String {
    let mut slug = String::with_capacity(raw.len());
    for ch in raw.chars().flat_map(char::to_lowercase) {
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() {
            slug.push(ch);
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    slug.truncate(MAX_SLUG_LEN);
    let trimmed = slug.trim_matches('-');
    if trimmed.is_empty() {
        return "task".to_string();
    }
    trimmed.to_string()
}

/// Compose `task-{id}-{slug}` from a task id and a free-form description.
pub fn to_canonical_name(task_id: u64, descriptive_slug: &str) -> Result<String, WeaveError> {
    if task_id == 0 {
        return Err(WeaveError::identifier("0", "task id must be positive"));
    }
    Ok(format!("{PREFIX}{task_id}-{}", sanitize_slug(descriptive_slug)))
}

/// Parse the task id out of a canonical name (bare or `refs/heads/...`).
pub fn from_canonical_name(name: &str) -> Result<u64, WeaveError> {
    let bare = name.strip_prefix(HEADS).unwrap_or(name);
    let caps = CANONICAL_RE
        .captures(bare)
        .ok_or_else(|| WeaveError::identifier(name, "expected task-<id>-<slug>"))?;
    caps[1]
        .parse::<u64>()
        .map_err(|err| WeaveError::identifier(name, format!("task id out of range: {err}")))
}

/// Parse a user-supplied task argument (`42`, `#42`, or a canonical name).
pub fn parse_task_arg(raw: &str) -> Result<u64, WeaveError> {
    let trimmed = raw.trim().trim_start_matches('#');
    if let Ok(id) = trimmed.parse::<u64>() {
        if id == 0 {
            return Err(WeaveError::identifier(raw, "task id must be positive"));
        }
        return Ok(id);
    }
    from_canonical_name(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_name_sanitizes_slug() {
        let name = to_canonical_name(456, "JWT Auth / Login!").expect("name");
        assert_eq!(name, "task-456-jwt-auth-login");
    }

    #[test]
    fn empty_slug_falls_back() {
        assert_eq!(to_canonical_name(3, "///").expect("name"), "task-3-task");
    }

    #[test]
    fn slug_is_truncated_without_trailing_dash() {
        let long = format!("{}-{}", "a".repeat(39), "bbbb");
        let slug = sanitize_slug(&long);
        assert!(slug.len() <= MAX_SLUG_LEN);
        assert!(!slug.ends_with('-'));
    }

    #[test]
    fn zero_task_id_is_rejected() {
        assert!(matches!(
            to_canonical_name(0, "x"),
            Err(WeaveError::Identifier { .. })
        ));
    }

    #[test]
    fn parses_bare_and_qualified_names() {
        assert_eq!(from_canonical_name("task-42-implementer").expect("id"), 42);
        assert_eq!(
            from_canonical_name("refs/heads/task-7-fix-login").expect("id"),
            7
        );
    }

    #[test]
    fn rejects_malformed_names() {
        for bad in ["main", "task-42", "task-0-x", "task-42-Upper", "issue-42-x", "task-42-x-"] {
            assert!(
                matches!(from_canonical_name(bad), Err(WeaveError::Identifier { .. })),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn round_trips_through_canonical_name() {
        let name = to_canonical_name(9001, "Refactor: cache layer").expect("name");
        assert_eq!(from_canonical_name(&name).expect("id"), 9001);
    }

    #[test]
    fn task_arg_accepts_numbers_and_names() {
        assert_eq!(parse_task_arg("#12").expect("id"), 12);
        assert_eq!(parse_task_arg("task-5-x").expect("id"), 5);
        assert!(parse_task_arg("0").is_err());
        assert!(parse_task_arg("nope").is_err());
    }
}
