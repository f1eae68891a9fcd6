//! weave configuration stored under `.weave/config.toml`.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::backoff::Backoff;
use crate::core::checklist::CheckSettings;

/// Where task branches and notes are published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Nothing leaves the local repository.
    #[default]
    Local,
    /// Branches and notes are pushed to the remote on completion.
    Github,
    /// Like `github`, but remote failures are logged instead of fatal.
    Hybrid,
}

impl std::str::FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "local" => Ok(Mode::Local),
            "github" => Ok(Mode::Github),
            "hybrid" => Ok(Mode::Hybrid),
            other => Err(anyhow!("unknown mode '{other}' (local, github, hybrid)")),
        }
    }
}

/// weave configuration (TOML).
///
/// Meant to be edited by humans. Missing fields take the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WeaveConfig {
    pub mode: Mode,
    /// Worktree root, relative to the repository root unless absolute.
    pub worktree_base: String,
    pub git: GitConfig,
    pub lock: RetryConfig,
    pub sync: RetryConfig,
    pub validation: ValidationConfig,
    pub hooks: HooksConfig,
    /// Label -> skills. The `default` row applies when no label matches.
    pub skill_routing: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GitConfig {
    /// Per-invocation timeout for git subprocesses.
    pub timeout_secs: u64,
    /// Remote used for pushes; defaults to `origin` outside local mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote: Option<String>,
    /// Notes namespace (`refs/notes/<notes_ref>`).
    pub notes_ref: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
    pub retries: u32,
    pub backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ValidationConfig {
    pub coverage_threshold: f64,
    /// JSON file in the workspace with `{"percent": <number>}`.
    pub coverage_report: String,
    /// Optional lint command run inside the workspace (e.g. `["cargo","clippy"]`).
    pub lint_command: Vec<String>,
    pub lint_timeout_secs: u64,
    /// Regexes that must not appear in staged additions.
    pub forbidden_patterns: Vec<String>,
    pub max_subject_len: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HooksConfig {
    pub pre_commit: bool,
    pub commit_msg: bool,
    pub post_commit: bool,
    pub pre_push: bool,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            remote: None,
            notes_ref: "weave".to_string(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retries: 5,
            backoff_ms: 50,
        }
    }
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            coverage_threshold: 80.0,
            coverage_report: "coverage.json".to_string(),
            lint_command: Vec::new(),
            lint_timeout_secs: 300,
            forbidden_patterns: vec![
                r"-----BEGIN (RSA |EC |OPENSSH |DSA )?PRIVATE KEY-----".to_string(),
                r"AKIA[0-9A-Z]{16}".to_string(),
                r"^(<{7}|>{7})( |$)".to_string(),
            ],
            max_subject_len: 72,
        }
    }
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            pre_commit: true,
            commit_msg: true,
            post_commit: true,
            pre_push: true,
        }
    }
}

impl Default for WeaveConfig {
    fn default() -> Self {
        let skill_routing = [
            ("api", vec!["api-design"]),
            ("database", vec!["schema-design", "migrations"]),
            ("security", vec!["threat-modeling"]),
            ("frontend", vec!["ui-components"]),
            ("default", vec!["general"]),
        ]
        .into_iter()
        .map(|(label, skills)| {
            (
                label.to_string(),
                skills.into_iter().map(str::to_string).collect(),
            )
        })
        .collect();
        Self {
            mode: Mode::Local,
            worktree_base: ".weave/worktrees".to_string(),
            git: GitConfig::default(),
            lock: RetryConfig::default(),
            sync: RetryConfig {
                retries: 3,
                backoff_ms: 200,
            },
            validation: ValidationConfig::default(),
            hooks: HooksConfig::default(),
            skill_routing,
        }
    }
}

impl WeaveConfig {
    pub fn validate(&self) -> Result<()> {
        if self.worktree_base.trim().is_empty() {
            return Err(anyhow!("worktree_base must not be empty"));
        }
        if self.git.timeout_secs == 0 {
            return Err(anyhow!("git.timeout_secs must be > 0"));
        }
        if self.git.notes_ref.trim().is_empty() || self.git.notes_ref.contains(char::is_whitespace)
        {
            return Err(anyhow!("git.notes_ref must be a non-empty ref name"));
        }
        if !(0.0..=100.0).contains(&self.validation.coverage_threshold) {
            return Err(anyhow!("validation.coverage_threshold must be within 0..=100"));
        }
        if self.validation.max_subject_len == 0 {
            return Err(anyhow!("validation.max_subject_len must be > 0"));
        }
        if let Some(first) = self.validation.lint_command.first()
            && first.trim().is_empty()
        {
            return Err(anyhow!("validation.lint_command must start with a program"));
        }
        Ok(())
    }

    pub fn git_timeout(&self) -> Duration {
        Duration::from_secs(self.git.timeout_secs)
    }

    pub fn lock_backoff(&self) -> Backoff {
        Backoff::new(self.lock.retries, self.lock.backoff_ms)
    }

    pub fn sync_backoff(&self) -> Backoff {
        Backoff::new(self.sync.retries, self.sync.backoff_ms)
    }

    /// Remote to publish to, if any.
    pub fn remote(&self) -> Option<&str> {
        match (&self.git.remote, self.mode) {
            (Some(remote), _) => Some(remote.as_str()),
            (None, Mode::Local) => None,
            (None, Mode::Github | Mode::Hybrid) => Some("origin"),
        }
    }

    pub fn check_settings(&self) -> CheckSettings {
        CheckSettings {
            coverage_threshold: self.validation.coverage_threshold,
            coverage_report: self.validation.coverage_report.clone(),
        }
    }

    /// Skills for a set of labels; falls back to the `default` row.
    pub fn route_skills<'a>(&self, labels: impl IntoIterator<Item = &'a str>) -> BTreeSet<String> {
        let mut skills = BTreeSet::new();
        for label in labels {
            if let Some(row) = self.skill_routing.get(&label.to_ascii_lowercase()) {
                skills.extend(row.iter().cloned());
            }
        }
        if skills.is_empty()
            && let Some(row) = self.skill_routing.get("default")
        {
            skills.extend(row.iter().cloned());
        }
        skills
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `WeaveConfig::default()`.
pub fn load_config(path: &Path) -> Result<WeaveConfig> {
    if !path.exists() {
        let cfg = WeaveConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: WeaveConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk.
pub fn write_config(path: &Path, cfg: &WeaveConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    crate::io::atomic::write_atomic(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, WeaveConfig::default());
        assert_eq!(cfg.remote(), None);
    }

    #[test]
    fn write_then_load_preserves_config() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let mut cfg = WeaveConfig::default();
        cfg.mode = Mode::Hybrid;
        cfg.validation.lint_command = vec!["cargo".to_string(), "clippy".to_string()];
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
        assert_eq!(loaded.remote(), Some("origin"));
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "[validation]\ncoverage_threshold = 50.0\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.validation.coverage_threshold, 50.0);
        assert_eq!(cfg.git.notes_ref, "weave");
        assert_eq!(cfg.lock.retries, 5);
    }

    #[test]
    fn rejects_out_of_range_threshold() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "[validation]\ncoverage_threshold = 150.0\n").expect("write");
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn skill_routing_unions_labels_and_falls_back() {
        let cfg = WeaveConfig::default();
        let skills = cfg.route_skills(["API", "database"]);
        assert!(skills.contains("api-design"));
        assert!(skills.contains("migrations"));
        let fallback = cfg.route_skills(["unrelated"]);
        assert_eq!(fallback.into_iter().collect::<Vec<_>>(), vec!["general"]);
    }
}
